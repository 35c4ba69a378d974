//! Engine side of the control channel: picks up commands and keeps the status document fresh.

use crate::error::EngineError;
use crate::io;
use crate::metrics::{emit, EngineEvent};
use crate::runtime::Event;
use log::{debug, info, warn};
use loopcast_core::control::{unix_now, Command, ControlChannel, Inbox, StatusSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

pub struct ControlPoller {
    channel: Arc<dyn ControlChannel>,
    events: mpsc::Sender<Event>,
    stop: watch::Sender<u64>,
    status: watch::Receiver<StatusSnapshot>,
    io_timeout: Duration,
}

impl ControlPoller {
    pub fn new(
        channel: Arc<dyn ControlChannel>,
        events: mpsc::Sender<Event>,
        stop: watch::Sender<u64>,
        status: watch::Receiver<StatusSnapshot>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            events,
            stop,
            status,
            io_timeout,
        }
    }

    /// Claims a pending command and hands it to the runtime.
    pub async fn poll_once(&self) -> Result<Option<Command>, EngineError> {
        let channel = self.channel.clone();
        let inbox = io::blocking(self.io_timeout, "read control document", move || {
            channel.take_command()
        })
        .await?;

        match inbox {
            Inbox::Empty => Ok(None),
            Inbox::Corrupt(reason) => {
                emit(EngineEvent::ControlCorruption { reason: &reason });
                self.write_status().await?;
                Ok(None)
            }
            Inbox::Command(request) => {
                info!(
                    "Received {:?} command requested at {:.3}",
                    request.command, request.requested_at
                );
                // Cancels whatever the runtime is in the middle of.
                if matches!(request.command, Command::Stop | Command::Restart) {
                    self.stop.send_modify(|generation| *generation += 1);
                }
                // A busy runtime must not hold up status publishing.
                match self
                    .events
                    .send_timeout(Event::Control(request.command), self.io_timeout)
                    .await
                {
                    Ok(()) => Ok(Some(request.command)),
                    Err(SendTimeoutError::Timeout(_)) => Err(EngineError::Timeout(format!(
                        "runtime did not take the {:?} command within {:?}, dropped",
                        request.command, self.io_timeout
                    ))),
                    Err(SendTimeoutError::Closed(_)) => {
                        Err(EngineError::Io("engine is no longer running".to_string()))
                    }
                }
            }
        }
    }

    pub async fn write_status(&self) -> Result<(), EngineError> {
        let snapshot = self.status.borrow().refreshed(unix_now());
        let channel = self.channel.clone();
        io::blocking(self.io_timeout, "write status document", move || {
            channel.publish_status(&snapshot)
        })
        .await
    }

    /// Polls and publishes until the runtime goes away, then writes one last status.
    pub async fn run(self, poll_every: Duration, publish_every: Duration) {
        let mut poll = interval(poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut publish = interval(publish_every);
        publish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.events.closed() => break,
                _ = poll.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!("Could not poll control channel: {}", err);
                    }
                }
                _ = publish.tick() => {
                    if let Err(err) = self.write_status().await {
                        warn!("Could not publish status: {}", err);
                    }
                }
            }
        }

        debug!("Runtime is gone, writing final status");
        if let Err(err) = self.write_status().await {
            warn!("Could not publish final status: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopcast_core::control::{
        ControlCommand, FileControlChannel, RunStatus, CONTROL_FILE, STATUS_FILE,
    };
    use loopcast_core::models::EncodingMode;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        channel: Arc<FileControlChannel>,
        poller: ControlPoller,
        events: mpsc::Receiver<Event>,
        stop: watch::Receiver<u64>,
        _status: watch::Sender<StatusSnapshot>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(FileControlChannel::open(dir.path()).unwrap());
        let (events_tx, events) = mpsc::channel(8);
        let (stop_tx, stop) = watch::channel(0);
        let (status_tx, status_rx) =
            watch::channel(StatusSnapshot::stopped(EncodingMode::HardCut));
        let poller = ControlPoller::new(
            channel.clone(),
            events_tx,
            stop_tx,
            status_rx,
            Duration::from_secs(2),
        );

        Fixture {
            dir,
            channel,
            poller,
            events,
            stop,
            _status: status_tx,
        }
    }

    #[tokio::test]
    async fn start_is_forwarded_and_cleared() {
        let mut f = fixture();
        f.channel
            .post_command(&ControlCommand::now(Command::Start))
            .unwrap();

        assert_eq!(f.poller.poll_once().await.unwrap(), Some(Command::Start));
        assert_eq!(f.events.try_recv().unwrap(), Event::Control(Command::Start));
        assert!(!f.dir.path().join(CONTROL_FILE).exists());
        assert!(!f.stop.has_changed().unwrap());

        assert_eq!(f.poller.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stop_and_restart_raise_the_stop_signal() {
        let mut f = fixture();
        for command in [Command::Stop, Command::Restart].iter() {
            f.channel.post_command(&ControlCommand::now(*command)).unwrap();
            f.poller.poll_once().await.unwrap();
            assert_eq!(f.events.try_recv().unwrap(), Event::Control(*command));
        }

        assert!(f.stop.has_changed().unwrap());
        assert_eq!(*f.stop.borrow_and_update(), 2);
    }

    #[tokio::test]
    async fn corrupt_command_is_dropped_and_status_rewritten() {
        let mut f = fixture();
        fs::write(f.dir.path().join(CONTROL_FILE), "{\"command\": \"sta").unwrap();

        assert_eq!(f.poller.poll_once().await.unwrap(), None);

        assert!(f.events.try_recv().is_err());
        assert!(!f.dir.path().join(CONTROL_FILE).exists());
        let status = f.channel.read_status().unwrap().unwrap();
        assert_eq!(status.status, RunStatus::Stopped);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn unknown_command_counts_as_corrupt() {
        let f = fixture();
        fs::write(
            f.dir.path().join(CONTROL_FILE),
            r#"{"command": "pause", "requested_at": 1700000000.0}"#,
        )
        .unwrap();

        assert_eq!(f.poller.poll_once().await.unwrap(), None);
        assert!(f.dir.path().join(STATUS_FILE).exists());
    }

    #[tokio::test]
    async fn full_event_queue_does_not_stall_the_poller() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(FileControlChannel::open(dir.path()).unwrap());
        let (events_tx, _events) = mpsc::channel(1);
        events_tx.try_send(Event::HealthTick).unwrap();
        let (stop_tx, _stop) = watch::channel(0);
        let (_status_tx, status_rx) =
            watch::channel(StatusSnapshot::stopped(EncodingMode::HardCut));
        let poller = ControlPoller::new(
            channel.clone(),
            events_tx,
            stop_tx,
            status_rx,
            Duration::from_millis(200),
        );
        channel
            .post_command(&ControlCommand::now(Command::Start))
            .unwrap();

        let polled = tokio::time::timeout(Duration::from_secs(5), poller.poll_once())
            .await
            .unwrap();
        assert!(matches!(polled, Err(EngineError::Timeout(_))));

        poller.write_status().await.unwrap();
        assert!(dir.path().join(STATUS_FILE).exists());
    }

    #[tokio::test]
    async fn run_ends_with_the_runtime_and_leaves_a_status() {
        let f = fixture();
        let Fixture {
            dir,
            channel,
            poller,
            events,
            ..
        } = f;

        let handle = tokio::spawn(poller.run(Duration::from_millis(10), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(events);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(dir.path().join(STATUS_FILE).exists());
        assert_eq!(
            channel.read_status().unwrap().map(|status| status.status),
            Some(RunStatus::Stopped)
        );
    }
}
