use crate::error::EngineError;
use crate::orchestrator::Orchestrator;
use derive_more::Display;
use log::{debug, error, info};
use loopcast_core::control::{Command, StatusSnapshot};
use loopcast_core::track::TrackChange;
use tokio::sync::{mpsc, watch};

#[derive(Clone, Debug, Display, PartialEq)]
pub enum Event {
    #[display(fmt = "track change")]
    TrackChanged(TrackChange),
    #[display(fmt = "{:?} command", _0)]
    Control(Command),
    #[display(fmt = "health tick")]
    HealthTick,
    #[display(fmt = "terminate")]
    Terminate,
}

/// Drops queued events that a later one makes pointless: only the last track change of a batch
/// is worth switching to, and one health tick does the work of many. Control commands keep their
/// order and nothing after a terminate is handled.
pub fn coalesce(batch: Vec<Event>) -> Vec<Event> {
    let last_track = batch
        .iter()
        .rposition(|event| matches!(event, Event::TrackChanged(_)));
    let mut ticked = false;
    let mut kept = Vec::with_capacity(batch.len());

    for (index, event) in batch.into_iter().enumerate() {
        match event {
            Event::TrackChanged(ref change) if Some(index) != last_track => {
                debug!("Superseded track change \"{}\"", change.key());
            }
            Event::HealthTick if ticked => {}
            Event::HealthTick => {
                ticked = true;
                kept.push(event);
            }
            Event::Terminate => {
                kept.push(event);
                break;
            }
            _ => kept.push(event),
        }
    }
    kept
}

/// Owns the orchestrator and feeds it one event at a time.
pub struct Runtime {
    receiver: mpsc::Receiver<Event>,
    orchestrator: Orchestrator,
    status: watch::Sender<StatusSnapshot>,
}

impl Runtime {
    pub fn new(
        receiver: mpsc::Receiver<Event>,
        orchestrator: Orchestrator,
        status: watch::Sender<StatusSnapshot>,
    ) -> Self {
        Runtime {
            receiver,
            orchestrator,
            status,
        }
    }

    pub async fn run(&mut self) {
        self.publish();
        while let Some(first) = self.receiver.recv().await {
            let mut batch = vec![first];
            while let Ok(event) = self.receiver.try_recv() {
                batch.push(event);
            }

            for event in coalesce(batch) {
                let terminate = event == Event::Terminate;
                self.handle(event).await;
                self.publish();
                if terminate {
                    return;
                }
            }
        }

        info!("Event channel closed, shutting down");
        self.orchestrator.shutdown().await;
        self.publish();
    }

    async fn handle(&mut self, event: Event) {
        debug!("Handling {}", event);
        let name = event.to_string();
        let result = match event {
            Event::TrackChanged(change) => {
                info!("Now playing \"{} - {}\"", change.artist, change.title);
                self.orchestrator.switch_track(&change).await
            }
            Event::Control(Command::Start) => self.orchestrator.start().await,
            Event::Control(Command::Stop) => self.orchestrator.stop().await,
            Event::Control(Command::Restart) => self.orchestrator.restart().await,
            Event::HealthTick => self.orchestrator.health_tick().await,
            Event::Terminate => {
                info!("Terminating, stopping all encoders");
                self.orchestrator.shutdown().await;
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(EngineError::Cancelled) => info!("{} was interrupted by a stop", name),
            Err(err) => error!("{} failed: {}", name, err),
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.orchestrator.status());
    }
}
