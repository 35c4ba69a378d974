use crate::error::EngineError;
use log::info;
use loopcast_core::control::{CurrentTrack, RunStatus, StatusSnapshot};
use loopcast_core::models::{EncodingMode, SessionState};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// The one broadcast an engine instance runs. Only the orchestrator holds it.
#[derive(Debug)]
pub struct StreamSession {
    state: SessionState,
    configured_mode: EncodingMode,
    mode: EncodingMode,
    restart_count: u32,
    last_restart: Option<Instant>,
    running_since: Option<Instant>,
    started_at: Option<f64>,
    current_track_key: Option<String>,
    current_loop: Option<PathBuf>,
    track_started: Option<(Instant, f64)>,
    track_duration: Option<Duration>,
}

fn allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    matches!(
        (from, to),
        (Stopped, Spawning)
            | (Spawning, Running)
            | (Spawning, Crashed)
            | (Spawning, Stopped)
            | (Running, Crashed)
            | (Running, Stopped)
            | (Crashed, Spawning)
            | (Crashed, Failed)
            | (Crashed, Stopped)
            | (Failed, Stopped)
    )
}

impl StreamSession {
    pub fn new(mode: EncodingMode) -> Self {
        Self {
            state: SessionState::Stopped,
            configured_mode: mode,
            mode,
            restart_count: 0,
            last_restart: None,
            running_since: None,
            started_at: None,
            current_track_key: None,
            current_loop: None,
            track_started: None,
            track_duration: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> EncodingMode {
        self.mode
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn last_restart(&self) -> Option<Instant> {
        self.last_restart
    }

    pub fn running_since(&self) -> Option<Instant> {
        self.running_since
    }

    pub fn current_track_key(&self) -> Option<&str> {
        self.current_track_key.as_deref()
    }

    pub fn current_loop(&self) -> Option<&Path> {
        self.current_loop.as_deref()
    }

    pub fn transition(&mut self, to: SessionState) -> Result<(), EngineError> {
        if !allowed(self.state, to) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!("Session {} -> {}", self.state, to);
        self.state = to;
        match to {
            SessionState::Running => self.running_since = Some(Instant::now()),
            _ => self.running_since = None,
        }
        Ok(())
    }

    /// A fresh run from `Stopped`: counters cleared and the configured mode back in force.
    pub fn begin(&mut self, unix_now: f64) {
        self.restart_count = 0;
        self.last_restart = None;
        self.mode = self.configured_mode;
        self.started_at = Some(unix_now);
    }

    pub fn record_restart(&mut self, now: Instant) -> u32 {
        self.restart_count += 1;
        self.last_restart = Some(now);
        self.restart_count
    }

    pub fn reset_restarts(&mut self) {
        self.restart_count = 0;
        self.last_restart = None;
    }

    pub fn demote(&mut self) {
        self.mode = EncodingMode::HardCut;
    }

    pub fn set_track(
        &mut self,
        key: &str,
        loop_path: &Path,
        duration: Option<Duration>,
        unix_now: f64,
    ) {
        self.current_track_key = Some(key.to_string());
        self.current_loop = Some(loop_path.to_path_buf());
        self.track_started = Some((Instant::now(), unix_now));
        self.track_duration = duration;
    }

    pub fn clear_track(&mut self) {
        self.current_loop = None;
        self.track_started = None;
        self.track_duration = None;
    }

    /// Estimated time left in the current track, if its length was announced.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let (started, _) = self.track_started?;
        let duration = self.track_duration?;
        Some(duration.saturating_sub(now.saturating_duration_since(started)))
    }

    pub fn status_snapshot(&self, pid: Option<u32>, unix_now: f64) -> StatusSnapshot {
        let status = RunStatus::from(self.state);
        let current_track = match (&self.current_track_key, self.track_started, pid) {
            (Some(key), Some((_, started_at)), Some(pid)) if status == RunStatus::Running => {
                Some(CurrentTrack {
                    track_key: key.clone(),
                    uptime_seconds: (unix_now - started_at).max(0.0),
                    started_at,
                    pid,
                })
            }
            _ => None,
        };

        StatusSnapshot {
            running: status == RunStatus::Running,
            status,
            current_track,
            restart_count: self.restart_count,
            state: self.state,
            mode: self.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lifecycle_follows_the_state_machine() {
        let mut session = StreamSession::new(EncodingMode::HardCut);
        session.transition(SessionState::Spawning).unwrap();
        session.transition(SessionState::Running).unwrap();
        session.transition(SessionState::Crashed).unwrap();
        session.transition(SessionState::Spawning).unwrap();
        session.transition(SessionState::Crashed).unwrap();
        session.transition(SessionState::Failed).unwrap();
        session.transition(SessionState::Stopped).unwrap();
    }

    #[test]
    fn failed_session_cannot_respawn_on_its_own() {
        let mut session = StreamSession::new(EncodingMode::HardCut);
        session.transition(SessionState::Spawning).unwrap();
        session.transition(SessionState::Crashed).unwrap();
        session.transition(SessionState::Failed).unwrap();

        let err = session.transition(SessionState::Spawning).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: SessionState::Failed,
                to: SessionState::Spawning
            }
        ));
    }

    #[test]
    fn running_requires_spawning_first() {
        let mut session = StreamSession::new(EncodingMode::HardCut);
        assert!(session.transition(SessionState::Running).is_err());
    }

    #[test]
    fn begin_restores_configured_mode() {
        let mut session = StreamSession::new(EncodingMode::PersistentDualInput);
        session.demote();
        session.record_restart(Instant::now());
        session.begin(1_700_000_000.0);

        assert_eq!(session.mode(), EncodingMode::PersistentDualInput);
        assert_eq!(session.restart_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_time_counts_down_and_saturates() {
        let mut session = StreamSession::new(EncodingMode::PersistentDualInput);
        session.set_track("a - b", Path::new("/l.mp4"), Some(Duration::from_secs(10)), 0.0);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(session.remaining(Instant::now()), Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(session.remaining(Instant::now()), Some(Duration::ZERO));
    }

    #[test]
    fn unknown_duration_has_no_estimate() {
        let mut session = StreamSession::new(EncodingMode::HardCut);
        session.set_track("a - b", Path::new("/l.mp4"), None, 0.0);
        assert_eq!(session.remaining(Instant::now()), None);
    }

    #[test]
    fn snapshot_reports_current_track_while_running() {
        let mut session = StreamSession::new(EncodingMode::HardCut);
        session.transition(SessionState::Spawning).unwrap();
        session.transition(SessionState::Running).unwrap();
        session.set_track("low - words", Path::new("/l.mp4"), None, 1_700_000_000.0);

        let snapshot = session.status_snapshot(Some(4242), 1_700_000_012.5);
        assert_eq!(
            snapshot.current_track,
            Some(CurrentTrack {
                track_key: "low - words".to_string(),
                uptime_seconds: 12.5,
                started_at: 1_700_000_000.0,
                pid: 4242,
            })
        );
        assert!(snapshot.running);
    }

    #[test]
    fn snapshot_of_failed_session_is_crashed_without_track() {
        let mut session = StreamSession::new(EncodingMode::HardCut);
        session.set_track("low - words", Path::new("/l.mp4"), None, 0.0);
        session.transition(SessionState::Spawning).unwrap();
        session.transition(SessionState::Crashed).unwrap();
        session.transition(SessionState::Failed).unwrap();

        let snapshot = session.status_snapshot(None, 10.0);
        assert_eq!(snapshot.status, RunStatus::Crashed);
        assert_eq!(snapshot.current_track, None);
        assert!(!snapshot.running);
    }
}
