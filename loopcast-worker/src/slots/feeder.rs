use super::SlotId;
use crate::encoder::{EncoderSpec, Launcher, ProcessHandle};
use crate::error::EngineError;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

const FEEDER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

struct Feeder {
    spec: EncoderSpec,
    handle: Box<dyn ProcessHandle>,
}

/// The helper encoders behind the process-backed strategies, at most one per slot.
pub(super) struct FeederSet {
    launcher: Arc<dyn Launcher>,
    feeders: [Option<Feeder>; 2],
}

impl FeederSet {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            feeders: [None, None],
        }
    }

    /// Replaces whatever feeds `slot` with a process running `spec`.
    pub async fn start(&mut self, slot: SlotId, spec: EncoderSpec) -> Result<(), EngineError> {
        self.stop(slot).await;
        let handle = self.launcher.launch(&spec).await?;
        debug!("{} started with pid {:?}", spec.label, handle.pid());
        self.feeders[slot.index()] = Some(Feeder { spec, handle });
        Ok(())
    }

    pub async fn stop(&mut self, slot: SlotId) {
        if let Some(mut feeder) = self.feeders[slot.index()].take() {
            if let Err(err) = feeder.handle.terminate(FEEDER_STOP_TIMEOUT).await {
                warn!("Could not stop {}: {}", feeder.spec.label, err);
            }
        }
    }

    pub async fn stop_all(&mut self) {
        for slot in SlotId::BOTH.iter() {
            self.stop(*slot).await;
        }
    }

    /// Starts again every feeder whose process has exited. Returns how many were restarted.
    pub async fn respawn_dead(&mut self) -> Result<usize, EngineError> {
        let mut respawned = 0;
        for slot in SlotId::BOTH.iter() {
            let exited = match self.feeders[slot.index()].as_mut() {
                Some(feeder) => feeder.handle.try_exit()?,
                None => None,
            };
            if let Some(report) = exited {
                let spec = match self.feeders[slot.index()].take() {
                    Some(feeder) => feeder.spec,
                    None => continue,
                };
                warn!("{} exited with {}, starting it again", spec.label, report.reason());
                self.start(*slot, spec).await?;
                respawned += 1;
            }
        }
        Ok(respawned)
    }

    #[cfg(test)]
    pub fn is_running(&self, slot: SlotId) -> bool {
        self.feeders[slot.index()].is_some()
    }
}
