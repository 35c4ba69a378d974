use super::feeder::FeederSet;
use super::{BoundHandle, InputBinder, SlotId};
use crate::command;
use crate::encoder::Launcher;
use crate::error::EngineError;
use async_trait::async_trait;
use loopcast_core::models::{BindingStrategy, EncoderSettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const RELAY_SETTLE: Duration = Duration::from_secs(1);

/// Each slot has its own encoder sending MPEG-TS to a loopback UDP port. The main encoder
/// listens on both ports and its blend decides which one goes out.
pub struct RelayBinder {
    base_port: u16,
    encoder: EncoderSettings,
    feeders: FeederSet,
}

impl RelayBinder {
    pub fn new(base_port: u16, encoder: EncoderSettings, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            base_port,
            encoder,
            feeders: FeederSet::new(launcher),
        }
    }

    fn port(&self, slot: SlotId) -> u16 {
        self.base_port.saturating_add(slot.index() as u16)
    }

    async fn feed(&mut self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError> {
        let spec = command::relay_feeder(
            &self.encoder,
            &format!("{} relay", slot),
            loop_path,
            self.port(slot),
        )?;
        self.feeders.start(slot, spec).await
    }
}

#[async_trait]
impl InputBinder for RelayBinder {
    fn strategy(&self) -> BindingStrategy {
        BindingStrategy::DualProcessRelay
    }

    async fn prepare(&mut self, slot: SlotId, loop_path: &Path) -> Result<BoundHandle, EngineError> {
        self.feed(slot, loop_path).await?;
        Ok(BoundHandle {
            slot,
            input_args: vec![
                "-f".to_string(),
                "mpegts".to_string(),
                "-i".to_string(),
                format!(
                    "udp://127.0.0.1:{}?fifo_size=1000000&overrun_nonfatal=1",
                    self.port(slot)
                ),
            ],
        })
    }

    async fn repoint(&mut self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError> {
        self.feed(slot, loop_path).await
    }

    fn settle_delay(&self) -> Duration {
        RELAY_SETTLE
    }

    async fn check(&mut self) -> Result<(), EngineError> {
        self.feeders.respawn_dead().await.map(|_| ())
    }

    async fn release(&mut self) -> Result<(), EngineError> {
        self.feeders.stop_all().await;
        Ok(())
    }
}
