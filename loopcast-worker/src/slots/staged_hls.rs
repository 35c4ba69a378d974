use super::feeder::FeederSet;
use super::{BoundHandle, InputBinder, SlotId};
use crate::command;
use crate::encoder::Launcher;
use crate::error::EngineError;
use crate::io;
use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use loopcast_core::models::{BindingStrategy, EncoderSettings};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Each slot is a live HLS playlist written by a first-stage encoder. Repointing restarts that
/// encoder on the new loop; the playlist continues, so the main encoder never reopens anything.
pub struct StagedHlsBinder {
    work_dir: PathBuf,
    segment_secs: u32,
    encoder: EncoderSettings,
    feeders: FeederSet,
    io_timeout: Duration,
}

impl StagedHlsBinder {
    pub fn new(
        work_dir: &Path,
        segment_secs: u32,
        encoder: EncoderSettings,
        launcher: Arc<dyn Launcher>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            segment_secs: segment_secs.max(1),
            encoder,
            feeders: FeederSet::new(launcher),
            io_timeout,
        }
    }

    fn slot_dir(&self, slot: SlotId) -> PathBuf {
        self.work_dir.join(slot.to_string())
    }

    fn playlist(&self, slot: SlotId) -> PathBuf {
        self.slot_dir(slot).join("index.m3u8")
    }

    async fn feed(&mut self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError> {
        let spec = command::hls_feeder(
            &self.encoder,
            &format!("{} segmenter", slot),
            loop_path,
            &self.playlist(slot),
            self.segment_secs,
        )?;
        self.feeders.start(slot, spec).await
    }
}

#[async_trait]
impl InputBinder for StagedHlsBinder {
    fn strategy(&self) -> BindingStrategy {
        BindingStrategy::StagedHlsSegment
    }

    async fn prepare(&mut self, slot: SlotId, loop_path: &Path) -> Result<BoundHandle, EngineError> {
        let dir = self.slot_dir(slot);
        io::blocking(self.io_timeout, "create segment directory", move || {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(&dir)
                .wrap_err_with(|| format!("Could not create {}", dir.display()))
        })
        .await?;
        self.feed(slot, loop_path).await?;

        Ok(BoundHandle {
            slot,
            input_args: vec![
                "-live_start_index".to_string(),
                "-3".to_string(),
                "-i".to_string(),
                self.playlist(slot).to_string_lossy().into_owned(),
            ],
        })
    }

    async fn repoint(&mut self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError> {
        self.feed(slot, loop_path).await
    }

    /// Segments already in the playlist have to play out first.
    fn settle_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.segment_secs) * 2)
    }

    async fn check(&mut self) -> Result<(), EngineError> {
        self.feeders.respawn_dead().await.map(|_| ())
    }

    async fn release(&mut self) -> Result<(), EngineError> {
        self.feeders.stop_all().await;
        Ok(())
    }
}
