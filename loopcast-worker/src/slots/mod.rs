//! The two input handles a persistent encoder reads from, and the strategies that repoint them.
//!
//! The orchestrator only talks to [`SlotManager`], which enforces the slot rules: one repoint at
//! a time, and never on a slot that a crossfade is still reading. How a slot is actually pointed
//! at a file is up to the [`InputBinder`] picked for the deployment.

mod concat;
mod feeder;
mod relay;
mod staged_hls;
mod symlink;

use crate::crossfade::CrossfadePlan;
use crate::encoder::Launcher;
use crate::error::EngineError;
use async_trait::async_trait;
use derive_more::Display;
use log::{debug, info};
use loopcast_core::models::{BindingStrategy, EncoderSettings, SlotSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Display, Eq, PartialEq, Hash)]
pub enum SlotId {
    #[display(fmt = "slot-0")]
    Zero,
    #[display(fmt = "slot-1")]
    One,
}

impl SlotId {
    pub const BOTH: [SlotId; 2] = [SlotId::Zero, SlotId::One];

    pub fn index(self) -> usize {
        match self {
            SlotId::Zero => 0,
            SlotId::One => 1,
        }
    }

    pub fn other(self) -> SlotId {
        match self {
            SlotId::Zero => SlotId::One,
            SlotId::One => SlotId::Zero,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputSlot {
    pub id: SlotId,
    pub bound: Option<PathBuf>,
    pub strategy: BindingStrategy,
}

/// What the encoder needs on its command line to read one slot.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundHandle {
    pub slot: SlotId,
    pub input_args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RepointAck {
    pub slot: SlotId,
    pub loop_path: PathBuf,
    /// How long to wait before the encoder is guaranteed to be reading the new loop.
    pub settle: Duration,
}

/// One way of pointing an encoder input at a loop file.
#[async_trait]
pub trait InputBinder: Send {
    fn strategy(&self) -> BindingStrategy;

    async fn prepare(&mut self, slot: SlotId, loop_path: &Path)
        -> Result<BoundHandle, EngineError>;

    async fn repoint(&mut self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError>;

    fn settle_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Called on every health tick while the session runs.
    async fn check(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn release(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

pub fn binder_for(
    settings: &SlotSettings,
    encoder: &EncoderSettings,
    launcher: Arc<dyn Launcher>,
    io_timeout: Duration,
) -> Box<dyn InputBinder> {
    match settings.strategy {
        BindingStrategy::Symlink => {
            Box::new(symlink::SymlinkBinder::new(&settings.work_dir, io_timeout))
        }
        BindingStrategy::ConcatList => Box::new(concat::ConcatBinder::new(
            &settings.work_dir,
            settings.concat_repeat,
            io_timeout,
        )),
        BindingStrategy::StagedHlsSegment => Box::new(staged_hls::StagedHlsBinder::new(
            &settings.work_dir,
            settings.hls_segment_secs,
            encoder.clone(),
            launcher,
            io_timeout,
        )),
        BindingStrategy::DualProcessRelay => Box::new(relay::RelayBinder::new(
            settings.relay_base_port,
            encoder.clone(),
            launcher,
        )),
    }
}

pub struct SlotManager {
    binder: Box<dyn InputBinder>,
    slots: [InputSlot; 2],
    live: SlotId,
    pending: Option<SlotId>,
    in_flight: Option<(SlotId, SlotId)>,
}

impl SlotManager {
    pub fn new(binder: Box<dyn InputBinder>) -> Self {
        let strategy = binder.strategy();
        let slot = |id| InputSlot {
            id,
            bound: None,
            strategy,
        };
        Self {
            binder,
            slots: [slot(SlotId::Zero), slot(SlotId::One)],
            live: SlotId::Zero,
            pending: None,
            in_flight: None,
        }
    }

    /// Binds both slots to the same loop and makes slot-0 the one on air.
    pub async fn prepare_pair(&mut self, loop_path: &Path) -> Result<[BoundHandle; 2], EngineError> {
        self.pending = None;
        self.in_flight = None;
        self.live = SlotId::Zero;

        let first = self.binder.prepare(SlotId::Zero, loop_path).await?;
        self.slots[0].bound = Some(loop_path.to_path_buf());
        let second = self.binder.prepare(SlotId::One, loop_path).await?;
        self.slots[1].bound = Some(loop_path.to_path_buf());

        info!(
            "Prepared input slots with {} for {}",
            self.binder.strategy(),
            loop_path.display()
        );
        Ok([first, second])
    }

    pub fn live_slot(&self) -> SlotId {
        self.live
    }

    pub fn idle_slot(&self) -> SlotId {
        self.live.other()
    }

    #[cfg(test)]
    pub fn bound(&self, id: SlotId) -> Option<&Path> {
        self.slots[id.index()].bound.as_deref()
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> Option<(SlotId, SlotId)> {
        self.in_flight
    }

    pub async fn repoint(&mut self, slot: SlotId, loop_path: &Path) -> Result<RepointAck, EngineError> {
        if let Some((source, destination)) = self.in_flight {
            if slot == source || slot == destination {
                return Err(EngineError::SlotBusy(slot));
            }
        }
        if let Some(pending) = self.pending {
            return Err(EngineError::SlotBusy(pending));
        }

        self.pending = Some(slot);
        self.binder.repoint(slot, loop_path).await?;
        self.pending = None;
        let entry = &mut self.slots[slot.index()];
        entry.bound = Some(loop_path.to_path_buf());
        debug!(
            "{} now points at {} through {}",
            entry.id,
            loop_path.display(),
            entry.strategy
        );

        Ok(RepointAck {
            slot,
            loop_path: loop_path.to_path_buf(),
            settle: self.binder.settle_delay(),
        })
    }

    /// Marks both slots of the plan as read by an active crossfade.
    pub fn begin(&mut self, plan: &CrossfadePlan) -> Result<(), EngineError> {
        if let Some((_, destination)) = self.in_flight {
            return Err(EngineError::SlotBusy(destination));
        }
        if let Some(pending) = self.pending {
            return Err(EngineError::SlotBusy(pending));
        }
        self.in_flight = Some((plan.source, plan.destination));
        Ok(())
    }

    /// The plan finished: its destination is now on air and its source becomes idle.
    pub fn complete(&mut self, plan: &CrossfadePlan) {
        if self.in_flight == Some((plan.source, plan.destination)) {
            self.in_flight = None;
            self.live = plan.destination;
        }
    }

    /// The plan never took effect: the source stays on air.
    pub fn abandon(&mut self) {
        self.in_flight = None;
    }

    pub async fn check(&mut self) -> Result<(), EngineError> {
        self.binder.check().await
    }

    pub async fn release(&mut self) -> Result<(), EngineError> {
        self.pending = None;
        self.in_flight = None;
        self.live = SlotId::Zero;
        for slot in self.slots.iter_mut() {
            slot.bound = None;
        }
        self.binder.release().await
    }
}
