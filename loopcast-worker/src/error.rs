use crate::slots::SlotId;
use derive_more::Display;
use loopcast_core::models::SessionState;

/// Failures below the level of the whole broadcast. Most of them are handled where they happen;
/// only an exhausted restart budget ends up in front of a human.
#[derive(Debug, Display)]
pub enum EngineError {
    #[display(fmt = "encoder failed to launch: {}", _0)]
    ProcessSpawnFailure(String),
    #[display(fmt = "encoder exited unexpectedly: {}", _0)]
    ProcessCrash(String),
    #[display(fmt = "filter graph rejected: {}", _0)]
    FilterGraph(String),
    #[display(fmt = "{} is still driving an active crossfade", _0)]
    SlotBusy(SlotId),
    #[display(fmt = "restart budget of {} attempts exhausted", _0)]
    RestartBudgetExhausted(u32),
    #[display(fmt = "session cannot go from {} to {}", from, to)]
    InvalidTransition { from: SessionState, to: SessionState },
    #[display(fmt = "timed out: {}", _0)]
    Timeout(String),
    #[display(fmt = "i/o failure: {}", _0)]
    Io(String),
    #[display(fmt = "unsupported: {}", _0)]
    Unsupported(String),
    #[display(fmt = "stopped while in flight")]
    Cancelled,
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl EngineError {
    pub fn is_filter_graph(&self) -> bool {
        matches!(self, EngineError::FilterGraph(_))
    }
}
