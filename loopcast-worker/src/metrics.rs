use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use loopcast_core::models::EncodingMode;
use prometheus::{self, Encoder, TextEncoder};
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};
use std::path::Path;

lazy_static! {
    pub static ref TRACK_SWITCH_COUNTER: IntCounter = register_int_counter!(
        "loopcast_track_switches",
        "Number of times the video loop was switched for a new track"
    )
    .unwrap();
    pub static ref PROCESS_SPAWN_COUNTER: IntCounter = register_int_counter!(
        "loopcast_encoder_spawns",
        "Number of encoder processes launched"
    )
    .unwrap();
    pub static ref PROCESS_CRASH_COUNTER: IntCounter = register_int_counter!(
        "loopcast_encoder_crashes",
        "Number of encoder processes that exited without being asked to"
    )
    .unwrap();
    pub static ref RESTART_ATTEMPT_COUNTER: IntCounter = register_int_counter!(
        "loopcast_restart_attempts",
        "Number of automatic restarts attempted by the health monitor"
    )
    .unwrap();
    pub static ref RESTART_BUDGET_EXHAUSTED_COUNTER: IntCounter = register_int_counter!(
        "loopcast_restart_budget_exhausted",
        "Number of times a session ran out of restarts and failed"
    )
    .unwrap();
    pub static ref MODE_DEMOTION_COUNTER: IntCounter = register_int_counter!(
        "loopcast_mode_demotions",
        "Number of times persistent mode was demoted to hard-cut"
    )
    .unwrap();
    pub static ref FILTER_GRAPH_ERROR_COUNTER: IntCounter = register_int_counter!(
        "loopcast_filter_graph_errors",
        "Number of crossfade filter graphs that could not be built or applied"
    )
    .unwrap();
    pub static ref RESOLUTION_MISS_COUNTER: IntCounter = register_int_counter!(
        "loopcast_resolution_misses",
        "Number of tracks that fell back to the default loop"
    )
    .unwrap();
    pub static ref CONTROL_CORRUPTION_COUNTER: IntCounter = register_int_counter!(
        "loopcast_control_corruptions",
        "Number of malformed control documents discarded"
    )
    .unwrap();
    pub static ref SWITCH_DURATION: Histogram = register_histogram!(
        "loopcast_switch_duration_seconds",
        "Seconds it took to complete a track switch"
    )
    .unwrap();
}

/// Something the observability collaborator wants to hear about.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    TrackSwitched {
        key: &'a str,
        loop_path: &'a Path,
        mode: EncodingMode,
    },
    ProcessSpawned {
        label: &'a str,
        pid: Option<u32>,
    },
    ProcessCrashed {
        label: &'a str,
        reason: &'a str,
    },
    RestartAttempted {
        attempt: u32,
        max: u32,
    },
    RestartBudgetExhausted {
        attempts: u32,
    },
    ModeDemoted {
        failures: u32,
    },
    FilterGraphError {
        reason: &'a str,
    },
    ResolutionMiss {
        key: &'a str,
    },
    ControlCorruption {
        reason: &'a str,
    },
}

/// Logs the event as one `key=value` line and counts it.
pub fn emit(event: EngineEvent) {
    const TARGET: &str = "loopcast::events";
    match event {
        EngineEvent::TrackSwitched {
            key,
            loop_path,
            mode,
        } => {
            TRACK_SWITCH_COUNTER.inc();
            info!(target: TARGET, "event=track_switched track=\"{}\" loop={} mode={}", key, loop_path.display(), mode);
        }
        EngineEvent::ProcessSpawned { label, pid } => {
            PROCESS_SPAWN_COUNTER.inc();
            info!(target: TARGET, "event=process_spawned label={} pid={:?}", label, pid);
        }
        EngineEvent::ProcessCrashed { label, reason } => {
            PROCESS_CRASH_COUNTER.inc();
            error!(target: TARGET, "event=process_crashed label={} reason=\"{}\"", label, reason);
        }
        EngineEvent::RestartAttempted { attempt, max } => {
            RESTART_ATTEMPT_COUNTER.inc();
            warn!(target: TARGET, "event=restart_attempted attempt={} max={}", attempt, max);
        }
        EngineEvent::RestartBudgetExhausted { attempts } => {
            RESTART_BUDGET_EXHAUSTED_COUNTER.inc();
            error!(target: TARGET, "event=restart_budget_exhausted attempts={} action=manual_reset_required", attempts);
        }
        EngineEvent::ModeDemoted { failures } => {
            MODE_DEMOTION_COUNTER.inc();
            warn!(target: TARGET, "event=mode_demoted from=persistent-dual-input to=hard-cut failures={}", failures);
        }
        EngineEvent::FilterGraphError { reason } => {
            FILTER_GRAPH_ERROR_COUNTER.inc();
            warn!(target: TARGET, "event=filter_graph_error reason=\"{}\"", reason);
        }
        EngineEvent::ResolutionMiss { key } => {
            RESOLUTION_MISS_COUNTER.inc();
            info!(target: TARGET, "event=resolution_miss track=\"{}\"", key);
        }
        EngineEvent::ControlCorruption { reason } => {
            CONTROL_CORRUPTION_COUNTER.inc();
            warn!(target: TARGET, "event=control_corruption reason=\"{}\"", reason);
        }
    }
}

pub fn get_metric_contents() -> String {
    debug!("Metrics endpoint called!");
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("Could not encode metrics: {}", err);
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_events_are_counted() {
        let before = MODE_DEMOTION_COUNTER.get();
        emit(EngineEvent::ModeDemoted { failures: 3 });
        assert!(MODE_DEMOTION_COUNTER.get() > before);
    }

    #[test]
    fn exposition_lists_registered_metrics() {
        emit(EngineEvent::ResolutionMiss { key: "nobody - nothing" });
        let contents = get_metric_contents();
        assert!(contents.contains("loopcast_resolution_misses"));
    }
}
