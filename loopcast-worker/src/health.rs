use loopcast_core::models::RecoverySettings;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartDecision {
    RestartNow,
    /// Still cooling down from the previous restart.
    Wait(Duration),
    GiveUp,
}

/// Bounded restarts with a cooldown between them.
#[derive(Clone, Debug)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub cooldown: Duration,
    pub stable_reset: Duration,
}

impl RestartPolicy {
    pub fn decide(
        &self,
        restart_count: u32,
        last_restart: Option<Instant>,
        now: Instant,
    ) -> RestartDecision {
        if restart_count >= self.max_restarts {
            return RestartDecision::GiveUp;
        }
        match last_restart {
            None => RestartDecision::RestartNow,
            Some(last) => {
                let since = now.saturating_duration_since(last);
                if since >= self.cooldown {
                    RestartDecision::RestartNow
                } else {
                    RestartDecision::Wait(self.cooldown - since)
                }
            }
        }
    }

    /// A session that has run cleanly for long enough gets its budget back.
    pub fn should_reset(
        &self,
        restart_count: u32,
        running_since: Option<Instant>,
        now: Instant,
    ) -> bool {
        match running_since {
            Some(since) if restart_count > 0 => {
                now.saturating_duration_since(since) >= self.stable_reset
            }
            _ => false,
        }
    }
}

/// Counts filter graph failures in a row. Any success starts the count over.
#[derive(Clone, Debug)]
pub struct FilterFailureGuard {
    threshold: u32,
    consecutive: u32,
}

impl FilterFailureGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Returns true once the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.threshold
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

pub struct HealthMonitor {
    pub policy: RestartPolicy,
    pub filter_guard: FilterFailureGuard,
    pub interval: Duration,
}

impl HealthMonitor {
    pub fn new(settings: &RecoverySettings) -> Self {
        Self {
            policy: RestartPolicy {
                max_restarts: settings.max_restarts,
                cooldown: Duration::from_secs(settings.cooldown_secs),
                stable_reset: Duration::from_secs(settings.stable_reset_secs),
            },
            filter_guard: FilterFailureGuard::new(settings.filter_graph_failure_threshold),
            interval: Duration::from_millis(settings.health_interval_ms.max(10)),
        }
    }

    pub fn reset(&mut self) {
        self.filter_guard.record_success();
    }
}
