//! The switch orchestrator: owns the stream session and every encoder process it runs.
//!
//! Every public method is called from the single runtime task, one at a time, so a switch in
//! progress is never interleaved with another switch, a health check or a control command. The
//! only thing that reaches in from outside while a method runs is the stop signal, which aborts
//! whatever the orchestrator is waiting on.

use crate::command;
use crate::crossfade::{CrossfadePlan, CrossfadePlanner};
use crate::encoder::{wait_or_stop, EncodeProcess, Launcher};
use crate::error::EngineError;
use crate::health::{HealthMonitor, RestartDecision};
use crate::metrics::{emit, EngineEvent, SWITCH_DURATION};
use crate::resolver::{Resolution, TrackResolver};
use crate::session::StreamSession;
use crate::slots::{InputBinder, SlotId, SlotManager};
use log::{debug, info, warn};
use loopcast_core::control::{unix_now, StatusSnapshot};
use loopcast_core::models::{Broadcast, EncodingMode, SessionState};
use loopcast_core::track::TrackChange;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// The track the session should be showing.
#[derive(Clone, Debug, PartialEq)]
struct Target {
    resolution: Resolution,
    duration: Option<Duration>,
}

pub struct Orchestrator {
    broadcast: Broadcast,
    resolver: TrackResolver,
    launcher: Arc<dyn Launcher>,
    slots: SlotManager,
    planner: CrossfadePlanner,
    monitor: HealthMonitor,
    session: StreamSession,
    live: Option<EncodeProcess>,
    target: Option<Target>,
    /// A switch that failed while the previous loop stayed on air.
    retry: Option<Target>,
    stop: watch::Receiver<u64>,
}

impl Orchestrator {
    pub fn new(
        broadcast: Broadcast,
        resolver: TrackResolver,
        launcher: Arc<dyn Launcher>,
        binder: Box<dyn InputBinder>,
        stop: watch::Receiver<u64>,
    ) -> Result<Self, EngineError> {
        let planner = CrossfadePlanner::new(&broadcast.crossfade, &broadcast.encoder)?;
        debug!(
            "Crossfades use {} over {}s",
            planner.kind(),
            broadcast.crossfade.duration_secs
        );
        Ok(Self {
            monitor: HealthMonitor::new(&broadcast.recovery),
            session: StreamSession::new(broadcast.mode),
            slots: SlotManager::new(binder),
            planner,
            broadcast,
            resolver,
            launcher,
            live: None,
            target: None,
            retry: None,
            stop,
        })
    }

    pub fn health_interval(&self) -> Duration {
        self.monitor.interval
    }

    pub fn status(&self) -> StatusSnapshot {
        let pid = self.live.as_ref().and_then(EncodeProcess::pid);
        self.session.status_snapshot(pid, unix_now())
    }

    pub async fn start(&mut self) -> Result<(), EngineError> {
        match self.session.state() {
            SessionState::Stopped => {}
            SessionState::Failed => {
                warn!("Session has failed, send a restart to reset it");
                return Ok(());
            }
            state => {
                debug!("Start ignored, session is {}", state);
                return Ok(());
            }
        }

        self.session.begin(unix_now());
        self.monitor.reset();
        info!(
            "Starting {} broadcast to {}",
            self.session.mode(),
            self.broadcast.output_url
        );
        let target = self.current_target();
        self.launch(target).await
    }

    pub async fn stop(&mut self) -> Result<(), EngineError> {
        // Whatever stop was signalled is being handled now.
        let _ = self.stop.borrow_and_update();

        if let Some(process) = self.live.take() {
            self.retire(process).await;
        }
        self.release_slots().await;
        self.retry = None;
        self.session.clear_track();
        if self.session.state() != SessionState::Stopped {
            self.session.transition(SessionState::Stopped)?;
        }
        Ok(())
    }

    /// Stop followed by a fresh start. This is also how a failed session is reset.
    pub async fn restart(&mut self) -> Result<(), EngineError> {
        self.stop().await?;
        self.start().await
    }

    pub async fn shutdown(&mut self) {
        if let Err(err) = self.stop().await {
            warn!("Could not stop cleanly: {}", err);
        }
    }

    pub async fn switch_track(&mut self, change: &TrackChange) -> Result<(), EngineError> {
        let resolution =
            self.resolver
                .resolve(&change.artist, &change.title, change.external_id.as_deref());
        debug!(
            "\"{}\" resolved by {:?} to {}",
            resolution.key,
            resolution.matched,
            resolution.loop_path.display()
        );
        let target = Target {
            resolution,
            duration: change.duration(),
        };
        self.target = Some(target.clone());
        // A newer track supersedes a switch still waiting for its retry.
        self.retry = None;

        if self.session.state() != SessionState::Running {
            info!(
                "Holding \"{}\" until the session is running (it is {})",
                target.resolution.key,
                self.session.state()
            );
            return Ok(());
        }
        if self.session.current_loop() == Some(target.resolution.loop_path.as_path()) {
            if self.session.current_track_key() != Some(target.resolution.key.as_str()) {
                debug!(
                    "\"{}\" uses the loop already on air",
                    target.resolution.key
                );
                self.session.set_track(
                    &target.resolution.key,
                    &target.resolution.loop_path,
                    target.duration,
                    unix_now(),
                );
            }
            return Ok(());
        }

        self.switch_or_retry_later(target).await
    }

    pub async fn health_tick(&mut self) -> Result<(), EngineError> {
        match self.session.state() {
            SessionState::Running => self.check_live().await,
            SessionState::Crashed => self.recover().await,
            _ => Ok(()),
        }
    }

    async fn switch_or_retry_later(&mut self, target: Target) -> Result<(), EngineError> {
        match self.apply(&target).await {
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(err) => {
                info!(
                    "\"{}\" will be retried, {} stays on air",
                    target.resolution.key,
                    self.session.current_track_key().unwrap_or("the previous loop")
                );
                self.retry = Some(target);
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Puts `target` on air in a running session, falling back to a hard cut once the filter
    /// graph has failed too often.
    async fn apply(&mut self, target: &Target) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = match self.session.mode() {
            EncodingMode::HardCut => self.hard_cut_switch(target).await,
            EncodingMode::PersistentDualInput => self.crossfade_switch(target).await,
        };

        match result {
            Ok(()) => {}
            Err(err)
                if err.is_filter_graph()
                    && self.session.mode() == EncodingMode::PersistentDualInput =>
            {
                if !self.filter_graph_failure(&err) {
                    return Err(err);
                }
                self.hard_cut_switch(target).await?;
            }
            Err(err) => return Err(err),
        }
        SWITCH_DURATION.observe(started.elapsed().as_secs_f64());
        self.on_air(target);
        Ok(())
    }

    /// Retries a failed switch under the same budget and cooldown as crash restarts.
    async fn retry_switch(&mut self, target: Target) -> Result<(), EngineError> {
        let now = Instant::now();
        let decision = self.monitor.policy.decide(
            self.session.restart_count(),
            self.session.last_restart(),
            now,
        );

        match decision {
            RestartDecision::Wait(left) => {
                debug!(
                    "Retrying \"{}\" in {:?}",
                    target.resolution.key, left
                );
                self.retry = Some(target);
                Ok(())
            }
            RestartDecision::GiveUp => {
                let attempts = self.session.restart_count();
                warn!(
                    "Giving up on \"{}\" after {} attempts",
                    target.resolution.key, attempts
                );
                emit(EngineEvent::RestartBudgetExhausted { attempts });
                Err(EngineError::RestartBudgetExhausted(attempts))
            }
            RestartDecision::RestartNow => {
                let attempt = self.session.record_restart(now);
                emit(EngineEvent::RestartAttempted {
                    attempt,
                    max: self.monitor.policy.max_restarts,
                });
                self.switch_or_retry_later(target).await
            }
        }
    }

    fn current_target(&self) -> Target {
        self.target.clone().unwrap_or_else(|| Target {
            resolution: self.resolver.fallback(),
            duration: None,
        })
    }

    fn on_air(&mut self, target: &Target) {
        self.session.set_track(
            &target.resolution.key,
            &target.resolution.loop_path,
            target.duration,
            unix_now(),
        );
        emit(EngineEvent::TrackSwitched {
            key: &target.resolution.key,
            loop_path: &target.resolution.loop_path,
            mode: self.session.mode(),
        });
    }

    /// SPAWNING until the new encoder proves itself, then RUNNING or CRASHED.
    async fn launch(&mut self, target: Target) -> Result<(), EngineError> {
        self.session.transition(SessionState::Spawning)?;
        loop {
            let loop_path = target.resolution.loop_path.as_path();
            let result = match self.session.mode() {
                EncodingMode::HardCut => self.spawn_hard_cut(loop_path).await,
                EncodingMode::PersistentDualInput => self.spawn_persistent(loop_path).await,
            };

            match result {
                Ok(process) => {
                    self.live = Some(process);
                    self.retry = None;
                    self.session.transition(SessionState::Running)?;
                    self.on_air(&target);
                    return Ok(());
                }
                // Either another persistent attempt or, once demoted, a hard-cut one.
                Err(err)
                    if err.is_filter_graph()
                        && self.session.mode() == EncodingMode::PersistentDualInput =>
                {
                    self.filter_graph_failure(&err);
                }
                Err(EngineError::Cancelled) => {
                    self.session.transition(SessionState::Stopped)?;
                    return Err(EngineError::Cancelled);
                }
                Err(err) => {
                    self.session.transition(SessionState::Crashed)?;
                    return Err(err);
                }
            }
        }
    }

    async fn spawn_hard_cut(&mut self, loop_path: &Path) -> Result<EncodeProcess, EngineError> {
        let spec = command::hard_cut(&self.broadcast, loop_path)?;
        let mut process = EncodeProcess::spawn(self.launcher.as_ref(), &spec, Vec::new())
            .await
            .map_err(|err| report_failure(&spec.label, err))?;

        let grace = self.broadcast.switching.spawn_grace();
        let deadline = self.broadcast.switching.startup_timeout();
        match process.await_liveness(grace, deadline, &mut self.stop).await {
            Ok(()) => Ok(process),
            Err(err) => {
                self.retire(process).await;
                Err(report_failure(&spec.label, err))
            }
        }
    }

    async fn spawn_persistent(&mut self, loop_path: &Path) -> Result<EncodeProcess, EngineError> {
        let result = self.try_spawn_persistent(loop_path).await;
        if result.is_err() {
            self.release_slots().await;
        }
        result
    }

    async fn try_spawn_persistent(
        &mut self,
        loop_path: &Path,
    ) -> Result<EncodeProcess, EngineError> {
        let handles = self.slots.prepare_pair(loop_path).await?;
        let graph = self.planner.base_graph(self.slots.live_slot());
        let spec = command::persistent(&self.broadcast, &handles, &graph);
        let mut process = EncodeProcess::spawn(self.launcher.as_ref(), &spec, SlotId::BOTH.to_vec())
            .await
            .map_err(|err| report_failure(&spec.label, err))?;

        let grace = self.broadcast.switching.spawn_grace();
        let deadline = self.broadcast.switching.startup_timeout();
        match process.await_liveness(grace, deadline, &mut self.stop).await {
            Ok(()) => Ok(process),
            Err(err) => {
                self.retire(process).await;
                Err(report_failure(&spec.label, err))
            }
        }
    }

    /// New process up first, old one down after the overlap, so the relay never sees a gap.
    async fn hard_cut_switch(&mut self, target: &Target) -> Result<(), EngineError> {
        let incoming = self.spawn_hard_cut(&target.resolution.loop_path).await?;

        let overlap = self.broadcast.switching.overlap();
        if let Err(err) = wait_or_stop(&mut self.stop, overlap).await {
            self.retire(incoming).await;
            return Err(err);
        }

        if let Some(outgoing) = self.live.replace(incoming) {
            let used_slots = !outgoing.slots.is_empty();
            self.retire(outgoing).await;
            // Nothing reads the input slots once the persistent encoder is gone.
            if used_slots {
                self.release_slots().await;
            }
        }
        Ok(())
    }

    async fn crossfade_switch(&mut self, target: &Target) -> Result<(), EngineError> {
        let source = self.slots.live_slot();
        let destination = self.slots.idle_slot();
        let ack = self
            .slots
            .repoint(destination, &target.resolution.loop_path)
            .await?;
        debug!(
            "{} switched to {}, settling for {:?}",
            ack.slot,
            ack.loop_path.display(),
            ack.settle
        );
        wait_or_stop(&mut self.stop, ack.settle).await?;

        let plan = self
            .planner
            .plan(self.session.remaining(Instant::now()), source, destination);
        let (command, baseline) = {
            let live = self.live_mut()?;
            (plan.filter_command(live.uptime())?, live.filter_errors())
        };

        self.slots.begin(&plan)?;
        match self.run_plan(&plan, &command, baseline).await {
            Ok(()) => {
                self.slots.complete(&plan);
                self.monitor.filter_guard.record_success();
                Ok(())
            }
            Err(err) => {
                self.slots.abandon();
                Err(err)
            }
        }
    }

    async fn run_plan(
        &mut self,
        plan: &CrossfadePlan,
        command: &str,
        baseline: u32,
    ) -> Result<(), EngineError> {
        self.live_mut()?.send_command(command).await?;
        info!(
            "Crossfading {} -> {} with {} in {:?} over {:?}",
            plan.source, plan.destination, plan.kind, plan.offset, plan.duration
        );
        wait_or_stop(&mut self.stop, plan.total()).await?;

        let live = self.live_mut()?;
        if live.filter_errors() > baseline {
            return Err(EngineError::FilterGraph(format!(
                "encoder rejected the {} crossfade",
                plan.kind
            )));
        }
        live.send_command(&plan.settled_command()).await
    }

    fn live_mut(&mut self) -> Result<&mut EncodeProcess, EngineError> {
        self.live
            .as_mut()
            .ok_or_else(|| EngineError::ProcessCrash("no encoder is running".to_string()))
    }

    /// Counts a filter graph failure and demotes the session once there were too many in a row.
    fn filter_graph_failure(&mut self, err: &EngineError) -> bool {
        emit(EngineEvent::FilterGraphError {
            reason: &err.to_string(),
        });
        if self.session.mode() != EncodingMode::PersistentDualInput {
            return false;
        }
        if !self.monitor.filter_guard.record_failure() {
            return false;
        }
        self.session.demote();
        emit(EngineEvent::ModeDemoted {
            failures: self.monitor.filter_guard.consecutive(),
        });
        true
    }

    async fn check_live(&mut self) -> Result<(), EngineError> {
        let exited = match self.live.as_mut() {
            Some(process) => process.poll()?,
            None => None,
        };

        if let Some(report) = exited {
            let (label, used_slots) = match self.live.take() {
                Some(process) => (process.label, !process.slots.is_empty()),
                None => (String::new(), false),
            };
            emit(EngineEvent::ProcessCrashed {
                label: &label,
                reason: &report.reason(),
            });
            if report.filter_graph_error {
                self.filter_graph_failure(&EngineError::FilterGraph(report.reason()));
            }
            if used_slots {
                self.release_slots().await;
            }
            self.session.transition(SessionState::Crashed)?;
            return self.recover().await;
        }

        if let Some(process) = self.live.as_ref() {
            debug!("{} alive, up {:?}", process.label, process.uptime());
        }
        let now = Instant::now();
        if self.retry.is_none()
            && self.monitor.policy.should_reset(
            self.session.restart_count(),
            self.session.running_since(),
            now,
        ) {
            info!(
                "Running cleanly for {:?}, restart budget restored",
                self.monitor.policy.stable_reset
            );
            self.session.reset_restarts();
        }
        let uses_slots = self
            .live
            .as_ref()
            .map_or(false, |process| !process.slots.is_empty());
        if uses_slots {
            if let Err(err) = self.slots.check().await {
                warn!("Input slot check failed: {}", err);
            }
        }
        match self.retry.take() {
            Some(target) => self.retry_switch(target).await,
            None => Ok(()),
        }
    }

    async fn recover(&mut self) -> Result<(), EngineError> {
        let now = Instant::now();
        let decision = self.monitor.policy.decide(
            self.session.restart_count(),
            self.session.last_restart(),
            now,
        );

        match decision {
            RestartDecision::Wait(left) => {
                debug!("Next restart allowed in {:?}", left);
                Ok(())
            }
            RestartDecision::GiveUp => {
                let attempts = self.session.restart_count();
                self.session.transition(SessionState::Failed)?;
                self.release_slots().await;
                emit(EngineEvent::RestartBudgetExhausted { attempts });
                Err(EngineError::RestartBudgetExhausted(attempts))
            }
            RestartDecision::RestartNow => {
                let attempt = self.session.record_restart(now);
                emit(EngineEvent::RestartAttempted {
                    attempt,
                    max: self.monitor.policy.max_restarts,
                });
                let target = self.current_target();
                self.launch(target).await
            }
        }
    }

    async fn retire(&mut self, process: EncodeProcess) {
        let label = process.label.clone();
        match process
            .terminate(self.broadcast.switching.terminate_timeout())
            .await
        {
            Ok(report) => debug!("{} stopped with {}", label, report.reason()),
            Err(err) => warn!("Could not stop {}: {}", label, err),
        }
    }

    async fn release_slots(&mut self) {
        if let Err(err) = self.slots.release().await {
            warn!("Could not release input slots: {}", err);
        }
    }
}

fn report_failure(label: &str, err: EngineError) -> EngineError {
    if !matches!(err, EngineError::Cancelled) {
        emit(EngineEvent::ProcessCrashed {
            label,
            reason: &err.to_string(),
        });
    }
    err
}

#[cfg(test)]
impl Orchestrator {
    fn state(&self) -> SessionState {
        self.session.state()
    }

    fn mode(&self) -> EncodingMode {
        self.session.mode()
    }

    fn restart_count(&self) -> u32 {
        self.session.restart_count()
    }

    fn current_track_key(&self) -> Option<&str> {
        self.session.current_track_key()
    }

    fn live_slot(&self) -> SlotId {
        self.slots.live_slot()
    }
}
