//! Supervision of external encoder processes.
//!
//! An [`EncodeProcess`] owns one launched encoder. It is the only place that knows how to tell
//! whether the process is alive, how to talk to it and how to stop it. What gets launched is
//! decided by [`Launcher`], so the orchestrator can be driven by a scripted fake in tests.

use crate::error::EngineError;
use crate::metrics::{emit, EngineEvent};
use crate::slots::SlotId;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

const LIVENESS_POLL: Duration = Duration::from_millis(100);
/// How long a killed process gets to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);
const DIAGNOSTIC_LINES: usize = 20;

/// A fully built command line.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderSpec {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Keep stdin open so commands can be sent to the running process.
    pub interactive: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub success: bool,
    pub filter_graph_error: bool,
    pub diagnostics: Vec<String>,
}

impl ExitReport {
    pub fn reason(&self) -> String {
        let code = match self.code {
            Some(_) if self.success => "exited cleanly".to_string(),
            Some(code) => format!("exit code {}", code),
            None => "killed by signal".to_string(),
        };
        match self.diagnostics.last() {
            Some(line) => format!("{} ({})", code, line),
            None => code,
        }
    }
}

#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// When the process last wrote anything to stderr.
    fn last_output(&self) -> Option<Instant>;

    /// Filter initialisation or command failures reported so far.
    fn filter_errors(&self) -> u32;

    fn try_exit(&mut self) -> Result<Option<ExitReport>, EngineError>;

    async fn send_command(&mut self, line: &str) -> Result<(), EngineError>;

    /// Asks the process to stop, and kills it if it is still there after `graceful`.
    async fn terminate(&mut self, graceful: Duration) -> Result<ExitReport, EngineError>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &EncoderSpec) -> Result<Box<dyn ProcessHandle>, EngineError>;
}

pub struct EncodeProcess {
    pub label: String,
    pub slots: Vec<SlotId>,
    pub spawned_at: Instant,
    pub exit: Option<ExitReport>,
    handle: Box<dyn ProcessHandle>,
}

impl EncodeProcess {
    pub async fn spawn(
        launcher: &dyn Launcher,
        spec: &EncoderSpec,
        slots: Vec<SlotId>,
    ) -> Result<Self, EngineError> {
        debug!(
            "Launching {}: {} {}",
            spec.label,
            spec.program.display(),
            spec.args.join(" ")
        );
        let handle = launcher.launch(spec).await?;
        emit(EngineEvent::ProcessSpawned {
            label: &spec.label,
            pid: handle.pid(),
        });

        Ok(Self {
            label: spec.label.clone(),
            slots,
            spawned_at: Instant::now(),
            exit: None,
            handle,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn filter_errors(&self) -> u32 {
        self.handle.filter_errors()
    }

    /// Returns the exit report once the process is gone.
    pub fn poll(&mut self) -> Result<Option<ExitReport>, EngineError> {
        if self.exit.is_none() {
            self.exit = self.handle.try_exit()?;
        }
        Ok(self.exit.clone())
    }

    /// Waits until the process has been producing output for `grace`. Fails if it exits first,
    /// if `deadline` passes, or if a stop is signalled.
    pub async fn await_liveness(
        &mut self,
        grace: Duration,
        deadline: Duration,
        stop: &mut watch::Receiver<u64>,
    ) -> Result<(), EngineError> {
        let give_up = self.spawned_at + deadline;
        let mut ticker = interval(LIVENESS_POLL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stoppable = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed(), if stoppable => match changed {
                    Ok(()) => return Err(EngineError::Cancelled),
                    Err(_) => stoppable = false,
                },
            }

            if let Some(report) = self.poll()? {
                let reason = format!("{} {}", self.label, report.reason());
                return Err(if report.filter_graph_error {
                    EngineError::FilterGraph(reason)
                } else {
                    EngineError::ProcessCrash(reason)
                });
            }
            if self.handle.last_output().is_some() && self.uptime() >= grace {
                debug!("{} is alive after {:?}", self.label, self.uptime());
                return Ok(());
            }
            if Instant::now() >= give_up {
                return Err(EngineError::Timeout(format!(
                    "{} produced no output within {:?}",
                    self.label, deadline
                )));
            }
        }
    }

    pub async fn send_command(&mut self, line: &str) -> Result<(), EngineError> {
        debug!("Sending to {}: {}", self.label, line);
        self.handle.send_command(line).await
    }

    pub async fn terminate(mut self, graceful: Duration) -> Result<ExitReport, EngineError> {
        if let Some(report) = self.poll()? {
            return Ok(report);
        }
        debug!("Stopping {}", self.label);
        self.handle.terminate(graceful).await
    }
}

/// Sleeps for `duration` unless a stop is signalled first.
pub async fn wait_or_stop(
    stop: &mut watch::Receiver<u64>,
    duration: Duration,
) -> Result<(), EngineError> {
    let until = Instant::now() + duration;
    tokio::select! {
        _ = tokio::time::sleep_until(until) => Ok(()),
        changed = stop.changed() => match changed {
            Ok(()) => Err(EngineError::Cancelled),
            Err(_) => {
                tokio::time::sleep_until(until).await;
                Ok(())
            }
        },
    }
}

/// Waits for a process that was already killed, within `limit`.
async fn reap<F>(pid: Option<u32>, limit: Duration, wait: F) -> Result<ExitStatus, EngineError>
where
    F: std::future::Future<Output = std::io::Result<ExitStatus>>,
{
    match timeout(limit, wait).await {
        Ok(status) => Ok(status?),
        Err(_) => Err(EngineError::Timeout(format!(
            "encoder {:?} still not reaped {:?} after SIGKILL",
            pid, limit
        ))),
    }
}

/// Whether an encoder stderr line reports a filter graph that could not be built or changed.
pub fn is_filter_failure(line: &str) -> bool {
    const MARKERS: [&str; 5] = [
        "Error initializing filter",
        "Error initializing complex filters",
        "Error reinitializing filters",
        "Failed to configure",
        "Error while filtering",
    ];
    if MARKERS.iter().any(|marker| line.contains(marker)) {
        return true;
    }
    // Replies to interactive commands look like `Command reply for stream 0: ret:-22 res:`.
    line.contains("Command reply") && line.contains("ret:-")
}

fn is_progress_line(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => !key.is_empty() && !key.contains(' '),
        None => false,
    }
}

#[derive(Default)]
struct OutputState {
    last_output: Option<Instant>,
    tail: VecDeque<String>,
    filter_errors: u32,
}

fn lock(output: &Mutex<OutputState>) -> std::sync::MutexGuard<'_, OutputState> {
    output.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Launches real ffmpeg processes.
pub struct FfmpegLauncher;

#[async_trait]
impl Launcher for FfmpegLauncher {
    async fn launch(&self, spec: &EncoderSpec) -> Result<Box<dyn ProcessHandle>, EngineError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            EngineError::ProcessSpawnFailure(format!("{}: {}", spec.program.display(), err))
        })?;

        let stdin = child.stdin.take();
        let output = Arc::new(Mutex::new(OutputState::default()));
        let reader = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(watch_stderr(spec.label.clone(), stderr, output.clone())));

        Ok(Box::new(FfmpegProcess {
            child,
            stdin,
            output,
            reader,
        }))
    }
}

async fn watch_stderr(label: String, stderr: ChildStderr, output: Arc<Mutex<OutputState>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut state = lock(&output);
                state.last_output = Some(Instant::now());
                if is_progress_line(&line) {
                    continue;
                }
                if is_filter_failure(&line) {
                    state.filter_errors += 1;
                    warn!("{}: {}", label, line);
                } else if line.contains("rror") {
                    warn!("{}: {}", label, line);
                } else {
                    debug!("{}: {}", label, line);
                }
                if state.tail.len() == DIAGNOSTIC_LINES {
                    state.tail.pop_front();
                }
                state.tail.push_back(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!("Stopped reading {} output: {}", label, err);
                break;
            }
        }
    }
}

struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Arc<Mutex<OutputState>>,
    reader: Option<JoinHandle<()>>,
}

impl FfmpegProcess {
    fn report(&self, status: ExitStatus) -> ExitReport {
        let state = lock(&self.output);
        ExitReport {
            code: status.code(),
            success: status.success(),
            filter_graph_error: state.filter_errors > 0,
            diagnostics: state.tail.iter().cloned().collect(),
        }
    }

    #[cfg(unix)]
    fn signal_stop(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("Could not signal {}: {}", pid, err);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_stop(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl ProcessHandle for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn last_output(&self) -> Option<Instant> {
        lock(&self.output).last_output
    }

    fn filter_errors(&self) -> u32 {
        lock(&self.output).filter_errors
    }

    fn try_exit(&mut self) -> Result<Option<ExitReport>, EngineError> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.report(status))),
            None => Ok(None),
        }
    }

    async fn send_command(&mut self, line: &str) -> Result<(), EngineError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            EngineError::Unsupported("encoder was not started with an open stdin".to_string())
        })?;
        stdin.write_all(b"c").await?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn terminate(&mut self, graceful: Duration) -> Result<ExitReport, EngineError> {
        if let Some(report) = self.try_exit()? {
            return Ok(report);
        }
        self.signal_stop();
        let status = match timeout(graceful, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "Encoder {:?} ignored SIGTERM for {:?}, killing it",
                    self.child.id(),
                    graceful
                );
                self.child.start_kill()?;
                let pid = self.child.id();
                reap(pid, KILL_WAIT, self.child.wait()).await?
            }
        };
        // Let the reader drain what the process wrote on its way out.
        if let Some(reader) = self.reader.take() {
            let _ = timeout(Duration::from_millis(200), reader).await;
        }
        Ok(self.report(status))
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum Script {
        Healthy,
        CrashOnStart,
        FailToSpawn,
        /// Runs, but every interactive command is answered with an error.
        RejectCommands,
    }

    #[derive(Default)]
    struct FakeState {
        exit_code: Option<i32>,
        filter_errors: u32,
        terminated: bool,
    }

    struct Shared {
        script: Script,
        launched: Vec<EncoderSpec>,
        commands: Vec<String>,
        processes: Vec<Arc<Mutex<FakeState>>>,
    }

    /// A launcher whose processes do what the current script says.
    #[derive(Clone)]
    pub struct FakeLauncher {
        shared: Arc<Mutex<Shared>>,
    }

    impl FakeLauncher {
        pub fn new(script: Script) -> Self {
            Self {
                shared: Arc::new(Mutex::new(Shared {
                    script,
                    launched: Vec::new(),
                    commands: Vec::new(),
                    processes: Vec::new(),
                })),
            }
        }

        pub fn set_script(&self, script: Script) {
            self.shared.lock().unwrap().script = script;
        }

        pub fn launches(&self) -> usize {
            self.shared.lock().unwrap().launched.len()
        }

        pub fn specs(&self) -> Vec<EncoderSpec> {
            self.shared.lock().unwrap().launched.clone()
        }

        pub fn commands(&self) -> Vec<String> {
            self.shared.lock().unwrap().commands.clone()
        }

        /// Processes neither exited nor stopped.
        pub fn running(&self) -> usize {
            let shared = self.shared.lock().unwrap();
            shared
                .processes
                .iter()
                .filter(|process| {
                    let state = process.lock().unwrap();
                    state.exit_code.is_none() && !state.terminated
                })
                .count()
        }

        pub fn terminated(&self) -> usize {
            let shared = self.shared.lock().unwrap();
            shared
                .processes
                .iter()
                .filter(|process| process.lock().unwrap().terminated)
                .count()
        }

        pub fn crash_latest(&self) {
            let shared = self.shared.lock().unwrap();
            if let Some(process) = shared.processes.last() {
                process.lock().unwrap().exit_code = Some(1);
            }
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, spec: &EncoderSpec) -> Result<Box<dyn ProcessHandle>, EngineError> {
            let mut shared = self.shared.lock().unwrap();
            shared.launched.push(spec.clone());
            let script = shared.script;
            if script == Script::FailToSpawn {
                return Err(EngineError::ProcessSpawnFailure(format!(
                    "{}: no such file",
                    spec.program.display()
                )));
            }

            let state = Arc::new(Mutex::new(FakeState::default()));
            shared.processes.push(state.clone());
            Ok(Box::new(FakeProcess {
                pid: 1000 + shared.launched.len() as u32,
                spawned_at: Instant::now(),
                script,
                state,
                shared: self.shared.clone(),
            }))
        }
    }

    struct FakeProcess {
        pid: u32,
        spawned_at: Instant,
        script: Script,
        state: Arc<Mutex<FakeState>>,
        shared: Arc<Mutex<Shared>>,
    }

    impl FakeProcess {
        fn report(&self) -> Option<ExitReport> {
            let state = self.state.lock().unwrap();
            state.exit_code.map(|code| ExitReport {
                code: Some(code),
                success: code == 0,
                filter_graph_error: state.filter_errors > 0,
                diagnostics: vec![format!("fake encoder exited with {}", code)],
            })
        }
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn last_output(&self) -> Option<Instant> {
            match self.script {
                Script::CrashOnStart => None,
                _ => Some(self.spawned_at),
            }
        }

        fn filter_errors(&self) -> u32 {
            self.state.lock().unwrap().filter_errors
        }

        fn try_exit(&mut self) -> Result<Option<ExitReport>, EngineError> {
            if self.script == Script::CrashOnStart {
                let mut state = self.state.lock().unwrap();
                state.exit_code.get_or_insert(1);
            }
            Ok(self.report())
        }

        async fn send_command(&mut self, line: &str) -> Result<(), EngineError> {
            self.shared.lock().unwrap().commands.push(line.to_string());
            if self.script == Script::RejectCommands {
                self.state.lock().unwrap().filter_errors += 1;
            }
            Ok(())
        }

        async fn terminate(&mut self, _graceful: Duration) -> Result<ExitReport, EngineError> {
            {
                let mut state = self.state.lock().unwrap();
                state.terminated = true;
                state.exit_code.get_or_insert(0);
            }
            Ok(self.report().unwrap_or(ExitReport {
                code: Some(0),
                success: true,
                filter_graph_error: false,
                diagnostics: Vec::new(),
            }))
        }
    }
}
