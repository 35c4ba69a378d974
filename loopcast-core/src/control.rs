//! Documents exchanged with an external controller and the file-backed channel that carries them.
//!
//! The controller drops `control.json` into a shared directory; the engine claims it, acts and
//! removes it. The engine keeps `status.json` fresh. Both documents are only ever replaced by a
//! rename, so a reader sees either the previous or the next document and never a partial one.

use crate::models::{EncodingMode, SessionState};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

pub const CONTROL_FILE: &str = "control.json";
pub const STATUS_FILE: &str = "status.json";
const CLAIMED_FILE: &str = "control.json.claimed";

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Restart,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ControlCommand {
    pub command: Command,
    pub requested_at: f64,
}

impl ControlCommand {
    pub fn now(command: Command) -> Self {
        Self {
            command,
            requested_at: unix_now(),
        }
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
    Crashed,
}

impl From<SessionState> for RunStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Spawning | SessionState::Running => RunStatus::Running,
            SessionState::Stopped => RunStatus::Stopped,
            SessionState::Crashed | SessionState::Failed => RunStatus::Crashed,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CurrentTrack {
    pub track_key: String,
    pub uptime_seconds: f64,
    pub started_at: f64,
    pub pid: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub running: bool,
    pub status: RunStatus,
    pub current_track: Option<CurrentTrack>,
    pub restart_count: u32,
    #[serde(default = "default_state")]
    pub state: SessionState,
    #[serde(default)]
    pub mode: EncodingMode,
}

fn default_state() -> SessionState {
    SessionState::Stopped
}

impl StatusSnapshot {
    pub fn stopped(mode: EncodingMode) -> Self {
        Self {
            running: false,
            status: RunStatus::Stopped,
            current_track: None,
            restart_count: 0,
            state: SessionState::Stopped,
            mode,
        }
    }

    /// Recomputes the track uptime against `now` so a snapshot taken a while ago still reports
    /// how long the current track has been on air.
    pub fn refreshed(&self, now: f64) -> Self {
        let mut snapshot = self.clone();
        if let Some(track) = snapshot.current_track.as_mut() {
            track.uptime_seconds = (now - track.started_at).max(0.0);
        }
        snapshot
    }
}

/// What the engine found when it looked for a command.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbox {
    Empty,
    Command(ControlCommand),
    /// The document could not be parsed. It has already been discarded.
    Corrupt(String),
}

/// Two typed documents and nothing else. The engine only talks to a controller through this
/// trait, so the transport can be swapped without touching the orchestration code.
pub trait ControlChannel: Send + Sync {
    /// Claims and clears the pending command, if any.
    fn take_command(&self) -> Result<Inbox>;

    fn post_command(&self, command: &ControlCommand) -> Result<()>;

    fn publish_status(&self, status: &StatusSnapshot) -> Result<()>;

    fn read_status(&self) -> Result<Option<StatusSnapshot>>;
}

pub struct FileControlChannel {
    dir: PathBuf,
}

impl FileControlChannel {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("Could not create control directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn write_atomic<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let mut file = NamedTempFile::new_in(&self.dir)
            .wrap_err("Could not create temporary control document")?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(self.dir.join(name))
            .wrap_err_with(|| format!("Could not replace {}", name))?;
        Ok(())
    }
}

impl ControlChannel for FileControlChannel {
    fn take_command(&self) -> Result<Inbox> {
        let claimed = self.dir.join(CLAIMED_FILE);
        match fs::rename(self.dir.join(CONTROL_FILE), &claimed) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Inbox::Empty),
            Err(err) => return Err(err).wrap_err("Could not claim control document"),
        }

        let contents = fs::read_to_string(&claimed);
        if let Err(err) = fs::remove_file(&claimed) {
            debug!("Could not remove claimed control document: {}", err);
        }
        let contents = contents.wrap_err("Could not read control document")?;

        if contents.trim().is_empty() {
            return Ok(Inbox::Empty);
        }
        match serde_json::from_str::<ControlCommand>(&contents) {
            Ok(command) => Ok(Inbox::Command(command)),
            Err(err) => Ok(Inbox::Corrupt(err.to_string())),
        }
    }

    fn post_command(&self, command: &ControlCommand) -> Result<()> {
        self.write_atomic(CONTROL_FILE, command)
    }

    fn publish_status(&self, status: &StatusSnapshot) -> Result<()> {
        self.write_atomic(STATUS_FILE, status)
    }

    fn read_status(&self) -> Result<Option<StatusSnapshot>> {
        match fs::read_to_string(self.dir.join(STATUS_FILE)) {
            Ok(contents) => Ok(Some(
                serde_json::from_str(&contents).wrap_err("Status document is malformed")?,
            )),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).wrap_err("Could not read status document"),
        }
    }
}

/// Seconds since the UNIX epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
