use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// One continuous broadcast: where the audio comes from, where the encoded stream goes and how
/// the engine is allowed to switch the video underneath it.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Broadcast {
    pub id: Option<String>,
    pub description: Option<String>,
    pub audio_url: String,
    pub output_url: String,
    pub default_loop: PathBuf,
    pub mappings_path: Option<PathBuf>,
    #[serde(default)]
    pub mode: EncodingMode,
    #[serde(default)]
    pub encoder: EncoderSettings,
    #[serde(default)]
    pub switching: SwitchSettings,
    #[serde(default)]
    pub crossfade: CrossfadeSettings,
    #[serde(default)]
    pub slots: SlotSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub control: ControlSettings,
}

impl Broadcast {
    pub fn is_valid(&self) -> Result<()> {
        if self.audio_url.trim().is_empty() {
            return Err(eyre!("An audio_url must be provided"));
        }
        if self.output_url.trim().is_empty() {
            return Err(eyre!("An output_url must be provided"));
        }
        if self.default_loop.as_os_str().is_empty() {
            return Err(eyre!("A default_loop must be provided"));
        }
        self.encoder.is_valid()?;
        self.crossfade.is_valid()?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingMode {
    HardCut,
    PersistentDualInput,
}

impl Default for EncodingMode {
    fn default() -> Self {
        EncodingMode::HardCut
    }
}

impl fmt::Display for EncodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingMode::HardCut => write!(f, "hard-cut"),
            EncodingMode::PersistentDualInput => write!(f, "persistent-dual-input"),
        }
    }
}

/// How a persistent encoder's input slots are pointed at loop files.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BindingStrategy {
    Symlink,
    ConcatList,
    StagedHlsSegment,
    DualProcessRelay,
}

impl Default for BindingStrategy {
    fn default() -> Self {
        BindingStrategy::Symlink
    }
}

impl fmt::Display for BindingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindingStrategy::Symlink => "symlink",
            BindingStrategy::ConcatList => "concat-list",
            BindingStrategy::StagedHlsSegment => "staged-hls-segment",
            BindingStrategy::DualProcessRelay => "dual-process-relay",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the single stream session owned by the orchestrator.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Spawning,
    Running,
    Crashed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Stopped => "STOPPED",
            SessionState::Spawning => "SPAWNING",
            SessionState::Running => "RUNNING",
            SessionState::Crashed => "CRASHED",
            SessionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Transitions the persistent encoder knows how to blend.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Fade,
    Dissolve,
    WipeLeft,
    WipeRight,
    WipeUp,
    WipeDown,
    WipeTl,
    WipeTr,
    WipeBl,
    WipeBr,
    CircleOpen,
    CircleClose,
    HorzOpen,
    HorzClose,
    VertOpen,
    VertClose,
    DiagTl,
    DiagTr,
    DiagBl,
    DiagBr,
    Radial,
}

impl TransitionKind {
    pub const ALL: [TransitionKind; 21] = [
        TransitionKind::Fade,
        TransitionKind::Dissolve,
        TransitionKind::WipeLeft,
        TransitionKind::WipeRight,
        TransitionKind::WipeUp,
        TransitionKind::WipeDown,
        TransitionKind::WipeTl,
        TransitionKind::WipeTr,
        TransitionKind::WipeBl,
        TransitionKind::WipeBr,
        TransitionKind::CircleOpen,
        TransitionKind::CircleClose,
        TransitionKind::HorzOpen,
        TransitionKind::HorzClose,
        TransitionKind::VertOpen,
        TransitionKind::VertClose,
        TransitionKind::DiagTl,
        TransitionKind::DiagTr,
        TransitionKind::DiagBl,
        TransitionKind::DiagBr,
        TransitionKind::Radial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Fade => "fade",
            TransitionKind::Dissolve => "dissolve",
            TransitionKind::WipeLeft => "wipeleft",
            TransitionKind::WipeRight => "wiperight",
            TransitionKind::WipeUp => "wipeup",
            TransitionKind::WipeDown => "wipedown",
            TransitionKind::WipeTl => "wipetl",
            TransitionKind::WipeTr => "wipetr",
            TransitionKind::WipeBl => "wipebl",
            TransitionKind::WipeBr => "wipebr",
            TransitionKind::CircleOpen => "circleopen",
            TransitionKind::CircleClose => "circleclose",
            TransitionKind::HorzOpen => "horzopen",
            TransitionKind::HorzClose => "horzclose",
            TransitionKind::VertOpen => "vertopen",
            TransitionKind::VertClose => "vertclose",
            TransitionKind::DiagTl => "diagtl",
            TransitionKind::DiagTr => "diagtr",
            TransitionKind::DiagBl => "diagbl",
            TransitionKind::DiagBr => "diagbr",
            TransitionKind::Radial => "radial",
        }
    }
}

impl FromStr for TransitionKind {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        TransitionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| eyre!("{} is not a supported transition", s))
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EncoderSettings {
    pub ffmpeg_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: String,
    pub video_codec: String,
    pub preset: String,
    pub video_bitrate: String,
    pub video_bufsize: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    pub output_format: String,
    pub extra_output_args: Vec<String>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            width: 1280,
            height: 720,
            fps: 30,
            pixel_format: "yuv420p".to_string(),
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            video_bitrate: "2500k".to_string(),
            video_bufsize: "5000k".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "160k".to_string(),
            audio_sample_rate: 44_100,
            output_format: "flv".to_string(),
            extra_output_args: Vec::new(),
        }
    }
}

impl EncoderSettings {
    fn is_valid(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(eyre!(
                "Output geometry {}x{} must be non-zero and even",
                self.width,
                self.height
            ));
        }
        if self.fps == 0 || self.fps > 120 {
            return Err(eyre!("Frame rate {} is not within 1-120", self.fps));
        }
        Ok(())
    }

    /// Keyframe interval, two seconds of frames.
    pub fn gop(&self) -> u32 {
        self.fps * 2
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(default)]
pub struct SwitchSettings {
    pub overlap_ms: u64,
    pub terminate_timeout_ms: u64,
    pub spawn_grace_ms: u64,
    pub startup_timeout_ms: u64,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            overlap_ms: 2_000,
            terminate_timeout_ms: 5_000,
            spawn_grace_ms: 2_000,
            startup_timeout_ms: 15_000,
        }
    }
}

impl SwitchSettings {
    pub fn overlap(&self) -> Duration {
        Duration::from_millis(self.overlap_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CrossfadeSettings {
    pub transition: String,
    pub duration_secs: f64,
    pub max_offset_secs: f64,
}

impl Default for CrossfadeSettings {
    fn default() -> Self {
        Self {
            transition: TransitionKind::Fade.as_str().to_string(),
            duration_secs: 1.5,
            max_offset_secs: 10.0,
        }
    }
}

/// Longest crossfade, or delay before one, a broadcast may ask for.
pub const MAX_CROSSFADE_SECS: f64 = 3600.0;

fn bounded_secs(secs: f64) -> Option<Duration> {
    if secs > MAX_CROSSFADE_SECS {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

impl CrossfadeSettings {
    /// `None` unless the duration is positive and within [`MAX_CROSSFADE_SECS`].
    pub fn duration(&self) -> Option<Duration> {
        bounded_secs(self.duration_secs).filter(|duration| !duration.is_zero())
    }

    pub fn max_offset(&self) -> Option<Duration> {
        bounded_secs(self.max_offset_secs)
    }

    fn is_valid(&self) -> Result<()> {
        TransitionKind::from_str(&self.transition)?;
        if self.duration().is_none() {
            return Err(eyre!(
                "Crossfade duration {} must be positive and at most {}s",
                self.duration_secs,
                MAX_CROSSFADE_SECS
            ));
        }
        if self.max_offset().is_none() {
            return Err(eyre!(
                "Crossfade max offset {} must be between 0 and {}s",
                self.max_offset_secs,
                MAX_CROSSFADE_SECS
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(default)]
pub struct SlotSettings {
    pub strategy: BindingStrategy,
    pub work_dir: PathBuf,
    pub concat_repeat: u32,
    pub hls_segment_secs: u32,
    pub relay_base_port: u16,
}

impl Default for SlotSettings {
    fn default() -> Self {
        Self {
            strategy: BindingStrategy::default(),
            work_dir: PathBuf::from("/tmp/loopcast/slots"),
            concat_repeat: 64,
            hls_segment_secs: 2,
            relay_base_port: 23_000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(default)]
pub struct RecoverySettings {
    pub max_restarts: u32,
    pub cooldown_secs: u64,
    pub stable_reset_secs: u64,
    pub health_interval_ms: u64,
    pub filter_graph_failure_threshold: u32,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            cooldown_secs: 60,
            stable_reset_secs: 600,
            health_interval_ms: 1_000,
            filter_graph_failure_threshold: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(default)]
pub struct ControlSettings {
    pub dir: PathBuf,
    pub poll_interval_ms: u64,
    pub status_interval_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/loopcast/control"),
            poll_interval_ms: 1_000,
            status_interval_ms: 1_000,
            io_timeout_ms: 2_000,
        }
    }
}

impl ControlSettings {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::io::Read;

    fn get_broadcast() -> Broadcast {
        Broadcast {
            id: Some("4f1e7c1a-0b55-4f2e-9d0c-2d4c1f6f2a10".to_string()),
            description: Some("Late night ambient radio".to_string()),
            audio_url: "http://radio.local:8000/live.mp3".to_string(),
            output_url: "rtmp://relay.local/live/stream".to_string(),
            default_loop: PathBuf::from("/srv/loops/default.mp4"),
            mappings_path: Some(PathBuf::from("/srv/loops/mappings.json")),
            mode: EncodingMode::PersistentDualInput,
            encoder: EncoderSettings {
                width: 1920,
                height: 1080,
                ..EncoderSettings::default()
            },
            switching: SwitchSettings::default(),
            crossfade: CrossfadeSettings {
                transition: "circleopen".to_string(),
                duration_secs: 2.0,
                max_offset_secs: 10.0,
            },
            slots: SlotSettings {
                strategy: BindingStrategy::ConcatList,
                ..SlotSettings::default()
            },
            recovery: RecoverySettings::default(),
            control: ControlSettings::default(),
        }
    }

    #[test]
    fn fixture_broadcast_is_valid() {
        assert!(get_broadcast().is_valid().is_ok());
    }

    #[test]
    fn check_geometry_must_be_even() {
        let mut b = get_broadcast();
        b.encoder.width = 1279;
        assert!(b.is_valid().is_err());

        b.encoder.width = 0;
        assert!(b.is_valid().is_err());
    }

    #[test]
    fn check_unknown_transition_is_rejected() {
        let mut b = get_broadcast();
        b.crossfade.transition = "starburst".to_string();
        assert!(b.is_valid().is_err());
    }

    #[test]
    fn check_crossfade_duration_is_positive() {
        let mut b = get_broadcast();
        b.crossfade.duration_secs = 0.0;
        assert!(b.is_valid().is_err());
    }

    #[test]
    fn check_crossfade_timings_fit_a_duration() {
        let mut b = get_broadcast();
        b.crossfade.duration_secs = 1e20;
        assert!(b.is_valid().is_err());

        let mut b = get_broadcast();
        b.crossfade.max_offset_secs = 1e20;
        assert!(b.is_valid().is_err());

        let mut b = get_broadcast();
        b.crossfade.max_offset_secs = f64::NAN;
        assert!(b.is_valid().is_err());

        let mut b = get_broadcast();
        b.crossfade.max_offset_secs = 0.0;
        assert!(b.is_valid().is_ok());
    }

    #[test]
    fn check_urls_are_required() {
        let mut b = get_broadcast();
        b.audio_url = "  ".to_string();
        assert!(b.is_valid().is_err());
    }

    #[test]
    fn transition_kind_parses_every_listed_name() {
        for kind in TransitionKind::ALL.iter() {
            assert_eq!(TransitionKind::from_str(kind.as_str()).unwrap(), *kind);
        }
        assert_eq!(
            TransitionKind::from_str(" WipeLeft ").unwrap(),
            TransitionKind::WipeLeft
        );
        assert!(TransitionKind::from_str("slideleft").is_err());
    }

    #[test]
    fn minimal_document_takes_defaults() {
        let broadcast: Broadcast = serde_json::from_str(
            r#"{"audio_url": "http://a", "output_url": "rtmp://b", "default_loop": "/l.mp4"}"#,
        )
        .unwrap();

        assert_eq!(broadcast.mode, EncodingMode::HardCut);
        assert_eq!(broadcast.recovery.max_restarts, 3);
        assert_eq!(broadcast.switching.overlap(), Duration::from_secs(2));
        assert_eq!(broadcast.slots.strategy, BindingStrategy::Symlink);
    }

    #[test]
    fn deserialize_as_expected() {
        let mut fixture = File::open("fixtures/broadcast.json").expect("Fixture was not found!");
        let mut expected_value = String::new();
        fixture.read_to_string(&mut expected_value).unwrap();
        let expected: Broadcast = serde_json::from_str(expected_value.as_str()).unwrap();

        assert_eq!(get_broadcast(), expected);
    }

    #[test]
    fn serialize_as_expected() {
        let mut fixture = File::open("fixtures/broadcast.json").expect("Fixture was not found!");
        let mut expected_value = String::new();
        fixture.read_to_string(&mut expected_value).unwrap();
        let fixture: serde_json::Value = serde_json::from_str(expected_value.as_str()).unwrap();

        let broadcast = get_broadcast();
        let broadcast_json = serde_json::to_string(&broadcast).unwrap();
        let broadcast_as_value: serde_json::Value =
            serde_json::from_str(broadcast_json.as_str()).unwrap();

        assert_eq!(broadcast_as_value, fixture);
    }
}
