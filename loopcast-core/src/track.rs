use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// An already-parsed "now playing" notification from the audio automation system.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrackChange {
    pub artist: String,
    pub title: String,
    pub external_id: Option<String>,
    /// Announced length of the track, when the automation system knows it.
    pub duration_secs: Option<f64>,
}

impl TrackChange {
    pub fn new(artist: &str, title: &str) -> Self {
        Self {
            artist: artist.to_string(),
            title: title.to_string(),
            external_id: None,
            duration_secs: None,
        }
    }

    pub fn key(&self) -> String {
        normalize_track_key(&self.artist, &self.title)
    }

    pub fn duration(&self) -> Option<Duration> {
        // Anything not representable is as good as unannounced.
        self.duration_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Maps one normalized track key to the loop shown while it plays.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct TrackMapping {
    pub key: String,
    pub loop_path: PathBuf,
    pub external_id: Option<String>,
    #[serde(default)]
    pub play_count: u64,
}

impl TrackMapping {
    pub fn load_all<R: Read>(reader: R) -> Result<Vec<TrackMapping>> {
        serde_json::from_reader(reader).wrap_err("Could not parse track mappings")
    }
}

/// Builds the lookup key for a track: `artist - title`, case folded, anything that is not
/// alphanumeric, a hyphen or whitespace dropped, and whitespace runs collapsed to one space.
pub fn normalize_track_key(artist: &str, title: &str) -> String {
    normalize_key(&format!("{} - {}", artist, title))
}

/// Same normalization applied to an already joined key.
pub fn normalize_key(raw: &str) -> String {
    let kept: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;

    #[test]
    fn key_is_case_folded_and_stripped() {
        assert_eq!(
            normalize_track_key("AC/DC", "Back In Black!"),
            "acdc - back in black"
        );
    }

    #[test]
    fn key_collapses_whitespace() {
        assert_eq!(
            normalize_track_key("  Boards   of Canada ", "Roygbiv\t(Live)"),
            "boards of canada - roygbiv live"
        );
    }

    #[test]
    fn key_keeps_hyphens_and_unicode_letters() {
        assert_eq!(
            normalize_track_key("Sigur Rós", "Hoppípolla - Edit"),
            "sigur rós - hoppípolla - edit"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_track_key("Daft Punk", "One More Time (Radio Edit)");
        assert_eq!(normalize_key(&once), once);
    }

    #[test]
    fn track_change_ignores_nonsense_durations() {
        let mut change = TrackChange::new("a", "b");
        change.duration_secs = Some(-3.0);
        assert_eq!(change.duration(), None);

        change.duration_secs = Some(f64::NAN);
        assert_eq!(change.duration(), None);

        change.duration_secs = Some(180.5);
        assert_eq!(change.duration(), Some(Duration::from_secs_f64(180.5)));
    }

    #[test]
    fn track_change_with_absurd_duration_is_unannounced() {
        let mut change = TrackChange::new("a", "b");
        change.duration_secs = Some(1e20);
        assert_eq!(change.duration(), None);

        change.duration_secs = Some(f64::INFINITY);
        assert_eq!(change.duration(), None);

        change.duration_secs = Some(f64::MAX);
        assert_eq!(change.duration(), None);
    }

    #[test]
    fn track_change_accepts_minimal_payload() {
        let change: TrackChange =
            serde_json::from_str(r#"{"artist": "Low", "title": "Words"}"#).unwrap();
        assert_eq!(change, TrackChange::new("Low", "Words"));
    }

    #[test]
    fn mappings_load_from_fixture() {
        let fixture = File::open("fixtures/mappings.json").expect("Fixture was not found!");
        let mappings = TrackMapping::load_all(fixture).unwrap();

        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].external_id.as_deref(), Some("song-1041"));
        assert_eq!(mappings[0].play_count, 12);
        assert_eq!(mappings[1].play_count, 0);
    }
}
