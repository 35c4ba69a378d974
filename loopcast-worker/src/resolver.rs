//! Track identity to video loop.

use crate::metrics::{emit, EngineEvent};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use log::{debug, info, warn};
use loopcast_core::track::{normalize_key, normalize_track_key, TrackMapping};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_TRACK_KEY: &str = "default";

/// Where mappings live. The engine only reads them and bumps play counters.
pub trait MappingStore: Send + Sync {
    fn by_key(&self, key: &str) -> Option<TrackMapping>;

    fn by_external_id(&self, external_id: &str) -> Option<TrackMapping>;

    fn record_play(&self, key: &str) -> Result<()>;
}

pub struct MemoryMappingStore {
    mappings: Mutex<HashMap<String, TrackMapping>>,
}

impl MemoryMappingStore {
    pub fn new(mappings: Vec<TrackMapping>) -> Self {
        let mut index = HashMap::new();
        for mut mapping in mappings {
            mapping.key = normalize_key(&mapping.key);
            if index.contains_key(&mapping.key) {
                warn!("Duplicate mapping for \"{}\", keeping the first", mapping.key);
                continue;
            }
            index.insert(mapping.key.clone(), mapping);
        }
        Self {
            mappings: Mutex::new(index),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .wrap_err_with(|| format!("Could not open mappings {}", path.display()))?;
        let mappings = TrackMapping::load_all(file)?;
        info!("Loaded {} track mappings", mappings.len());
        Ok(Self::new(mappings))
    }

    #[cfg(test)]
    pub fn play_count(&self, key: &str) -> Option<u64> {
        self.mappings
            .lock()
            .ok()
            .and_then(|mappings| mappings.get(key).map(|mapping| mapping.play_count))
    }
}

impl MappingStore for MemoryMappingStore {
    fn by_key(&self, key: &str) -> Option<TrackMapping> {
        self.mappings.lock().ok()?.get(key).cloned()
    }

    fn by_external_id(&self, external_id: &str) -> Option<TrackMapping> {
        self.mappings
            .lock()
            .ok()?
            .values()
            .find(|mapping| mapping.external_id.as_deref() == Some(external_id))
            .cloned()
    }

    fn record_play(&self, key: &str) -> Result<()> {
        let mut mappings = self
            .mappings
            .lock()
            .map_err(|_| eyre!("Mapping store lock is poisoned"))?;
        let mapping = mappings
            .get_mut(key)
            .ok_or_else(|| eyre!("No mapping for {}", key))?;
        mapping.play_count += 1;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MatchKind {
    Key,
    ExternalId,
    Default,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    /// Normalized key of the track that was asked for.
    pub key: String,
    pub loop_path: PathBuf,
    pub matched: MatchKind,
}

pub struct TrackResolver {
    store: Box<dyn MappingStore>,
    default_loop: PathBuf,
}

impl TrackResolver {
    pub fn new(store: Box<dyn MappingStore>, default_loop: PathBuf) -> Self {
        Self {
            store,
            default_loop,
        }
    }

    /// Never fails: a track nobody mapped plays over the default loop.
    pub fn resolve(&self, artist: &str, title: &str, external_id: Option<&str>) -> Resolution {
        let key = normalize_track_key(artist, title);

        let found = self
            .store
            .by_key(&key)
            .map(|mapping| (mapping, MatchKind::Key))
            .or_else(|| {
                external_id
                    .filter(|id| !id.trim().is_empty())
                    .and_then(|id| self.store.by_external_id(id.trim()))
                    .map(|mapping| (mapping, MatchKind::ExternalId))
            });

        match found {
            Some((mapping, matched)) => {
                if let Err(err) = self.store.record_play(&mapping.key) {
                    warn!("Could not count play of \"{}\": {:#}", mapping.key, err);
                }
                debug!("\"{}\" resolved to {}", key, mapping.loop_path.display());
                Resolution {
                    key,
                    loop_path: mapping.loop_path,
                    matched,
                }
            }
            None => {
                emit(EngineEvent::ResolutionMiss { key: &key });
                Resolution {
                    key,
                    loop_path: self.default_loop.clone(),
                    matched: MatchKind::Default,
                }
            }
        }
    }

    /// What plays before any track has been announced.
    pub fn fallback(&self) -> Resolution {
        Resolution {
            key: DEFAULT_TRACK_KEY.to_string(),
            loop_path: self.default_loop.clone(),
            matched: MatchKind::Default,
        }
    }
}
