use super::{BoundHandle, InputBinder, SlotId};
use crate::error::EngineError;
use crate::io;
use async_trait::async_trait;
use color_eyre::eyre::WrapErr;
use loopcast_core::models::BindingStrategy;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

const HEADER: &str = "ffconcat version 1.0\n";

/// Quotes a path for a concat manifest `file` line.
fn quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

/// A manifest that plays `entry` back to back `repeat` times. The concat demuxer opens every
/// entry again when it reaches it, which is what lets a slot change underneath a running encoder.
pub(super) fn manifest(entry: &Path, repeat: u32, nested: bool) -> String {
    let mut contents = String::from(HEADER);
    for _ in 0..repeat.max(1) {
        let _ = writeln!(contents, "file {}", quote(entry));
        if nested {
            contents.push_str("option safe 0\n");
        }
    }
    contents
}

/// Replaces `path` with `contents` in one rename.
pub(super) fn write_atomic(path: &Path, contents: &str) -> color_eyre::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Could not create slot directory {}", dir.display()))?;
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path)
        .wrap_err_with(|| format!("Could not replace {}", path.display()))?;
    Ok(())
}

pub(super) fn concat_input_args(manifest: &Path) -> Vec<String> {
    vec![
        "-re".to_string(),
        "-stream_loop".to_string(),
        "-1".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        manifest.to_string_lossy().into_owned(),
    ]
}

/// The encoder reads a fixed outer manifest that repeats a per-slot inner manifest. Repointing
/// rewrites the inner one, which takes effect the next time the outer manifest reaches it.
pub struct ConcatBinder {
    work_dir: PathBuf,
    repeat: u32,
    io_timeout: Duration,
}

impl ConcatBinder {
    pub fn new(work_dir: &Path, repeat: u32, io_timeout: Duration) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            repeat,
            io_timeout,
        }
    }

    fn outer(&self, slot: SlotId) -> PathBuf {
        self.work_dir.join(format!("{}.ffconcat", slot))
    }

    fn inner(&self, slot: SlotId) -> PathBuf {
        self.work_dir.join(format!("{}.current.ffconcat", slot))
    }

    async fn write_inner(&self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError> {
        let inner = self.inner(slot);
        let contents = manifest(loop_path, 1, false);
        io::blocking(self.io_timeout, "write slot manifest", move || {
            write_atomic(&inner, &contents)
        })
        .await
    }
}

#[async_trait]
impl InputBinder for ConcatBinder {
    fn strategy(&self) -> BindingStrategy {
        BindingStrategy::ConcatList
    }

    async fn prepare(&mut self, slot: SlotId, loop_path: &Path) -> Result<BoundHandle, EngineError> {
        self.write_inner(slot, loop_path).await?;

        let outer = self.outer(slot);
        let contents = manifest(&self.inner(slot), self.repeat, true);
        let target = outer.clone();
        io::blocking(self.io_timeout, "write outer manifest", move || {
            write_atomic(&target, &contents)
        })
        .await?;

        Ok(BoundHandle {
            slot,
            input_args: concat_input_args(&outer),
        })
    }

    async fn repoint(&mut self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError> {
        self.write_inner(slot, loop_path).await
    }

    async fn release(&mut self) -> Result<(), EngineError> {
        let paths: Vec<PathBuf> = SlotId::BOTH
            .iter()
            .flat_map(|slot| vec![self.outer(*slot), self.inner(*slot)])
            .collect();
        io::blocking(self.io_timeout, "remove slot manifests", move || {
            for path in paths {
                let _ = fs::remove_file(path);
            }
            Ok(())
        })
        .await
    }
}
