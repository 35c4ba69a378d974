use super::concat::{concat_input_args, manifest, write_atomic};
use super::{BoundHandle, InputBinder, SlotId};
use crate::error::EngineError;
use crate::io;
use async_trait::async_trait;
use loopcast_core::models::BindingStrategy;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How many times the fixed manifest lists the link before the encoder loops over it again.
const LINK_REPEAT: u32 = 64;

/// Each slot is a symlink. The encoder reads a fixed manifest that lists the link over and over,
/// so a replaced link is picked up at the next loop boundary.
pub struct SymlinkBinder {
    work_dir: PathBuf,
    io_timeout: Duration,
}

impl SymlinkBinder {
    pub fn new(work_dir: &Path, io_timeout: Duration) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            io_timeout,
        }
    }

    fn link(&self, slot: SlotId) -> PathBuf {
        self.work_dir.join(format!("{}.link", slot))
    }

    fn manifest(&self, slot: SlotId) -> PathBuf {
        self.work_dir.join(format!("{}.links.ffconcat", slot))
    }

    async fn point(&self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError> {
        let link = self.link(slot);
        let target = loop_path.to_path_buf();
        io::blocking(self.io_timeout, "replace slot link", move || {
            replace_link(&link, &target)
        })
        .await
    }
}

/// Points `link` at `target` by renaming a freshly made link over it.
#[cfg(unix)]
fn replace_link(link: &Path, target: &Path) -> color_eyre::Result<()> {
    use color_eyre::eyre::WrapErr;

    let dir = link.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let staging = link.with_extension("link.tmp");
    let _ = fs::remove_file(&staging);
    std::os::unix::fs::symlink(target, &staging)
        .wrap_err_with(|| format!("Could not link {}", target.display()))?;
    fs::rename(&staging, link).wrap_err_with(|| format!("Could not replace {}", link.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn replace_link(_link: &Path, _target: &Path) -> color_eyre::Result<()> {
    Err(color_eyre::eyre::eyre!(
        "Symlink slots need a unix filesystem"
    ))
}

#[async_trait]
impl InputBinder for SymlinkBinder {
    fn strategy(&self) -> BindingStrategy {
        BindingStrategy::Symlink
    }

    async fn prepare(&mut self, slot: SlotId, loop_path: &Path) -> Result<BoundHandle, EngineError> {
        self.point(slot, loop_path).await?;

        let manifest_path = self.manifest(slot);
        let contents = manifest(&self.link(slot), LINK_REPEAT, false);
        let target = manifest_path.clone();
        io::blocking(self.io_timeout, "write link manifest", move || {
            write_atomic(&target, &contents)
        })
        .await?;

        Ok(BoundHandle {
            slot,
            input_args: concat_input_args(&manifest_path),
        })
    }

    async fn repoint(&mut self, slot: SlotId, loop_path: &Path) -> Result<(), EngineError> {
        self.point(slot, loop_path).await
    }

    async fn release(&mut self) -> Result<(), EngineError> {
        let paths: Vec<PathBuf> = SlotId::BOTH
            .iter()
            .flat_map(|slot| vec![self.link(*slot), self.manifest(*slot)])
            .collect();
        io::blocking(self.io_timeout, "remove slot links", move || {
            for path in paths {
                let _ = fs::remove_file(path);
            }
            Ok(())
        })
        .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn repoint_swaps_link_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut binder = SymlinkBinder::new(dir.path(), Duration::from_secs(2));

        binder
            .prepare(SlotId::Zero, Path::new("/loops/a.mp4"))
            .await
            .unwrap();
        let link = dir.path().join("slot-0.link");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("/loops/a.mp4"));

        binder
            .repoint(SlotId::Zero, Path::new("/loops/b.mp4"))
            .await
            .unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("/loops/b.mp4"));
        assert!(!dir.path().join("slot-0.link.tmp").exists());
    }

    #[tokio::test]
    async fn manifest_lists_the_link_not_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut binder = SymlinkBinder::new(dir.path(), Duration::from_secs(2));
        binder
            .prepare(SlotId::One, Path::new("/loops/a.mp4"))
            .await
            .unwrap();

        let contents = fs::read_to_string(dir.path().join("slot-1.links.ffconcat")).unwrap();
        assert!(contents.contains("slot-1.link'"));
        assert!(!contents.contains("/loops/a.mp4"));
    }
}
