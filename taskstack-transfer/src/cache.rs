//! Local attachment cache.
//!
//! Completed files live at `<dir>/<attachment id>`; partial downloads at
//! `<dir>/<attachment id>.part` until they are renamed into place.

use std::io;
use std::path::{Path, PathBuf};
use taskstack_types::EntityId;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, attachment_id: EntityId) -> PathBuf {
        self.dir.join(attachment_id.to_string())
    }

    pub fn part_path(&self, attachment_id: EntityId) -> PathBuf {
        self.dir.join(format!("{attachment_id}.part"))
    }

    /// Whether a complete copy is cached.
    pub fn contains(&self, attachment_id: EntityId) -> bool {
        self.path_for(attachment_id).is_file()
    }

    /// Bytes on disk, partial downloads included.
    pub fn used_bytes(&self) -> io::Result<u64> {
        let mut total = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Copies an uploaded file into the cache so it counts toward the quota
    /// and stays available offline.
    pub async fn import(&self, attachment_id: EntityId, source: &Path) -> io::Result<PathBuf> {
        let dest = self.path_for(attachment_id);
        if source != dest {
            let tmp = self.dir.join(format!("{attachment_id}.import"));
            tokio::fs::copy(source, &tmp).await?;
            tokio::fs::rename(&tmp, &dest).await?;
            debug!(%attachment_id, "cached uploaded attachment");
        }
        Ok(dest)
    }

    pub async fn remove(&self, attachment_id: EntityId) -> io::Result<()> {
        for path in [self.path_for(attachment_id), self.part_path(attachment_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Deletes every cached file, keeping the directory.
    pub fn clear(&self) -> io::Result<()> {
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
