use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Raw `getblock` responses on disk, one `block_<height>.json` per height.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, height: u64) -> PathBuf {
        self.root.join(format!("block_{height}.json"))
    }

    /// Write the snapshot through a temp file in the same directory and
    /// rename it into place, so readers never see a half-written file.
    pub fn write(&self, height: u64, raw: &serde_json::Value) -> Result<PathBuf, SnapshotError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SnapshotError::Io { path, source }
        };

        std::fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;

        let bytes = serde_json::to_vec(raw)?;
        let mut file = NamedTempFile::new_in(&self.root).map_err(io_err(&self.root))?;
        file.write_all(&bytes).map_err(io_err(file.path()))?;
        file.as_file().sync_all().map_err(io_err(file.path()))?;

        let target = self.path_for(height);
        file.persist(&target)
            .map_err(|e| SnapshotError::Io {
                path: target.clone(),
                source: e.error,
            })?;
        Ok(target)
    }

    pub fn read(&self, height: u64) -> Result<Option<serde_json::Value>, SnapshotError> {
        let path = self.path_for(height);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SnapshotError::Io { path, source }),
        }
    }
}
