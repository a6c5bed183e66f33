use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::key::is_entry_id;

const TEMP_PREFIX: &str = "tmp_";

/// On-disk layout: `<root>/<aa>/<bb>/<entry_id>`, one file per entry. Temporary files live
/// directly under the root so a rename never crosses directories on the same filesystem.
#[derive(Debug, Clone)]
pub(super) struct DiskLayout {
    root: PathBuf,
}

impl DiskLayout {
    pub(super) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(super) fn root(&self) -> &Path {
        &self.root
    }

    pub(super) fn entry_path(&self, entry_id: &str) -> PathBuf {
        let (first, remainder) = entry_id.split_at(2);
        let (second, _) = remainder.split_at(2);
        self.root.join(first).join(second).join(entry_id)
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }

    /// Writes through a temp file renamed into place. On error, returns the path that failed.
    pub(super) async fn write_entry(
        &self,
        entry_id: &str,
        data: &[u8],
    ) -> std::result::Result<PathBuf, (PathBuf, std::io::Error)> {
        let target = self.entry_path(entry_id);
        if let Some(shard) = target.parent() {
            async_fs::create_dir_all(shard)
                .await
                .map_err(|err| (shard.to_path_buf(), err))?;
        }

        let temp_path = self.temp_path();
        let result = async {
            let mut options = async_fs::OpenOptions::new();
            options.create_new(true).write(true);
            #[cfg(unix)]
            {
                options.mode(0o600);
            }
            let mut file = options.open(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            async_fs::rename(&temp_path, &target).await
        }
        .await;

        if let Err(err) = result {
            if let Err(cleanup) = async_fs::remove_file(&temp_path).await
                && cleanup.kind() != ErrorKind::NotFound
            {
                warn!(path = %temp_path.display(), error = %cleanup, "failed to remove temp file");
            }
            return Err((temp_path, err));
        }
        Ok(target)
    }

    pub(super) async fn read_entry(&self, entry_id: &str) -> std::io::Result<Vec<u8>> {
        async_fs::read(self.entry_path(entry_id)).await
    }

    pub(super) fn remove_temp_files(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let is_temp = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if is_temp && entry.file_type()?.is_file() {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        warn!(path = %entry.path().display(), error = %err, "failed to remove stale temp file")
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Lists entry ids from file names alone. A file is an entry when its name is an entry id
    /// and it sits in the shard directories that id maps to.
    pub(super) fn scan(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return Ok(found);
        }
        for shard1 in fs::read_dir(&self.root)? {
            let shard1 = shard1?;
            if !shard1.file_type()?.is_dir() {
                continue;
            }
            for shard2 in fs::read_dir(shard1.path())? {
                let shard2 = shard2?;
                if !shard2.file_type()?.is_dir() {
                    continue;
                }
                for file in fs::read_dir(shard2.path())? {
                    let file = file?;
                    let Some(name) = file.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if file.file_type()?.is_file()
                        && is_entry_id(&name)
                        && self.entry_path(&name) == file.path()
                    {
                        found.push(name);
                    }
                }
            }
        }
        Ok(found)
    }
}
