use crate::error::CondenseError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub const PARTIAL_SUFFIX: &str = ".partial";
pub const BACKUP_SUFFIX: &str = ".partial.bak";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn write_atomic(path: &Path, text: &str) -> io::Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let mut tmp = NamedTempFile::new_in(&parent)?;
    tmp.write_all(text.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn read_non_empty(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Ok(Some(text)),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// The `.partial` snapshot of an in-progress summary, mirrored into
/// `.partial.bak`. All file IO runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    partial: PathBuf,
    backup: PathBuf,
}

impl CheckpointStore {
    pub fn for_summary(summary_path: &Path) -> Self {
        Self {
            partial: with_suffix(summary_path, PARTIAL_SUFFIX),
            backup: with_suffix(summary_path, BACKUP_SUFFIX),
        }
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    fn io_error(&self, path: &Path, source: io::Error) -> CondenseError {
        CondenseError::Checkpoint {
            path: path.display().to_string(),
            source,
        }
    }

    pub async fn save(&self, text: &str) -> Result<(), CondenseError> {
        let partial = self.partial.clone();
        let backup = self.backup.clone();
        let body = text.to_string();
        let result = tokio::task::spawn_blocking(move || -> Result<(), (PathBuf, io::Error)> {
            write_atomic(&partial, &body).map_err(|err| (partial.clone(), err))?;
            write_atomic(&backup, &body).map_err(|err| (backup.clone(), err))?;
            Ok(())
        })
        .await
        .map_err(|err| self.io_error(&self.partial, io::Error::other(err)))?;
        result.map_err(|(path, err)| self.io_error(&path, err))?;
        debug!(path = %self.partial.display(), chars = text.len(), "checkpoint saved");
        Ok(())
    }

    /// Latest non-empty snapshot: `.partial`, then `.partial.bak`.
    pub async fn load(&self) -> Result<Option<String>, CondenseError> {
        let partial = self.partial.clone();
        let backup = self.backup.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<Option<String>, (PathBuf, io::Error)> {
            if let Some(text) = read_non_empty(&partial).map_err(|err| (partial.clone(), err))? {
                return Ok(Some(text));
            }
            read_non_empty(&backup).map_err(|err| (backup.clone(), err))
        })
        .await
        .map_err(|err| self.io_error(&self.partial, io::Error::other(err)))?;
        result.map_err(|(path, err)| self.io_error(&path, err))
    }

    /// Removes both files. Returns true when anything was deleted.
    pub async fn clear(&self) -> Result<bool, CondenseError> {
        let partial = self.partial.clone();
        let backup = self.backup.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<bool, (PathBuf, io::Error)> {
            let removed_partial = remove_if_present(&partial).map_err(|err| (partial.clone(), err))?;
            let removed_backup = remove_if_present(&backup).map_err(|err| (backup.clone(), err))?;
            Ok(removed_partial || removed_backup)
        })
        .await
        .map_err(|err| self.io_error(&self.partial, io::Error::other(err)))?;
        result.map_err(|(path, err)| self.io_error(&path, err))
    }
}
