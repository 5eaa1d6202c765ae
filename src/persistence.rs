//! Atomic file writes shared by the store snapshot, the index checkpoint and
//! the cache artifacts.
//!
//! Every write goes to a `<file name>.tmp` sibling first and is renamed into
//! place, so a reader never sees a half-written file and a crash leaves at
//! most a stray `.tmp` next to the previous version.
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{RecallError, RecallResult};

/// Temporary sibling used while writing `path`: `a/b.json` -> `a/b.json.tmp`.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

/// Write `bytes` to `path` through its temporary sibling, creating the parent
/// directory if needed.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> RecallResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(|e| {
                RecallError::PersistenceFailure(format!("Failed to create directory: {e}"))
            })?;
        }
    }

    let temp = temp_path(path);
    fs::write(&temp, bytes).await.map_err(|e| {
        RecallError::PersistenceFailure(format!("Failed to write temporary file: {e}"))
    })?;
    fs::rename(&temp, path)
        .await
        .map_err(|e| RecallError::PersistenceFailure(format!("Failed to rename file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_path_keeps_extension() {
        assert_eq!(
            temp_path(Path::new("/data/abc.json")),
            PathBuf::from("/data/abc.json.tmp")
        );
        assert_eq!(
            temp_path(Path::new("vectors.meta.json")),
            PathBuf::from("vectors.meta.json.tmp")
        );
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("entry.json");

        write_atomic(&path, b"{\"a\":1}").await.unwrap();
        write_atomic(&path, b"{\"a\":2}").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":2}");
        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["entry.json"]);
    }
}
