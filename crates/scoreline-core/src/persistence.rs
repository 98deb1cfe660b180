use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, instrument};

/// Writes through a sibling temp file so readers never see a partial file.
#[instrument(skip(bytes), fields(path = %path.display(), bytes = bytes.len()))]
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;

    let mut temp_file =
        tempfile::NamedTempFile::new_in(parent).context("failed to create temp file")?;
    temp_file
        .write_all(bytes)
        .context("failed to write temp file")?;
    temp_file
        .persist(path)
        .map_err(|error| anyhow::anyhow!(error.error))
        .with_context(|| format!("failed to persist file: {}", path.display()))?;
    debug!("file written");
    Ok(())
}

/// Returns `false` without touching the file when it already holds `bytes`.
#[instrument(skip(bytes), fields(path = %path.display()))]
pub fn write_if_changed(path: &Path, bytes: &[u8]) -> Result<bool> {
    if path.exists() {
        let existing =
            fs::read(path).with_context(|| format!("failed to read file: {}", path.display()))?;
        if existing == bytes {
            debug!("file unchanged, write skipped");
            return Ok(false);
        }
    }
    write_atomic(path, bytes)?;
    info!("file written");
    Ok(true)
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("failed to serialize json")?;
    write_atomic(path, &json)
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read(path).with_context(|| format!("failed to read json: {}", path.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("invalid json: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn identical_contents_are_not_rewritten() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("score.osc");

        assert!(write_if_changed(&path, b"abc").expect("first write should succeed"));
        let first: SystemTime = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .expect("mtime should be readable");

        assert!(!write_if_changed(&path, b"abc").expect("second write should succeed"));
        let second = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .expect("mtime should be readable");
        assert_eq!(first, second);

        assert!(write_if_changed(&path, b"abcd").expect("third write should succeed"));
        assert_eq!(fs::read(&path).expect("file should be readable"), b"abcd");
    }

    #[test]
    fn json_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("value.json");
        save_json(&path, &vec![1, 2, 3]).expect("save should succeed");
        let loaded: Vec<i32> = load_json(&path).expect("load should succeed");
        assert_eq!(loaded, vec![1, 2, 3]);
    }
}
