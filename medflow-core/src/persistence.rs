//! Durable JSON file helpers shared by the file-backed stores.
//!
//! Writes go to a `.tmp` sibling which is fsynced and then renamed over the
//! target, so a reader sees either the old record or the new one, never a
//! torn write.

use std::io;
use std::path::Path;

use tokio::io::AsyncWriteExt;

/// Serialize `data` as pretty JSON and atomically replace `path` with it.
///
/// Creates parent directories if they don't exist.
pub async fn write_json_atomic<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    write_atomic(path, &json).await
}

/// Atomically replace `path` with `data`, syncing before the rename.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

/// Load and deserialize JSON from `path`.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let value =
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
