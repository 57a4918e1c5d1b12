//! JSON Lines snapshot of a model's records, taken before rotating it.
//!
//! Records are written as stored, so encrypted fields stay ciphertext.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::model::{EncryptedModel, ModelStore, StoreError};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Page through `store` and write one JSON object per record. Returns the
/// number of records written.
pub async fn backup_model<M, S, W>(
    store: &S,
    batch_size: usize,
    writer: &mut W,
) -> Result<u64, BackupError>
where
    M: EncryptedModel + Serialize,
    S: ModelStore<M> + ?Sized,
    W: Write + Send,
{
    let batch_size = batch_size.max(1);
    let mut written = 0u64;
    let mut offset = 0u64;

    loop {
        let batch = store.fetch_batch(offset, batch_size).await?;
        if batch.is_empty() {
            break;
        }
        for record in &batch {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
            written += 1;
        }
        offset += batch.len() as u64;
    }

    writer.flush()?;
    Ok(written)
}

/// `<dir>/<table>-<UTC timestamp>.jsonl`
pub fn backup_path(dir: &Path, table: &str) -> PathBuf {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    dir.join(format!("{}-{}.jsonl", table, timestamp))
}

/// Back up `M` into a new timestamped file under `dir`.
pub async fn backup_to_dir<M, S>(
    store: &S,
    batch_size: usize,
    dir: &Path,
) -> Result<(PathBuf, u64), BackupError>
where
    M: EncryptedModel + Serialize,
    S: ModelStore<M> + ?Sized,
{
    fs::create_dir_all(dir)?;
    let path = backup_path(dir, M::table_name());
    let mut writer = BufWriter::new(File::create(&path)?);
    let count = backup_model(store, batch_size, &mut writer).await?;

    info!(model = M::table_name(), path = %path.display(), records = count, "Wrote backup");
    Ok((path, count))
}
