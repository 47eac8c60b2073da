//! Durable local state for argosync: atomic file replacement, raw payload
//! storage, Parquet encoding, the fingerprint ledger, the metadata catalog,
//! and the HTTP fetch + retry utilities used against the remote archive.

use std::path::{Path, PathBuf};

use anyhow::Context;
use argosync_core::{FileKind, Fingerprint};
use arrow_array::{Array, RecordBatch};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod catalog;
pub mod http;
pub mod ledger;
pub mod retry;
pub mod table;

pub use catalog::CatalogStore;
pub use http::{HttpClientConfig, HttpFetcher};
pub use ledger::{FingerprintStore, StoreError};
pub use retry::{Retried, RetryBudget, RetryError, RetryPolicy};

pub const CRATE_NAME: &str = "argosync-storage";

/// Replace `path` with `bytes` via a temp file in the same directory and a rename,
/// so readers never observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: Fingerprint,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Local mirror of downloaded payloads, laid out as `<root>/<dac>/<key>/<file>`.
#[derive(Debug, Clone)]
pub struct RawStore {
    root: PathBuf,
}

impl RawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_path(&self, dac: &str, key: &str, kind: FileKind) -> PathBuf {
        self.root.join(dac).join(key).join(kind.file_name(key))
    }

    pub async fn store_payload(
        &self,
        dac: &str,
        key: &str,
        kind: FileKind,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPayload> {
        let absolute_path = self.payload_path(dac, key, kind);
        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredPayload {
            content_hash: Fingerprint::of_bytes(bytes),
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Encode a single record batch as an in-memory Parquet file.
pub fn encode_parquet(batch: &RecordBatch) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(writer_properties()))
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buf)
}

pub fn decode_parquet(bytes: Bytes) -> anyhow::Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context("opening parquet reader")?
        .build()
        .context("building parquet reader")?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.context("reading record batch")?);
    }
    Ok(batches)
}

/// Read every record batch of a Parquet file.
pub async fn read_parquet_file(path: &Path) -> anyhow::Result<Vec<RecordBatch>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    decode_parquet(Bytes::from(bytes)).with_context(|| format!("decoding {}", path.display()))
}

pub(crate) fn typed_column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a T, String> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| format!("missing column '{name}': {e}"))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("column '{name}' has unexpected type"))
}
