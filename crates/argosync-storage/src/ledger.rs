//! The fingerprint ledger: which floats have been processed, at which fingerprint.
//!
//! The whole table is loaded into memory at start of run and rewritten
//! atomically by [`FingerprintStore::persist`]. Workers only mutate it through
//! [`FingerprintStore::compare_and_set`] and the status helpers, each of which
//! is a single critical section.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use argosync_core::{Fingerprint, LedgerRecord, LedgerStatus};
use arrow_array::{Array, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{decode_parquet, encode_parquet, typed_column, write_atomic};

pub const LEDGER_FILE_NAME: &str = "processed_hash.parquet";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fingerprint conflict for {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: String,
        found: String,
    },
    #[error("persisted state {path} is corrupt: {detail}")]
    Corruption { path: PathBuf, detail: String },
    #[error("no ledger record for {key}")]
    UnknownEntity { key: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

fn describe(fp: Option<&Fingerprint>) -> String {
    fp.map(|f| f.short().to_string())
        .unwrap_or_else(|| "<absent>".to_string())
}

#[derive(Debug)]
pub struct FingerprintStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, LedgerRecord>>,
}

impl FingerprintStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the ledger from `path`. A missing file is an empty ledger; a file
    /// that cannot be parsed is [`StoreError::Corruption`].
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no ledger yet, starting empty");
                return Ok(Self::empty(path));
            }
            Err(err) => {
                return Err(StoreError::Io(
                    anyhow::Error::new(err).context(format!("reading {}", path.display())),
                ))
            }
        };

        let corrupt = |detail: String| StoreError::Corruption {
            path: path.clone(),
            detail,
        };
        let batches = decode_parquet(Bytes::from(bytes)).map_err(|e| corrupt(format!("{e:#}")))?;
        let mut records = BTreeMap::new();
        for batch in &batches {
            for record in batch_to_records(batch).map_err(&corrupt)? {
                if records.insert(record.key.clone(), record).is_some() {
                    return Err(corrupt("duplicate float_id rows".to_string()));
                }
            }
        }
        debug!(path = %path.display(), records = records.len(), "ledger loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<LedgerRecord> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, LedgerRecord> {
        self.records.lock().await.clone()
    }

    /// Create a pending record on first observation. Returns true if created.
    pub async fn observe(&self, key: &str) -> bool {
        let mut records = self.records.lock().await;
        if records.contains_key(key) {
            return false;
        }
        records.insert(key.to_string(), LedgerRecord::pending(key));
        true
    }

    /// Advance `key` to `new` only if the stored fingerprint still equals `expected`.
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Fingerprint>,
        new: Fingerprint,
        status: LedgerStatus,
    ) -> Result<LedgerRecord, StoreError> {
        let mut records = self.records.lock().await;
        let current = records.get(key).and_then(|r| r.fingerprint.as_ref());
        if current != expected {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: describe(expected),
                found: describe(current),
            });
        }

        let record = records
            .entry(key.to_string())
            .or_insert_with(|| LedgerRecord::pending(key));
        record.fingerprint = Some(new);
        record.status = status;
        if status == LedgerStatus::Processed {
            record.last_processed = Some(Utc::now());
        }
        Ok(record.clone())
    }

    /// Record a failed attempt. The fingerprint is left untouched so the float
    /// stays in the next run's work set.
    pub async fn mark_failed(&self, key: &str) -> Result<(), StoreError> {
        self.set_status(key, LedgerStatus::Failed, false).await
    }

    /// Forget the fingerprint of `key` so it is reprocessed on the next detection.
    pub async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        self.set_status(key, LedgerStatus::Pending, true).await
    }

    async fn set_status(
        &self,
        key: &str,
        status: LedgerStatus,
        clear_fingerprint: bool,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(key).ok_or_else(|| StoreError::UnknownEntity {
            key: key.to_string(),
        })?;
        record.status = status;
        if clear_fingerprint {
            record.fingerprint = None;
        }
        Ok(())
    }

    /// Rewrite the persisted ledger atomically from the in-memory table.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let records = self.snapshot().await;
        let batch = records_to_batch(records.values())?;
        let bytes = encode_parquet(&batch)?;
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), records = records.len(), "ledger persisted");
        Ok(())
    }
}

fn ledger_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("float_id", DataType::Utf8, false),
        Field::new("fingerprint", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, false),
        Field::new(
            "last_processed",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            true,
        ),
    ]))
}

fn records_to_batch<'a>(
    records: impl Iterator<Item = &'a LedgerRecord> + Clone,
) -> anyhow::Result<RecordBatch> {
    let keys = StringArray::from(records.clone().map(|r| Some(r.key.as_str())).collect::<Vec<_>>());
    let fingerprints = StringArray::from(
        records
            .clone()
            .map(|r| r.fingerprint.as_ref().map(|f| f.as_str()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        records
            .clone()
            .map(|r| Some(r.status.as_str()))
            .collect::<Vec<_>>(),
    );
    let processed_at = TimestampMicrosecondArray::from(
        records
            .map(|r| r.last_processed.map(|t| t.timestamp_micros()))
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");

    Ok(RecordBatch::try_new(
        ledger_schema(),
        vec![
            Arc::new(keys),
            Arc::new(fingerprints),
            Arc::new(statuses),
            Arc::new(processed_at),
        ],
    )?)
}

fn batch_to_records(batch: &RecordBatch) -> Result<Vec<LedgerRecord>, String> {
    let keys = typed_column::<StringArray>(batch, "float_id")?;
    let fingerprints = typed_column::<StringArray>(batch, "fingerprint")?;
    let statuses = typed_column::<StringArray>(batch, "status")?;
    let processed_at = typed_column::<TimestampMicrosecondArray>(batch, "last_processed")?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if keys.is_null(i) || statuses.is_null(i) {
            return Err(format!("row {i} is missing float_id or status"));
        }
        let last_processed = if processed_at.is_null(i) {
            None
        } else {
            let micros = processed_at.value(i);
            Some(
                DateTime::<Utc>::from_timestamp_micros(micros)
                    .ok_or_else(|| format!("row {i} has out-of-range timestamp {micros}"))?,
            )
        };
        out.push(LedgerRecord {
            key: keys.value(i).to_string(),
            fingerprint: (!fingerprints.is_null(i))
                .then(|| Fingerprint::from_hex(fingerprints.value(i))),
            status: statuses.value(i).parse()?,
            last_processed,
        });
    }
    Ok(out)
}
