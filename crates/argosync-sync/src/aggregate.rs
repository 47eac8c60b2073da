//! Commit of one converted float: table, then catalog row, then ledger.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use argosync_core::{EntityTable, Fingerprint, LedgerRecord, LedgerStatus};
use argosync_storage::table::{entity_table_path, write_entity_table};
use argosync_storage::{CatalogStore, FingerprintStore};
use tracing::{debug, error};

use crate::convert::SummaryStats;
use crate::error::SyncError;

pub struct Aggregator {
    out_root: PathBuf,
    dac: String,
    catalog: Arc<CatalogStore>,
    ledger: Arc<FingerprintStore>,
    fatal: OnceLock<String>,
}

impl Aggregator {
    pub fn new(
        out_root: impl Into<PathBuf>,
        dac: impl Into<String>,
        catalog: Arc<CatalogStore>,
        ledger: Arc<FingerprintStore>,
    ) -> Self {
        Self {
            out_root: out_root.into(),
            dac: dac.into(),
            catalog,
            ledger,
            fatal: OnceLock::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.fatal.get().is_some()
    }

    /// The error that latched the abort, if any.
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.get().map(String::as_str)
    }

    fn abort(&self, err: SyncError) -> SyncError {
        if self.fatal.set(err.to_string()).is_ok() {
            error!(error = %err, "fatal commit failure, no further floats will be committed");
        }
        err
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        if self.is_aborted() {
            Err(SyncError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Write the table, upsert the catalog row and only then advance the
    /// ledger from `expected` to `fingerprint`.
    pub async fn commit(
        &self,
        key: &str,
        expected: Option<&Fingerprint>,
        fingerprint: Fingerprint,
        table: &EntityTable,
        stats: &SummaryStats,
    ) -> Result<LedgerRecord, SyncError> {
        self.ensure_running()?;
        let path = entity_table_path(&self.out_root, &self.dac, key);
        let bytes = match write_entity_table(&path, table).await {
            Ok(bytes) => bytes,
            Err(error) => return Err(self.abort(SyncError::TableWrite { path, error })),
        };
        debug!(key, bytes, rows = table.rows.len(), "entity table written");

        self.ensure_running()?;
        let row = stats.to_catalog_row(key, &self.dac, fingerprint.clone());
        self.catalog
            .upsert(row)
            .await
            .map_err(|e| self.abort(SyncError::CatalogWrite(e)))?;

        let record = self
            .ledger
            .compare_and_set(key, expected, fingerprint, LedgerStatus::Processed)
            .await?;
        Ok(record)
    }
}
