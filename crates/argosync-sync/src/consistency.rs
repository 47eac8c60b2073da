//! Startup check that the ledger and the catalog agree.
//!
//! A crash between the catalog upsert and the ledger update leaves a catalog
//! row the ledger does not know about, which is harmless: the float is simply
//! reprocessed. The reverse, a `processed` ledger entry without a matching
//! catalog row, would hide the float forever and is repaired here.

use argosync_core::{Fingerprint, LedgerStatus};
use argosync_storage::{CatalogStore, FingerprintStore, StoreError};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyFinding {
    pub key: String,
    pub ledger_fingerprint: Option<Fingerprint>,
    pub catalog_fingerprint: Option<Fingerprint>,
}

impl ConsistencyFinding {
    pub fn describe(&self) -> String {
        let short = |fp: &Option<Fingerprint>| {
            fp.as_ref()
                .map(|f| f.short().to_string())
                .unwrap_or_else(|| "none".to_string())
        };
        match &self.catalog_fingerprint {
            None => format!(
                "{} is processed at {} but has no catalog row",
                self.key,
                short(&self.ledger_fingerprint)
            ),
            Some(_) => format!(
                "{} is processed at {} but the catalog row is at {}",
                self.key,
                short(&self.ledger_fingerprint),
                short(&self.catalog_fingerprint)
            ),
        }
    }
}

/// Ledger entries marked processed whose catalog row is missing or carries a
/// different fingerprint.
pub async fn check_consistency(
    ledger: &FingerprintStore,
    catalog: &CatalogStore,
) -> Vec<ConsistencyFinding> {
    let catalog_fps = catalog.fingerprints().await;
    ledger
        .snapshot()
        .await
        .into_values()
        .filter(|r| r.status == LedgerStatus::Processed)
        .filter_map(|r| {
            let catalog_fp = catalog_fps.get(&r.key).cloned();
            (catalog_fp.is_none() || catalog_fp != r.fingerprint).then(|| ConsistencyFinding {
                key: r.key,
                ledger_fingerprint: r.fingerprint,
                catalog_fingerprint: catalog_fp,
            })
        })
        .collect()
}

/// Invalidate every inconsistent entry so the next detection reprocesses it.
pub async fn repair(
    ledger: &FingerprintStore,
    findings: &[ConsistencyFinding],
) -> Result<(), StoreError> {
    for finding in findings {
        warn!(finding = %finding.describe(), "ledger and catalog disagree, invalidating");
        ledger.invalidate(&finding.key).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::fixtures::{payloads, ProfileFixture};
    use crate::convert::{convert, NetcdfDecoder};
    use tempfile::tempdir;

    async fn seeded(root: &std::path::Path) -> (FingerprintStore, CatalogStore) {
        let ledger = FingerprintStore::empty(root.join("processed_hash.parquet"));
        let catalog = CatalogStore::empty(root.join("argo_meta.parquet"));
        let (_, stats) = convert(&NetcdfDecoder, "1", &payloads(&ProfileFixture::core(0.0), None))
            .expect("convert");
        for (key, meta) in [("1", b"a"), ("2", b"b"), ("3", b"c")] {
            let fp = Fingerprint::of_bytes(meta);
            ledger
                .compare_and_set(key, None, fp.clone(), LedgerStatus::Processed)
                .await
                .expect("cas");
            if key != "3" {
                let stored = if key == "2" { Fingerprint::of_bytes(b"stale") } else { fp };
                catalog
                    .upsert(stats.to_catalog_row(key, "incois", stored))
                    .await
                    .expect("upsert");
            }
        }
        (ledger, catalog)
    }

    #[tokio::test]
    async fn mismatched_and_missing_rows_are_found_and_invalidated() {
        let dir = tempdir().expect("tempdir");
        let (ledger, catalog) = seeded(dir.path()).await;

        let findings = check_consistency(&ledger, &catalog).await;
        let keys = findings.iter().map(|f| f.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["2", "3"]);
        assert!(findings[1].describe().contains("no catalog row"));

        repair(&ledger, &findings).await.expect("repair");
        let record = ledger.get("3").await.expect("record");
        assert_eq!(record.status, LedgerStatus::Pending);
        assert_eq!(record.fingerprint, None);
        assert_eq!(
            ledger.get("1").await.and_then(|r| r.fingerprint),
            Some(Fingerprint::of_bytes(b"a"))
        );
        assert!(check_consistency(&ledger, &catalog).await.is_empty());
    }
}
