//! Incremental sync of one Argo DAC: list, detect changes, fetch, convert,
//! commit, report.

use std::sync::Arc;

use anyhow::Result;
use argosync_core::LedgerStatus;
use argosync_remote::{list_entities, HttpRemote, MirrorRemote, RemoteCatalog};
use argosync_storage::{CatalogStore, FingerprintStore, HttpFetcher, RawStore, RetryPolicy};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod aggregate;
pub mod config;
pub mod consistency;
pub mod convert;
pub mod coordinator;
pub mod detect;
pub mod error;
pub mod netcdf;
pub mod publish;
pub mod report;

pub use aggregate::Aggregator;
pub use config::SyncConfig;
pub use consistency::{check_consistency, repair, ConsistencyFinding};
pub use convert::{convert, NetcdfDecoder, PayloadDecoder, RawPayloads, SummaryStats};
pub use coordinator::{EntityOutcome, EntityReport, FetchCoordinator};
pub use detect::{compute_work_set, WorkItem, WorkSet};
pub use error::SyncError;
pub use report::{write_reports, RunSummary};

pub const CRATE_NAME: &str = "argosync-sync";

/// Ledger and catalog counts, as printed by `argosync status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub ledger_entries: usize,
    pub processed: usize,
    pub failed: usize,
    pub pending: usize,
    pub catalog_rows: usize,
    pub findings: Vec<ConsistencyFinding>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    remote: Arc<dyn RemoteCatalog>,
    decoder: Arc<dyn PayloadDecoder>,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let remote: Arc<dyn RemoteCatalog> = if config.is_http() {
            let http = HttpFetcher::new(config.http_config())?;
            Arc::new(HttpRemote::new(config.base_url.clone(), config.dac.clone(), http))
        } else {
            Arc::new(MirrorRemote::new(config.mirror_root(), config.dac.clone()))
        };
        if config.fetch_concurrency() < config.concurrency {
            warn!(
                concurrency = config.concurrency,
                max_connections = config.max_connections,
                "concurrency above the connection limit, capping"
            );
        }
        let policy = config.retry_policy();
        Ok(Self {
            config,
            remote,
            decoder: Arc::new(NetcdfDecoder),
            policy,
            shutdown: watch::channel(false).1,
        })
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteCatalog>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn PayloadDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    async fn open_stores(&self) -> Result<(Arc<FingerprintStore>, Arc<CatalogStore>), SyncError> {
        let ledger = FingerprintStore::load(self.config.ledger_path()).await?;
        let catalog = CatalogStore::load(self.config.catalog_path()).await?;
        Ok((Arc::new(ledger), Arc::new(catalog)))
    }

    /// One full pass over the DAC.
    ///
    /// Per-float failures are reported in the summary. An unreadable ledger or
    /// catalog is returned as an error before any work starts; listing and
    /// commit failures are recorded as the summary's fatal error.
    pub async fn run_once(&self) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let mut summary = RunSummary::new(run_id, self.config.dac.clone(), Utc::now());
        let (ledger, catalog) = self.open_stores().await?;

        let findings = check_consistency(&ledger, &catalog).await;
        repair(&ledger, &findings).await?;
        summary.consistency_findings = findings;

        match list_entities(
            self.remote.as_ref(),
            &self.policy,
            self.config.fetch_concurrency(),
            &self.shutdown,
        )
        .await {
            Ok(listings) => {
                summary.listed = listings.len();
                for listing in &listings {
                    ledger.observe(&listing.key).await;
                }
                let work_set = compute_work_set(&listings, &ledger.snapshot().await);
                summary.work = work_set.items.len();
                info!(
                    %run_id,
                    listed = summary.listed,
                    work = summary.work,
                    unchanged = work_set.unchanged.len(),
                    unreachable = work_set.unreachable.len(),
                    "change detection complete"
                );

                let aggregator = Arc::new(Aggregator::new(
                    &self.config.out_root,
                    self.config.dac.clone(),
                    catalog.clone(),
                    ledger.clone(),
                ));
                let coordinator = FetchCoordinator::new(
                    self.remote.clone(),
                    self.decoder.clone(),
                    ledger.clone(),
                    aggregator.clone(),
                    self.policy,
                )
                .with_raw_store(RawStore::new(&self.config.raw_root))
                .with_shutdown(self.shutdown.clone());

                let reports = coordinator
                    .process_all(&work_set, self.config.fetch_concurrency())
                    .await;
                summary.record_entities(reports);
                summary.fatal_error = aggregator.fatal_error().map(str::to_string);
            }
            Err(source) => {
                let err = SyncError::Listing {
                    dac: self.config.dac.clone(),
                    source,
                };
                error!(error = %err, "cannot list remote floats, nothing processed");
                summary.fatal_error = Some(err.to_string());
            }
        }

        match ledger.persist().await {
            Ok(()) => summary.ledger_persisted = true,
            Err(e) => error!(error = %e, path = %ledger.path().display(), "ledger not persisted"),
        }
        summary.finished_at = Utc::now();

        match write_reports(&self.config.reports_root(), &summary).await {
            Ok(dir) => info!(reports = %dir.display(), "run reports written"),
            Err(e) => warn!("cannot write run reports: {e:#}"),
        }

        if let Some(url) = &self.config.postgres_url {
            if summary.fatal_error.is_none() {
                if let Err(e) = publish::publish_catalog(url, &catalog.rows().await).await {
                    warn!("catalog publish failed: {e:#}");
                }
            }
        }

        info!(
            %run_id,
            processed = summary.count(EntityOutcome::Processed),
            unchanged = summary.count(EntityOutcome::SkippedUnchanged),
            failed = summary.failures(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// Counts and consistency findings without touching the remote or
    /// repairing anything.
    pub async fn status(&self) -> Result<StatusReport, SyncError> {
        let (ledger, catalog) = self.open_stores().await?;
        let records = ledger.snapshot().await;
        let with_status = |status: LedgerStatus| records.values().filter(|r| r.status == status).count();
        Ok(StatusReport {
            ledger_entries: records.len(),
            processed: with_status(LedgerStatus::Processed),
            failed: with_status(LedgerStatus::Failed),
            pending: with_status(LedgerStatus::Pending),
            catalog_rows: catalog.len().await,
            findings: check_consistency(&ledger, &catalog).await,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    Ok(pipeline.run_once().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use argosync_core::{FileKind, Fingerprint, RemoteError};
    use argosync_remote::MemoryRemote;
    use argosync_storage::StoreError;
    use tempfile::{tempdir, TempDir};

    use crate::convert::fixtures::{meta_bytes, payloads, ProfileFixture};

    fn publish(remote: &MemoryRemote, key: &str, revision: u32) {
        remote.put(key, FileKind::Meta, meta_bytes("APEX", revision));
        remote.put(
            key,
            FileKind::Profile,
            ProfileFixture::core(revision as f32).to_bytes(),
        );
    }

    fn pipeline(dir: &TempDir, remote: Arc<MemoryRemote>) -> SyncPipeline {
        let root = dir.path().to_path_buf();
        let config = SyncConfig::from_lookup(|key| match key {
            "ARGOSYNC_BASE_URL" => Some(root.join("mirror").display().to_string()),
            "RAW_ROOT" => Some(root.join("raw").display().to_string()),
            "OUT_ROOT" => Some(root.join("processed").display().to_string()),
            "ARGOSYNC_CONCURRENCY" => Some("2".to_string()),
            _ => None,
        });
        SyncPipeline::new(config)
            .expect("pipeline")
            .with_remote(remote)
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                unavailable_base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                attempt_timeout: Some(Duration::from_secs(2)),
                total_budget: Duration::from_secs(10),
            })
    }

    fn seeded_remote() -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::new("incois"));
        for key in ["2902114", "2902115", "2902116"] {
            publish(&remote, key, 1);
        }
        remote
    }

    #[tokio::test]
    async fn second_run_without_remote_changes_processes_nothing() {
        let dir = tempdir().expect("tempdir");
        let remote = seeded_remote();
        let pipeline = pipeline(&dir, remote.clone());

        let first = pipeline.run_once().await.expect("first run");
        assert_eq!(first.count(EntityOutcome::Processed), 3);
        assert!(first.is_success());
        let fetches = remote.payload_fetches();

        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.work, 0);
        assert_eq!(second.count(EntityOutcome::Processed), 0);
        assert_eq!(second.count(EntityOutcome::SkippedUnchanged), 3);
        assert_eq!(remote.payload_fetches(), fetches);
    }

    #[tokio::test]
    async fn only_the_changed_float_is_reprocessed() {
        let dir = tempdir().expect("tempdir");
        let remote = seeded_remote();
        let pipeline = pipeline(&dir, remote.clone());
        pipeline.run_once().await.expect("first run");

        publish(&remote, "2902115", 2);
        let summary = pipeline.run_once().await.expect("second run");
        assert_eq!(summary.work, 1);
        assert_eq!(summary.outcome_of("2902115"), Some(EntityOutcome::Processed));
        assert_eq!(summary.outcome_of("2902114"), Some(EntityOutcome::SkippedUnchanged));

        let catalog = CatalogStore::load(pipeline.config().catalog_path())
            .await
            .expect("catalog");
        assert_eq!(catalog.len().await, 3);
        let row = catalog.get("2902115").await.expect("row");
        assert_eq!(row.fingerprint, Fingerprint::of_bytes(&meta_bytes("APEX", 2)));
        assert_eq!(row.temp_max, Some(30.0));
    }

    #[tokio::test]
    async fn lost_ledger_update_is_reprocessed_idempotently() {
        let dir = tempdir().expect("tempdir");
        let remote = seeded_remote();
        let pipeline = pipeline(&dir, remote.clone());
        pipeline.run_once().await.expect("first run");
        let before = CatalogStore::load(pipeline.config().catalog_path())
            .await
            .expect("catalog")
            .rows()
            .await;

        // Table and catalog were written but the ledger never caught up.
        std::fs::remove_file(pipeline.config().ledger_path()).expect("drop ledger");

        let summary = pipeline.run_once().await.expect("rerun");
        assert_eq!(summary.count(EntityOutcome::Processed), 3);
        let after = CatalogStore::load(pipeline.config().catalog_path())
            .await
            .expect("catalog")
            .rows()
            .await;
        assert_eq!(after.len(), 3);
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.float_id, b.float_id);
            assert_eq!(a.fingerprint, b.fingerprint);
            assert_eq!(a.num_rows, b.num_rows);
            assert_eq!(a.summary, b.summary);
        }

        let ledger = FingerprintStore::load(pipeline.config().ledger_path())
            .await
            .expect("ledger");
        assert_eq!(ledger.len().await, 3);
    }

    #[tokio::test]
    async fn catalog_ahead_of_ledger_converges_on_the_catalog_revision() {
        let dir = tempdir().expect("tempdir");
        let remote = seeded_remote();
        let pipeline = pipeline(&dir, remote.clone());
        pipeline.run_once().await.expect("first run");
        let old = Fingerprint::of_bytes(&meta_bytes("APEX", 1));
        let new = Fingerprint::of_bytes(&meta_bytes("APEX", 2));

        // Revision 2 reached the catalog, then the process died before the
        // ledger moved off revision 1.
        publish(&remote, "2902115", 2);
        let catalog = CatalogStore::load(pipeline.config().catalog_path())
            .await
            .expect("catalog");
        let (_, stats) = convert(
            &NetcdfDecoder,
            "2902115",
            &payloads(&ProfileFixture::core(2.0), None),
        )
        .expect("convert");
        catalog
            .upsert(stats.to_catalog_row("2902115", "incois", new.clone()))
            .await
            .expect("upsert");
        let ledger = FingerprintStore::load(pipeline.config().ledger_path())
            .await
            .expect("ledger");
        assert_eq!(ledger.get("2902115").await.and_then(|r| r.fingerprint), Some(old));

        let summary = pipeline.run_once().await.expect("rerun");
        assert_eq!(summary.consistency_findings.len(), 1);
        assert_eq!(summary.consistency_findings[0].key, "2902115");
        assert_eq!(summary.outcome_of("2902115"), Some(EntityOutcome::Processed));
        assert_eq!(summary.outcome_of("2902114"), Some(EntityOutcome::SkippedUnchanged));
        assert!(summary.is_success());

        let catalog = CatalogStore::load(pipeline.config().catalog_path())
            .await
            .expect("catalog");
        let rows = catalog.rows().await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|r| r.float_id == "2902115").count(), 1);
        assert_eq!(catalog.get("2902115").await.expect("row").fingerprint, new);
        let ledger = FingerprintStore::load(pipeline.config().ledger_path())
            .await
            .expect("ledger");
        let record = ledger.get("2902115").await.expect("record");
        assert_eq!(record.fingerprint, Some(new));
        assert_eq!(record.status, LedgerStatus::Processed);

        let third = pipeline.run_once().await.expect("third run");
        assert_eq!(third.work, 0);
        assert!(third.consistency_findings.is_empty());
    }

    #[tokio::test]
    async fn shutdown_before_the_run_fetches_nothing() {
        let dir = tempdir().expect("tempdir");
        let remote = Arc::new(MemoryRemote::new("incois"));
        let keys = (0..20).map(|i| format!("29021{i:02}")).collect::<Vec<_>>();
        for key in &keys {
            publish(&remote, key, 1);
        }
        let (stop, shutdown) = watch::channel(false);
        stop.send_replace(true);
        let pipeline = pipeline(&dir, remote.clone()).with_shutdown(shutdown);

        let summary = pipeline.run_once().await.expect("summary");
        assert_eq!(summary.listed, 0);
        assert!(summary.entities.is_empty());
        assert!(summary.fatal_error.is_none());
        assert!(summary.ledger_persisted);
        for key in &keys {
            assert_eq!(remote.fetch_count(key, FileKind::Meta), 0, "{key}");
        }
        assert_eq!(remote.payload_fetches(), 0);
    }

    #[tokio::test]
    async fn corrupt_ledger_stops_the_run_before_any_fetch() {
        let dir = tempdir().expect("tempdir");
        let remote = seeded_remote();
        let pipeline = pipeline(&dir, remote.clone());
        let ledger_path = pipeline.config().ledger_path();
        std::fs::create_dir_all(ledger_path.parent().expect("parent")).expect("out root");
        std::fs::write(&ledger_path, b"definitely not parquet").expect("garbage");

        let err = pipeline.run_once().await.expect_err("corruption");
        assert!(matches!(err, SyncError::Store(StoreError::Corruption { .. })));
        assert!(err.is_fatal());
        assert_eq!(remote.payload_fetches(), 0);
    }

    #[tokio::test]
    async fn listing_failure_is_fatal_but_the_ledger_is_still_saved() {
        let dir = tempdir().expect("tempdir");
        let remote = seeded_remote();
        remote.fail_listing(RemoteError::Unavailable {
            path: "incois/".to_string(),
            detail: "connection refused".to_string(),
        });
        let pipeline = pipeline(&dir, remote.clone());

        let summary = pipeline.run_once().await.expect("summary");
        assert!(summary.fatal_error.is_some());
        assert!(summary.ledger_persisted);
        assert!(!summary.is_success());
        assert!(summary.entities.is_empty());
        assert!(pipeline.config().ledger_path().exists());
    }

    #[tokio::test]
    async fn failures_are_reported_and_retried_next_run() {
        let dir = tempdir().expect("tempdir");
        let remote = seeded_remote();
        remote.put("2902116", FileKind::Profile, &b"garbage"[..]);
        let pipeline = pipeline(&dir, remote.clone());

        let first = pipeline.run_once().await.expect("first run");
        assert_eq!(first.outcome_of("2902116"), Some(EntityOutcome::FailedDecode));
        assert!(first.is_success());

        publish(&remote, "2902116", 1);
        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.work, 1);
        assert_eq!(second.outcome_of("2902116"), Some(EntityOutcome::Processed));

        let status = pipeline.status().await.expect("status");
        assert_eq!(status.processed, 3);
        assert_eq!(status.failed, 0);
        assert_eq!(status.catalog_rows, 3);
        assert!(status.findings.is_empty());
    }

    #[tokio::test]
    async fn run_writes_reports_and_raw_payloads() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(&dir, seeded_remote());
        let summary = pipeline.run_once().await.expect("run");

        let reports = pipeline
            .config()
            .reports_root()
            .join(summary.run_id.to_string());
        assert!(reports.join("run_summary.json").exists());
        assert!(reports.join("daily_brief.md").exists());
        assert!(dir
            .path()
            .join("raw/incois/2902114/2902114_prof.nc")
            .exists());
        assert!(dir
            .path()
            .join("processed/incois/2902114.parquet")
            .exists());
    }
}
