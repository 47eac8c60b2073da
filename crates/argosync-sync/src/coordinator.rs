//! Bounded-concurrency processing of the work set.
//!
//! Each slot runs one float end to end: fetch, convert, commit. Floats never
//! share a slot and a failure stays inside its own pipeline.

use std::fmt;
use std::sync::Arc;

use argosync_core::{FileKind, Fingerprint, LedgerRecord, RemoteError};
use argosync_remote::RemoteCatalog;
use argosync_storage::{FingerprintStore, RawStore, RetryBudget, RetryError, RetryPolicy, StoreError};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::aggregate::Aggregator;
use crate::convert::{convert, PayloadDecoder, RawPayloads};
use crate::detect::{WorkItem, WorkSet};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityOutcome {
    SkippedUnchanged,
    Processed,
    FailedTransientExhausted,
    FailedDecode,
    FailedRemote,
    /// The float's own pipeline broke, e.g. the conversion task panicked.
    FailedInternal,
    SkippedUnreachable,
    Conflict,
    Cancelled,
    Aborted,
}

impl EntityOutcome {
    pub const ALL: [EntityOutcome; 10] = [
        EntityOutcome::SkippedUnchanged,
        EntityOutcome::Processed,
        EntityOutcome::FailedTransientExhausted,
        EntityOutcome::FailedDecode,
        EntityOutcome::FailedRemote,
        EntityOutcome::FailedInternal,
        EntityOutcome::SkippedUnreachable,
        EntityOutcome::Conflict,
        EntityOutcome::Cancelled,
        EntityOutcome::Aborted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityOutcome::SkippedUnchanged => "skipped-unchanged",
            EntityOutcome::Processed => "processed",
            EntityOutcome::FailedTransientExhausted => "failed-transient-exhausted",
            EntityOutcome::FailedDecode => "failed-decode",
            EntityOutcome::FailedRemote => "failed-remote",
            EntityOutcome::FailedInternal => "failed-internal",
            EntityOutcome::SkippedUnreachable => "skipped-unreachable",
            EntityOutcome::Conflict => "conflict",
            EntityOutcome::Cancelled => "cancelled",
            EntityOutcome::Aborted => "aborted",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            EntityOutcome::FailedTransientExhausted
                | EntityOutcome::FailedDecode
                | EntityOutcome::FailedRemote
                | EntityOutcome::FailedInternal
        )
    }
}

impl fmt::Display for EntityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn outcome_for(err: &SyncError) -> EntityOutcome {
    match err {
        SyncError::Fetch(e) if e.is_transient_exhaustion() => EntityOutcome::FailedTransientExhausted,
        SyncError::Fetch(_) => EntityOutcome::FailedRemote,
        SyncError::Store(StoreError::Conflict { .. }) => EntityOutcome::Conflict,
        e if e.is_fatal() => EntityOutcome::Aborted,
        SyncError::Decode(_) => EntityOutcome::FailedDecode,
        SyncError::Store(_) | SyncError::Task(_) | SyncError::Io(_) => EntityOutcome::FailedInternal,
        SyncError::Listing { .. }
        | SyncError::CatalogWrite(_)
        | SyncError::TableWrite { .. }
        | SyncError::Aborted => EntityOutcome::Aborted,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityReport {
    pub key: String,
    pub outcome: EntityOutcome,
    /// Fetch attempts spent on this float, retries included.
    pub attempts: usize,
    pub rows: Option<usize>,
    pub fingerprint: Option<Fingerprint>,
    pub detail: Option<String>,
}

impl EntityReport {
    pub fn new(key: impl Into<String>, outcome: EntityOutcome) -> Self {
        Self {
            key: key.into(),
            outcome,
            attempts: 0,
            rows: None,
            fingerprint: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub struct FetchCoordinator {
    remote: Arc<dyn RemoteCatalog>,
    decoder: Arc<dyn PayloadDecoder>,
    ledger: Arc<FingerprintStore>,
    aggregator: Arc<Aggregator>,
    policy: RetryPolicy,
    raw_store: Option<RawStore>,
    shutdown: watch::Receiver<bool>,
}

impl FetchCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteCatalog>,
        decoder: Arc<dyn PayloadDecoder>,
        ledger: Arc<FingerprintStore>,
        aggregator: Arc<Aggregator>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            decoder,
            ledger,
            aggregator,
            policy,
            raw_store: None,
            shutdown: watch::channel(false).1,
        }
    }

    /// Keep a local copy of every fetched file.
    pub fn with_raw_store(mut self, raw_store: RawStore) -> Self {
        self.raw_store = Some(raw_store);
        self
    }

    /// Floats not yet started when the flag turns true are reported cancelled.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run every work item with at most `concurrency` pipelines in flight.
    /// Unchanged and unreachable floats are reported without any work.
    pub async fn process_all(&self, work_set: &WorkSet, concurrency: usize) -> Vec<EntityReport> {
        let mut reports = Vec::with_capacity(
            work_set.items.len() + work_set.unchanged.len() + work_set.unreachable.len(),
        );
        reports.extend(
            work_set
                .unchanged
                .iter()
                .map(|key| EntityReport::new(key.as_str(), EntityOutcome::SkippedUnchanged)),
        );
        reports.extend(work_set.unreachable.iter().map(|(key, err)| {
            EntityReport::new(key.as_str(), EntityOutcome::SkippedUnreachable)
                .with_detail(err.to_string())
        }));

        let processed = stream::iter(&work_set.items)
            .map(|item| self.process_entity(item))
            .buffer_unordered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        reports.extend(processed);
        reports.sort_by(|a, b| a.key.cmp(&b.key));
        reports
    }

    async fn process_entity(&self, item: &WorkItem) -> EntityReport {
        if *self.shutdown.borrow() {
            return EntityReport::new(item.key.as_str(), EntityOutcome::Cancelled)
                .with_detail("shutdown requested before start");
        }
        if let Some(fatal) = self.aggregator.fatal_error() {
            return EntityReport::new(item.key.as_str(), EntityOutcome::Aborted)
                .with_detail(format!("not started: {fatal}"));
        }
        let span = info_span!("entity", key = %item.key);
        self.run_and_report(item).instrument(span).await
    }

    async fn run_and_report(&self, item: &WorkItem) -> EntityReport {
        let mut attempts = 0usize;
        let result = self.run_entity(item, &mut attempts).await;

        let mut report = EntityReport::new(item.key.as_str(), EntityOutcome::Processed);
        report.attempts = attempts;
        match result {
            Ok((record, rows)) => {
                info!(rows, attempts, "float processed");
                report.rows = Some(rows);
                report.fingerprint = record.fingerprint;
            }
            Err(err) => {
                report.outcome = outcome_for(&err);
                report.detail = Some(err.to_string());
                if report.outcome.is_failure() {
                    if let Err(e) = self.ledger.mark_failed(&item.key).await {
                        warn!(error = %e, "cannot record failure in ledger");
                    }
                }
                warn!(outcome = %report.outcome, attempts, error = %err, "float not processed");
            }
        }
        report
    }

    async fn fetch(
        &self,
        key: &str,
        kind: FileKind,
        budget: &RetryBudget,
        attempts: &mut usize,
    ) -> Result<Bytes, RetryError> {
        let remote = self.remote.as_ref();
        let label = kind.file_name(key);
        match self
            .policy
            .run(&label, budget, move || remote.fetch_payload(key, kind))
            .await
        {
            Ok(fetched) => {
                *attempts += fetched.attempts;
                Ok(fetched.value)
            }
            Err(err) => {
                *attempts += err.attempts();
                Err(err)
            }
        }
    }

    async fn run_entity(
        &self,
        item: &WorkItem,
        attempts: &mut usize,
    ) -> Result<(LedgerRecord, usize), SyncError> {
        let key = item.key.as_str();
        self.ledger.observe(key).await;

        let budget = self.policy.budget();
        let meta = self.fetch(key, FileKind::Meta, &budget, attempts).await?;
        let profile = self.fetch(key, FileKind::Profile, &budget, attempts).await?;
        let extended = match self
            .fetch(key, FileKind::ExtendedProfile, &budget, attempts)
            .await
        {
            Ok(bytes) => Some(bytes),
            Err(RetryError::Permanent {
                error: RemoteError::NotFound { .. },
                ..
            }) => None,
            Err(err) => return Err(err.into()),
        };
        debug!(
            meta = meta.len(),
            profile = profile.len(),
            extended = extended.as_ref().map(|b| b.len()),
            "payloads fetched"
        );

        if let Some(raw_store) = &self.raw_store {
            let dac = self.remote.dac();
            let files = [
                (FileKind::Meta, Some(&meta)),
                (FileKind::Profile, Some(&profile)),
                (FileKind::ExtendedProfile, extended.as_ref()),
            ];
            for (kind, bytes) in files {
                if let Some(bytes) = bytes {
                    if let Err(e) = raw_store.store_payload(dac, key, kind, bytes).await {
                        warn!(%kind, error = %e, "cannot keep raw payload");
                    }
                }
            }
        }

        let fingerprint = Fingerprint::of_bytes(&meta);
        if fingerprint != item.remote {
            debug!(
                listed = item.remote.short(),
                fetched = fingerprint.short(),
                "metadata changed since listing"
            );
        }

        let payloads = RawPayloads {
            meta,
            profile,
            extended,
        };
        let decoder = self.decoder.clone();
        let owned_key = key.to_string();
        let (table, stats) =
            tokio::task::spawn_blocking(move || convert(decoder.as_ref(), &owned_key, &payloads))
                .await??;

        let record = self
            .aggregator
            .commit(key, item.expected.as_ref(), fingerprint, &table, &stats)
            .await?;
        Ok((record, table.rows.len()))
    }
}
