//! Change detection: which floats need (re)processing this run.

use std::collections::BTreeMap;

use argosync_core::{Fingerprint, LedgerRecord, RemoteError};
use argosync_remote::RemoteListing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: String,
    /// Ledger fingerprint at detection time; the commit is conditional on it.
    pub expected: Option<Fingerprint>,
    pub remote: Fingerprint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    pub items: Vec<WorkItem>,
    pub unchanged: Vec<String>,
    pub unreachable: Vec<(String, RemoteError)>,
}

impl WorkSet {
    pub fn keys(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.key.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Diff the remote listing against a ledger snapshot.
///
/// A float is work iff the ledger has no fingerprint for it or a different
/// one. Floats whose remote fingerprint is unknown are neither work nor
/// unchanged.
pub fn compute_work_set(
    remote: &[RemoteListing],
    ledger: &BTreeMap<String, LedgerRecord>,
) -> WorkSet {
    let mut set = WorkSet::default();
    for listing in remote {
        let fingerprint = match &listing.fingerprint {
            Ok(fp) => fp,
            Err(err) => {
                set.unreachable.push((listing.key.clone(), err.clone()));
                continue;
            }
        };
        let stored = ledger.get(&listing.key).and_then(|r| r.fingerprint.clone());
        if stored.as_ref() == Some(fingerprint) {
            set.unchanged.push(listing.key.clone());
        } else {
            set.items.push(WorkItem {
                key: listing.key.clone(),
                expected: stored,
                remote: fingerprint.clone(),
            });
        }
    }
    set.items.sort_by(|a, b| a.key.cmp(&b.key));
    set.unchanged.sort();
    set.unreachable.sort_by(|a, b| a.0.cmp(&b.0));
    set
}
