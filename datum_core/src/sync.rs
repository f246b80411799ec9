//! Delta transfer between the cache store and a remote.
//!
//! Both directions compute the set of leaf fingerprints the given manifests
//! declare, ask the destination which of them it already holds (in batches),
//! and move only the rest. Objects are transferred independently on a worker
//! pool; a failing object is recorded in the report and the batch carries on,
//! so rerunning the same push or pull resends exactly the failed subset.

use crate::error::{Error, Result};
use crate::hash::{CancelFlag, Hash};
use crate::manifest::Manifest;
use crate::remote::Transport;
use crate::store::Store;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

/// Keys per membership query.
pub const MEMBERSHIP_BATCH: usize = 1000;

/// Reason recorded for objects skipped after cancellation.
pub const CANCELLED_REASON: &str = "cancelled";

/// One object that could not be transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferFailure {
    pub hash: Hash,
    pub reason: String,
}

/// Outcome of a push or pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Objects copied to the destination.
    pub transferred: Vec<Hash>,
    /// Objects the destination already had.
    pub skipped: Vec<Hash>,
    /// Objects that failed; retrying the operation resends only these.
    pub failed: Vec<TransferFailure>,
}

impl TransferReport {
    /// True when every declared object is now at the destination.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn sort(&mut self) {
        self.transferred.sort();
        self.skipped.sort();
        self.failed.sort_by(|a, b| a.hash.cmp(&b.hash));
    }
}

/// Where the objects declared by a set of manifests currently live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Number of distinct objects declared.
    pub declared: usize,
    /// Declared objects absent from the local cache.
    pub missing_local: Vec<Hash>,
    /// Declared objects absent from the remote.
    pub missing_remote: Vec<Hash>,
}

impl SyncStatus {
    pub fn is_synced(&self) -> bool {
        self.missing_local.is_empty() && self.missing_remote.is_empty()
    }
}

/// Build a worker pool with `jobs` threads.
pub(crate) fn worker_pool(jobs: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .thread_name(|i| format!("datum-worker-{}", i))
        .build()
        .map_err(|e| Error::Io {
            source: std::io::Error::other(e.to_string()),
        })
}

/// Runs push, pull and status against any [`Transport`].
pub struct SyncEngine {
    pool: rayon::ThreadPool,
    cancel: Option<CancelFlag>,
}

impl SyncEngine {
    /// An engine transferring up to `jobs` objects at once.
    pub fn new(jobs: usize) -> Result<Self> {
        Ok(Self {
            pool: worker_pool(jobs)?,
            cancel: None,
        })
    }

    /// Stop scheduling new objects once `cancel` is set.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Upload every declared object the remote does not have yet.
    ///
    /// Each local entry is verified before upload; a corrupted one is
    /// recorded as failed and never reaches the remote.
    pub fn push(
        &self,
        manifests: &[Manifest],
        store: &Store,
        remote: &dyn Transport,
    ) -> Result<TransferReport> {
        let wanted = declared_objects(manifests, store)?;
        let mut report = TransferReport::default();

        let present = membership(&wanted, |batch| remote.exists_many(batch), &mut report);
        let needed: Vec<Hash> = wanted
            .iter()
            .filter(|h| !present.contains(*h) && !has_failed(&report, h))
            .copied()
            .collect();
        report.skipped = wanted.iter().filter(|h| present.contains(*h)).copied().collect();

        self.transfer(&needed, &mut report, |hash| {
            let mut entry = store.open_verified_raw(hash)?;
            remote.put_from(hash, &mut entry)
        });

        report.sort();
        info!(
            transferred = report.transferred.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "push finished"
        );
        Ok(report)
    }

    /// Download every declared object missing from the local cache.
    ///
    /// Each object is verified against its fingerprint before it enters the
    /// cache.
    pub fn pull(
        &self,
        manifests: &[Manifest],
        remote: &dyn Transport,
        store: &Store,
    ) -> Result<TransferReport> {
        let wanted = declared_objects(manifests, store)?;
        let mut report = TransferReport::default();

        let present = membership(&wanted, |batch| Ok(store.has_many(batch)), &mut report);
        let needed: Vec<Hash> = wanted
            .iter()
            .filter(|h| !present.contains(*h))
            .copied()
            .collect();
        report.skipped = wanted.iter().filter(|h| present.contains(*h)).copied().collect();

        self.transfer(&needed, &mut report, |hash| {
            store.import_with(hash, |file| remote.get_into(hash, file).map(|_| ()))?;
            Ok(())
        });

        report.sort();
        info!(
            transferred = report.transferred.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "pull finished"
        );
        Ok(report)
    }

    /// Report which declared objects are missing locally and remotely.
    pub fn status(
        &self,
        manifests: &[Manifest],
        store: &Store,
        remote: &dyn Transport,
    ) -> Result<SyncStatus> {
        let wanted = declared_objects(manifests, store)?;

        let mut remote_present = HashSet::new();
        for batch in wanted.chunks(MEMBERSHIP_BATCH) {
            remote_present.extend(remote.exists_many(batch)?);
        }
        let local_present = store.has_many(&wanted);

        Ok(SyncStatus {
            declared: wanted.len(),
            missing_local: wanted
                .iter()
                .filter(|h| !local_present.contains(*h))
                .copied()
                .collect(),
            missing_remote: wanted
                .iter()
                .filter(|h| !remote_present.contains(*h))
                .copied()
                .collect(),
        })
    }

    /// Run `copy` for every hash on the pool, recording each outcome.
    fn transfer<F>(&self, needed: &[Hash], report: &mut TransferReport, copy: F)
    where
        F: Fn(&Hash) -> Result<()> + Sync,
    {
        let cancel = self.cancel.as_ref();
        let outcomes: Vec<(Hash, Result<()>)> = self.pool.install(|| {
            needed
                .par_iter()
                .map(|hash| {
                    let outcome = match cancel {
                        Some(flag) if flag.is_cancelled() => Err(Error::Cancelled),
                        _ => copy(hash),
                    };
                    (*hash, outcome)
                })
                .collect()
        });

        for (hash, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    debug!(%hash, "transferred");
                    report.transferred.push(hash);
                }
                Err(Error::Cancelled) => report.failed.push(TransferFailure {
                    hash,
                    reason: CANCELLED_REASON.to_string(),
                }),
                Err(e) => {
                    warn!(%hash, error = %e, "transfer failed");
                    report.failed.push(TransferFailure {
                        hash,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Every leaf fingerprint the manifests declare, sorted and deduplicated.
fn declared_objects(manifests: &[Manifest], store: &Store) -> Result<Vec<Hash>> {
    let mut wanted = BTreeSet::new();
    for manifest in manifests {
        if manifest.algorithm() != store.algorithm() {
            return Err(Error::unsupported_algorithm(format!(
                "{} uses {}, cache store uses {}",
                manifest.path(),
                manifest.algorithm(),
                store.algorithm()
            )));
        }
        wanted.extend(manifest.root().leaf_hashes());
    }
    Ok(wanted.into_iter().collect())
}

/// Batched membership query. A failing batch marks its keys as failed.
fn membership<F>(wanted: &[Hash], query: F, report: &mut TransferReport) -> HashSet<Hash>
where
    F: Fn(&[Hash]) -> Result<HashSet<Hash>>,
{
    let mut present = HashSet::new();
    for batch in wanted.chunks(MEMBERSHIP_BATCH) {
        match query(batch) {
            Ok(found) => present.extend(found),
            Err(e) => {
                warn!(keys = batch.len(), error = %e, "membership check failed");
                report
                    .failed
                    .extend(batch.iter().map(|hash| TransferFailure {
                        hash: *hash,
                        reason: e.to_string(),
                    }));
            }
        }
    }
    present
}

fn has_failed(report: &TransferReport, hash: &Hash) -> bool {
    report.failed.iter().any(|f| &f.hash == hash)
}
