//! PPPoE reconciliation pass: bring one router's subscribers in line with the
//! account list observed on that router.
//!
//! Each observed record is applied as update → insert → (on conflict) update,
//! so concurrent passes over the same router converge without surfacing
//! duplicate-key errors. With `prune`, subscribers of the router that were not
//! observed are deleted afterwards. Already-applied writes stand when the pass
//! stops early; re-running with the same input converges.
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::config::{Config, DEFAULT_PRUNE_BATCH_SIZE};
use crate::model::{ObservedRecord, RecordOutcome, SyncReport};
use crate::store::{StoreError, SubscriberStore};

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub prune_batch_size: usize,
    pub deadline: Option<Duration>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            prune_batch_size: DEFAULT_PRUNE_BATCH_SIZE,
            deadline: None,
        }
    }
}

impl From<&Config> for ReconcileOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            prune_batch_size: cfg.sync.prune_batch_size,
            deadline: Some(cfg.sync_deadline()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("sync aborted: {source}")]
    Fatal {
        report: SyncReport,
        #[source]
        source: StoreError,
    },
    #[error("sync exceeded its deadline of {limit:?}")]
    Timeout { report: SyncReport, limit: Duration },
}

impl SyncError {
    /// Counts accumulated before the pass stopped, if it got that far.
    pub fn partial_report(&self) -> Option<&SyncReport> {
        match self {
            SyncError::Validation(_) => None,
            SyncError::Fatal { report, .. } | SyncError::Timeout { report, .. } => Some(report),
        }
    }
}

/// Why a step stopped the whole pass.
enum Abort {
    Fatal(StoreError),
    Deadline,
}

struct Deadline(Option<(Instant, Duration)>);

impl Deadline {
    fn start(limit: Option<Duration>) -> Self {
        Self(limit.map(|l| (Instant::now() + l, l)))
    }

    /// Runs one step under the deadline. An expired deadline stops the pass
    /// before the step issues any write.
    async fn run<T, F>(&self, fut: F) -> Result<T, Abort>
    where
        F: Future<Output = T>,
    {
        match self.0 {
            Some((at, _)) if Instant::now() >= at => Err(Abort::Deadline),
            Some((at, _)) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| Abort::Deadline),
            None => Ok(fut.await),
        }
    }

    fn limit(&self) -> Duration {
        self.0.map(|(_, l)| l).unwrap_or_default()
    }
}

#[instrument(skip_all, fields(router_id = %router_id, observed = observed.len(), prune = prune))]
pub async fn reconcile(
    store: &dyn SubscriberStore,
    router_id: &str,
    observed: &[ObservedRecord],
    prune: bool,
    opts: &ReconcileOptions,
) -> Result<SyncReport, SyncError> {
    let router_id = router_id.trim();
    if router_id.is_empty() {
        return Err(SyncError::Validation("router_id is required"));
    }
    if opts.prune_batch_size == 0 {
        return Err(SyncError::Validation("prune batch size must be > 0"));
    }

    let deadline = Deadline::start(opts.deadline);
    let mut report = SyncReport::default();

    let stop = |report: SyncReport, abort: Abort| match abort {
        Abort::Fatal(source) => {
            warn!(%source, "sync aborted by store failure");
            SyncError::Fatal { report, source }
        }
        Abort::Deadline => {
            warn!(limit = ?deadline.limit(), "sync deadline exceeded");
            SyncError::Timeout {
                report,
                limit: deadline.limit(),
            }
        }
    };

    for rec in observed {
        let step = deadline.run(apply_record(store, router_id, rec)).await;
        match step {
            Ok(Ok(outcome)) => {
                if let RecordOutcome::Failed(reason) = &outcome {
                    warn!(%reason, "subscriber not synced");
                }
                report.record(outcome);
            }
            Ok(Err(err)) => return Err(stop(report, Abort::Fatal(err))),
            Err(abort) => return Err(stop(report, abort)),
        }
    }

    if prune {
        let keep: HashSet<&str> = observed.iter().filter_map(ObservedRecord::username).collect();
        if keep.is_empty() {
            info!("prune requested with no usable usernames; skipping");
        } else {
            let step = deadline
                .run(prune_absent(store, router_id, &keep, opts.prune_batch_size, &mut report))
                .await;
            match step {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(stop(report, Abort::Fatal(err))),
                Err(abort) => return Err(stop(report, abort)),
            }
        }
    }

    info!(
        added = report.added,
        updated = report.updated,
        skipped = report.skipped,
        pruned = report.pruned,
        warnings = report.warnings.len(),
        "sync finished"
    );
    Ok(report)
}

/// Apply one observed record. Only a fatal store error escapes; everything
/// else is folded into the outcome.
async fn apply_record(
    store: &dyn SubscriberStore,
    router_id: &str,
    rec: &ObservedRecord,
) -> Result<RecordOutcome, StoreError> {
    let Some(username) = rec.username() else {
        return Ok(RecordOutcome::Skipped);
    };
    let failed = |err: StoreError| match err {
        StoreError::Fatal(_) => Err(err),
        other => Ok(RecordOutcome::Failed(format!("{username}: {other}"))),
    };

    match store.update(router_id, username, &rec.password, &rec.profile).await {
        Ok(0) => {}
        Ok(_) => return Ok(RecordOutcome::Updated),
        Err(err) => return failed(err),
    }

    match store.insert(router_id, username, &rec.password, &rec.profile).await {
        Ok(()) => Ok(RecordOutcome::Added),
        Err(StoreError::Conflict) => {
            // Lost the insert race; the row exists now, so write our values over it.
            match store.update(router_id, username, &rec.password, &rec.profile).await {
                Ok(_) => Ok(RecordOutcome::Updated),
                Err(err) => failed(err),
            }
        }
        Err(err) => failed(err),
    }
}

/// Delete subscribers of `router_id` that are not in `keep`, in bounded batches.
async fn prune_absent(
    store: &dyn SubscriberStore,
    router_id: &str,
    keep: &HashSet<&str>,
    batch_size: usize,
    report: &mut SyncReport,
) -> Result<(), StoreError> {
    let stale: Vec<String> = match store.usernames(router_id).await {
        Ok(existing) => existing
            .into_iter()
            .filter(|u| !keep.contains(u.as_str()))
            .collect(),
        Err(StoreError::Fatal(msg)) => return Err(StoreError::Fatal(msg)),
        Err(err) => {
            report.warnings.push(format!("prune: {err}"));
            return Ok(());
        }
    };

    for chunk in stale.chunks(batch_size) {
        match store.delete(router_id, chunk).await {
            Ok(n) => report.pruned += n,
            Err(StoreError::Fatal(msg)) => return Err(StoreError::Fatal(msg)),
            Err(err) => {
                warn!(%err, batch = chunk.len(), "prune batch failed");
                report.warnings.push(format!("prune: {err}"));
            }
        }
    }
    Ok(())
}
