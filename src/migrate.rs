//! Migration driver.
//!
//! Walks every object in the bucket, picks the metadata documents by name
//! suffix and runs each one through the same pipeline:
//!
//! ```text
//! fetch -> backup original -> patch -> backup patched -> write back
//! ```
//!
//! A failure at any step is recorded against that object only and the scan
//! moves on.  An object is never written unless both of its backups are
//! already on disk.  Re-running the driver is the retry mechanism: objects
//! that were patched come back as unchanged.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backup::{BackupKind, BackupStore};
use crate::errors::{ObjectFailure, Phase};
use crate::guard::BucketBinding;
use crate::patcher::{PatchOutcome, Patcher};
use crate::storage::backend::ObjectStore;

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    /// Objects returned by the bucket listing.
    pub listed: usize,
    /// Objects whose name matched the metadata suffix and were started.
    pub candidates: usize,
    /// Documents written back with the label added.
    pub patched: usize,
    /// Documents that already carried the label.
    pub unchanged: usize,
    /// Documents that failed at some step.
    pub failed: usize,
    /// Matching objects never started because the run was interrupted.
    pub not_started: usize,
    /// Whether a shutdown request cut the scan short.
    pub interrupted: bool,
    /// Per-object failures, in listing order.
    pub failures: Vec<ObjectFailure>,
}

impl Summary {
    fn record(&mut self, outcome: ObjectOutcome) {
        match outcome {
            ObjectOutcome::Patched => self.patched += 1,
            ObjectOutcome::Unchanged => self.unchanged += 1,
            ObjectOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
        }
    }
}

/// What happened to one candidate object.
#[derive(Debug)]
enum ObjectOutcome {
    Patched,
    Unchanged,
    Failed(ObjectFailure),
}

/// Runs the per-object pipeline over a bucket.
#[derive(Clone)]
pub struct Migration {
    store: Arc<dyn ObjectStore>,
    backups: Arc<BackupStore>,
    patcher: Patcher,
    metadata_suffix: String,
    concurrency: usize,
}

impl Migration {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        backups: Arc<BackupStore>,
        patcher: Patcher,
        metadata_suffix: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            backups,
            patcher,
            metadata_suffix: metadata_suffix.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Migrate every metadata document in the bound bucket.
    ///
    /// Only a listing failure is returned as an error; per-object failures
    /// are collected into the [`Summary`].  Once `shutdown` is set no new
    /// object is started, and objects already in flight are finished.
    pub async fn run(
        &self,
        binding: &BucketBinding,
        shutdown: &AtomicBool,
    ) -> anyhow::Result<Summary> {
        let bucket = binding.bucket();
        let names = self
            .store
            .list(bucket)
            .await
            .map_err(|e| e.context(format!("listing gs://{bucket}")))?;

        let mut summary = Summary {
            listed: names.len(),
            ..Summary::default()
        };
        let candidates: Vec<String> = names
            .into_iter()
            .filter(|name| name.ends_with(&self.metadata_suffix))
            .collect();
        info!(
            bucket,
            listed = summary.listed,
            candidates = candidates.len(),
            "bucket listed"
        );

        if self.concurrency == 1 {
            self.run_sequential(binding, candidates, shutdown, &mut summary)
                .await;
        } else {
            self.run_concurrent(binding, candidates, shutdown, &mut summary)
                .await;
        }

        Ok(summary)
    }

    async fn run_sequential(
        &self,
        binding: &BucketBinding,
        candidates: Vec<String>,
        shutdown: &AtomicBool,
        summary: &mut Summary,
    ) {
        let total = candidates.len();
        for (idx, name) in candidates.into_iter().enumerate() {
            if shutdown.load(Ordering::SeqCst) {
                mark_interrupted(summary, total - idx);
                return;
            }
            summary.candidates += 1;
            let outcome = self
                .process_object(binding.bucket(), binding.environment(), &name)
                .await;
            summary.record(outcome);
        }
    }

    async fn run_concurrent(
        &self,
        binding: &BucketBinding,
        candidates: Vec<String>,
        shutdown: &AtomicBool,
        summary: &mut Summary,
    ) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = VecDeque::new();
        let total = candidates.len();

        for (idx, name) in candidates.into_iter().enumerate() {
            if shutdown.load(Ordering::SeqCst) {
                mark_interrupted(summary, total - idx);
                break;
            }
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // A worker may have been slow to free a slot; re-check.
            if shutdown.load(Ordering::SeqCst) {
                mark_interrupted(summary, total - idx);
                break;
            }

            summary.candidates += 1;
            let worker = self.clone();
            let bucket = binding.bucket().to_string();
            let environment = binding.environment().to_string();
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                worker
                    .process_object(&bucket, &environment, &task_name)
                    .await
            });
            in_flight.push_back((name, handle));
        }

        while let Some((name, handle)) = in_flight.pop_front() {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => ObjectOutcome::Failed(failure(
                    binding.bucket(),
                    &name,
                    Phase::Aborted,
                    anyhow::anyhow!("worker task aborted: {e}"),
                )),
            };
            summary.record(outcome);
        }
    }

    /// Run one object through the pipeline.
    async fn process_object(&self, bucket: &str, environment: &str, name: &str) -> ObjectOutcome {
        info!(bucket, object = name, "found metadata document");

        let original = match self.store.read(bucket, name).await {
            Ok(data) => data,
            Err(e) => return ObjectOutcome::Failed(failure(bucket, name, Phase::Fetch, e)),
        };

        match self.backups.write(name, BackupKind::Original, &original).await {
            Ok(record) => info!(
                object = name,
                path = %record.path.display(),
                sha256 = %record.sha256,
                "backup of original written"
            ),
            Err(e) => {
                return ObjectOutcome::Failed(failure(bucket, name, Phase::BackupOriginal, e))
            }
        }

        let patched = match self.patcher.patch(&original, environment) {
            Ok(PatchOutcome::Patched(bytes)) => bytes,
            Ok(PatchOutcome::Unchanged) => {
                info!(
                    bucket,
                    object = name,
                    label = self.patcher.label_key(),
                    "changes not needed"
                );
                return ObjectOutcome::Unchanged;
            }
            Err(e) => return ObjectOutcome::Failed(failure(bucket, name, Phase::Patch, e.into())),
        };

        match self.backups.write(name, BackupKind::Patched, &patched).await {
            Ok(record) => debug!(
                object = name,
                path = %record.path.display(),
                "backup of patched document written"
            ),
            Err(e) => {
                return ObjectOutcome::Failed(failure(bucket, name, Phase::BackupPatched, e))
            }
        }

        info!(bucket, object = name, "uploading modified metadata document");
        if let Err(e) = self.store.write(bucket, name, Bytes::from(patched)).await {
            return ObjectOutcome::Failed(failure(bucket, name, Phase::Write, e));
        }

        ObjectOutcome::Patched
    }
}

fn mark_interrupted(summary: &mut Summary, remaining: usize) {
    warn!(remaining, "shutdown requested, not starting further objects");
    summary.interrupted = true;
    summary.not_started += remaining;
}

/// Log and package a per-object failure.
fn failure(bucket: &str, name: &str, phase: Phase, err: anyhow::Error) -> ObjectFailure {
    let cause = format!("{err:#}");
    warn!(bucket, object = name, %phase, error = %cause, "object failed, continuing");
    ObjectFailure {
        name: name.to_string(),
        phase,
        cause,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
