//! Run controller: guard, report, then migrate only when confirmed.
//!
//! The bucket is validated before anything else.  Without confirmation the
//! run stops after reporting the resolved bucket and label value, and the
//! object store is never even opened.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backup::BackupStore;
use crate::config::Config;
use crate::errors::GuardError;
use crate::guard::{BucketBinding, Guard};
use crate::migrate::{Migration, Summary};
use crate::patcher::Patcher;
use crate::storage::backend::ObjectStore;

/// How a run that passed the guard ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Not confirmed: nothing was read or written.
    DryRun { binding: BucketBinding },
    /// The driver scanned the bucket.
    Completed {
        binding: BucketBinding,
        summary: Summary,
    },
    /// The driver could not enumerate the bucket.
    DriverFailed {
        binding: BucketBinding,
        error: anyhow::Error,
    },
}

/// Errors that stop a run before any object is touched.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("setup failed: {0:#}")]
    Setup(anyhow::Error),
}

/// Guard `bucket_arg`, report the binding, and migrate if `confirm` is set.
///
/// `open_store` is only called for confirmed runs.
pub async fn execute<F>(
    config: &Config,
    bucket_arg: &str,
    confirm: bool,
    open_store: F,
    shutdown: &AtomicBool,
) -> Result<RunOutcome, RunError>
where
    F: FnOnce() -> anyhow::Result<Arc<dyn ObjectStore>>,
{
    let guard = Guard::new(&config.guard).map_err(RunError::Setup)?;
    let binding = guard.validate(bucket_arg)?;

    info!("GCS Bucket   : {}", binding.bucket());
    info!("Label Value  : {}={}", config.migration.label_key, binding.environment());

    if !confirm {
        info!("Making no changes without --confirm");
        return Ok(RunOutcome::DryRun { binding });
    }

    let store = open_store().map_err(RunError::Setup)?;
    let backups =
        BackupStore::new(&config.backup.dir, config.backup.file_mode).map_err(|e| {
            RunError::Setup(e.context(format!("creating backup dir {}", config.backup.dir)))
        })?;
    info!(dir = %backups.dir().display(), "writing backups");

    let migration = Migration::new(
        store,
        Arc::new(backups),
        Patcher::new(config.migration.label_key.clone()),
        config.migration.metadata_suffix.clone(),
        config.migration.concurrency,
    );

    match migration.run(&binding, shutdown).await {
        Ok(summary) => {
            report(&summary);
            Ok(RunOutcome::Completed { binding, summary })
        }
        Err(e) => {
            error!("Error: {e:#}");
            Ok(RunOutcome::DriverFailed { binding, error: e })
        }
    }
}

/// Log the final counts, keeping "already correct" apart from "failed".
fn report(summary: &Summary) {
    info!(
        listed = summary.listed,
        scanned = summary.candidates,
        patched = summary.patched,
        unchanged = summary.unchanged,
        failed = summary.failed,
        "migration finished"
    );
    for failure in &summary.failures {
        warn!("failed: {failure}");
    }
    if summary.interrupted {
        warn!(
            not_started = summary.not_started,
            "run interrupted; re-run to process the remaining objects"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{AccessCounts, MemoryStore};

    const META: &str = r#"{"thanos":{"labels":{"replica":"a"}}}"#;

    fn config(backup_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.backup.dir = backup_dir.to_string_lossy().into_owned();
        config
    }

    #[tokio::test]
    async fn test_dry_run_never_opens_store() {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = dir.path().join("backups");
        let outcome = execute(
            &config(&backup_dir),
            "gs://acme-thanos-lts-prod-east/",
            false,
            || panic!("store must not be opened on a dry run"),
            &AtomicBool::new(false),
        )
        .await
        .unwrap();

        let RunOutcome::DryRun { binding } = outcome else {
            panic!("expected a dry run");
        };
        assert_eq!(binding.bucket(), "acme-thanos-lts-prod-east");
        assert_eq!(binding.environment(), "east");
        assert!(!backup_dir.exists());
    }

    #[tokio::test]
    async fn test_dry_run_zero_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("acme-thanos-lts-prod-east", "01A/meta.json", META).await;
        let handle = store.clone();

        execute(
            &config(dir.path()),
            "acme-thanos-lts-prod-east",
            false,
            move || Ok(handle as Arc<dyn ObjectStore>),
            &AtomicBool::new(false),
        )
        .await
        .unwrap();

        assert_eq!(store.access_counts(), AccessCounts::default());
        assert_eq!(
            store.snapshot("acme-thanos-lts-prod-east", "01A/meta.json").await.unwrap(),
            META
        );
    }

    #[tokio::test]
    async fn test_guard_rejection_is_fatal_before_store() {
        let dir = tempfile::tempdir().unwrap();
        for bucket in [
            "gs://bruce-thanos-lts-expiring-backup",
            "gs://acme-metrics",
            "acme-thanos-lts-prod-backup",
        ] {
            let err = execute(
                &config(dir.path()),
                bucket,
                true,
                || panic!("store must not be opened when the guard refuses"),
                &AtomicBool::new(false),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, RunError::Guard(_)), "{bucket}");
        }
    }

    #[tokio::test]
    async fn test_confirmed_run_patches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("acme-thanos-lts-prod-east", "01A/meta.json", META).await;
        let handle = store.clone();

        let outcome = execute(
            &config(dir.path()),
            "acme-thanos-lts-prod-east",
            true,
            move || Ok(handle as Arc<dyn ObjectStore>),
            &AtomicBool::new(false),
        )
        .await
        .unwrap();

        let RunOutcome::Completed { summary, .. } = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.patched, 1);
        assert_eq!(store.access_counts().writes, 1);
        assert!(dir.path().join("01A-meta.json").exists());
        assert!(dir.path().join("01A-meta.json.fixed").exists());
    }

    #[tokio::test]
    async fn test_store_open_failure_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = execute(
            &config(dir.path()),
            "acme-thanos-lts-prod-east",
            true,
            || Err(anyhow::anyhow!("no credentials")),
            &AtomicBool::new(false),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunError::Setup(_)));
        assert!(err.to_string().contains("no credentials"));
    }
}
