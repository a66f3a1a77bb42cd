//! Local filesystem object store.
//!
//! Each subdirectory of the root acts as a bucket and the object name is
//! used as a relative path inside it (`<root>/<bucket>/<name>`).  This lets
//! an operator rehearse a migration against a copy of a bucket made with
//! `gsutil -m cp -r`.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.

use bytes::Bytes;
use std::future::Future;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use super::backend::ObjectStore;
use crate::errors::ObjectNotFound;

/// Temp directory name under the root.  Never listed as a bucket.
const TMP_DIR: &str = ".tmp";

/// Treats directories under a root as buckets.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new `LocalStore` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root })
    }

    /// Resolve a bucket directory, rejecting anything but a single plain
    /// path component.
    fn bucket_dir(&self, bucket: &str) -> anyhow::Result<PathBuf> {
        let mut components = Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if bucket != TMP_DIR => Ok(self.root.join(bucket)),
            _ => anyhow::bail!("Invalid bucket name for local store: {}", bucket),
        }
    }

    /// Resolve an object to a file path, rejecting path traversal.
    fn resolve(&self, bucket: &str, name: &str) -> anyhow::Result<PathBuf> {
        for component in Path::new(name).components() {
            if !matches!(component, Component::Normal(_)) {
                anyhow::bail!("Path traversal detected in object name: {}", name);
            }
        }
        Ok(self.bucket_dir(bucket)?.join(name))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(TMP_DIR).join(format!("tmp-{}", id))
    }
}

/// Collect every file under `dir` as a `/`-separated name relative to `base`.
fn walk(base: &Path, dir: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(base, &path, out)?;
        } else {
            let rel = path.strip_prefix(base)?;
            let name: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(name.join("/"));
        }
    }
    Ok(())
}

impl ObjectStore for LocalStore {
    fn list(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let dir = self.bucket_dir(&bucket)?;
            if !dir.is_dir() {
                anyhow::bail!("Bucket not found in local store: {}", dir.display());
            }
            tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
                let mut names = Vec::new();
                walk(&dir, &dir, &mut names)?;
                Ok(names)
            })
            .await?
        })
    }

    fn read(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let path = self.resolve(&bucket, &name)?;
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(ObjectNotFound { bucket, name }.into())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn write(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&bucket, &name)?;
            let tmp_path = self.temp_path();

            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                // Ensure parent directory exists (handles names with '/' separators).
                if let Some(parent) = final_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                // Crash-only: temp-fsync-rename pattern.
                let mut file = std::fs::File::create(&tmp_path)?;
                file.write_all(&data)?;
                file.sync_all()?;
                std::fs::rename(&tmp_path, &final_path)?;
                Ok(())
            })
            .await?
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
