//! Local backup store.
//!
//! Before anything in the bucket is modified, the fetched bytes and the
//! proposed replacement are copied to a local directory.  These files are
//! the only rollback path; the tool never reads them back or deletes them.
//!
//! File names are derived from the object name with `/` flattened to `-`,
//! after `%` and `-` are percent-encoded so that distinct objects never
//! share a file.  The original copy keeps that name; the patched copy
//! appends `.fixed`.
//!
//! Writes go to a temp file, are fsynced, then published with a hard link so
//! an existing backup is never replaced.  If the name is taken by identical
//! bytes the write is a no-op; if it holds different bytes (a re-run that
//! fetched an already patched document) the new copy lands beside it under
//! `<name>.<first 12 hex digits of its SHA-256>`.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix appended to the backup of the patched document.
pub const PATCHED_SUFFIX: &str = ".fixed";

/// Characters escaped before `/` is flattened to `-`.
const NAME_ESCAPE: &AsciiSet = &CONTROLS.add(b'%').add(b'-');

/// Hex digits of the digest used to disambiguate a taken backup name.
const DIGEST_SUFFIX_LEN: usize = 12;

/// Which copy of a document a backup holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    /// Bytes as fetched from the bucket.
    Original,
    /// Bytes about to be written to the bucket.
    Patched,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Original => f.write_str("original"),
            BackupKind::Patched => f.write_str("patched"),
        }
    }
}

/// A backup that has been durably written.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    /// Where the copy lives.
    pub path: PathBuf,
    /// Original or patched.
    pub kind: BackupKind,
    /// Hex SHA-256 of the stored bytes.
    pub sha256: String,
}

/// Writes backup copies under a single directory.
pub struct BackupStore {
    dir: PathBuf,
    file_mode: u32,
}

impl BackupStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>, file_mode: u32) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, file_mode })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a backup of `object_name` would be written to.
    pub fn path_for(&self, object_name: &str, kind: BackupKind) -> PathBuf {
        self.dir.join(backup_file_name(object_name, kind))
    }

    /// Durably write `data` as the `kind` backup of `object_name`.
    ///
    /// Never replaces an existing file.  The returned record names the path
    /// that actually holds `data`.
    pub async fn write(
        &self,
        object_name: &str,
        kind: BackupKind,
        data: &[u8],
    ) -> anyhow::Result<BackupRecord> {
        let preferred = self.path_for(object_name, kind);
        let tmp_path = self.temp_path();
        let bytes = data.to_vec();
        let sha256 = hex::encode(Sha256::digest(data));
        let mode = self.file_mode;

        let digest = sha256.clone();
        let path = tokio::task::spawn_blocking(move || {
            write_no_clobber(&tmp_path, &preferred, &bytes, &digest, mode)
        })
        .await??;

        tracing::debug!(path = %path.display(), %kind, %sha256, "backup written");

        Ok(BackupRecord { path, kind, sha256 })
    }

    /// Temp file path inside the backup directory so the hard link stays on
    /// one filesystem.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.dir.join(format!(".tmp-{}", id))
    }
}

/// Flatten an object name into a single path component.
///
/// `%` and `-` are percent-encoded first, so every `-` in the result came
/// from a `/` and the mapping is one-to-one.
pub fn backup_file_name(object_name: &str, kind: BackupKind) -> String {
    let flat = utf8_percent_encode(object_name, NAME_ESCAPE)
        .to_string()
        .replace('/', "-");
    match kind {
        BackupKind::Original => flat,
        BackupKind::Patched => format!("{flat}{PATCHED_SUFFIX}"),
    }
}

/// Fallback path for a backup whose preferred name already holds other bytes.
fn digest_path(preferred: &Path, sha256: &str) -> PathBuf {
    let mut name = preferred.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(&sha256[..DIGEST_SUFFIX_LEN]);
    preferred.with_file_name(name)
}

fn write_no_clobber(
    tmp_path: &Path,
    preferred: &Path,
    data: &[u8],
    sha256: &str,
    mode: u32,
) -> anyhow::Result<PathBuf> {
    let result = (|| -> anyhow::Result<PathBuf> {
        let mut file = std::fs::File::create(tmp_path)?;
        file.write_all(data)?;
        set_mode(&file, mode)?;
        file.sync_all()?;

        if publish(tmp_path, preferred, sha256)? {
            return Ok(preferred.to_path_buf());
        }
        let fallback = digest_path(preferred, sha256);
        if publish(tmp_path, &fallback, sha256)? {
            tracing::info!(
                taken = %preferred.display(),
                path = %fallback.display(),
                "backup name holds different bytes, keeping both"
            );
            return Ok(fallback);
        }
        anyhow::bail!(
            "backups {} and {} both exist with different content",
            preferred.display(),
            fallback.display()
        )
    })();
    // Published or not, the temp name is no longer needed.
    let _ = std::fs::remove_file(tmp_path);
    result
}

/// Link `tmp_path` to `target` unless `target` exists.  Returns whether
/// `target` now holds bytes with digest `sha256`.
fn publish(tmp_path: &Path, target: &Path, sha256: &str) -> anyhow::Result<bool> {
    match std::fs::hard_link(tmp_path, target) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let existing = std::fs::read(target)?;
            Ok(hex::encode(Sha256::digest(&existing)) == sha256)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn set_mode(file: &std::fs::File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &std::fs::File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────
