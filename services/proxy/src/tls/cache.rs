//! On-disk certificate cache.
//!
//! Two files per identity under the cache directory:
//! - `<identity>.crt`: PEM chain, mode 0644
//! - `<identity>.key`: PEM private key, mode 0600
//!
//! Writes go to a temp file first and are renamed into place, so a reader
//! never sees a half-written file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::entry::CertificateEntry;
use crate::error::CertificateError;

const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Certificate files for one cache directory.
#[derive(Debug, Clone)]
pub struct CertificateCache {
    dir: PathBuf,
}

impl CertificateCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{identity}.crt"))
    }

    pub fn key_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{identity}.key"))
    }

    /// Load the cached entry for `identity`.
    ///
    /// Returns `Ok(None)` when either file is missing.
    pub fn load(&self, identity: &str) -> Result<Option<CertificateEntry>, CertificateError> {
        let cert_path = self.cert_path(identity);
        let key_path = self.key_path(identity);

        if !cert_path.exists() || !key_path.exists() {
            debug!(dir = %self.dir.display(), identity = %identity, "No cached certificate");
            return Ok(None);
        }

        let cert_pem = read_file(&cert_path)?;
        let key_pem = read_file(&key_path)?;
        let entry = CertificateEntry::from_pem(identity, cert_pem, key_pem, &cert_path)?;

        info!(
            path = %cert_path.display(),
            serial = %entry.serial,
            not_after = %entry.not_after,
            "Loaded cached certificate"
        );

        Ok(Some(entry))
    }

    /// Persist `entry` atomically.
    pub fn store(&self, entry: &CertificateEntry) -> Result<(), CertificateError> {
        create_dir(&self.dir)?;

        let key_path = self.key_path(&entry.identity);
        write_atomic(&key_path, entry.key_pem.as_bytes(), KEY_MODE)?;

        let cert_path = self.cert_path(&entry.identity);
        write_atomic(&cert_path, entry.cert_pem.as_bytes(), CERT_MODE)?;

        debug!(
            path = %cert_path.display(),
            serial = %entry.serial,
            "Saved certificate to cache"
        );

        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String, CertificateError> {
    fs::read_to_string(path).map_err(|e| CertificateError::LoadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn create_dir(dir: &Path) -> Result<(), CertificateError> {
    let persist_failed = |e: io::Error| CertificateError::PersistFailed {
        path: dir.to_path_buf(),
        reason: format!("failed to create directory: {e}"),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(dir)
            .map_err(persist_failed)
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(persist_failed)
    }
}

fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), CertificateError> {
    let persist_failed = |target: &Path, e: io::Error| CertificateError::PersistFailed {
        path: target.to_path_buf(),
        reason: e.to_string(),
    };

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);
    write_with_mode(&tmp_path, contents, mode).map_err(|e| persist_failed(&tmp_path, e))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        persist_failed(path, e)
    })
}

#[cfg(unix)]
fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    // `mode` only applies on creation.
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_with_mode(path: &Path, contents: &[u8], _mode: u32) -> io::Result<()> {
    fs::write(path, contents)
}
