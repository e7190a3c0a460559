use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fs_util;

pub(crate) const ACCOUNT_KEY_FILE: &str = "account-identity.pem";
pub(crate) const CERTIFICATE_KEY_FILE: &str = "certificate-identity.pem";
pub(crate) const CERTIFICATE_FILE: &str = "certificate.pem";
const OLD_SUFFIX: &str = ".old";

/// The persisted pair: chain plus the matching certificate key.
pub(crate) struct StoredCertificate {
    pub chain_pem: String,
    pub key_pem: String,
}

/// What startup recovery found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// Current pair present, no leftovers.
    SteadyState,
    /// Nothing on disk yet; first issuance pending.
    ColdStart,
    /// A renewal finished but its cleanup crashed; stale backups deleted.
    RemovedStaleBackups,
    /// A renewal crashed mid-swap; the previous pair was put back.
    RestoredPreviousCertificate,
}

/// On-disk home of the certificate chain and keys, plus the atomic renewal
/// protocol and its crash recovery.
///
/// Renewal writes in a fixed order (rename current pair to `.old`, write the
/// new pair, delete `.old`) so that any crash leaves a state
/// [`Self::recover`] can classify.
pub(crate) struct CertificateStore {
    dir: PathBuf,
    /// Serializes installs: interleaved writers could pair one renewal's
    /// chain with another renewal's key.
    write_lock: Mutex<()>,
}

impl CertificateStore {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn account_key_path(&self) -> PathBuf {
        self.dir.join(ACCOUNT_KEY_FILE)
    }

    fn chain_path(&self) -> PathBuf {
        self.dir.join(CERTIFICATE_FILE)
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(CERTIFICATE_KEY_FILE)
    }

    fn old_chain_path(&self) -> PathBuf {
        self.dir.join(format!("{CERTIFICATE_FILE}{OLD_SUFFIX}"))
    }

    fn old_key_path(&self) -> PathBuf {
        self.dir.join(format!("{CERTIFICATE_KEY_FILE}{OLD_SUFFIX}"))
    }

    /// Classifies the on-disk state and repairs any interrupted renewal.
    /// Must run before the store is read.
    ///
    /// # Errors
    /// Returns [`Error::CertificateStateCorrupted`] for combinations the
    /// renewal protocol cannot produce, [`Error::StorageIo`] when the
    /// repair itself fails.
    pub(crate) async fn recover(&self) -> Result<Recovery> {
        let chain = self.exists(&self.chain_path()).await?;
        let key = self.exists(&self.key_path()).await?;
        let old_chain = self.exists(&self.old_chain_path()).await?;
        let old_key = self.exists(&self.old_key_path()).await?;

        match (chain, key) {
            (true, true) => {
                if old_chain || old_key {
                    // Renewal completed; only the backup cleanup was lost.
                    warn!("removing stale certificate backups left by an interrupted renewal");
                    self.remove_if_exists(&self.old_chain_path()).await?;
                    self.remove_if_exists(&self.old_key_path()).await?;
                    Ok(Recovery::RemovedStaleBackups)
                } else {
                    Ok(Recovery::SteadyState)
                }
            }
            (false, false) => {
                if old_chain && old_key {
                    // Crash after the current pair was set aside and before
                    // anything new was written.
                    warn!("restoring certificate pair from an interrupted renewal");
                    self.rename(&self.old_chain_path(), &self.chain_path()).await?;
                    self.rename(&self.old_key_path(), &self.key_path()).await?;
                    Ok(Recovery::RestoredPreviousCertificate)
                } else if !old_chain && !old_key {
                    debug!("no certificate on disk yet");
                    Ok(Recovery::ColdStart)
                } else {
                    Err(self.corrupted(chain, key, old_chain, old_key))
                }
            }
            (true, false) => {
                if old_chain && old_key {
                    // The new chain landed but its key never did: drop the
                    // half-written chain and fall back to the old pair.
                    warn!("discarding partially renewed chain; restoring previous pair");
                    self.remove_if_exists(&self.chain_path()).await?;
                    self.rename(&self.old_chain_path(), &self.chain_path()).await?;
                    self.rename(&self.old_key_path(), &self.key_path()).await?;
                    Ok(Recovery::RestoredPreviousCertificate)
                } else if old_key {
                    // Crash between the two set-aside renames: the chain on
                    // disk is still the previous one.
                    warn!("restoring certificate key from an interrupted renewal");
                    self.rename(&self.old_key_path(), &self.key_path()).await?;
                    Ok(Recovery::RestoredPreviousCertificate)
                } else {
                    Err(self.corrupted(chain, key, old_chain, old_key))
                }
            }
            (false, true) => {
                if old_chain && old_key {
                    warn!("discarding partially renewed key; restoring previous pair");
                    self.remove_if_exists(&self.key_path()).await?;
                    self.rename(&self.old_chain_path(), &self.chain_path()).await?;
                    self.rename(&self.old_key_path(), &self.key_path()).await?;
                    Ok(Recovery::RestoredPreviousCertificate)
                } else if old_chain {
                    warn!("restoring certificate chain from an interrupted renewal");
                    self.rename(&self.old_chain_path(), &self.chain_path()).await?;
                    Ok(Recovery::RestoredPreviousCertificate)
                } else {
                    Err(self.corrupted(chain, key, old_chain, old_key))
                }
            }
        }
    }

    /// Reads the current pair, or `None` on a cold start.
    ///
    /// # Errors
    /// Returns [`Error::StorageIo`] on read failure and
    /// [`Error::CertificateStateCorrupted`] if exactly one of the two files
    /// exists (recovery would have repaired any legal state).
    pub(crate) async fn load(&self) -> Result<Option<StoredCertificate>> {
        let chain = self.read_optional(&self.chain_path()).await?;
        let key = self.read_optional(&self.key_path()).await?;
        match (chain, key) {
            (Some(chain_pem), Some(key_pem)) => Ok(Some(StoredCertificate { chain_pem, key_pem })),
            (None, None) => Ok(None),
            (chain, key) => Err(self.corrupted(chain.is_some(), key.is_some(), false, false)),
        }
    }

    /// Atomically replaces the stored pair with a freshly issued one.
    ///
    /// Write order matters for [`Self::recover`]: set the current pair
    /// aside, write the new chain then the new key (both fsynced), then drop
    /// the backups.
    ///
    /// # Errors
    /// Returns [`Error::StorageIo`] if any step fails; the disk is left in a
    /// state the next [`Self::recover`] run repairs.
    pub(crate) async fn install(&self, chain_pem: &str, key_pem: &str) -> Result<()> {
        let _writer = self.write_lock.lock().await;

        if self.exists(&self.chain_path()).await? {
            self.rename(&self.chain_path(), &self.old_chain_path()).await?;
        }
        if self.exists(&self.key_path()).await? {
            self.rename(&self.key_path(), &self.old_key_path()).await?;
        }

        fs_util::write_public(&self.chain_path(), chain_pem.as_bytes())
            .await
            .map_err(|source| self.storage_io(self.chain_path(), source))?;
        fs_util::write_private(&self.key_path(), key_pem.as_bytes())
            .await
            .map_err(|source| self.storage_io(self.key_path(), source))?;

        self.remove_if_exists(&self.old_chain_path()).await?;
        self.remove_if_exists(&self.old_key_path()).await?;
        info!("certificate pair installed under {}", self.dir.display());
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path)
            .await
            .map_err(|source| self.storage_io(path.to_path_buf(), source))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)
            .await
            .map_err(|source| self.storage_io(from.to_path_buf(), source))
    }

    async fn remove_if_exists(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.storage_io(path.to_path_buf(), source)),
        }
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.storage_io(path.to_path_buf(), source)),
        }
    }

    fn storage_io(&self, path: PathBuf, source: std::io::Error) -> Error {
        Error::StorageIo { path, source }
    }

    fn corrupted(&self, chain: bool, key: bool, old_chain: bool, old_key: bool) -> Error {
        let describe = |present| if present { "present" } else { "missing" };
        Error::CertificateStateCorrupted {
            dir: self.dir.clone(),
            detail: format!(
                "{CERTIFICATE_FILE} {}, {CERTIFICATE_KEY_FILE} {}, \
                 {CERTIFICATE_FILE}{OLD_SUFFIX} {}, {CERTIFICATE_KEY_FILE}{OLD_SUFFIX} {}",
                describe(chain),
                describe(key),
                describe(old_chain),
                describe(old_key),
            ),
        }
    }
}
