use std::path::PathBuf;

use thiserror::Error;

use crate::acme::types::Problem;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between "give me a TLS config" and a live,
/// renewing certificate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot access identity key at {path}: {source}")]
    IdentityIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed identity key at {path}: {reason}")]
    IdentityParse { path: PathBuf, reason: String },

    #[error("failed to fetch ACME directory from {url}: {reason}")]
    DirectoryFetch { url: String, reason: String },

    #[error("failed to obtain a replay nonce: {0}")]
    Nonce(String),

    #[error("ACME request to {url} failed: {problem}")]
    AcmeRequest { url: String, problem: Problem },

    #[error("certificate order failed: {0}")]
    OrderFailed(String),

    #[error("gave up waiting for {phase} after {seconds}s")]
    OrderTimeout { phase: &'static str, seconds: u64 },

    #[error("cannot read or write {path}: {source}")]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate state under {dir} is corrupted ({detail}); manual cleanup required")]
    CertificateStateCorrupted { dir: PathBuf, detail: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("local crypto operation failed: {0}")]
    Crypto(String),
}
