use std::io::ErrorKind;
use std::path::Path;

use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fs_util;
use crate::jose::{self, Jwk};

const KEY_BITS: usize = 2048;

/// An RSA-2048 keypair plus its derived JOSE material.
///
/// Two of these exist per client: the long-lived account identity (persisted
/// once, reused across renewals) and the per-renewal certificate identity
/// used inside the CSR.
#[derive(Debug)]
pub struct Identity {
    key: RsaPrivateKey,
    pem: String,
    jwk: Jwk,
    thumbprint: String,
}

impl Identity {
    /// Loads the keypair at `path`, generating and persisting a fresh one
    /// (mode 0600) if the file does not exist.
    ///
    /// # Errors
    /// Returns [`Error::IdentityIo`] if the path cannot be read or written
    /// and [`Error::IdentityParse`] if the file is not a PEM RSA key.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(pem) => {
                debug!("loaded identity key from {}", path.display());
                Self::from_pem(pem).map_err(|reason| Error::IdentityParse {
                    path: path.to_path_buf(),
                    reason,
                })
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let identity = Self::generate().await?;
                fs_util::write_private(path, identity.pem.as_bytes())
                    .await
                    .map_err(|source| Error::IdentityIo {
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!("generated new RSA-{KEY_BITS} identity key at {}", path.display());
                Ok(identity)
            }
            Err(source) => Err(Error::IdentityIo {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Generates a fresh RSA-2048 keypair off the async runtime.
    ///
    /// # Errors
    /// Returns [`Error::Crypto`] if key generation fails.
    pub async fn generate() -> Result<Self> {
        let key = tokio::task::spawn_blocking(|| {
            let mut rng = rand::thread_rng();
            RsaPrivateKey::new(&mut rng, KEY_BITS)
        })
        .await
        .map_err(|err| Error::Crypto(format!("key generation task failed: {err}")))?
        .map_err(|err| Error::Crypto(format!("RSA key generation failed: {err}")))?;

        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| Error::Crypto(format!("cannot encode key as PEM: {err}")))?
            .to_string();
        Self::from_parts(key, pem)
    }

    /// Parses a PKCS#8 (or legacy PKCS#1) PEM private key. The original PEM
    /// text is kept verbatim so re-serializing a loaded identity is lossless.
    pub(crate) fn from_pem(pem: String) -> std::result::Result<Self, String> {
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|err| format!("not an RSA private key: {err}"))?;
        Self::from_parts(key, pem).map_err(|err| err.to_string())
    }

    fn from_parts(key: RsaPrivateKey, pem: String) -> Result<Self> {
        let public = key.to_public_key();
        let jwk = Jwk::rsa(&public.n().to_bytes_be(), &public.e().to_bytes_be());
        let thumbprint = jose::thumbprint(&jwk)?;
        Ok(Self {
            key,
            pem,
            jwk,
            thumbprint,
        })
    }

    #[must_use]
    pub fn pem(&self) -> &str {
        &self.pem
    }

    #[must_use]
    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// RFC 7638 thumbprint of the public JWK, base64url without padding.
    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// `token || "." || thumbprint`, the body served for an HTTP-01 challenge.
    #[must_use]
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint)
    }

    /// Signs `message` with RS256 (PKCS#1 v1.5 over SHA-256).
    ///
    /// # Errors
    /// Returns [`Error::Crypto`] if signing fails.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signer = SigningKey::<Sha256>::new(self.key.clone());
        let signature = signer
            .try_sign(message)
            .map_err(|err| Error::Crypto(format!("RS256 signing failed: {err}")))?;
        Ok(signature.to_vec())
    }
}
