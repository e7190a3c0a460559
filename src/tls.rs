use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use x509_parser::extensions::GeneralName;

use crate::error::{Error, Result};

/// How long before `notAfter` a certificate is considered due for renewal.
const RENEW_BEFORE: time::Duration = time::Duration::days(30);

/// A parsed certificate chain plus its private key.
///
/// Replaced wholesale on renewal; consumers hold an `Arc` snapshot obtained
/// through the facade.
#[derive(Debug)]
pub struct CertificateBundle {
    chain_pem: String,
    key_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    serial: String,
    sans: Vec<String>,
}

impl CertificateBundle {
    /// Parses a leaf-first PEM chain and its matching key PEM.
    ///
    /// # Errors
    /// Returns [`Error::Crypto`] if the leaf certificate cannot be parsed.
    pub(crate) fn from_pem(chain_pem: String, key_pem: String) -> Result<Self> {
        let pem = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes())
            .map_err(|err| Error::Crypto(format!("cannot parse certificate PEM: {err}")))?
            .1;
        let (_, leaf) = x509_parser::parse_x509_certificate(&pem.contents)
            .map_err(|err| Error::Crypto(format!("cannot parse leaf certificate: {err}")))?;

        let not_before = leaf.validity().not_before.to_datetime();
        let not_after = leaf.validity().not_after.to_datetime();
        let serial = leaf.raw_serial_as_string();

        let mut sans = Vec::new();
        let san_extension = leaf
            .subject_alternative_name()
            .map_err(|err| Error::Crypto(format!("cannot read subject alternative names: {err}")))?;
        if let Some(extension) = san_extension {
            for name in &extension.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    sans.push((*dns).to_string());
                }
            }
        }

        Ok(Self {
            chain_pem,
            key_pem,
            not_before,
            not_after,
            serial,
            sans,
        })
    }

    #[must_use]
    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    #[must_use]
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    #[must_use]
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Leaf serial number, colon-separated hex.
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// DNS subject alternative names of the leaf.
    #[must_use]
    pub fn sans(&self) -> &[String] {
        &self.sans
    }

    /// When the renewal scheduler should replace this certificate.
    #[must_use]
    pub fn renew_at(&self) -> OffsetDateTime {
        self.not_after - RENEW_BEFORE
    }

    /// True if every configured domain appears among the SANs.
    #[must_use]
    pub fn covers(&self, domains: &[String]) -> bool {
        domains.iter().all(|domain| {
            self.sans
                .iter()
                .any(|san| san.eq_ignore_ascii_case(domain))
        })
    }

    /// Converts the PEM pair into the rustls form served to clients.
    ///
    /// # Errors
    /// Returns [`Error::Crypto`] if the chain or key cannot be decoded.
    pub(crate) fn certified_key(&self) -> Result<CertifiedKey> {
        let certs = rustls_pemfile::certs(&mut self.chain_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| Error::Crypto(format!("invalid certificate chain PEM: {err}")))?;
        if certs.is_empty() {
            return Err(Error::Crypto(
                "certificate chain PEM contains no certificates".to_string(),
            ));
        }

        let key = rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|err| Error::Crypto(format!("invalid private key PEM: {err}")))?
            .ok_or_else(|| Error::Crypto("no private key found in PEM".to_string()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|err| Error::Crypto(format!("unsupported private key: {err}")))?;

        Ok(CertifiedKey::new(certs, signing_key))
    }
}

/// Certificate resolver backed by an atomically swappable certified key.
///
/// The `ServerConfig` handed to the host references this resolver, so
/// rotating the key makes every subsequent handshake use the new
/// certificate without rebuilding the config.
pub(crate) struct CertResolver {
    current: ArcSwap<CertifiedKey>,
}

impl CertResolver {
    pub(crate) fn new(initial: CertifiedKey) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub(crate) fn swap(&self, replacement: CertifiedKey) {
        self.current.store(Arc::new(replacement));
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load_full())
    }
}

/// Builds the long-lived server configuration around `resolver`.
///
/// # Errors
/// Returns [`Error::Crypto`] if the rustls builder rejects the protocol
/// versions (which the defaults never do).
pub(crate) fn build_server_config(resolver: Arc<CertResolver>) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::Crypto(format!("cannot build TLS config: {err}")))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(sans: &[&str]) -> (String, String) {
        let mut params = rcgen::CertificateParams::new(
            sans.iter().map(ToString::to_string).collect::<Vec<_>>(),
        )
        .unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, sans[0]);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_bundle_parses_sans_serial_and_validity() {
        let (chain_pem, key_pem) = self_signed(&["localhost", "pebble"]);
        let bundle = CertificateBundle::from_pem(chain_pem, key_pem).unwrap();

        assert_eq!(bundle.sans(), ["localhost", "pebble"]);
        assert!(!bundle.serial().is_empty());
        let now = OffsetDateTime::now_utc();
        assert!(bundle.not_before() <= now);
        assert!(bundle.not_after() > now);
        assert_eq!(bundle.renew_at(), bundle.not_after() - RENEW_BEFORE);
    }

    #[test]
    fn test_bundle_covers_configured_domains() {
        let (chain_pem, key_pem) = self_signed(&["localhost", "pebble"]);
        let bundle = CertificateBundle::from_pem(chain_pem, key_pem).unwrap();

        assert!(bundle.covers(&["localhost".to_string()]));
        assert!(bundle.covers(&["Pebble".to_string(), "localhost".to_string()]));
        assert!(!bundle.covers(&["other.example".to_string()]));
    }

    #[test]
    fn test_bundle_rejects_garbage_chain() {
        let err =
            CertificateBundle::from_pem("not a pem".to_string(), "not a key".to_string())
                .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn test_certified_key_and_server_config_round_trip() {
        let (chain_pem, key_pem) = self_signed(&["localhost"]);
        let bundle = CertificateBundle::from_pem(chain_pem, key_pem).unwrap();

        let certified = bundle.certified_key().unwrap();
        assert_eq!(certified.cert.len(), 1);

        let resolver = Arc::new(CertResolver::new(certified));
        let config = build_server_config(resolver.clone()).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );

        // A swap replaces what the resolver serves.
        let (other_chain, other_key) = self_signed(&["replacement.example"]);
        let other = CertificateBundle::from_pem(other_chain, other_key).unwrap();
        resolver.swap(other.certified_key().unwrap());
        assert_eq!(resolver.current.load().cert.len(), 1);
    }
}
