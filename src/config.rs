use std::path::PathBuf;

use crate::error::{Error, Result};

const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
const PEBBLE: &str = "https://localhost:14000/dir";
const MOCK: &str = "http://localhost:9829/directory";

/// Which ACME directory the client talks to.
///
/// `Pebble` and `Mock` point at local test servers; `Custom` exists so test
/// harnesses (and Pebble instances on non-default ports) can supply their own
/// directory URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEndpoint {
    Production,
    Staging,
    Pebble,
    Mock,
    Custom(String),
}

impl DirectoryEndpoint {
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Production => LETS_ENCRYPT_PRODUCTION,
            Self::Staging => LETS_ENCRYPT_STAGING,
            Self::Pebble => PEBBLE,
            Self::Mock => MOCK,
            Self::Custom(url) => url,
        }
    }

    /// Local test CAs present self-signed certificates; only the public
    /// Let's Encrypt endpoints get strict TLS verification.
    pub(crate) fn verify_tls(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// DNS names to include as subject alternative names. The first entry
    /// becomes the CSR common name.
    pub domains: Vec<String>,
    pub server: DirectoryEndpoint,
    /// Absolute directory holding the account key, certificate key and chain.
    pub settings_path: PathBuf,
    /// Optional contact addresses for the ACME account (`mailto:` is added
    /// where missing).
    pub contacts: Vec<String>,
}

impl Config {
    /// Checks the configuration before any network or disk activity.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if no domains are given, a domain is
    /// blank, or `settings_path` is not absolute.
    pub fn validate(&self) -> Result<()> {
        if self.domains.is_empty() {
            return Err(Error::Configuration(
                "at least one domain is required".to_string(),
            ));
        }
        if let Some(blank) = self.domains.iter().find(|d| d.trim().is_empty()) {
            return Err(Error::Configuration(format!(
                "domain entries must not be blank (got {blank:?})"
            )));
        }
        if !self.settings_path.is_absolute() {
            return Err(Error::Configuration(format!(
                "settings_path must be absolute, got {}",
                self.settings_path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            domains: vec!["example.com".to_string()],
            server: DirectoryEndpoint::Staging,
            settings_path: PathBuf::from("/var/lib/autocert"),
            contacts: Vec::new(),
        }
    }

    #[test]
    fn test_endpoint_urls() {
        assert_eq!(
            DirectoryEndpoint::Production.url(),
            "https://acme-v02.api.letsencrypt.org/directory"
        );
        assert_eq!(
            DirectoryEndpoint::Staging.url(),
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        );
        assert_eq!(
            DirectoryEndpoint::Pebble.url(),
            "https://localhost:14000/dir"
        );
        assert_eq!(
            DirectoryEndpoint::Mock.url(),
            "http://localhost:9829/directory"
        );
        let custom = DirectoryEndpoint::Custom("http://localhost:5002/dir".to_string());
        assert_eq!(custom.url(), "http://localhost:5002/dir");
    }

    #[test]
    fn test_only_public_endpoints_verify_tls() {
        assert!(DirectoryEndpoint::Production.verify_tls());
        assert!(DirectoryEndpoint::Staging.verify_tls());
        assert!(!DirectoryEndpoint::Pebble.verify_tls());
        assert!(!DirectoryEndpoint::Mock.verify_tls());
        assert!(!DirectoryEndpoint::Custom("http://x".to_string()).verify_tls());
    }

    #[test]
    fn test_validate_accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_domains() {
        let mut config = valid_config();
        config.domains.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one domain"));
    }

    #[test]
    fn test_validate_rejects_blank_domain() {
        let mut config = valid_config();
        config.domains.push("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_settings_path() {
        let mut config = valid_config();
        config.settings_path = PathBuf::from("relative/dir");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }
}
