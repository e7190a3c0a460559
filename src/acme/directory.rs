use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// The ACME directory document: one URL per protocol operation.
///
/// Fetched once per client and immutable afterwards. `revoke_cert` and
/// `key_change` are part of the document but unused by this crate.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: Option<String>,
    #[serde(default)]
    pub key_change: Option<String>,
}

impl Directory {
    /// Fetches and parses the directory document at `url`.
    ///
    /// # Errors
    /// Returns [`Error::DirectoryFetch`] if the server is unreachable,
    /// responds with a non-success status, or returns malformed JSON.
    pub(crate) async fn fetch(http: &reqwest::Client, url: &str) -> Result<Self> {
        debug!("fetching ACME directory from {url}");
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|err| Error::DirectoryFetch {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::DirectoryFetch {
                url: url.to_string(),
                reason: format!("unexpected status {status}"),
            });
        }

        let directory: Directory =
            response
                .json()
                .await
                .map_err(|err| Error::DirectoryFetch {
                    url: url.to_string(),
                    reason: format!("invalid directory document: {err}"),
                })?;
        info!("ACME directory loaded from {url}");
        Ok(directory)
    }
}
