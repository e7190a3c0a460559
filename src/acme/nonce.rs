use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) const HEADER_REPLAY_NONCE: &str = "replay-nonce";
const NEW_NONCE_TIMEOUT: Duration = Duration::from_secs(10);

/// FIFO pool of replay nonces.
///
/// Every ACME response donates its `Replay-Nonce` header back to the pool;
/// each signed request consumes exactly one. The queue lock is held across
/// the fallback `newNonce` HEAD request, so concurrent takers on an empty
/// pool line up behind a single in-flight fetch.
pub(crate) struct NoncePool {
    queue: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Pops the oldest pooled nonce, fetching a fresh one from
    /// `new_nonce_url` when the pool is empty.
    ///
    /// # Errors
    /// Returns [`Error::Nonce`] if the `newNonce` request fails or its
    /// response has no `Replay-Nonce` header.
    pub(crate) async fn take(&self, http: &reqwest::Client, new_nonce_url: &str) -> Result<String> {
        let mut queue = self.queue.lock().await;
        if let Some(nonce) = queue.pop_front() {
            return Ok(nonce);
        }

        debug!("nonce pool empty, fetching from {new_nonce_url}");
        let response = http
            .head(new_nonce_url)
            .timeout(NEW_NONCE_TIMEOUT)
            .send()
            .await
            .map_err(|err| Error::Nonce(format!("newNonce request failed: {err}")))?;
        extract(response.headers()).ok_or_else(|| {
            Error::Nonce("newNonce response is missing the Replay-Nonce header".to_string())
        })
    }

    pub(crate) async fn put(&self, nonce: String) {
        self.queue.lock().await.push_back(nonce);
    }
}

/// Pulls the `Replay-Nonce` value out of a response header map.
pub(crate) fn extract(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(HEADER_REPLAY_NONCE)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}
