use std::collections::HashMap;
use std::sync::Arc;

use poem::http::Method;
use poem::{Endpoint, IntoResponse, Middleware, Request, Response};
use tokio::sync::Mutex;
use tracing::debug;

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Shared map of challenge token to key authorization.
///
/// The order engine inserts a token just before signalling readiness and
/// removes it once the authorization attempt ends; the responder middleware
/// reads it while the ACME server probes port 80.
#[derive(Clone, Default)]
pub struct ChallengeTokens {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl ChallengeTokens {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: &str, key_authorization: &str) {
        self.inner
            .lock()
            .await
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub async fn remove(&self, token: &str) {
        self.inner.lock().await.remove(token);
    }

    pub async fn key_authorization(&self, token: &str) -> Option<String> {
        self.inner.lock().await.get(token).cloned()
    }
}

/// Poem middleware answering `GET /.well-known/acme-challenge/{token}` from
/// the token map and passing every other request through to the wrapped
/// endpoint. Mount it on the host's plaintext (port 80) listener.
#[derive(Clone)]
pub struct Http01Responder {
    tokens: ChallengeTokens,
}

impl Http01Responder {
    #[must_use]
    pub fn new(tokens: ChallengeTokens) -> Self {
        Self { tokens }
    }

    #[must_use]
    pub fn tokens(&self) -> &ChallengeTokens {
        &self.tokens
    }
}

impl<E: Endpoint> Middleware<E> for Http01Responder {
    type Output = Http01ResponderEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        Http01ResponderEndpoint {
            inner: ep,
            tokens: self.tokens.clone(),
        }
    }
}

pub struct Http01ResponderEndpoint<E> {
    inner: E,
    tokens: ChallengeTokens,
}

impl<E: Endpoint> Endpoint for Http01ResponderEndpoint<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        if req.method() == Method::GET {
            if let Some(token) = req.uri().path().strip_prefix(CHALLENGE_PATH_PREFIX) {
                if let Some(key_authorization) = self.tokens.key_authorization(token).await {
                    debug!("serving key authorization for challenge token {token}");
                    return Ok(Response::builder()
                        .content_type("text/plain; charset=utf-8")
                        .body(key_authorization));
                }
            }
        }
        self.inner.call(req).await.map(IntoResponse::into_response)
    }
}
