use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::acme::directory::Directory;
use crate::acme::nonce::{self, NoncePool};
use crate::acme::types::{
    Authorization, FinalizeRequest, Identifier, NewAccountRequest, NewOrderRequest, Order, Problem,
};
use crate::config::DirectoryEndpoint;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::jose::{self, ALG_RS256, ProtectedHeader};

const CONTENT_TYPE_JOSE_JSON: &str = "application/jose+json";
const USER_AGENT: &str = concat!("autocert/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a request goes: a directory-resolved operation or a URL the server
/// handed us earlier (order, authorization, challenge, certificate).
#[derive(Debug, Clone, Copy)]
pub(crate) enum RequestUrl<'a> {
    NewAccount,
    NewOrder,
    Explicit(&'a str),
}

/// The JWS payload. `PostAsGet` is the empty string mandated by RFC 8555
/// for reads; `EmptyObject` is the `{}` used to signal challenge readiness.
#[derive(Debug)]
pub(crate) enum RequestPayload {
    PostAsGet,
    EmptyObject,
    Json(serde_json::Value),
}

/// A single ACME operation, described as data and run through [`AcmeClient::execute`].
#[derive(Debug)]
pub(crate) struct AcmeRequest<'a> {
    pub url: RequestUrl<'a>,
    pub payload: RequestPayload,
    /// `false` only for `newAccount`, which authenticates with the bare JWK.
    pub use_kid: bool,
    pub expected: &'a [StatusCode],
}

pub(crate) struct AcmeResponse {
    pub url: String,
    pub status: StatusCode,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl AcmeResponse {
    /// Decodes the response body as JSON.
    ///
    /// # Errors
    /// Returns [`Error::AcmeRequest`] if the body does not match `T`.
    pub(crate) fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|err| Error::AcmeRequest {
            url: self.url.clone(),
            problem: Problem::transport(format!("invalid response body: {err}")),
        })
    }
}

/// The signed-request engine plus the account state it authenticates with.
///
/// Owns the HTTP client, the cached directory, the nonce pool and the
/// account identity; order logic lives in [`crate::acme::order`].
pub(crate) struct AcmeClient {
    http: reqwest::Client,
    directory_url: String,
    directory: tokio::sync::OnceCell<Directory>,
    nonces: NoncePool,
    identity: Arc<Identity>,
    kid: RwLock<Option<String>>,
}

impl AcmeClient {
    /// Builds a client for `endpoint` authenticating with `identity`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the HTTP client cannot be built.
    pub(crate) fn new(endpoint: &DirectoryEndpoint, identity: Arc<Identity>) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US"));

        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .default_headers(default_headers);
        if !endpoint.verify_tls() {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|err| Error::Configuration(format!("cannot build HTTP client: {err}")))?;

        Ok(Self {
            http,
            directory_url: endpoint.url().to_string(),
            directory: tokio::sync::OnceCell::new(),
            nonces: NoncePool::new(),
            identity,
            kid: RwLock::new(None),
        })
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }

    pub(crate) fn kid(&self) -> Option<String> {
        self.kid.read().expect("kid lock poisoned").clone()
    }

    async fn directory(&self) -> Result<&Directory> {
        self.directory
            .get_or_try_init(|| Directory::fetch(&self.http, &self.directory_url))
            .await
    }

    /// Signs and sends one ACME request, retrying exactly once on `badNonce`.
    ///
    /// The `Replay-Nonce` of every response, success or failure, is fed back
    /// into the pool before the status is even looked at.
    ///
    /// # Errors
    /// Returns [`Error::AcmeRequest`] carrying the server's problem document
    /// when the response status is not in `expected`.
    pub(crate) async fn execute(&self, request: AcmeRequest<'_>) -> Result<AcmeResponse> {
        let directory = self.directory().await?;
        let url = match request.url {
            RequestUrl::NewAccount => directory.new_account.clone(),
            RequestUrl::NewOrder => directory.new_order.clone(),
            RequestUrl::Explicit(explicit) => explicit.to_string(),
        };

        let payload_b64 = match &request.payload {
            RequestPayload::PostAsGet => String::new(),
            RequestPayload::EmptyObject => jose::b64(b"{}"),
            RequestPayload::Json(value) => {
                let bytes = serde_json::to_vec(value)
                    .map_err(|err| Error::Crypto(format!("cannot encode payload: {err}")))?;
                jose::b64(&bytes)
            }
        };

        let kid = if request.use_kid {
            Some(self.kid().ok_or_else(|| {
                Error::OrderFailed("account is not registered yet (no kid)".to_string())
            })?)
        } else {
            None
        };

        let mut retried_bad_nonce = false;
        loop {
            let nonce = self.nonces.take(&self.http, &directory.new_nonce).await?;
            let protected = ProtectedHeader {
                alg: ALG_RS256,
                nonce,
                url: &url,
                jwk: if request.use_kid {
                    None
                } else {
                    Some(self.identity.jwk())
                },
                kid: kid.as_deref(),
            };
            let protected_b64 = jose::b64(
                &serde_json::to_vec(&protected)
                    .map_err(|err| Error::Crypto(format!("cannot encode JWS header: {err}")))?,
            );
            let signing_input = format!("{protected_b64}.{payload_b64}");
            let signature = self.identity.sign(signing_input.as_bytes())?;

            let body = serde_json::json!({
                "protected": protected_b64,
                "payload": payload_b64,
                "signature": jose::b64(&signature),
            });

            debug!("POST {url}");
            let response = self
                .http
                .post(&url)
                .header(CONTENT_TYPE, CONTENT_TYPE_JOSE_JSON)
                .body(body.to_string())
                .send()
                .await
                .map_err(|err| Error::AcmeRequest {
                    url: url.clone(),
                    problem: Problem::transport(err),
                })?;

            if let Some(fresh) = nonce::extract(response.headers()) {
                self.nonces.put(fresh).await;
            }

            let status = response.status();
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string);
            let bytes = response
                .bytes()
                .await
                .map_err(|err| Error::AcmeRequest {
                    url: url.clone(),
                    problem: Problem::transport(err),
                })?
                .to_vec();

            if request.expected.contains(&status) {
                return Ok(AcmeResponse {
                    url,
                    status,
                    location,
                    body: bytes,
                });
            }

            let problem: Problem =
                serde_json::from_slice(&bytes).unwrap_or_else(|_| Problem::from_status(status));
            if status == StatusCode::BAD_REQUEST && problem.is_bad_nonce() && !retried_bad_nonce {
                warn!("server rejected the nonce, retrying once against {url}");
                retried_bad_nonce = true;
                continue;
            }
            return Err(Error::AcmeRequest { url, problem });
        }
    }

    /// Registers (or recovers) the ACME account and caches its `kid`.
    ///
    /// # Errors
    /// Returns [`Error::AcmeRequest`] if the server rejects the registration
    /// or [`Error::OrderFailed`] if the response carries no `Location`.
    pub(crate) async fn register_account(&self, contacts: &[String]) -> Result<String> {
        let payload = NewAccountRequest {
            terms_of_service_agreed: true,
            contact: contacts.iter().map(|c| contact_from_email(c)).collect(),
            only_return_existing: false,
        };
        let response = self
            .execute(AcmeRequest {
                url: RequestUrl::NewAccount,
                payload: RequestPayload::Json(
                    serde_json::to_value(&payload)
                        .map_err(|err| Error::Crypto(format!("cannot encode payload: {err}")))?,
                ),
                use_kid: false,
                expected: &[StatusCode::OK, StatusCode::CREATED],
            })
            .await?;

        let kid = response.location.ok_or_else(|| {
            Error::OrderFailed("newAccount response is missing the Location header".to_string())
        })?;
        if response.status == StatusCode::OK {
            debug!("account already existed on the server");
        }
        info!("ACME account registered: {kid}");
        *self.kid.write().expect("kid lock poisoned") = Some(kid.clone());
        Ok(kid)
    }

    /// Returns the cached account `kid`, registering first if necessary.
    pub(crate) async fn ensure_account(&self, contacts: &[String]) -> Result<String> {
        if let Some(kid) = self.kid() {
            return Ok(kid);
        }
        self.register_account(contacts).await
    }

    /// Creates an order for `domains` and records its `Location` URL.
    ///
    /// # Errors
    /// Returns [`Error::AcmeRequest`] on server rejection.
    pub(crate) async fn new_order(&self, domains: &[String]) -> Result<Order> {
        let payload = NewOrderRequest {
            identifiers: domains.iter().map(|d| Identifier::dns(d)).collect(),
        };
        let response = self
            .execute(AcmeRequest {
                url: RequestUrl::NewOrder,
                payload: RequestPayload::Json(
                    serde_json::to_value(&payload)
                        .map_err(|err| Error::Crypto(format!("cannot encode payload: {err}")))?,
                ),
                use_kid: true,
                expected: &[StatusCode::CREATED],
            })
            .await?;

        let mut order: Order = response.json()?;
        order.url = response.location;
        info!("order created for {domains:?} (status {:?})", order.status);
        Ok(order)
    }

    pub(crate) async fn fetch_order(&self, url: &str) -> Result<Order> {
        let response = self.post_as_get(url).await?;
        let mut order: Order = response.json()?;
        order.url = Some(url.to_string());
        Ok(order)
    }

    pub(crate) async fn fetch_authorization(&self, url: &str) -> Result<Authorization> {
        self.post_as_get(url).await?.json()
    }

    /// Tells the server the challenge is ready to be validated.
    pub(crate) async fn trigger_challenge(&self, url: &str) -> Result<()> {
        debug!("signalling challenge readiness at {url}");
        self.execute(AcmeRequest {
            url: RequestUrl::Explicit(url),
            payload: RequestPayload::EmptyObject,
            use_kid: true,
            expected: &[StatusCode::OK],
        })
        .await?;
        Ok(())
    }

    /// Submits the DER CSR to the order's finalize URL.
    pub(crate) async fn finalize_order(&self, url: &str, csr_der: &[u8]) -> Result<Order> {
        let payload = FinalizeRequest {
            csr: jose::b64(csr_der),
        };
        let response = self
            .execute(AcmeRequest {
                url: RequestUrl::Explicit(url),
                payload: RequestPayload::Json(
                    serde_json::to_value(&payload)
                        .map_err(|err| Error::Crypto(format!("cannot encode payload: {err}")))?,
                ),
                use_kid: true,
                expected: &[StatusCode::OK],
            })
            .await?;
        response.json()
    }

    /// Downloads the issued certificate chain. The body is PEM, not JSON.
    pub(crate) async fn download_certificate(&self, url: &str) -> Result<String> {
        let response = self.post_as_get(url).await?;
        String::from_utf8(response.body).map_err(|err| Error::AcmeRequest {
            url: url.to_string(),
            problem: Problem::transport(format!("certificate body is not UTF-8: {err}")),
        })
    }

    async fn post_as_get(&self, url: &str) -> Result<AcmeResponse> {
        self.execute(AcmeRequest {
            url: RequestUrl::Explicit(url),
            payload: RequestPayload::PostAsGet,
            use_kid: true,
            expected: &[StatusCode::OK],
        })
        .await
    }
}

fn contact_from_email(email: &str) -> String {
    if email.starts_with("mailto:") {
        email.to_string()
    } else {
        format!("mailto:{email}")
    }
}
