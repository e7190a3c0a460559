use std::fmt;

use serde::{Deserialize, Serialize};

pub(crate) const ERROR_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub(crate) fn dns(value: &str) -> Self {
        Self {
            kind: "dns".to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
    /// From the `Location` header, not the body.
    #[serde(skip)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Authorization {
    pub status: AuthorizationStatus,
    pub identifier: Identifier,
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub expires: Option<String>,
}

impl Authorization {
    /// The first listed `http-01` challenge, if the server offered one.
    #[must_use]
    pub fn http01_challenge(&self) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.kind == ChallengeType::Http01)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub url: String,
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub error: Option<Problem>,
}

/// RFC 7807 problem document attached to ACME error responses.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub detail: Option<String>,
    pub status: Option<u16>,
}

impl Problem {
    pub(crate) fn is_bad_nonce(&self) -> bool {
        self.kind.as_deref() == Some(ERROR_BAD_NONCE)
    }

    /// A problem document standing in for a failure that never reached the
    /// ACME layer (connection refused, timeout, unreadable body).
    pub(crate) fn transport(detail: impl fmt::Display) -> Self {
        Self {
            kind: None,
            detail: Some(detail.to_string()),
            status: None,
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode) -> Self {
        Self {
            kind: None,
            detail: Some(format!("unexpected status {status}")),
            status: Some(status.as_u16()),
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind.as_deref(), self.detail.as_deref()) {
            (Some(kind), Some(detail)) => write!(f, "{kind}: {detail}"),
            (Some(kind), None) => write!(f, "{kind}"),
            (None, Some(detail)) => write!(f, "{detail}"),
            (None, None) => write!(f, "unknown error"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewAccountRequest {
    pub terms_of_service_agreed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub only_return_existing: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct NewOrderRequest {
    pub identifiers: Vec<Identifier>,
}

#[derive(Debug, Serialize)]
pub(crate) struct FinalizeRequest {
    pub csr: String,
}
