use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub(crate) const ALG_RS256: &str = "RS256";

pub(crate) fn b64(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Public JWK form of an RSA account key.
///
/// Field order matters: serializing this struct yields the RFC 7638
/// canonical JSON (members sorted lexicographically, no whitespace), so the
/// serialized form doubles as the thumbprint input.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Jwk {
    pub e: String,
    pub kty: String,
    pub n: String,
}

impl Jwk {
    pub(crate) fn rsa(n: &[u8], e: &[u8]) -> Self {
        Self {
            e: b64(e),
            kty: "RSA".to_string(),
            n: b64(n),
        }
    }
}

/// RFC 7638 thumbprint: base64url(SHA-256(canonical JWK JSON)), unpadded.
///
/// # Errors
/// Returns [`Error::Crypto`] if the JWK cannot be serialized.
pub(crate) fn thumbprint(jwk: &Jwk) -> Result<String> {
    let canonical = serde_json::to_string(jwk)
        .map_err(|err| Error::Crypto(format!("cannot canonicalize JWK: {err}")))?;
    Ok(b64(Sha256::digest(canonical.as_bytes()).as_slice()))
}

/// Protected header of a flattened JWS. Exactly one of `jwk` and `kid` is
/// present: `jwk` for `newAccount`, `kid` everywhere after.
#[derive(Debug, Serialize)]
pub(crate) struct ProtectedHeader<'a> {
    pub alg: &'static str,
    pub nonce: String,
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwk: Option<&'a Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<&'a str>,
}
