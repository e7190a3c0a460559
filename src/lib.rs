//! Embedded ACME (RFC 8555) client for Let's Encrypt-style CAs.
//!
//! Hand [`provision`] a set of domains and a settings directory and it
//! returns a [`TlsConfigHandle`]: a live rustls server configuration whose
//! certificate is obtained via the HTTP-01 challenge, persisted with
//! crash-safe atomic swaps, and renewed automatically 30 days before expiry.
//! The host keeps ownership of both listeners: it terminates HTTPS with the
//! handle's config and mounts the handle's [`responder::Http01Responder`]
//! middleware on its plaintext listener.

pub mod acme;
pub mod config;
pub mod error;
pub mod responder;

mod fs_util;
mod handle;
mod identity;
mod jose;
mod renewal;
mod store;
mod tls;

pub use config::{Config, DirectoryEndpoint};
pub use error::{Error, Result};
pub use handle::{TlsConfigHandle, provision};
pub use jose::Jwk;
pub use responder::{ChallengeTokens, Http01Responder};
pub use tls::CertificateBundle;
