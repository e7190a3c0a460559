use std::time::Duration;

use tracing::{debug, info};

use crate::acme::client::AcmeClient;
use crate::acme::types::{AuthorizationStatus, Order, OrderStatus};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::responder::ChallengeTokens;

const AUTHORIZATION_DEADLINE: Duration = Duration::from_secs(300);
const FINALIZE_DEADLINE: Duration = Duration::from_secs(300);
const POLL_INITIAL_DELAY: Duration = Duration::from_secs(1);
const POLL_DELAY_STEP: Duration = Duration::from_secs(1);
const POLL_DELAY_CAP: Duration = Duration::from_secs(10);

/// What a completed order produces: the PEM chain (leaf first) and the PEM
/// key of the certificate identity generated for this renewal.
#[derive(Debug)]
pub(crate) struct IssuedCertificate {
    pub chain_pem: String,
    pub key_pem: String,
}

/// Drives one order from `newOrder` to a downloaded chain.
///
/// Strictly sequential: all authorizations are settled before the CSR is
/// built, and the first authorization to come back `invalid` aborts the
/// order without touching the remaining ones.
///
/// # Errors
/// Returns [`Error::OrderFailed`] for protocol-level rejection,
/// [`Error::OrderTimeout`] when a polling deadline expires, and
/// [`Error::AcmeRequest`] for transport/server errors.
pub(crate) async fn place_order(
    client: &AcmeClient,
    tokens: &ChallengeTokens,
    domains: &[String],
    contacts: &[String],
) -> Result<IssuedCertificate> {
    client.ensure_account(contacts).await?;

    let order = client.new_order(domains).await?;
    let order_url = order.url.clone().ok_or_else(|| {
        Error::OrderFailed("newOrder response is missing the Location header".to_string())
    })?;

    match order.status {
        OrderStatus::Invalid => return Err(order_failure(&order)),
        OrderStatus::Valid => {
            // Can only happen when the server resumes an order finalized by a
            // previous process; we no longer hold that certificate key.
            return Err(Error::OrderFailed(
                "order is already valid but no matching certificate key exists".to_string(),
            ));
        }
        OrderStatus::Pending => {
            for authz_url in &order.authorizations {
                validate_authorization(client, tokens, authz_url).await?;
            }
        }
        OrderStatus::Ready | OrderStatus::Processing => {}
    }

    let certificate_identity = Identity::generate().await?;
    let csr = build_csr(domains, &certificate_identity)?;
    info!("finalizing order at {}", order.finalize);
    let finalized = client.finalize_order(&order.finalize, &csr).await?;

    let completed = match finalized.status {
        OrderStatus::Valid => finalized,
        OrderStatus::Invalid => return Err(order_failure(&finalized)),
        _ => wait_for_issuance(client, &order_url).await?,
    };

    let certificate_url = completed.certificate.ok_or_else(|| {
        Error::OrderFailed("order is valid but carries no certificate URL".to_string())
    })?;
    info!("downloading certificate chain from {certificate_url}");
    let chain_pem = client.download_certificate(&certificate_url).await?;

    Ok(IssuedCertificate {
        chain_pem,
        key_pem: certificate_identity.pem().to_string(),
    })
}

/// Settles a single authorization via its first http-01 challenge. The
/// challenge token is registered with the responder only for the duration of
/// the attempt.
async fn validate_authorization(
    client: &AcmeClient,
    tokens: &ChallengeTokens,
    authz_url: &str,
) -> Result<()> {
    debug!("fetching authorization {authz_url}");
    let authz = client.fetch_authorization(authz_url).await?;
    let domain = authz.identifier.value.clone();

    match authz.status {
        AuthorizationStatus::Valid => {
            debug!("authorization for {domain} is already valid");
            return Ok(());
        }
        AuthorizationStatus::Pending => {}
        other => {
            return Err(Error::OrderFailed(format!(
                "authorization for {domain} is {other:?}"
            )));
        }
    }

    let challenge = authz.http01_challenge().ok_or_else(|| {
        Error::OrderFailed(format!("no http-01 challenge offered for {domain}"))
    })?;
    let token = challenge.token.clone();
    let challenge_url = challenge.url.clone();
    debug!("selected http-01 challenge for {domain} (token {token})");

    let key_authorization = client.identity().key_authorization(&token);
    tokens.insert(&token, &key_authorization).await;

    let outcome = async {
        client.trigger_challenge(&challenge_url).await?;
        poll_authorization(client, authz_url, &domain).await
    }
    .await;

    tokens.remove(&token).await;
    outcome
}

async fn poll_authorization(client: &AcmeClient, authz_url: &str, domain: &str) -> Result<()> {
    let mut schedule = PollSchedule::new("authorization validation", AUTHORIZATION_DEADLINE);
    loop {
        schedule.wait().await?;
        let authz = client.fetch_authorization(authz_url).await?;
        debug!("authorization for {domain} is {:?}", authz.status);
        match authz.status {
            AuthorizationStatus::Valid => {
                info!("authorization for {domain} validated");
                return Ok(());
            }
            AuthorizationStatus::Invalid => {
                let detail = authz
                    .challenges
                    .iter()
                    .find_map(|c| c.error.as_ref())
                    .map_or_else(
                        || "authorization reported invalid".to_string(),
                        ToString::to_string,
                    );
                return Err(Error::OrderFailed(format!(
                    "authorization for {domain} failed: {detail}"
                )));
            }
            _ => {}
        }
    }
}

async fn wait_for_issuance(client: &AcmeClient, order_url: &str) -> Result<Order> {
    let mut schedule = PollSchedule::new("order finalization", FINALIZE_DEADLINE);
    loop {
        schedule.wait().await?;
        let order = client.fetch_order(order_url).await?;
        debug!("order is {:?}", order.status);
        match order.status {
            OrderStatus::Valid => return Ok(order),
            OrderStatus::Invalid => return Err(order_failure(&order)),
            _ => {}
        }
    }
}

fn order_failure(order: &Order) -> Error {
    let detail = order.error.as_ref().map_or_else(
        || "order reported invalid".to_string(),
        ToString::to_string,
    );
    Error::OrderFailed(detail)
}

/// PKCS#10 request over the full SAN set, signed with the fresh certificate
/// key. The first domain doubles as the common name.
fn build_csr(domains: &[String], certificate_identity: &Identity) -> Result<Vec<u8>> {
    let primary = domains.first().ok_or_else(|| {
        Error::Configuration("at least one domain is required".to_string())
    })?;

    let mut params = rcgen::CertificateParams::default();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, primary.clone());

    let mut sans = Vec::new();
    for domain in domains {
        let dns_name = domain.clone().try_into().map_err(|err| {
            Error::Crypto(format!("invalid DNS name {domain:?}: {err}"))
        })?;
        sans.push(rcgen::SanType::DnsName(dns_name));
    }
    params.subject_alt_names = sans;

    let key = rcgen::KeyPair::from_pem_and_sign_algo(
        certificate_identity.pem(),
        &rcgen::PKCS_RSA_SHA256,
    )
    .map_err(|err| Error::Crypto(format!("cannot load certificate key for CSR: {err}")))?;
    let csr = params
        .serialize_request(&key)
        .map_err(|err| Error::Crypto(format!("cannot build CSR: {err}")))?;
    Ok(csr.der().to_vec())
}

/// Linear backoff: 1 s, 2 s, ... capped at 10 s, bounded by an overall
/// deadline per phase.
struct PollSchedule {
    phase: &'static str,
    delay: Duration,
    deadline: tokio::time::Instant,
    total: Duration,
}

impl PollSchedule {
    fn new(phase: &'static str, total: Duration) -> Self {
        Self {
            phase,
            delay: POLL_INITIAL_DELAY,
            deadline: tokio::time::Instant::now() + total,
            total,
        }
    }

    async fn wait(&mut self) -> Result<()> {
        if tokio::time::Instant::now() + self.delay > self.deadline {
            return Err(Error::OrderTimeout {
                phase: self.phase,
                seconds: self.total.as_secs(),
            });
        }
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay + POLL_DELAY_STEP).min(POLL_DELAY_CAP);
        Ok(())
    }
}
