//! End-to-end issuance scenarios against a mock ACME server: cold start,
//! warm start, forced renewal, bad-nonce retry and renewal coalescing.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use autocert::{Config, DirectoryEndpoint, provision};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const REPLAY_NONCE: &str = "replay-nonce";

fn self_signed_chain(sans: &[&str]) -> String {
    let mut params = rcgen::CertificateParams::new(
        sans.iter().map(ToString::to_string).collect::<Vec<_>>(),
    )
    .expect("certificate params");
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, sans[0]);
    let key = rcgen::KeyPair::generate().expect("key pair");
    params.self_signed(&key).expect("self signed").pem()
}

fn config(server: &MockServer, settings_path: &Path, domains: &[&str]) -> Config {
    Config {
        domains: domains.iter().map(ToString::to_string).collect(),
        server: DirectoryEndpoint::Custom(format!("{}/directory", server.uri())),
        settings_path: settings_path.to_path_buf(),
        contacts: vec!["ops@example.com".to_string()],
    }
}

struct Nonces(Arc<AtomicUsize>);

impl Nonces {
    fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(0)))
    }

    fn next(&self) -> String {
        format!("nonce-{}", self.0.fetch_add(1, Ordering::SeqCst))
    }

    fn clone_counter(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

async fn mount_directory(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/directory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "newNonce": format!("{}/new-nonce", server.uri()),
            "newAccount": format!("{}/new-account", server.uri()),
            "newOrder": format!("{}/new-order", server.uri()),
            "revokeCert": format!("{}/revoke-cert", server.uri()),
            "keyChange": format!("{}/key-change", server.uri()),
        })))
        .mount(server)
        .await;
}

async fn mount_new_nonce(server: &MockServer, nonces: &Nonces) {
    let nonces = nonces.clone_counter();
    Mock::given(method("HEAD"))
        .and(path("/new-nonce"))
        .respond_with(move |_: &Request| {
            ResponseTemplate::new(200).insert_header(REPLAY_NONCE, nonces.next())
        })
        .mount(server)
        .await;
}

async fn mount_new_account(server: &MockServer, nonces: &Nonces) {
    let nonces = nonces.clone_counter();
    let location = format!("{}/acct/1", server.uri());
    Mock::given(method("POST"))
        .and(path("/new-account"))
        .respond_with(move |_: &Request| {
            ResponseTemplate::new(201)
                .insert_header(REPLAY_NONCE, nonces.next())
                .insert_header("Location", location.as_str())
                .set_body_json(serde_json::json!({"status": "valid"}))
        })
        .mount(server)
        .await;
}

async fn mount_new_order(server: &MockServer, nonces: &Nonces, authorizations: Vec<String>) {
    let nonces = nonces.clone_counter();
    let uri = server.uri();
    Mock::given(method("POST"))
        .and(path("/new-order"))
        .respond_with(move |_: &Request| {
            ResponseTemplate::new(201)
                .insert_header(REPLAY_NONCE, nonces.next())
                .insert_header("Location", format!("{uri}/order/1").as_str())
                .set_body_json(serde_json::json!({
                    "status": "pending",
                    "finalize": format!("{uri}/order/1/finalize"),
                    "authorizations": authorizations,
                }))
        })
        .mount(server)
        .await;
}

/// Authorization that is already valid: the order engine skips its
/// challenge entirely.
async fn mount_valid_authorization(server: &MockServer, nonces: &Nonces, route: &str, domain: &str) {
    let nonces = nonces.clone_counter();
    let domain = domain.to_string();
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(move |_: &Request| {
            ResponseTemplate::new(200)
                .insert_header(REPLAY_NONCE, nonces.next())
                .set_body_json(serde_json::json!({
                    "status": "valid",
                    "identifier": {"type": "dns", "value": domain},
                    "challenges": [],
                }))
        })
        .mount(server)
        .await;
}

/// Finalize endpoint that immediately reports the order valid, handing out
/// `/cert/1`, `/cert/2`, ... on successive renewals.
async fn mount_immediate_finalize(server: &MockServer, nonces: &Nonces) -> Arc<AtomicUsize> {
    let nonces = nonces.clone_counter();
    let issued = Arc::new(AtomicUsize::new(0));
    let issued_in_responder = Arc::clone(&issued);
    let uri = server.uri();
    Mock::given(method("POST"))
        .and(path("/order/1/finalize"))
        .respond_with(move |_: &Request| {
            let n = issued_in_responder.fetch_add(1, Ordering::SeqCst) + 1;
            ResponseTemplate::new(200)
                .insert_header(REPLAY_NONCE, nonces.next())
                .set_body_json(serde_json::json!({
                    "status": "valid",
                    "finalize": format!("{uri}/order/1/finalize"),
                    "authorizations": [],
                    "certificate": format!("{uri}/cert/{n}"),
                }))
        })
        .mount(server)
        .await;
    issued
}

async fn mount_certificate(server: &MockServer, nonces: &Nonces, route: &str, chain_pem: String) {
    let nonces = nonces.clone_counter();
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(move |_: &Request| {
            ResponseTemplate::new(200)
                .insert_header(REPLAY_NONCE, nonces.next())
                .set_body_string(chain_pem.clone())
        })
        .mount(server)
        .await;
}

/// The short path: every authorization already valid, finalize immediately
/// valid. Used by the renewal-focused scenarios.
async fn mount_happy_flow(server: &MockServer, domains: &[&str], chains: Vec<String>) {
    let nonces = Nonces::new();
    mount_directory(server).await;
    mount_new_nonce(server, &nonces).await;
    mount_new_account(server, &nonces).await;
    let authz_urls: Vec<String> = (1..=domains.len())
        .map(|i| format!("{}/authz/{i}", server.uri()))
        .collect();
    mount_new_order(server, &nonces, authz_urls).await;
    for (i, domain) in domains.iter().enumerate() {
        mount_valid_authorization(server, &nonces, &format!("/authz/{}", i + 1), domain).await;
    }
    mount_immediate_finalize(server, &nonces).await;
    for (i, chain) in chains.into_iter().enumerate() {
        mount_certificate(server, &nonces, &format!("/cert/{}", i + 1), chain).await;
    }
}

fn file_mode(path: &Path) -> u32 {
    std::fs::metadata(path).expect("metadata").permissions().mode() & 0o777
}

#[tokio::test]
async fn test_cold_start_issues_and_persists_a_certificate() {
    let server = MockServer::start().await;
    let nonces = Nonces::new();
    let settings = tempfile::tempdir().expect("tempdir");
    let domains = ["localhost", "pebble"];

    mount_directory(&server).await;
    mount_new_nonce(&server, &nonces).await;
    mount_new_account(&server, &nonces).await;
    mount_new_order(
        &server,
        &nonces,
        vec![
            format!("{}/authz/1", server.uri()),
            format!("{}/authz/2", server.uri()),
        ],
    )
    .await;

    // First authorization goes through the full pending -> trigger -> valid
    // cycle; the second is valid from the start.
    {
        let nonces = nonces.clone_counter();
        let uri = server.uri();
        let polls = AtomicUsize::new(0);
        Mock::given(method("POST"))
            .and(path("/authz/1"))
            .respond_with(move |_: &Request| {
                let call = polls.fetch_add(1, Ordering::SeqCst);
                let body = if call == 0 {
                    serde_json::json!({
                        "status": "pending",
                        "identifier": {"type": "dns", "value": "localhost"},
                        "challenges": [
                            {
                                "type": "tls-alpn-01",
                                "url": format!("{uri}/chall/alpn"),
                                "token": "tok-alpn",
                                "status": "pending"
                            },
                            {
                                "type": "http-01",
                                "url": format!("{uri}/chall/1"),
                                "token": "tok-http",
                                "status": "pending"
                            }
                        ],
                    })
                } else {
                    serde_json::json!({
                        "status": "valid",
                        "identifier": {"type": "dns", "value": "localhost"},
                        "challenges": [],
                    })
                };
                ResponseTemplate::new(200)
                    .insert_header(REPLAY_NONCE, nonces.next())
                    .set_body_json(body)
            })
            .mount(&server)
            .await;
    }
    mount_valid_authorization(&server, &nonces, "/authz/2", "pebble").await;
    {
        let nonces = nonces.clone_counter();
        let uri = server.uri();
        Mock::given(method("POST"))
            .and(path("/chall/1"))
            .respond_with(move |_: &Request| {
                ResponseTemplate::new(200)
                    .insert_header(REPLAY_NONCE, nonces.next())
                    .set_body_json(serde_json::json!({
                        "type": "http-01",
                        "url": format!("{uri}/chall/1"),
                        "token": "tok-http",
                        "status": "processing"
                    }))
            })
            .expect(1)
            .mount(&server)
            .await;
    }
    // Finalize reports processing once; the order poll then finds it valid.
    {
        let nonces = nonces.clone_counter();
        let uri = server.uri();
        Mock::given(method("POST"))
            .and(path("/order/1/finalize"))
            .respond_with(move |_: &Request| {
                ResponseTemplate::new(200)
                    .insert_header(REPLAY_NONCE, nonces.next())
                    .set_body_json(serde_json::json!({
                        "status": "processing",
                        "finalize": format!("{uri}/order/1/finalize"),
                        "authorizations": [],
                    }))
            })
            .mount(&server)
            .await;
    }
    {
        let nonces = nonces.clone_counter();
        let uri = server.uri();
        Mock::given(method("POST"))
            .and(path("/order/1"))
            .respond_with(move |_: &Request| {
                ResponseTemplate::new(200)
                    .insert_header(REPLAY_NONCE, nonces.next())
                    .set_body_json(serde_json::json!({
                        "status": "valid",
                        "finalize": format!("{uri}/order/1/finalize"),
                        "authorizations": [],
                        "certificate": format!("{uri}/cert/1"),
                    }))
            })
            .mount(&server)
            .await;
    }
    mount_certificate(&server, &nonces, "/cert/1", self_signed_chain(&domains)).await;

    let handle = provision(config(&server, settings.path(), &domains))
        .await
        .expect("cold start issuance");

    // Persisted layout and modes.
    let account_key = settings.path().join("account-identity.pem");
    let certificate_key = settings.path().join("certificate-identity.pem");
    let certificate = settings.path().join("certificate.pem");
    assert!(account_key.exists());
    assert!(certificate_key.exists());
    assert!(certificate.exists());
    assert!(!settings.path().join("certificate.pem.old").exists());
    assert!(!settings.path().join("certificate-identity.pem.old").exists());
    assert_eq!(file_mode(&account_key), 0o600);
    assert_eq!(file_mode(&certificate_key), 0o600);
    assert_eq!(file_mode(&certificate), 0o644);

    // The served bundle covers every configured domain and is currently valid.
    let bundle = handle.certificate();
    assert_eq!(bundle.sans(), ["localhost", "pebble"]);
    let now = time::OffsetDateTime::now_utc();
    assert!(bundle.not_before() <= now && now <= bundle.not_after());
    assert!(!bundle.serial().is_empty());

    let tls = handle.server_config();
    assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

    // Every signed request presented a distinct nonce.
    let mut seen = std::collections::HashSet::new();
    for request in server.received_requests().await.expect("recorded requests") {
        if request.method.as_str() != "POST" {
            continue;
        }
        let jws: serde_json::Value =
            serde_json::from_slice(&request.body).expect("JWS request body");
        let protected = URL_SAFE_NO_PAD
            .decode(jws["protected"].as_str().expect("protected field"))
            .expect("base64url protected header");
        let header: serde_json::Value = serde_json::from_slice(&protected).expect("JWS header");
        let nonce = header["nonce"].as_str().expect("nonce").to_string();
        assert!(seen.insert(nonce), "a nonce was presented twice");
    }

    handle.stop_auto_renewal();
}

#[tokio::test]
async fn test_warm_start_reuses_the_stored_certificate_without_network() {
    let settings = tempfile::tempdir().expect("tempdir");
    let domains = ["localhost", "pebble"];

    let first_serial = {
        let server = MockServer::start().await;
        mount_happy_flow(&server, &domains, vec![self_signed_chain(&domains)]).await;
        let handle = provision(config(&server, settings.path(), &domains))
            .await
            .expect("cold start issuance");
        handle.stop_auto_renewal();
        handle.certificate().serial().to_string()
    };

    // Nothing mounted: any request against this server would 404 and fail
    // the provision call.
    let quiet_server = MockServer::start().await;
    let started = std::time::Instant::now();
    let handle = provision(config(&quiet_server, settings.path(), &domains))
        .await
        .expect("warm start");
    let warm_duration = started.elapsed();

    assert_eq!(handle.certificate().serial(), first_serial);
    assert!(
        quiet_server
            .received_requests()
            .await
            .expect("recorded requests")
            .is_empty(),
        "warm start must not touch the ACME server"
    );
    // Generous bound: a warm start does no network I/O and no key generation.
    assert!(warm_duration.as_secs() < 5);
    handle.stop_auto_renewal();
}

#[tokio::test]
async fn test_forced_renewal_installs_a_chain_with_a_new_serial() {
    let server = MockServer::start().await;
    let settings = tempfile::tempdir().expect("tempdir");
    let domains = ["localhost"];

    mount_happy_flow(
        &server,
        &domains,
        vec![self_signed_chain(&domains), self_signed_chain(&domains)],
    )
    .await;

    let handle = provision(config(&server, settings.path(), &domains))
        .await
        .expect("cold start issuance");
    let first_serial = handle.certificate().serial().to_string();

    // Not due yet: the check is a no-op.
    assert!(!handle.check_for_renewal().await.expect("renewal check"));

    handle.set_renew_at(time::OffsetDateTime::now_utc() - time::Duration::days(1));
    assert!(handle.check_for_renewal().await.expect("forced renewal"));

    let renewed_serial = handle.certificate().serial().to_string();
    assert_ne!(renewed_serial, first_serial);
    assert!(!settings.path().join("certificate.pem.old").exists());
    assert!(!settings.path().join("certificate-identity.pem.old").exists());

    // The store now holds the renewed chain.
    let stored = std::fs::read_to_string(settings.path().join("certificate.pem")).expect("chain");
    assert_eq!(stored, handle.certificate().chain_pem());
    handle.stop_auto_renewal();
}

#[tokio::test]
async fn test_concurrent_renewal_triggers_share_one_order() {
    let server = MockServer::start().await;
    let settings = tempfile::tempdir().expect("tempdir");
    let domains = ["localhost"];

    mount_happy_flow(
        &server,
        &domains,
        vec![self_signed_chain(&domains), self_signed_chain(&domains)],
    )
    .await;

    let handle = provision(config(&server, settings.path(), &domains))
        .await
        .expect("cold start issuance");
    handle.set_renew_at(time::OffsetDateTime::now_utc() - time::Duration::days(1));

    let (first, second) = tokio::join!(handle.check_for_renewal(), handle.check_for_renewal());
    let renewed = [first.expect("first check"), second.expect("second check")];
    assert_eq!(
        renewed.iter().filter(|&&r| r).count(),
        1,
        "exactly one of the concurrent checks should have renewed"
    );

    let order_posts = server
        .received_requests()
        .await
        .expect("recorded requests")
        .iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/new-order")
        .count();
    assert_eq!(order_posts, 2, "one cold-start order plus one renewal order");
    handle.stop_auto_renewal();
}

#[tokio::test]
async fn test_concurrent_cold_starts_share_one_order() {
    let server = MockServer::start().await;
    let settings = tempfile::tempdir().expect("tempdir");
    let domains = ["localhost"];

    // Only one chain is mounted: a second order would ask for /cert/2 and
    // fail, so the assertion below is backed up by the provisions themselves.
    mount_happy_flow(&server, &domains, vec![self_signed_chain(&domains)]).await;

    let (first, second) = tokio::join!(
        provision(config(&server, settings.path(), &domains)),
        provision(config(&server, settings.path(), &domains)),
    );
    let first = first.expect("first concurrent provision");
    let second = second.expect("second concurrent provision");

    assert_eq!(first.certificate().serial(), second.certificate().serial());

    let order_posts = server
        .received_requests()
        .await
        .expect("recorded requests")
        .iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/new-order")
        .count();
    assert_eq!(
        order_posts, 1,
        "concurrent cold starts must share a single order flow"
    );

    first.stop_auto_renewal();
    second.stop_auto_renewal();
}

struct BadNonceOnce {
    calls: AtomicUsize,
    location: String,
    nonces: Nonces,
}

impl Respond for BadNonceOnce {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            ResponseTemplate::new(400)
                .insert_header(REPLAY_NONCE, self.nonces.next())
                .set_body_json(serde_json::json!({
                    "type": "urn:ietf:params:acme:error:badNonce",
                    "detail": "JWS has an invalid anti-replay nonce"
                }))
        } else {
            ResponseTemplate::new(201)
                .insert_header(REPLAY_NONCE, self.nonces.next())
                .insert_header("Location", self.location.as_str())
                .set_body_json(serde_json::json!({"status": "valid"}))
        }
    }
}

#[tokio::test]
async fn test_bad_nonce_is_recovered_with_a_single_retry() {
    let server = MockServer::start().await;
    let settings = tempfile::tempdir().expect("tempdir");
    let domains = ["localhost"];
    let nonces = Nonces::new();

    mount_directory(&server).await;
    mount_new_nonce(&server, &nonces).await;
    Mock::given(method("POST"))
        .and(path("/new-account"))
        .respond_with(BadNonceOnce {
            calls: AtomicUsize::new(0),
            location: format!("{}/acct/1", server.uri()),
            nonces: nonces.clone_counter(),
        })
        .expect(2)
        .mount(&server)
        .await;
    mount_new_order(&server, &nonces, vec![format!("{}/authz/1", server.uri())]).await;
    mount_valid_authorization(&server, &nonces, "/authz/1", "localhost").await;
    mount_immediate_finalize(&server, &nonces).await;
    mount_certificate(&server, &nonces, "/cert/1", self_signed_chain(&domains)).await;

    let handle = provision(config(&server, settings.path(), &domains))
        .await
        .expect("issuance despite one badNonce");
    assert_eq!(handle.certificate().sans(), ["localhost"]);
    handle.stop_auto_renewal();
}
