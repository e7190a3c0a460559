use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwap;
use rustls::ServerConfig;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::acme::client::AcmeClient;
use crate::acme::order;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs_util;
use crate::identity::Identity;
use crate::renewal;
use crate::responder::{ChallengeTokens, Http01Responder};
use crate::store::CertificateStore;
use crate::tls::{self, CertResolver, CertificateBundle};

/// Everything the facade and the renewal task share.
pub(crate) struct ManagerState {
    config: Config,
    client: AcmeClient,
    store: CertificateStore,
    tokens: ChallengeTokens,
    resolver: Arc<CertResolver>,
    bundle: ArcSwap<CertificateBundle>,
    renew_at: Mutex<OffsetDateTime>,
    /// Single-flight guard, shared with [`provision`] startups via
    /// [`settings_lock`]: concurrent issuance triggers for one settings
    /// directory wait here, then re-check the renewal date and find the
    /// fresh certificate already in place.
    renewal_flight: Arc<tokio::sync::Mutex<()>>,
}

impl ManagerState {
    pub(crate) fn renew_at(&self) -> OffsetDateTime {
        *self.renew_at.lock().expect("renew_at lock poisoned")
    }

    fn set_renew_at(&self, when: OffsetDateTime) {
        *self.renew_at.lock().expect("renew_at lock poisoned") = when;
    }

    /// Renews now if the certificate is due. Returns whether a new
    /// certificate was installed.
    pub(crate) async fn check_for_renewal(&self) -> Result<bool> {
        let _flight = self.renewal_flight.lock().await;
        if OffsetDateTime::now_utc() < self.renew_at() {
            return Ok(false);
        }
        info!("certificate is due for renewal, starting ACME order");
        let bundle = issue_and_install(&self.client, &self.tokens, &self.store, &self.config).await?;
        self.adopt(bundle)?;
        Ok(true)
    }

    /// Makes `bundle` the live certificate: swap the resolver key, move the
    /// renewal date, publish the new snapshot.
    fn adopt(&self, bundle: CertificateBundle) -> Result<()> {
        let certified = bundle.certified_key()?;
        self.resolver.swap(certified);
        self.set_renew_at(bundle.renew_at());
        info!(
            "serving certificate serial {} (expires {})",
            bundle.serial(),
            bundle.not_after()
        );
        self.bundle.store(Arc::new(bundle));
        Ok(())
    }
}

async fn issue_and_install(
    client: &AcmeClient,
    tokens: &ChallengeTokens,
    store: &CertificateStore,
    config: &Config,
) -> Result<CertificateBundle> {
    let issued = order::place_order(client, tokens, &config.domains, &config.contacts).await?;
    store.install(&issued.chain_pem, &issued.key_pem).await?;
    CertificateBundle::from_pem(issued.chain_pem, issued.key_pem)
}

/// Process-wide startup lock, one per settings directory.
///
/// Concurrent [`provision`] calls against the same directory serialize
/// here: the first runs recovery and (on a cold start) the order flow, the
/// rest then find the stored certificate and never place an order of their
/// own.
fn settings_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .expect("settings lock map poisoned");
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

/// Sets up storage, recovers from any interrupted renewal, obtains a
/// certificate (from disk or a fresh order) and starts the auto-renewal
/// loop.
///
/// # Errors
/// Propagates configuration, storage, identity and ACME errors; see
/// [`Error`] for the kinds.
pub async fn provision(config: Config) -> Result<TlsConfigHandle> {
    config.validate()?;

    // Held until the handle is ready: recovery, the load and any cold-start
    // issuance below must not interleave with another provision call on the
    // same directory.
    let startup_lock = settings_lock(&config.settings_path);
    let _startup = startup_lock.lock().await;

    fs_util::ensure_dir(&config.settings_path)
        .await
        .map_err(|source| Error::StorageIo {
            path: config.settings_path.clone(),
            source,
        })?;

    let store = CertificateStore::new(&config.settings_path);
    let recovery = store.recover().await?;
    debug!("certificate store recovery: {recovery:?}");

    let account = Identity::load_or_create(&store.account_key_path()).await?;
    let client = AcmeClient::new(&config.server, Arc::new(account))?;
    let tokens = ChallengeTokens::new();

    let now = OffsetDateTime::now_utc();
    let stored = match store.load().await? {
        Some(stored) => Some(CertificateBundle::from_pem(stored.chain_pem, stored.key_pem)?),
        None => None,
    };
    let bundle = match stored {
        Some(bundle) if now < bundle.renew_at() && bundle.covers(&config.domains) => {
            debug!("using stored certificate (serial {})", bundle.serial());
            bundle
        }
        Some(_) => {
            info!("stored certificate is due for replacement, ordering a new one");
            issue_and_install(&client, &tokens, &store, &config).await?
        }
        None => {
            info!("no certificate on disk, ordering the first one");
            issue_and_install(&client, &tokens, &store, &config).await?
        }
    };

    let resolver = Arc::new(CertResolver::new(bundle.certified_key()?));
    let server_config = Arc::new(tls::build_server_config(Arc::clone(&resolver))?);
    let renew_at = bundle.renew_at();

    let state = Arc::new(ManagerState {
        config,
        client,
        store,
        tokens,
        resolver,
        bundle: ArcSwap::from_pointee(bundle),
        renew_at: Mutex::new(renew_at),
        renewal_flight: Arc::clone(&startup_lock),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let renewal_task = renewal::spawn(Arc::clone(&state), shutdown_rx);

    Ok(TlsConfigHandle {
        state,
        server_config,
        shutdown: shutdown_tx,
        _renewal_task: renewal_task,
    })
}

/// Live TLS material for the host's HTTPS listener.
///
/// The contained [`ServerConfig`] stays valid for the life of the handle;
/// certificate rotation happens behind its certificate resolver, so
/// acceptors built from it pick up renewals automatically.
pub struct TlsConfigHandle {
    state: Arc<ManagerState>,
    server_config: Arc<ServerConfig>,
    shutdown: watch::Sender<bool>,
    _renewal_task: JoinHandle<()>,
}

impl TlsConfigHandle {
    /// The rustls server configuration to terminate HTTPS with.
    #[must_use]
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Snapshot of the currently served certificate.
    #[must_use]
    pub fn certificate(&self) -> Arc<CertificateBundle> {
        self.state.bundle.load_full()
    }

    /// The HTTP-01 middleware to mount on the host's plaintext listener.
    #[must_use]
    pub fn responder(&self) -> Http01Responder {
        Http01Responder::new(self.state.tokens.clone())
    }

    /// When the next renewal is scheduled.
    #[must_use]
    pub fn renew_at(&self) -> OffsetDateTime {
        self.state.renew_at()
    }

    /// Moves the renewal date, e.g. to force a renewal on the next check.
    /// Mostly useful for tests and operational tooling.
    pub fn set_renew_at(&self, when: OffsetDateTime) {
        self.state.set_renew_at(when);
    }

    /// Checks expiry immediately, renewing if due. Concurrent calls share a
    /// single in-flight order.
    ///
    /// # Errors
    /// Propagates order and storage errors from the renewal attempt.
    pub async fn check_for_renewal(&self) -> Result<bool> {
        self.state.check_for_renewal().await
    }

    /// Stops the background renewal loop. An in-flight renewal completes;
    /// the handle keeps serving the current certificate.
    pub fn stop_auto_renewal(&self) {
        debug!("stopping auto-renewal");
        let _ = self.shutdown.send(true);
    }
}
