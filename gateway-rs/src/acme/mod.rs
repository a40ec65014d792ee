//! ACME certificate lifecycle
//!
//! Every managed domain walks
//! `Unmanaged -> Requested -> Validating -> Issued -> DueForRenewal -> Requested ...`.
//! A failed attempt is retried with exponential backoff up to
//! `max_attempts`; after that the domain sits in `Failed`, a
//! [`CertificateEvent::Failed`] is emitted and the next renewal scan tries
//! again. At most one lifecycle runs per domain at a time.
//!
//! Issued certificates are installed in the [`CertificateStore`] (which
//! swaps them in atomically for SNI) and persisted under the certificate
//! directory so a restart does not re-issue.

mod authority;
mod challenge;

pub use authority::{AcmeAuthority, AcmeError, CertificateAuthority, IssuedCertificate, PendingOrder, ATTEMPT_TIMEOUT};
pub use challenge::{challenge_token, AcmeChallengeStore, CHALLENGE_PREFIX};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AcmeConfig;
use crate::error::{GatewayError, Result};
use crate::events::{CertificateEvent, EventSink, GatewayEvent};
use crate::tls::{Certificate, CertificateInfo, CertificateStore};

/// File under the certificate directory holding the ACME account
pub const ACCOUNT_FILE: &str = "acme_account.json";

/// Where a domain is in its certificate lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unmanaged,
    /// Order placed, challenges being published
    Requested,
    /// Waiting for the authority to validate
    Validating,
    Issued,
    /// Inside the early-renewal window
    DueForRenewal,
    /// Retry budget exhausted; retried on the next scan
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    pub domain: String,
    pub state: LifecycleState,
    /// Attempts made by the current or last lifecycle
    pub attempts: u32,
    pub last_error: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
}

impl DomainStatus {
    fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            state: LifecycleState::Unmanaged,
            attempts: 0,
            last_error: None,
            not_after: None,
        }
    }
}

/// Exponential backoff with up to 10% jitter
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt - 1)).min(max_ms);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms + jitter)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drives issuance and renewal for the managed domains
pub struct AcmeManager {
    authority: Arc<dyn CertificateAuthority>,
    certs: Arc<CertificateStore>,
    challenges: AcmeChallengeStore,
    events: EventSink,
    cert_dir: PathBuf,
    check_interval: Duration,
    early_renew_days: i64,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    attempt_timeout: Duration,
    statuses: Mutex<BTreeMap<String, DomainStatus>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Marks a domain as having a lifecycle running
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    domain: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.domain);
    }
}

impl AcmeManager {
    /// Manager for `config.domains`, storing certificates under `cert_dir`
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        certs: Arc<CertificateStore>,
        events: EventSink,
        config: &AcmeConfig,
        cert_dir: impl Into<PathBuf>,
    ) -> Self {
        let manager = Self {
            authority,
            certs,
            challenges: AcmeChallengeStore::new(),
            events,
            cert_dir: cert_dir.into(),
            check_interval: Duration::from_secs(config.check_interval_secs.max(1)),
            early_renew_days: config.early_renew_days,
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
            attempt_timeout: ATTEMPT_TIMEOUT,
            statuses: Mutex::new(BTreeMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        };
        for domain in &config.domains {
            manager.manage(domain);
        }
        manager
    }

    /// Manager talking to the configured ACME directory
    pub fn from_config(
        certs: Arc<CertificateStore>,
        events: EventSink,
        config: &AcmeConfig,
        cert_dir: impl Into<PathBuf>,
    ) -> Self {
        let cert_dir = cert_dir.into();
        let authority = AcmeAuthority::new(
            config.directory.clone(),
            config.email.clone(),
            cert_dir.join(ACCOUNT_FILE),
        );
        Self::new(Arc::new(authority), certs, events, config, cert_dir)
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Give up on an attempt the authority has not completed within `limit`
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = limit;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// HTTP-01 responses the plain listeners serve
    pub fn challenges(&self) -> AcmeChallengeStore {
        self.challenges.clone()
    }

    /// Put `domain` under management. A usable certificate already in the
    /// store counts as issued.
    pub fn manage(&self, domain: &str) {
        let mut statuses = lock(&self.statuses);
        if statuses.contains_key(domain) {
            return;
        }
        let mut status = DomainStatus::new(domain);
        if let Some(info) = self.certs.get(domain).filter(|info| !info.self_signed) {
            status.state = LifecycleState::Issued;
            status.not_after = Some(info.not_after);
        }
        info!(domain, state = ?status.state, "Managing certificate");
        statuses.insert(domain.to_string(), status);
    }

    /// Stop managing `domain`; its installed certificate stays
    pub fn unmanage(&self, domain: &str) -> bool {
        lock(&self.statuses).remove(domain).is_some()
    }

    pub fn state(&self, domain: &str) -> LifecycleState {
        lock(&self.statuses)
            .get(domain)
            .map(|s| s.state)
            .unwrap_or(LifecycleState::Unmanaged)
    }

    pub fn status(&self, domain: &str) -> Option<DomainStatus> {
        lock(&self.statuses).get(domain).cloned()
    }

    pub fn statuses(&self) -> Vec<DomainStatus> {
        lock(&self.statuses).values().cloned().collect()
    }

    fn update(&self, domain: &str, apply: impl FnOnce(&mut DomainStatus)) {
        let mut statuses = lock(&self.statuses);
        let status = statuses
            .entry(domain.to_string())
            .or_insert_with(|| DomainStatus::new(domain));
        apply(status);
    }

    fn begin(&self, domain: &str) -> Option<InFlight<'_>> {
        lock(&self.in_flight).insert(domain.to_string()).then(|| InFlight {
            set: &self.in_flight,
            domain: domain.to_string(),
        })
    }

    /// Run one issuance lifecycle for `domain`.
    ///
    /// Returns `Ok(None)` when a lifecycle for the domain is already running.
    pub async fn obtain(&self, domain: &str) -> Result<Option<CertificateInfo>> {
        let Some(_flight) = self.begin(domain) else {
            debug!(domain, "Certificate lifecycle already in flight");
            return Ok(None);
        };
        self.manage(domain);
        let renewal = self
            .certs
            .get(domain)
            .is_some_and(|info| !info.self_signed);

        let mut reason = String::new();
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = calculate_backoff(attempt - 1, self.backoff_base, self.backoff_max);
                debug!(domain, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::time::sleep(delay).await;
            }

            self.update(domain, |s| {
                s.state = LifecycleState::Requested;
                s.attempts = attempt;
            });
            info!(domain, attempt, renewal, "Requesting certificate");

            match self.attempt(domain).await {
                Ok(info) => {
                    self.update(domain, |s| {
                        s.state = LifecycleState::Issued;
                        s.last_error = None;
                        s.not_after = Some(info.not_after);
                    });
                    info!(domain, not_after = %info.not_after, "Certificate issued");
                    self.events.emit(GatewayEvent::Certificate(CertificateEvent::Issued {
                        domain: domain.to_string(),
                        not_after: info.not_after,
                        renewal,
                    }));
                    return Ok(Some(info));
                }
                Err(e) => {
                    warn!(domain, attempt, error = %e, "Certificate attempt failed");
                    reason = e.to_string();
                    self.update(domain, |s| s.last_error = Some(reason.clone()));
                }
            }
        }

        self.update(domain, |s| s.state = LifecycleState::Failed);
        self.events.emit(GatewayEvent::Certificate(CertificateEvent::Failed {
            domain: domain.to_string(),
            attempts: self.max_attempts,
            reason: reason.clone(),
        }));
        Err(GatewayError::AcmeChallengeFailed {
            domain: domain.to_string(),
            attempts: self.max_attempts,
            reason,
        })
    }

    async fn attempt(&self, domain: &str) -> std::result::Result<CertificateInfo, AcmeError> {
        let order = async {
            let pending = self.authority.request(domain, &self.challenges).await?;
            self.update(domain, |s| s.state = LifecycleState::Validating);
            pending.complete().await
        };
        let issued = authority::within(self.attempt_timeout, "issuance attempt", order).await??;

        let certificate = Certificate::from_pem(domain, &issued.chain_pem, &issued.key_pem)
            .map_err(|e| AcmeError::Finalization(e.to_string()))?;
        let info = self
            .certs
            .install(&certificate)
            .map_err(|e| AcmeError::Finalization(e.to_string()))?;
        if let Err(e) = certificate.save(&self.cert_dir) {
            // Already serving; only a restart would lose it.
            warn!(domain, error = %e, "Failed to persist issued certificate");
        }
        Ok(info)
    }

    fn needs_certificate(&self, domain: &str, now: DateTime<Utc>) -> bool {
        match self.certs.get(domain) {
            Some(info) if !info.self_signed => info.expires_within(now, self.early_renew_days),
            _ => true,
        }
    }

    /// Run one lifecycle for every managed domain that is missing a
    /// certificate or inside the early-renewal window.
    ///
    /// Returns the number of lifecycles started.
    pub async fn check_renewals(&self) -> usize {
        let now = Utc::now();
        let due: Vec<String> = lock(&self.statuses)
            .keys()
            .filter(|domain| self.needs_certificate(domain, now))
            .cloned()
            .collect();

        let mut started = 0;
        for domain in due {
            self.update(&domain, |s| {
                if s.state == LifecycleState::Issued {
                    s.state = LifecycleState::DueForRenewal;
                }
            });
            match self.obtain(&domain).await {
                Ok(Some(_)) => started += 1,
                Ok(None) => {}
                Err(e) => {
                    started += 1;
                    error!(domain = %domain, error = %e, "Certificate lifecycle gave up");
                }
            }
        }
        started
    }

    /// Scan on every check interval until `shutdown` fires. The first scan
    /// runs immediately.
    pub fn start_renewal_task(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                check_interval_secs = self.check_interval.as_secs(),
                domains = lock(&self.statuses).len(),
                "Starting certificate renewal task"
            );
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            started = self.check_renewals() => {
                                if started > 0 {
                                    debug!(started, "Renewal scan finished");
                                }
                            }
                            _ = shutdown.cancelled() => break,
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("Certificate renewal task stopped");
        })
    }
}

impl std::fmt::Debug for AcmeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeManager")
            .field("cert_dir", &self.cert_dir)
            .field("check_interval", &self.check_interval)
            .field("max_attempts", &self.max_attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}
