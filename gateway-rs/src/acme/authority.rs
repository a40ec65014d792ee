//! Certificate authorities
//!
//! [`CertificateAuthority`] is the seam between the lifecycle manager and
//! the ACME protocol. An order is split in two phases so the manager can
//! tell `Requested` from `Validating`: [`CertificateAuthority::request`]
//! places the order and publishes HTTP-01 responses, and
//! [`PendingOrder::complete`] waits for validation and downloads the chain.

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};

use super::challenge::AcmeChallengeStore;

/// How long the authority gets to validate every challenge of an order
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long the authority gets to sign after finalization
const CERTIFICATE_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bound on any single round trip to the authority
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a whole attempt, from placing the order to downloading the chain
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors raised by a single issuance attempt
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME account error: {0}")]
    Account(String),

    #[error("Failed to place order: {0}")]
    Order(String),

    #[error("Challenge failed for '{domain}': {message}")]
    Challenge { domain: String, message: String },

    #[error("Failed to finalize certificate: {0}")]
    Finalization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// PEM material returned by the authority
#[derive(Clone)]
pub struct IssuedCertificate {
    pub chain_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_pem", &format!("{} bytes", self.chain_pem.len()))
            .finish_non_exhaustive()
    }
}

/// An ACME-compatible certificate authority
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Place an order for `domain` and publish its challenge responses
    async fn request(
        &self,
        domain: &str,
        challenges: &AcmeChallengeStore,
    ) -> Result<Box<dyn PendingOrder>, AcmeError>;
}

/// An order whose challenges are published and marked ready
#[async_trait]
pub trait PendingOrder: Send {
    /// Wait for validation, finalize, and withdraw the challenge responses
    async fn complete(self: Box<Self>) -> Result<IssuedCertificate, AcmeError>;
}

/// [`CertificateAuthority`] backed by an ACME directory via `instant-acme`
pub struct AcmeAuthority {
    directory: String,
    email: Option<String>,
    /// Account credentials JSON, created on first use
    account_path: PathBuf,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    pub fn new(directory: impl Into<String>, email: Option<String>, account_path: PathBuf) -> Self {
        Self {
            directory: directory.into(),
            email,
            account_path,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account.get_or_try_init(|| self.load_or_create_account()).await
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        if tokio::fs::try_exists(&self.account_path).await? {
            let json = tokio::fs::read_to_string(&self.account_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&json)
                .map_err(|e| AcmeError::Account(format!("Invalid stored credentials: {}", e)))?;
            let builder = Account::builder().map_err(|e| AcmeError::Account(e.to_string()))?;
            let account = bounded("account lookup", builder.from_credentials(credentials))
                .await?
                .map_err(|e| AcmeError::Account(e.to_string()))?;
            info!(path = %self.account_path.display(), "Loaded ACME account");
            return Ok(account);
        }

        info!(directory = %self.directory, email = ?self.email, "Creating ACME account");
        let contact = self.email.as_ref().map(|email| format!("mailto:{}", email));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();
        let builder = Account::builder().map_err(|e| AcmeError::Account(e.to_string()))?;
        let new_account = NewAccount {
            contact: &contacts,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = bounded(
            "account registration",
            builder.create(&new_account, self.directory.clone(), None),
        )
        .await?
        .map_err(|e| AcmeError::Account(e.to_string()))?;

        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::Account(format!("Failed to serialize credentials: {}", e)))?;
        if let Some(parent) = self.account_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.account_path, json).await?;
        Ok(account)
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn request(
        &self,
        domain: &str,
        challenges: &AcmeChallengeStore,
    ) -> Result<Box<dyn PendingOrder>, AcmeError> {
        if domain.starts_with("*.") {
            return Err(AcmeError::Order(format!(
                "'{}' is a wildcard; HTTP-01 cannot validate it",
                domain
            )));
        }

        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let new_order = NewOrder::new(&identifiers);
        let mut order = bounded("new order", account.new_order(&new_order))
            .await?
            .map_err(|e| AcmeError::Order(e.to_string()))?;

        let mut tokens = Vec::new();
        if let Err(e) = publish_challenges(&mut order, domain, challenges, &mut tokens).await {
            for token in &tokens {
                challenges.remove_challenge(token).await;
            }
            return Err(e);
        }

        debug!(domain, challenges = tokens.len(), "ACME order placed");
        Ok(Box::new(AcmeOrder {
            domain: domain.to_string(),
            order,
            tokens,
            challenges: challenges.clone(),
        }))
    }
}

async fn publish_challenges(
    order: &mut Order,
    domain: &str,
    challenges: &AcmeChallengeStore,
    tokens: &mut Vec<String>,
) -> Result<(), AcmeError> {
    let challenge_error = |message: String| AcmeError::Challenge {
        domain: domain.to_string(),
        message,
    };

    let mut authorizations = order.authorizations();
    while let Some(result) = bounded("authorization lookup", authorizations.next()).await? {
        let mut authz = result.map_err(|e| challenge_error(e.to_string()))?;
        if authz.status == AuthorizationStatus::Valid {
            continue;
        }

        let mut challenge = authz
            .challenge(ChallengeType::Http01)
            .ok_or_else(|| challenge_error("authority offered no HTTP-01 challenge".to_string()))?;
        let key_authorization = challenge.key_authorization();
        challenges
            .add_challenge(&challenge.token, key_authorization.as_str())
            .await;
        tokens.push(challenge.token.clone());

        bounded("challenge ready", challenge.set_ready())
            .await?
            .map_err(|e| challenge_error(e.to_string()))?;
    }
    Ok(())
}

struct AcmeOrder {
    domain: String,
    order: Order,
    tokens: Vec<String>,
    challenges: AcmeChallengeStore,
}

impl AcmeOrder {
    async fn wait_ready(&mut self) -> Result<(), AcmeError> {
        let deadline = Instant::now() + CHALLENGE_TIMEOUT;
        loop {
            let state = bounded("order refresh", self.order.refresh())
                .await?
                .map_err(|e| AcmeError::Order(e.to_string()))?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(AcmeError::Challenge {
                        domain: self.domain.clone(),
                        message: "authority rejected the challenge".to_string(),
                    })
                }
                OrderStatus::Pending | OrderStatus::Processing => {}
            }
            if Instant::now() > deadline {
                return Err(AcmeError::Timeout(format!("validation of {}", self.domain)));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn finalize(&mut self) -> Result<IssuedCertificate, AcmeError> {
        let key = rcgen::KeyPair::generate().map_err(|e| AcmeError::Finalization(e.to_string()))?;
        let csr = rcgen::CertificateParams::new(vec![self.domain.clone()])
            .and_then(|params| params.serialize_request(&key))
            .map_err(|e| AcmeError::Finalization(e.to_string()))?;
        bounded("finalization", self.order.finalize_csr(csr.der()))
            .await?
            .map_err(|e| AcmeError::Finalization(e.to_string()))?;

        let deadline = Instant::now() + CERTIFICATE_TIMEOUT;
        let chain_pem = loop {
            let state = bounded("order refresh", self.order.refresh())
                .await?
                .map_err(|e| AcmeError::Finalization(e.to_string()))?;
            match state.status {
                OrderStatus::Valid => {
                    let chain = bounded("certificate download", self.order.certificate())
                        .await?
                        .map_err(|e| AcmeError::Finalization(e.to_string()))?;
                    break chain.ok_or_else(|| AcmeError::Finalization("no certificate in response".to_string()))?;
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Finalization("order became invalid".to_string()));
                }
                _ => {}
            }
            if Instant::now() > deadline {
                return Err(AcmeError::Timeout(format!("certificate for {}", self.domain)));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        Ok(IssuedCertificate {
            chain_pem,
            key_pem: key.serialize_pem(),
        })
    }
}

/// Run one call to the authority, failing with [`AcmeError::Timeout`] if it
/// does not answer within [`REQUEST_TIMEOUT`]
async fn bounded<F: Future>(step: &str, call: F) -> Result<F::Output, AcmeError> {
    within(REQUEST_TIMEOUT, step, call).await
}

pub(crate) async fn within<F: Future>(limit: Duration, step: &str, call: F) -> Result<F::Output, AcmeError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| AcmeError::Timeout(format!("{} after {:?}", step, limit)))
}

#[async_trait]
impl PendingOrder for AcmeOrder {
    async fn complete(mut self: Box<Self>) -> Result<IssuedCertificate, AcmeError> {
        let result = match self.wait_ready().await {
            Ok(()) => self.finalize().await,
            Err(e) => Err(e),
        };
        for token in &self.tokens {
            self.challenges.remove_challenge(token).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wildcard_rejected_before_contacting_authority() {
        let dir = tempfile::tempdir().unwrap();
        let authority = AcmeAuthority::new(
            "https://acme.invalid/directory",
            None,
            dir.path().join("acme_account.json"),
        );
        let challenges = AcmeChallengeStore::new();

        let err = authority.request("*.example.com", &challenges).await.err().unwrap();
        assert!(matches!(err, AcmeError::Order(_)));
        assert!(!dir.path().join("acme_account.json").exists());
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let limit = Duration::from_millis(20);
        let err = within(limit, "order refresh", std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::Timeout(ref step) if step.starts_with("order refresh")));

        let answered = within(limit, "order refresh", async { 7 }).await.unwrap();
        assert_eq!(answered, 7);
    }

    #[tokio::test]
    async fn test_corrupt_credentials_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme_account.json");
        std::fs::write(&path, "not json").unwrap();
        let authority = AcmeAuthority::new("https://acme.invalid/directory", None, path);

        let err = authority
            .request("a.example.com", &AcmeChallengeStore::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AcmeError::Account(_)));
    }
}
