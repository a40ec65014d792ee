//! HTTP-01 challenge responses
//!
//! Tokens published here are answered at
//! `/.well-known/acme-challenge/{token}` by every plain HTTP listener,
//! ahead of redirects and routing rules.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Path prefix the authority fetches challenge responses from
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Token to key-authorization map shared between the lifecycle manager and
/// the HTTP listeners
#[derive(Debug, Clone, Default)]
pub struct AcmeChallengeStore {
    challenges: Arc<RwLock<HashMap<String, String>>>,
}

impl AcmeChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a challenge response
    pub async fn add_challenge(&self, token: &str, key_authorization: &str) {
        self.challenges
            .write()
            .await
            .insert(token.to_string(), key_authorization.to_string());
        debug!(token, "Published ACME challenge");
    }

    pub async fn get_challenge(&self, token: &str) -> Option<String> {
        self.challenges.read().await.get(token).cloned()
    }

    /// Withdraw a challenge once the order settled
    pub async fn remove_challenge(&self, token: &str) {
        if self.challenges.write().await.remove(token).is_some() {
            debug!(token, "Withdrew ACME challenge");
        }
    }

    pub async fn len(&self) -> usize {
        self.challenges.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.challenges.read().await.is_empty()
    }

    /// Key authorization for a request path, if it is a published challenge
    pub async fn respond(&self, path: &str) -> Option<String> {
        let token = challenge_token(path)?;
        self.get_challenge(token).await
    }
}

/// Token part of a challenge path
pub fn challenge_token(path: &str) -> Option<&str> {
    path.strip_prefix(CHALLENGE_PREFIX)
        .filter(|token| !token.is_empty() && !token.contains('/'))
}
