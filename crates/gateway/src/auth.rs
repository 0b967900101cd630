//! The Auth collaborator (§1 Out of scope, §4.1, §4.4): an external
//! interface the gateway calls into but does not implement the policy
//! for. A permissive default is provided so the gateway is runnable
//! standalone.
use std::collections::HashSet;

use async_trait::async_trait;

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// The caller may proceed.
    Allowed,
    /// The caller's token/key is not recognized at all.
    Unauthenticated,
    /// The caller is recognized but may not act on this client id.
    Forbidden,
}

/// Authentication and authorization, called at two points: peer
/// handshake (`authenticate_peer`) and HTTP dispatch
/// (`authorize_client`). Billing/quota accounting is a separate
/// concern left entirely to implementors.
#[async_trait]
pub trait Auth: Send + Sync {
    /// Validate a peer's handshake token, returning the API key it
    /// authenticates as.
    async fn authenticate_peer(&self, token: &str) -> AuthDecision;

    /// Check whether `api_key` may address `client_id`.
    async fn authorize_client(&self, api_key: &str, client_id: &str) -> AuthDecision;
}

/// A concrete, swappable default: a static set of valid API keys,
/// where any key may address any client id (no per-client ACL). This
/// mirrors the teacher's `allow`/`deny` list being a concrete
/// instantiation of an otherwise-pluggable access-control interface.
pub struct StaticApiKeyAuth {
    keys: HashSet<String>,
}

impl StaticApiKeyAuth {
    /// Construct from a fixed list of valid API keys/tokens.
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Allow every caller through. Useful for local development.
    pub fn permit_all() -> Self {
        Self { keys: HashSet::new() }
    }
}

#[async_trait]
impl Auth for StaticApiKeyAuth {
    async fn authenticate_peer(&self, token: &str) -> AuthDecision {
        if self.keys.is_empty() || self.keys.contains(token) {
            AuthDecision::Allowed
        } else {
            AuthDecision::Unauthenticated
        }
    }

    async fn authorize_client(&self, api_key: &str, _client_id: &str) -> AuthDecision {
        if self.keys.is_empty() || self.keys.contains(api_key) {
            AuthDecision::Allowed
        } else {
            AuthDecision::Forbidden
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permit_all_allows_any_token() {
        let auth = StaticApiKeyAuth::permit_all();
        assert_eq!(auth.authenticate_peer("anything").await, AuthDecision::Allowed);
    }

    #[tokio::test]
    async fn static_keys_reject_unknown_tokens() {
        let auth = StaticApiKeyAuth::new(["k1".to_string()]);
        assert_eq!(auth.authenticate_peer("k1").await, AuthDecision::Allowed);
        assert_eq!(
            auth.authenticate_peer("k2").await,
            AuthDecision::Unauthenticated
        );
        assert_eq!(
            auth.authorize_client("k2", "c1").await,
            AuthDecision::Forbidden
        );
    }
}
