//! Browser authentication boundary
//!
//! JWT issuance and verification live in an external service; the core
//! consumes them through [`AuthVerifier`]. Verification is pure and
//! cacheable, so the trait is synchronous.

use std::sync::Arc;

/// Claims extracted from a verified browser JWT
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub user_id: String,
    /// The browser login session this token belongs to
    pub auth_session_id: String,
    /// Set while the user still owes a TOTP step; all WS endpoints reject
    pub pending_totp: bool,
}

/// Verifies the `token` query parameter presented at WebSocket upgrade
pub trait AuthVerifier: Send + Sync {
    /// Returns `None` for a missing, malformed, expired or otherwise
    /// unverifiable token.
    fn verify_jwt(&self, token: &str) -> Option<VerifiedToken>;
}

/// Static verifier for tests and local development: accepts tokens of the
/// form `user:<id>` and nothing else.
pub struct StaticVerifier;

impl AuthVerifier for StaticVerifier {
    fn verify_jwt(&self, token: &str) -> Option<VerifiedToken> {
        let user_id = token.strip_prefix("user:")?;
        if user_id.is_empty() {
            return None;
        }
        Some(VerifiedToken {
            user_id: user_id.to_string(),
            auth_session_id: "static".to_string(),
            pending_totp: false,
        })
    }
}

pub type SharedVerifier = Arc<dyn AuthVerifier>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_verifier_accepts_prefixed_tokens() {
        let v = StaticVerifier;
        let t = v.verify_jwt("user:alice").unwrap();
        assert_eq!(t.user_id, "alice");
        assert!(!t.pending_totp);
    }

    #[test]
    fn static_verifier_rejects_garbage() {
        let v = StaticVerifier;
        assert!(v.verify_jwt("").is_none());
        assert!(v.verify_jwt("user:").is_none());
        assert!(v.verify_jwt("bearer xyz").is_none());
    }
}
