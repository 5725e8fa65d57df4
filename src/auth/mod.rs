//! TokenVerifier: validates a bearer credential issued by the identity
//! provider and returns `{userId, agentId}` or a typed failure.
//!
//! The identity provider itself — login, registration, refresh — is out of
//! scope; this module only verifies tokens it did not mint, against signing
//! material supplied via configuration.

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Claims carried by an access token. The relay never issues these; it only
/// decodes tokens minted upstream, so there is no `encode` path here.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id (subject).
    pub sub: String,
    /// Agent id — one per user in this system.
    pub agent_id: String,
    pub exp: i64,
    pub iat: i64,
}

/// Typed verification failure. Never leaks verifier internals to the client —
/// the websocket layer maps this straight to a coarse `error` frame.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
    #[error("unauthorized")]
    Unauthorized,
}

/// The identity a verified token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: Uuid,
    pub agent_id: String,
}

/// Verifies bearer tokens against a fixed signing secret and algorithm.
///
/// Pure modulo the caller-supplied signing material baked in at construction;
/// holds no mutable state, so one instance is shared (via `Arc` in
/// `AppState`) across every connection without synchronization.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// `algorithm` matches `auth.algorithm` from configuration.
    pub fn new(signing_material: &str, algorithm: Algorithm) -> Self {
        let decoding_key = DecodingKey::from_secret(signing_material.as_bytes());
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        Self {
            decoding_key,
            validation,
        }
    }

    /// Never panics or throws on malformed input — always returns a typed
    /// error.
    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            },
        )?;

        let claims = data.claims;

        // Belt-and-braces: `validate_exp` already rejects stale tokens, but a
        // forged `exp` combined with a validator that skipped the check
        // would otherwise slip through.
        if claims.exp < Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::Unauthorized)?;

        if claims.agent_id.trim().is_empty() {
            return Err(AuthError::Unauthorized);
        }

        Ok(VerifiedIdentity {
            user_id,
            agent_id: claims.agent_id,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::mint;
    use super::*;

    const SECRET: &str = "test-signing-material-at-least-32-bytes-long";

    #[test]
    fn verify_accepts_a_fresh_token() {
        let verifier = TokenVerifier::new(SECRET, Algorithm::HS256);
        let user_id = Uuid::new_v4();
        let token = mint(SECRET, user_id, "agent-1", 300);

        let identity = verifier.verify(&token).expect("token should verify");
        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.agent_id, "agent-1");
    }

    #[test]
    fn verify_rejects_expired_token() {
        let verifier = TokenVerifier::new(SECRET, Algorithm::HS256);
        let token = mint(SECRET, Uuid::new_v4(), "agent-1", -10);

        let err = verifier.verify(&token).expect_err("expired token must fail");
        assert_eq!(err, AuthError::Expired);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let verifier = TokenVerifier::new(SECRET, Algorithm::HS256);
        let token = mint(
            "a-completely-different-secret-value",
            Uuid::new_v4(),
            "agent-1",
            300,
        );

        let err = verifier.verify(&token).expect_err("wrong signature must fail");
        assert_eq!(err, AuthError::Invalid);
    }

    #[test]
    fn verify_rejects_malformed_token() {
        let verifier = TokenVerifier::new(SECRET, Algorithm::HS256);
        let err = verifier
            .verify("not.a.jwt")
            .expect_err("malformed token must fail");
        assert_eq!(err, AuthError::Invalid);
    }

    #[test]
    fn verify_rejects_empty_agent_id() {
        let verifier = TokenVerifier::new(SECRET, Algorithm::HS256);
        let token = mint(SECRET, Uuid::new_v4(), "", 300);

        let err = verifier
            .verify(&token)
            .expect_err("empty agent id must be unauthorized");
        assert_eq!(err, AuthError::Unauthorized);
    }

    #[test]
    fn verify_rejects_non_uuid_subject() {
        use jsonwebtoken::{encode, EncodingKey, Header};

        let claims = Claims {
            sub: "not-a-uuid".into(),
            agent_id: "agent-1".into(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 300,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let verifier = TokenVerifier::new(SECRET, Algorithm::HS256);
        let err = verifier
            .verify(&token)
            .expect_err("non-uuid subject must be unauthorized");
        assert_eq!(err, AuthError::Unauthorized);
    }

    #[test]
    fn verifier_is_reusable_across_many_calls() {
        let verifier = TokenVerifier::new(SECRET, Algorithm::HS256);
        for i in 0..5 {
            let token = mint(SECRET, Uuid::new_v4(), &format!("agent-{i}"), 300);
            assert!(verifier.verify(&token).is_ok());
        }
    }
}
