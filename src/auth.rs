//! Identity-claim verification and session tokens.
//!
//! The identity provider signs a claim over the user's attested fields:
//! `hash = HMAC-SHA256(SHA256(secret), sorted "k=v" lines)`. We verify that
//! signature and the claim's age, then mint our own session token
//! `HMAC-SHA256(secret, "user_id:auth_date")` that the gateway re-checks on
//! every `auth` message without any session table.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Claims older than a day are rejected outright.
const MAX_CLAIM_AGE_SECS: i64 = 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication is not configured")]
    Disabled,
    #[error("claim is missing required field {0}")]
    MissingField(&'static str),
    #[error("claim signature mismatch")]
    BadSignature,
    #[error("claim expired")]
    Expired,
    #[error("invalid session token")]
    BadToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedUser {
    pub id: i64,
    pub first_name: String,
    pub username: Option<String>,
    pub auth_date: i64,
}

pub struct AuthVerifier {
    secret: Option<String>,
}

impl AuthVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    pub fn enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify an identity claim object and extract the user it attests.
    pub fn verify_claim(&self, claim: &serde_json::Value) -> Result<VerifiedUser, AuthError> {
        self.verify_claim_at(claim, Utc::now().timestamp())
    }

    fn verify_claim_at(
        &self,
        claim: &serde_json::Value,
        now_secs: i64,
    ) -> Result<VerifiedUser, AuthError> {
        let secret = self.secret.as_deref().ok_or(AuthError::Disabled)?;
        let fields = claim.as_object().ok_or(AuthError::MissingField("hash"))?;

        let hash = fields
            .get("hash")
            .and_then(|v| v.as_str())
            .ok_or(AuthError::MissingField("hash"))?;
        let auth_date = fields
            .get("auth_date")
            .and_then(value_as_i64)
            .ok_or(AuthError::MissingField("auth_date"))?;
        let id = fields
            .get("id")
            .and_then(value_as_i64)
            .ok_or(AuthError::MissingField("id"))?;

        // Everything but the hash itself, sorted by key.
        let mut lines: Vec<String> = fields
            .iter()
            .filter(|(k, _)| k.as_str() != "hash")
            .map(|(k, v)| format!("{k}={}", value_as_text(v)))
            .collect();
        lines.sort();
        let data_check_string = lines.join("\n");

        let secret_key = Sha256::digest(secret.as_bytes());
        let mut mac = HmacSha256::new_from_slice(&secret_key)
            .map_err(|_| AuthError::BadSignature)?;
        mac.update(data_check_string.as_bytes());
        let expected = hex::decode(hash).map_err(|_| AuthError::BadSignature)?;
        mac.verify_slice(&expected)
            .map_err(|_| AuthError::BadSignature)?;

        if now_secs - auth_date > MAX_CLAIM_AGE_SECS {
            return Err(AuthError::Expired);
        }

        Ok(VerifiedUser {
            id,
            first_name: fields
                .get("first_name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            username: fields
                .get("username")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            auth_date,
        })
    }

    /// Mint the session token the client presents on its WebSocket `auth`.
    pub fn mint_token(&self, user_id: i64, auth_date: i64) -> Result<String, AuthError> {
        let secret = self.secret.as_deref().ok_or(AuthError::Disabled)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AuthError::BadToken)?;
        mac.update(format!("{user_id}:{auth_date}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Recompute-and-compare in constant time.
    pub fn verify_token(
        &self,
        token: &str,
        user_id: i64,
        auth_date: i64,
    ) -> Result<(), AuthError> {
        let secret = self.secret.as_deref().ok_or(AuthError::Disabled)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AuthError::BadToken)?;
        mac.update(format!("{user_id}:{auth_date}").as_bytes());
        let presented = hex::decode(token).map_err(|_| AuthError::BadToken)?;
        mac.verify_slice(&presented).map_err(|_| AuthError::BadToken)
    }
}

fn value_as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Field rendering for the data-check string: strings verbatim, everything
/// else in its JSON form.
fn value_as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
