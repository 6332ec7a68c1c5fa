//! Access/refresh token pair and JWT expiry inspection.
//!
//! The access token is decoded without signature verification; the client
//! only needs the `exp` claim to decide whether to refresh. The server stays
//! the authority on validity.

use crate::auth::error::AuthError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A short-lived access token plus the refresh token that mints the next one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenPair {
    pub fn bearer(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: default_token_type(),
        }
    }

    /// Expiry of the access token, read from its `exp` claim.
    pub fn expires_at(&self) -> Result<DateTime<Utc>, AuthError> {
        access_token_expiry(&self.access_token)
    }

    pub fn is_expired(&self) -> Result<bool, AuthError> {
        Ok(self.expires_at()? <= Utc::now())
    }
}

// Tokens never reach logs, even through `{:?}`.
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

/// Read the `exp` claim of a JWT.
pub fn access_token_expiry(token: &str) -> Result<DateTime<Utc>, AuthError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => {
            return Err(AuthError::MalformedToken(
                "expected three dot-separated segments".into(),
            ));
        }
    };

    // Some issuers pad their segments even though RFC 7515 says not to
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::MalformedToken(format!("payload is not base64url: {}", e)))?;
    let claims: ExpiryClaims = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::MalformedToken(format!("payload is not a claims object: {}", e)))?;

    let exp = claims
        .exp
        .ok_or_else(|| AuthError::MalformedToken("missing exp claim".into()))?;
    DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| AuthError::MalformedToken(format!("exp claim out of range: {}", exp)))
}

/// Unsigned JWTs for tests in this crate.
#[cfg(test)]
pub(crate) fn unsigned_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user_1","exp":{}}}"#, exp));
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_token_is_not_expired() {
        let exp = Utc::now().timestamp() + 3600;
        let pair = TokenPair::bearer(unsigned_jwt(exp), "refresh");
        assert!(!pair.is_expired().unwrap());
        assert_eq!(pair.expires_at().unwrap().timestamp(), exp);
    }

    #[test]
    fn test_past_token_is_expired() {
        let pair = TokenPair::bearer(unsigned_jwt(Utc::now().timestamp() - 10), "refresh");
        assert!(pair.is_expired().unwrap());
    }

    #[test]
    fn test_malformed_tokens() {
        for token in ["", "opaque-token", "a.b", "a.!!!.c", "a.b.c.d"] {
            let err = access_token_expiry(token).unwrap_err();
            assert!(
                matches!(err, AuthError::MalformedToken(_)),
                "{:?} should be malformed",
                token
            );
        }
    }

    #[test]
    fn test_missing_exp_is_malformed() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"user_1"}"#);
        let token = format!("e30.{}.sig", payload);
        assert!(matches!(
            access_token_expiry(&token),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let pair = TokenPair::bearer("secret-access", "secret-refresh");
        let rendered = format!("{:?}", pair);
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }
}
