//! Typed errors for credential acquisition and session establishment.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`SecretStore`](crate::auth::SecretStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The platform keychain (or the file backing it) could not be used.
    #[error("credential storage unavailable: {0}")]
    KeychainUnavailable(String),

    /// No secret stored under the key. Callers treat this as "not configured".
    #[error("no credential stored for {service}/{key}")]
    KeyNotFound { service: String, key: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Nothing usable in the keychain; the user has to log in first.
    #[error("not logged in, run `keystone login` first")]
    NotLoggedIn,

    #[error("access token is malformed: {0}")]
    MalformedToken(String),

    #[error("failed to refresh access token: {0}")]
    RefreshFailed(String),

    /// The client was built without a cookie jar; this is a builder misuse.
    #[error("client does not have a cookie jar, cannot read or set cookies")]
    NoCookieJar,

    #[error("empty csrf token received from server, cannot continue")]
    EmptyCsrfToken,

    #[error("failed to bind sso callback listener: {0}")]
    ListenerBind(#[source] std::io::Error),

    #[error("sso callback listener must use a loopback address, got {0}")]
    NonLoopbackListener(std::net::SocketAddr),

    #[error("timed out after {0:?} waiting for sso login to complete")]
    TimedOut(Duration),

    #[error("sso login canceled")]
    Canceled,

    #[error("sso callback did not carry a complete login: {0}")]
    IncompleteCallback(String),

    #[error("sso callback server stopped before delivering a result")]
    CallbackClosed,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("credential cannot be sent as an http header")]
    InvalidCredential,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

impl AuthError {
    /// True when the keychain simply had nothing stored.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AuthError::Store(e) if e.is_not_found())
    }
}
