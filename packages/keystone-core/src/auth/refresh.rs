//! Access token lifecycle: keep the stored pair usable, refreshing once on expiry.

use crate::auth::credentials::{SecretStore, store_token_pair};
use crate::auth::error::AuthError;
use crate::auth::token::TokenPair;
use std::future::Future;

/// Mints a new access/refresh pair from a valid refresh token.
pub trait Reauthenticator {
    fn refresh(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenPair, AuthError>> + Send;
}

/// Return a pair whose access token is not expired.
///
/// An unexpired pair comes back untouched without any network traffic. An
/// expired one is exchanged exactly once; on success the new pair is stored
/// before it is returned. Any refresh failure is final for this invocation,
/// a rejected refresh token will not become valid by retrying.
pub async fn ensure_fresh<R>(
    pair: TokenPair,
    reauthenticator: &R,
    store: &dyn SecretStore,
) -> Result<TokenPair, AuthError>
where
    R: Reauthenticator,
{
    if !pair.is_expired()? {
        tracing::debug!("Access token still valid");
        return Ok(pair);
    }

    tracing::info!("Access token expired, refreshing");
    let refreshed = reauthenticator
        .refresh(&pair.refresh_token)
        .await
        .map_err(|e| match e {
            AuthError::RefreshFailed(_) => e,
            other => AuthError::RefreshFailed(other.to_string()),
        })?;

    if refreshed.access_token.is_empty() || refreshed.refresh_token.is_empty() {
        return Err(AuthError::RefreshFailed(
            "server returned an incomplete token pair".into(),
        ));
    }

    store_token_pair(store, &refreshed)?;
    tracing::info!("Access token refreshed");
    Ok(refreshed)
}
