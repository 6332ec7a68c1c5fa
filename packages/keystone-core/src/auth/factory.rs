//! Builds ready-to-use API clients from configuration and the credential store.

use crate::auth::credentials::{
    SecretStore, load_session, load_token_pair, store_session, store_token_pair,
};
use crate::auth::csrf::client_with_csrf_token;
use crate::auth::error::AuthError;
use crate::auth::refresh::{Reauthenticator, ensure_fresh};
use crate::auth::resolver::{StaticCredential, resolve_static_token};
use crate::auth::sso::SsoFlow;
use crate::auth::token::TokenPair;
use crate::cloud::config::ClientConfig;
use crate::cloud::{ClientOptions, CloudClient};
use reqwest::cookie::Jar;
use std::sync::Arc;

/// Client factory owned by the command-dispatch boundary.
///
/// Every client it returns has its own cookie jar and, unless disabled by
/// configuration, has completed the CSRF bootstrap. Credentials on a
/// returned client never change; a refreshed credential means a new client.
pub struct SessionClientFactory {
    config: ClientConfig,
    store: Arc<dyn SecretStore>,
}

impl SessionClientFactory {
    pub fn new(config: ClientConfig, store: Arc<dyn SecretStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    /// Authenticated client from the highest-priority credential available.
    ///
    /// Static credentials win; otherwise the stored session is used. An
    /// empty keychain is reported as [`AuthError::NotLoggedIn`].
    pub async fn client(&self) -> Result<CloudClient, AuthError> {
        match resolve_static_token(&self.config.auth) {
            StaticCredential::Found { source, token } => {
                tracing::debug!("Authenticating with {} from configuration", source);
                self.with_static_token(&token).await
            }
            StaticCredential::NotConfigured => {
                tracing::debug!("No static credential configured, using stored session");
                self.with_stored_session().await.map_err(|e| {
                    if e.is_not_found() {
                        AuthError::NotLoggedIn
                    } else {
                        e
                    }
                })
            }
        }
    }

    pub async fn with_static_token(&self, token: &str) -> Result<CloudClient, AuthError> {
        let client = CloudClient::new(
            &self.config.api_url,
            ClientOptions {
                bearer_token: Some(token.to_string()),
                ..self.base_options()
            },
        )?;
        self.finish(client).await
    }

    /// Client carrying the stored bearer token and session cookie, refreshing
    /// the pair first when the access token has expired.
    pub async fn with_stored_session(&self) -> Result<CloudClient, AuthError> {
        let pair = self.fresh_token_pair().await?;
        let session = load_session(self.store.as_ref())?;
        if session.is_none() {
            tracing::debug!("No stored session, continuing with bearer token only");
        }

        let client = CloudClient::new(
            &self.config.api_url,
            ClientOptions {
                bearer_token: Some(pair.access_token),
                session,
                ..self.base_options()
            },
        )?;
        self.finish(client).await
    }

    /// Stored token pair, refreshed once if expired.
    pub async fn fresh_token_pair(&self) -> Result<TokenPair, AuthError> {
        let pair = load_token_pair(self.store.as_ref())?;
        ensure_fresh(pair, self, self.store.as_ref()).await
    }

    /// Unauthenticated client for login, refresh and discovery endpoints.
    pub async fn anonymous_client(&self) -> Result<CloudClient, AuthError> {
        let client = CloudClient::new(&self.config.api_url, self.base_options())?;
        self.finish(client).await
    }

    /// Password login for accounts without enforced SSO; stores the result.
    pub async fn login_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<TokenPair, AuthError> {
        let client = self.anonymous_client().await?;
        let (pair, session) = client.login(email, password).await?;
        store_token_pair(self.store.as_ref(), &pair)?;
        if let Some(session) = session {
            store_session(self.store.as_ref(), &session)?;
        }
        tracing::info!("Logged in as {}", email);
        Ok(pair)
    }

    /// SSO flow against the configured API, using the configured listener
    /// address and timeout.
    pub fn sso_flow(&self) -> Result<SsoFlow, AuthError> {
        let client = CloudClient::new(&self.config.api_url, ClientOptions::default())?;
        Ok(SsoFlow::new(
            client,
            self.store.clone(),
            self.config.sso.clone(),
        ))
    }

    fn base_options(&self) -> ClientOptions {
        ClientOptions {
            debug: self.config.debug,
            cookie_jar: Some(Arc::new(Jar::default())),
            ..Default::default()
        }
    }

    async fn finish(&self, client: CloudClient) -> Result<CloudClient, AuthError> {
        if self.config.disable_csrf {
            tracing::debug!("CSRF bootstrap disabled by configuration");
            return Ok(client);
        }
        client_with_csrf_token(&client).await
    }
}

/// Refreshes through a fresh anonymous client, built only when needed.
impl Reauthenticator for SessionClientFactory {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        self.anonymous_client().await?.refresh(refresh_token).await
    }
}

/// Write session and auth cookies the server handed out back to the store.
///
/// Best effort: failures are logged, never returned.
pub fn persist_session_cookies(client: &CloudClient, store: &dyn SecretStore) {
    match client.session_from_cookie_jar() {
        Ok(Some(session)) => match store_session(store, &session) {
            Ok(()) => tracing::debug!("Persisted session cookie"),
            Err(e) => tracing::warn!("Failed to persist session cookie: {}", e),
        },
        Ok(None) => {}
        Err(e) => {
            tracing::debug!("Skipping cookie persistence: {}", e);
            return;
        }
    }

    if let Some(pair) = client.auth_tokens_from_cookie_jar() {
        match store_token_pair(store, &pair) {
            Ok(()) => tracing::debug!("Persisted auth cookies"),
            Err(e) => tracing::warn!("Failed to persist auth cookies: {}", e),
        }
    }
}
