//! Keystone Core Library
//!
//! This crate provides client authentication and session establishment for
//! the Keystone API:
//! - Credential resolution (static token, personal access token, JWT)
//! - Stored sessions with refresh-on-expiry
//! - CSRF double-submit bootstrap on top of a cookie jar
//! - Interactive browser SSO login through a loopback callback listener
//! - Credential management (keyring with file fallback)
//!
//! # Features
//!
//! - `keyring-storage` (default): Use platform keyring for credential storage
//! - `file-storage`: Use file-based credential storage (for headless Linux)
//! - `browser` (default): Open the SSO login page in the default browser
//!
//! # Example
//!
//! ```no_run
//! use keystone_core::auth::{self, SessionClientFactory};
//! use keystone_core::cloud;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let factory = SessionClientFactory::new(cloud::load_client_config(), auth::default_store()?);
//!
//!     // Interactive login for an organization
//!     let login = factory.sso_flow()?.login("org_123", &CancellationToken::new()).await?;
//!     println!("Logged in, session stored: {}", login.session.is_some());
//!
//!     // Later invocations pick up the stored session
//!     let client = factory.client().await?;
//!     let response = client.get("/v1/me").await?;
//!     println!("{}", response.text().await?);
//!     auth::persist_session_cookies(&client, factory.store().as_ref());
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cloud;

// Re-export commonly used types
pub use auth::{
    AuthError, CredentialSource, SecretStore, SessionClientFactory, SsoFlow, SsoFlowConfig,
    SsoLogin, StaticCredential, StoreError, TokenPair,
};
pub use cloud::{ClientConfig, ClientOptions, CloudClient, ConfigSource};
