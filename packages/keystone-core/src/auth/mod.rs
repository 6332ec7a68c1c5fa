//! Authentication for the Keystone API.
//!
//! Credential resolution, token lifecycle, CSRF bootstrap, and the
//! interactive SSO login, on top of a platform credential store.

pub mod credentials;
pub mod csrf;
pub mod error;
mod factory;
pub mod refresh;
mod resolver;
pub mod sso;
pub mod token;

pub use credentials::{
    FileStore, MemoryStore, SecretStore, default_store, load_session, load_token_pair,
    storage_description, store_session, store_token_pair,
};
#[cfg(feature = "keyring-storage")]
pub use credentials::KeyringStore;
pub use csrf::{client_with_csrf_token, fetch_csrf_token};
pub use error::{AuthError, StoreError};
pub use factory::{SessionClientFactory, persist_session_cookies};
pub use refresh::{Reauthenticator, ensure_fresh};
pub use resolver::{CredentialSource, StaticCredential, resolve_static_token};
pub use sso::{BrowserOpener, SsoFlow, SsoFlowConfig, SsoLogin, default_browser_opener};
pub use token::{TokenPair, access_token_expiry};
