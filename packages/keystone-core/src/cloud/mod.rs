//! HTTP access to the Keystone API.

mod client;
pub mod config;

pub use client::{
    ACCESS_TOKEN_COOKIE, CSRF_COOKIE, CSRF_HEADER, ClientOptions, CloudClient, DEV_SESSION_COOKIE,
    LIVENESS_PATH, REFRESH_TOKEN_COOKIE, SESSION_COOKIE, SsoStatus, session_cookie_name,
};
pub(crate) use client::parse_cookie_header;
pub use config::{ClientConfig, ConfigSource, load_client_config};
