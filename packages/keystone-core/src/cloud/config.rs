use crate::auth::sso::SsoFlowConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default API URL
const DEFAULT_API_URL: &str = "https://api.keystone.dev";

/// Environment variable names, checked before the config file
const ENV_API_URL: &str = "KEYSTONE_API_URL";
const ENV_TOKEN: &str = "KEYSTONE_TOKEN";
const ENV_PAT: &str = "KEYSTONE_PAT";
const ENV_JWT: &str = "KEYSTONE_JWT";
const ENV_DEBUG: &str = "KEYSTONE_DEBUG";
const ENV_DISABLE_CSRF: &str = "KEYSTONE_DISABLE_CSRF";
const ENV_SSO_LISTEN_ADDRESS: &str = "KEYSTONE_SSO_LISTEN_ADDRESS";
const ENV_SSO_TIMEOUT: &str = "KEYSTONE_SSO_TIMEOUT";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    api: Option<ApiSection>,
    auth: Option<AuthSection>,
    sso: Option<SsoSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiSection {
    /// API endpoint URL (e.g., "https://keystone.example.com")
    url: Option<String>,
    debug: Option<bool>,
    disable_csrf: Option<bool>,
}

#[derive(Deserialize, Default)]
struct AuthSection {
    token: Option<String>,
    pat: Option<String>,
    jwt: Option<String>,
}

impl fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSection").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, Default)]
struct SsoSection {
    listen_address: Option<String>,
    timeout_secs: Option<u64>,
}

/// Static credentials, in the priority order the resolver walks them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthSettings {
    /// Explicit API token
    pub token: Option<String>,
    /// Personal access token
    pub pat: Option<String>,
    /// Raw JWT
    pub jwt: Option<String>,
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("AuthSettings")
            .field("token", &set(&self.token))
            .field("pat", &set(&self.pat))
            .field("jwt", &set(&self.jwt))
            .finish()
    }
}

/// Runtime client configuration, passed explicitly to every component.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for API calls (e.g., "https://api.keystone.dev")
    pub api_url: String,
    /// Source of the API URL (for display)
    pub source: ConfigSource,
    pub auth: AuthSettings,
    /// Log every request and response
    pub debug: bool,
    /// Skip the CSRF bootstrap request
    pub disable_csrf: bool,
    pub sso: SsoFlowConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            source: ConfigSource::Default,
            auth: AuthSettings::default(),
            debug: false,
            disable_csrf: false,
            sso: SsoFlowConfig::default(),
        }
    }
}

/// Where the configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// Loaded from environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
    /// Overridden by a command-line flag
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
            ConfigSource::CommandLine => write!(f, "command line"),
        }
    }
}

/// Get the keystone config directory
pub(crate) fn keystone_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Failed to find config directory")?;
    Ok(config_dir.join("keystone"))
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    keystone_config_dir().ok().map(|p| p.join("config.toml"))
}

/// Parse configuration file contents
pub fn parse_config_file(content: &str) -> Result<ConfigFile> {
    toml::from_str(content).context("Failed to parse config file")
}

/// Load configuration from the config file
fn load_config_file() -> Option<ConfigFile> {
    let path = get_config_file_path()?;

    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {:#}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(name: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => None,
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!("Ignoring {}={:?}: expected a boolean", name, other);
            None
        }
    }
}

/// The SSO callback receives tokens, so only loopback addresses are accepted.
fn parse_listen_address(name: &str, raw: &str) -> Option<SocketAddr> {
    match raw.trim().parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_loopback() => Some(addr),
        Ok(addr) => {
            tracing::warn!("Ignoring {}={}: not a loopback address", name, addr);
            None
        }
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

fn parse_timeout_secs(name: &str, raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!("Ignoring {}={:?}: expected a positive number of seconds", name, raw);
            None
        }
    }
}

impl ClientConfig {
    /// Merge configuration layers with priority:
    /// 1. Environment variables (looked up through `env`)
    /// 2. Config file
    /// 3. Default values
    pub fn from_layers<F>(env: F, file: Option<ConfigFile>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = file.unwrap_or_default();
        let api = file.api.unwrap_or_default();
        let auth = file.auth.unwrap_or_default();
        let sso = file.sso.unwrap_or_default();
        let mut config = ClientConfig::default();

        // API URL
        if let Some(url) = non_empty(env(ENV_API_URL)) {
            tracing::info!("Using API URL from environment variable: {}", url);
            config.api_url = url.trim_end_matches('/').to_string();
            config.source = ConfigSource::Environment;
        } else if let Some(url) = non_empty(api.url) {
            tracing::info!("Using API URL from config file: {}", url);
            config.api_url = url.trim_end_matches('/').to_string();
            config.source = ConfigSource::ConfigFile;
        } else {
            tracing::debug!("Using default API URL: {}", DEFAULT_API_URL);
        }

        // Static credentials are resolved per field, env first
        config.auth = AuthSettings {
            token: non_empty(env(ENV_TOKEN)).or_else(|| non_empty(auth.token)),
            pat: non_empty(env(ENV_PAT)).or_else(|| non_empty(auth.pat)),
            jwt: non_empty(env(ENV_JWT)).or_else(|| non_empty(auth.jwt)),
        };

        config.debug = env(ENV_DEBUG)
            .and_then(|v| parse_bool(ENV_DEBUG, &v))
            .or(api.debug)
            .unwrap_or(false);
        config.disable_csrf = env(ENV_DISABLE_CSRF)
            .and_then(|v| parse_bool(ENV_DISABLE_CSRF, &v))
            .or(api.disable_csrf)
            .unwrap_or(false);

        if let Some(addr) = env(ENV_SSO_LISTEN_ADDRESS)
            .and_then(|v| parse_listen_address(ENV_SSO_LISTEN_ADDRESS, &v))
            .or_else(|| {
                sso.listen_address
                    .as_deref()
                    .and_then(|v| parse_listen_address("sso.listen_address", v))
            })
        {
            config.sso.listen_address = addr;
        }

        if let Some(timeout) = env(ENV_SSO_TIMEOUT)
            .and_then(|v| parse_timeout_secs(ENV_SSO_TIMEOUT, &v))
            .or_else(|| sso.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs))
        {
            config.sso.timeout = timeout;
        }

        config
    }
}

/// Load client configuration from the process environment and the config file.
pub fn load_client_config() -> ClientConfig {
    ClientConfig::from_layers(|name| std::env::var(name).ok(), load_config_file())
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/keystone/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# Keystone CLI Configuration
# Place this file at: ~/.config/keystone/config.toml

[api]
# API endpoint URL for self-hosted instances
# Default: https://api.keystone.dev
# url = "https://keystone.example.com"
# debug = false
# disable_csrf = false

[auth]
# Static credentials, used in this order when set.
# Prefer the KEYSTONE_TOKEN / KEYSTONE_PAT environment variables.
# token = ""
# pat = ""
# jwt = ""

[sso]
# listen_address = "127.0.0.1:0"
# timeout_secs = 120
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_layers(env_of(&[]), None);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.source, ConfigSource::Default);
        assert_eq!(config.auth, AuthSettings::default());
        assert!(!config.debug);
        assert!(!config.disable_csrf);
        assert_eq!(config.sso.timeout, Duration::from_secs(120));
        assert_eq!(config.sso.listen_address.port(), 0);
        assert!(config.sso.listen_address.ip().is_loopback());
    }

    #[test]
    fn test_example_config_parses() {
        let file = parse_config_file(&generate_example_config()).unwrap();
        let config = ClientConfig::from_layers(env_of(&[]), Some(file));
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_file_layer() {
        let file = parse_config_file(
            r#"
[api]
url = "https://keystone.example.com/"
disable_csrf = true

[auth]
pat = "pat_from_file"

[sso]
listen_address = "127.0.0.1:8400"
timeout_secs = 30
"#,
        )
        .unwrap();
        let config = ClientConfig::from_layers(env_of(&[]), Some(file));

        assert_eq!(config.api_url, "https://keystone.example.com");
        assert_eq!(config.source, ConfigSource::ConfigFile);
        assert_eq!(config.auth.pat.as_deref(), Some("pat_from_file"));
        assert!(config.disable_csrf);
        assert_eq!(config.sso.listen_address.port(), 8400);
        assert_eq!(config.sso.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = parse_config_file(
            r#"
[api]
url = "https://file.example.com"
debug = false

[auth]
token = "file_token"
"#,
        )
        .unwrap();
        let env = env_of(&[
            (ENV_API_URL, "http://localhost:17608"),
            (ENV_TOKEN, "env_token"),
            (ENV_DEBUG, "true"),
            (ENV_SSO_TIMEOUT, "5"),
        ]);
        let config = ClientConfig::from_layers(env, Some(file));

        assert_eq!(config.api_url, "http://localhost:17608");
        assert_eq!(config.source, ConfigSource::Environment);
        assert_eq!(config.auth.token.as_deref(), Some("env_token"));
        assert!(config.debug);
        assert_eq!(config.sso.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_empty_env_bool_keeps_file_value() {
        let file = parse_config_file("[api]\ndebug = true\ndisable_csrf = true\n").unwrap();
        let env = env_of(&[(ENV_DEBUG, ""), (ENV_DISABLE_CSRF, "  ")]);
        let config = ClientConfig::from_layers(env, Some(file));

        assert!(config.debug);
        assert!(config.disable_csrf);
    }

    #[test]
    fn test_non_loopback_listen_address_is_ignored() {
        let env = env_of(&[(ENV_SSO_LISTEN_ADDRESS, "0.0.0.0:8400")]);
        let config = ClientConfig::from_layers(env, None);
        assert_eq!(config.sso.listen_address, SsoFlowConfig::default().listen_address);

        let file = parse_config_file("[sso]\nlisten_address = \"192.168.1.20:8400\"\n").unwrap();
        let config = ClientConfig::from_layers(env_of(&[]), Some(file));
        assert_eq!(config.sso.listen_address, SsoFlowConfig::default().listen_address);

        let env = env_of(&[(ENV_SSO_LISTEN_ADDRESS, "[::1]:8400")]);
        let config = ClientConfig::from_layers(env, None);
        assert_eq!(config.sso.listen_address, "[::1]:8400".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let env = env_of(&[
            (ENV_DEBUG, "sometimes"),
            (ENV_SSO_LISTEN_ADDRESS, "not-an-address"),
            (ENV_SSO_TIMEOUT, "0"),
            (ENV_TOKEN, "   "),
        ]);
        let config = ClientConfig::from_layers(env, None);

        assert!(!config.debug);
        assert_eq!(config.sso, SsoFlowConfig::default());
        assert_eq!(config.auth.token, None);
    }

    #[test]
    fn test_debug_output_hides_credentials() {
        let config = ClientConfig::from_layers(env_of(&[(ENV_TOKEN, "tok_secret")]), None);
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("tok_secret"));
    }
}
