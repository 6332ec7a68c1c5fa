//! Keystone CLI - authenticate against a Keystone tenant and call its API
//!
//! This binary is the command-dispatch boundary for the core library:
//! - Log in through browser SSO or with a password
//! - Keep the stored session fresh
//! - Make authenticated API calls

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::{Input, Password};
use keystone_core::auth::{self, AuthError, SessionClientFactory, StaticCredential, TokenPair};
use keystone_core::cloud::{self, ClientConfig, ConfigSource};
use std::io::{self, BufRead, IsTerminal};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "keystone")]
#[command(author = "Keystone Maintainers")]
#[command(version)]
#[command(about = "Authenticate against a Keystone tenant and call its API")]
#[command(long_about = "
Keystone CLI obtains, refreshes and attaches credentials for the Keystone API.

Quick start:
  1. Log in:             keystone login --email you@example.com
  2. Check the session:  keystone status
  3. Call the API:       keystone get /v1/me

Static credentials (KEYSTONE_TOKEN, KEYSTONE_PAT, KEYSTONE_JWT) take
precedence over the stored session.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// API endpoint, overrides KEYSTONE_API_URL and the config file
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Static API token, overrides every other credential source
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Log every HTTP request and response
    #[arg(long, global = true)]
    pub debug: bool,

    /// Skip the CSRF bootstrap request
    #[arg(long, global = true)]
    pub disable_csrf: bool,

    /// Seconds to wait for the SSO browser login
    #[arg(long, global = true)]
    pub sso_timeout: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in, through SSO when the account requires it
    Login {
        /// Account email, used to discover whether SSO is enforced
        #[arg(short, long)]
        email: Option<String>,

        /// Go straight to SSO for this organization
        #[arg(short, long)]
        org: Option<String>,

        /// Read the password from stdin instead of prompting
        #[arg(long)]
        password_stdin: bool,
    },

    /// Refresh the stored access token if it has expired
    Refresh,

    /// Show which credential is in use and the session state
    Status,

    /// Make an authenticated GET request and print the response body
    Get {
        /// API path, e.g. /v1/me
        path: String,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose || cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("keystone={},keystone_core={}", log_level, log_level).into()
            }),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = client_config(&cli);
    let store = auth::default_store().context("Failed to open credential storage")?;
    let factory = SessionClientFactory::new(config, store);

    match &cli.command {
        Commands::Login {
            email,
            org,
            password_stdin,
        } => cmd_login(&cli, &factory, email.as_deref(), org.as_deref(), *password_stdin).await,
        Commands::Refresh => cmd_refresh(&cli, &factory).await,
        Commands::Status => cmd_status(&cli, &factory),
        Commands::Get { path } => cmd_get(&cli, &factory, path).await,
        Commands::Config => cmd_config(&cli, &factory),
    }
}

/// Environment and config file, then command-line flags on top.
fn client_config(cli: &Cli) -> ClientConfig {
    let mut config = cloud::load_client_config();
    if let Some(url) = cli.api_url.as_deref().filter(|u| !u.trim().is_empty()) {
        config.api_url = url.trim_end_matches('/').to_string();
        config.source = ConfigSource::CommandLine;
    }
    if let Some(token) = cli.token.as_deref().filter(|t| !t.trim().is_empty()) {
        config.auth.token = Some(token.to_string());
    }
    if cli.debug {
        config.debug = true;
    }
    if cli.disable_csrf {
        config.disable_csrf = true;
    }
    if let Some(secs) = cli.sso_timeout.filter(|s| *s > 0) {
        config.sso.timeout = Duration::from_secs(secs);
    }
    config
}

/// Cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted, canceling");
            trigger.cancel();
        }
    });
    cancel
}

fn prompt_email() -> Result<String> {
    if !io::stdin().is_terminal() {
        bail!("--email is required in non-interactive mode");
    }
    let email = Input::<String>::new()
        .with_prompt("Email")
        .interact_text()
        .context("Failed to read email")?;
    Ok(email.trim().to_string())
}

fn read_password(from_stdin: bool) -> Result<String> {
    if from_stdin {
        return password_from(io::stdin().lock());
    }
    if !io::stdin().is_terminal() {
        bail!("No terminal to prompt for a password, pass --password-stdin");
    }
    Password::new()
        .with_prompt("Password")
        .allow_empty_password(false)
        .interact()
        .context("Failed to read password")
}

/// First line of `reader`, without the line ending.
fn password_from(mut reader: impl BufRead) -> Result<String> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("Empty password on stdin");
    }
    Ok(password.to_string())
}

fn expiry_string(pair: &TokenPair) -> Option<String> {
    pair.expires_at().ok().map(|at| at.to_rfc3339())
}

async fn cmd_login(
    cli: &Cli,
    factory: &SessionClientFactory,
    email: Option<&str>,
    org: Option<&str>,
    password_stdin: bool,
) -> Result<()> {
    if let StaticCredential::Found { source, .. } = auth::resolve_static_token(&factory.config().auth) {
        tracing::warn!(
            "A static {} is configured and will be used instead of the login session",
            source
        );
    }

    let organization_id = match org {
        Some(org) => org.to_string(),
        None => {
            let email = match email {
                Some(email) => email.to_string(),
                None if password_stdin => bail!("--email is required with --password-stdin"),
                None => prompt_email()?,
            };
            if email.is_empty() {
                bail!("An email address is required to log in");
            }

            let client = factory.anonymous_client().await?;
            let sso = client
                .sso_status(&email)
                .await
                .context("Failed to check SSO requirements")?;

            if !sso.enforced {
                let password = read_password(password_stdin)?;
                let pair = factory.login_with_password(&email, &password).await?;
                return print_login(cli, "password", &pair, None);
            }

            let org = sso
                .organization_id
                .context("SSO is enforced but the server did not name an organization, pass --org")?;
            if let Some(provider) = &sso.provider {
                tracing::info!("SSO is enforced through {}", provider);
            }
            org
        }
    };

    let flow = factory.sso_flow()?;
    if let OutputFormat::Text = cli.format {
        println!(
            "Waiting up to {}s for the browser login to complete (Ctrl-C to cancel)...",
            flow.config().timeout.as_secs()
        );
    }

    let login = match flow.login(&organization_id, &interrupt_token()).await {
        Ok(login) => login,
        Err(AuthError::Canceled) => bail!("Login canceled"),
        Err(AuthError::TimedOut(after)) => {
            bail!("Login timed out after {}s, run `keystone login` again", after.as_secs())
        }
        Err(e) => return Err(e).context("SSO login failed"),
    };

    print_login(cli, "sso", &login.tokens, Some(&organization_id))
}

fn print_login(
    cli: &Cli,
    method: &str,
    pair: &TokenPair,
    organization_id: Option<&str>,
) -> Result<()> {
    match cli.format {
        OutputFormat::Text => {
            println!();
            match organization_id {
                Some(org) => println!("Logged in to organization '{}' via {}", org, method),
                None => println!("Logged in via {}", method),
            }
            if let Some(expiry) = expiry_string(pair) {
                println!("Access token expires: {}", expiry);
            }
            println!("Credentials stored in {}", auth::storage_description());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "status": "logged_in",
                    "method": method,
                    "organization_id": organization_id,
                    "expires_at": expiry_string(pair),
                })
            );
        }
    }
    Ok(())
}

async fn cmd_refresh(cli: &Cli, factory: &SessionClientFactory) -> Result<()> {
    let pair = match factory.fresh_token_pair().await {
        Ok(pair) => pair,
        Err(e) if e.is_not_found() => return Err(AuthError::NotLoggedIn.into()),
        Err(e) => return Err(e.into()),
    };

    match cli.format {
        OutputFormat::Text => {
            println!("Session is valid");
            if let Some(expiry) = expiry_string(&pair) {
                println!("Access token expires: {}", expiry);
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "status": "valid",
                    "expires_at": expiry_string(&pair),
                })
            );
        }
    }
    Ok(())
}

fn cmd_status(cli: &Cli, factory: &SessionClientFactory) -> Result<()> {
    let store = factory.store().as_ref();
    let static_source = match auth::resolve_static_token(&factory.config().auth) {
        StaticCredential::Found { source, .. } => Some(source.to_string()),
        StaticCredential::NotConfigured => None,
    };

    let pair = match auth::load_token_pair(store) {
        Ok(pair) => Some(pair),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e).context("Failed to read stored credentials"),
    };
    let has_session = auth::load_session(store)
        .context("Failed to read stored session")?
        .is_some();
    let expires_at = pair.as_ref().and_then(expiry_string);
    let expired = pair.as_ref().and_then(|p| p.is_expired().ok());

    match cli.format {
        OutputFormat::Text => {
            match (&static_source, &pair) {
                (Some(source), _) => println!("Status:  Using {} from configuration", source),
                (None, Some(_)) => println!("Status:  Logged in"),
                (None, None) => println!("Status:  Not logged in"),
            }
            if pair.is_some() {
                let state = match expired {
                    Some(true) => " (expired, will refresh on next use)",
                    Some(false) => "",
                    None => " (unreadable)",
                };
                println!(
                    "Access:  expires {}{}",
                    expires_at.as_deref().unwrap_or("-"),
                    state
                );
                println!("Session: {}", if has_session { "stored" } else { "none" });
            }
            println!();
            println!("Storage: {}", auth::storage_description());
            if static_source.is_none() && pair.is_none() {
                println!();
                println!("Run 'keystone login' to authenticate.");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "authenticated": static_source.is_some() || pair.is_some(),
                    "credential_source": static_source
                        .clone()
                        .or_else(|| pair.as_ref().map(|_| "stored session".to_string())),
                    "access_token_expires_at": expires_at,
                    "access_token_expired": expired,
                    "session_stored": has_session,
                    "storage_info": auth::storage_description(),
                })
            );
        }
    }

    Ok(())
}

async fn cmd_get(cli: &Cli, factory: &SessionClientFactory, path: &str) -> Result<()> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    let client = factory.client().await?;
    let response = client
        .get(&path)
        .await
        .with_context(|| format!("GET {} failed", path))?;
    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;

    auth::persist_session_cookies(&client, factory.store().as_ref());

    match cli.format {
        OutputFormat::Text => println!("{}", body),
        OutputFormat::Json => {
            let body = serde_json::from_str::<serde_json::Value>(&body)
                .unwrap_or(serde_json::Value::String(body));
            println!(
                "{}",
                serde_json::json!({
                    "status": status.as_u16(),
                    "body": body,
                })
            );
        }
    }

    if !status.is_success() {
        bail!("Server returned {}", status);
    }
    Ok(())
}

fn cmd_config(cli: &Cli, factory: &SessionClientFactory) -> Result<()> {
    let config = factory.config();
    let config_path = cloud::config::get_config_file_path_string();
    let credential = match auth::resolve_static_token(&config.auth) {
        StaticCredential::Found { source, .. } => source.to_string(),
        StaticCredential::NotConfigured => "stored session".to_string(),
    };

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("API endpoint:     {} (from {})", config.api_url, config.source);
            println!("Credential:       {}", credential);
            println!("Credential store: {}", auth::storage_description());
            println!("SSO listener:     {}", config.sso.listen_address);
            println!("SSO timeout:      {}s", config.sso.timeout.as_secs());
            println!("Debug logging:    {}", config.debug);
            println!("CSRF bootstrap:   {}", if config.disable_csrf { "disabled" } else { "enabled" });
            println!();
            println!("Environment variables:");
            println!("  KEYSTONE_API_URL            - Override API endpoint");
            println!("  KEYSTONE_TOKEN              - Static API token");
            println!("  KEYSTONE_PAT                - Personal access token");
            println!("  KEYSTONE_JWT                - Raw JWT");
            println!("  KEYSTONE_DEBUG              - Log HTTP requests (true/false)");
            println!("  KEYSTONE_DISABLE_CSRF       - Skip CSRF bootstrap (true/false)");
            println!("  KEYSTONE_SSO_LISTEN_ADDRESS - SSO callback address");
            println!("  KEYSTONE_SSO_TIMEOUT        - SSO timeout in seconds");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", cloud::config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "api_url": config.api_url,
                    "api_source": config.source.to_string(),
                    "credential": credential,
                    "credential_storage": auth::storage_description(),
                    "sso_listen_address": config.sso.listen_address.to_string(),
                    "sso_timeout_secs": config.sso.timeout.as_secs(),
                    "debug": config.debug,
                    "disable_csrf": config.disable_csrf,
                })
            );
        }
    }

    Ok(())
}
