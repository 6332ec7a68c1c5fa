//! Browser-redirect SSO login.
//!
//! The flow binds a loopback listener, sends the user's browser to the API's
//! SSO entry point with the listener as the `return` URL, and waits for the
//! first redirect to come back carrying the auth cookies. Exactly one of
//! {callback, cancellation, timeout} decides the outcome, and the listener is
//! closed before [`SsoFlow::login`] returns in every case.

use crate::auth::credentials::{SecretStore, store_session, store_token_pair};
use crate::auth::error::AuthError;
use crate::auth::token::TokenPair;
use crate::cloud::{ACCESS_TOKEN_COOKIE, CloudClient, REFRESH_TOKEN_COOKIE, parse_cookie_header};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header::COOKIE};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SSO_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a stopping callback server may take to finish its last response
const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUCCESS_BODY: &str = "Login successful. You can close this window and return to the terminal.";
const INCOMPLETE_BODY: &str =
    "Login failed: the redirect did not carry a complete session. Run `keystone login` again.";
const FAILURE_BODY: &str = "Login failed: the session could not be saved. Check the terminal.";
const ALREADY_COMPLETED_BODY: &str = "Login already completed. You can close this window.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoFlowConfig {
    /// Loopback address for the callback listener; port 0 lets the OS pick.
    pub listen_address: SocketAddr,
    pub timeout: Duration,
}

impl Default for SsoFlowConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            timeout: DEFAULT_SSO_TIMEOUT,
        }
    }
}

/// Opens a URL in the user's browser.
pub type BrowserOpener = Arc<dyn Fn(&str) -> io::Result<()> + Send + Sync>;

/// Platform default browser, or an `Unsupported` error when built without
/// the `browser` feature.
pub fn default_browser_opener() -> BrowserOpener {
    Arc::new(|url: &str| {
        #[cfg(feature = "browser")]
        {
            webbrowser::open(url)
        }
        #[cfg(not(feature = "browser"))]
        {
            let _ = url;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "built without browser support",
            ))
        }
    })
}

/// Credentials captured from the SSO redirect.
#[derive(Clone, PartialEq, Eq)]
pub struct SsoLogin {
    pub tokens: TokenPair,
    pub session: Option<String>,
}

impl fmt::Debug for SsoLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsoLogin")
            .field("tokens", &self.tokens)
            .field("session", &self.session.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

type CallbackResult = Result<SsoLogin, AuthError>;

struct CallbackState {
    /// Single-slot result; the first request takes the sender.
    result: Mutex<Option<oneshot::Sender<CallbackResult>>>,
    store: Arc<dyn SecretStore>,
    session_cookie: &'static str,
    shutdown: CancellationToken,
}

pub struct SsoFlow {
    client: CloudClient,
    store: Arc<dyn SecretStore>,
    config: SsoFlowConfig,
    opener: BrowserOpener,
}

impl SsoFlow {
    /// `client` only provides the API base URL and the session cookie name;
    /// no request is made through it.
    pub fn new(client: CloudClient, store: Arc<dyn SecretStore>, config: SsoFlowConfig) -> Self {
        Self {
            client,
            store,
            config,
            opener: default_browser_opener(),
        }
    }

    pub fn with_browser_opener(mut self, opener: BrowserOpener) -> Self {
        self.opener = opener;
        self
    }

    pub fn config(&self) -> &SsoFlowConfig {
        &self.config
    }

    /// Run the interactive login for `organization_id`.
    ///
    /// The session is persisted by the callback handler as soon as it
    /// arrives; the token pair is persisted here once the flow completes.
    pub async fn login(
        &self,
        organization_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SsoLogin, AuthError> {
        if !self.config.listen_address.ip().is_loopback() {
            return Err(AuthError::NonLoopbackListener(self.config.listen_address));
        }
        let listener = TcpListener::bind(self.config.listen_address)
            .await
            .map_err(AuthError::ListenerBind)?;
        let local_addr = listener.local_addr().map_err(AuthError::ListenerBind)?;
        tracing::debug!("SSO callback listener bound on {}", local_addr);

        // Child token: the caller canceling also stops the server
        let shutdown = cancel.child_token();
        let (sender, receiver) = oneshot::channel();
        let state = Arc::new(CallbackState {
            result: Mutex::new(Some(sender)),
            store: self.store.clone(),
            session_cookie: self.client.session_cookie_name(),
            shutdown: shutdown.clone(),
        });
        let app = Router::new().fallback(handle_callback).with_state(state);
        let serve =
            axum::serve(listener, app).with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let server = tokio::spawn(async move {
            if let Err(e) = serve.await {
                tracing::warn!("SSO callback server failed: {}", e);
            }
        });

        let return_url = format!("http://{}", local_addr);
        let outcome = self
            .await_callback(organization_id, &return_url, receiver, cancel)
            .await;

        shutdown.cancel();
        stop_server(server).await;
        tracing::debug!("SSO callback listener on {} closed", local_addr);

        let login = outcome?;
        store_token_pair(self.store.as_ref(), &login.tokens)?;
        tracing::info!("SSO login completed");
        Ok(login)
    }

    async fn await_callback(
        &self,
        organization_id: &str,
        return_url: &str,
        receiver: oneshot::Receiver<CallbackResult>,
        cancel: &CancellationToken,
    ) -> CallbackResult {
        let login_url = self.client.sso_login_url(organization_id, return_url)?;
        self.open_browser(login_url.as_str());

        tracing::debug!("Waiting up to {:?} for the SSO callback", self.config.timeout);
        tokio::select! {
            result = receiver => result.unwrap_or(Err(AuthError::CallbackClosed)),
            _ = cancel.cancelled() => Err(AuthError::Canceled),
            _ = tokio::time::sleep(self.config.timeout) => Err(AuthError::TimedOut(self.config.timeout)),
        }
    }

    fn open_browser(&self, url: &str) {
        tracing::info!("Opening browser for SSO login");
        if let Err(e) = (self.opener)(url) {
            tracing::warn!("Failed to open browser automatically: {}", e);
            eprintln!("Open this URL in your browser to log in:\n\n  {}\n", url);
        }
    }
}

async fn stop_server(server: JoinHandle<()>) {
    let abort = server.abort_handle();
    if tokio::time::timeout(SERVER_SHUTDOWN_GRACE, server).await.is_err() {
        tracing::warn!(
            "SSO callback server did not stop within {:?}, aborting",
            SERVER_SHUTDOWN_GRACE
        );
        abort.abort();
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    headers: HeaderMap,
) -> (StatusCode, &'static str) {
    let sender = state
        .result
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let Some(sender) = sender else {
        tracing::debug!("Ignoring SSO callback after the first one");
        return (StatusCode::CONFLICT, ALREADY_COMPLETED_BODY);
    };

    let result = login_from_callback(&headers, state.session_cookie, state.store.as_ref());
    let reply = match &result {
        Ok(_) => (StatusCode::OK, SUCCESS_BODY),
        Err(AuthError::IncompleteCallback(reason)) => {
            tracing::warn!("Incomplete SSO callback: {}", reason);
            (StatusCode::BAD_REQUEST, INCOMPLETE_BODY)
        }
        Err(e) => {
            tracing::warn!("SSO callback failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY)
        }
    };

    if sender.send(result).is_err() {
        tracing::debug!("SSO callback arrived after the caller stopped waiting");
    }
    state.shutdown.cancel();
    reply
}

fn login_from_callback(
    headers: &HeaderMap,
    session_cookie: &str,
    store: &dyn SecretStore,
) -> CallbackResult {
    let cookies: Vec<(String, String)> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(parse_cookie_header)
        .collect();
    let find = |name: &str| {
        cookies
            .iter()
            .find(|(cookie_name, value)| cookie_name == name && !value.is_empty())
            .map(|(_, value)| value.clone())
    };
    let missing = |name: &str| AuthError::IncompleteCallback(format!("missing {} cookie", name));

    let access_token = find(ACCESS_TOKEN_COOKIE).ok_or_else(|| missing(ACCESS_TOKEN_COOKIE))?;
    let refresh_token = find(REFRESH_TOKEN_COOKIE).ok_or_else(|| missing(REFRESH_TOKEN_COOKIE))?;

    let session = find(session_cookie);
    match &session {
        Some(session) => {
            store_session(store, session)?;
            tracing::debug!("Stored session from SSO callback");
        }
        None => tracing::debug!("SSO callback carried no {} cookie", session_cookie),
    }

    Ok(SsoLogin {
        tokens: TokenPair::bearer(access_token, refresh_token),
        session,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::{MemoryStore, load_session, load_token_pair};
    use crate::cloud::ClientOptions;
    use axum::http::HeaderValue;
    use reqwest::Url;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const FULL_COOKIES: &str = "access_token=acc_1; refresh_token=ref_1; temporary-cookie=sess_1";

    fn flow(store: Arc<MemoryStore>, config: SsoFlowConfig, opener: BrowserOpener) -> SsoFlow {
        let client = CloudClient::new("http://localhost:17608", ClientOptions::default()).unwrap();
        SsoFlow::new(client, store, config).with_browser_opener(opener)
    }

    fn short(timeout: Duration) -> SsoFlowConfig {
        SsoFlowConfig {
            timeout,
            ..Default::default()
        }
    }

    fn return_url(login_url: &str) -> io::Result<String> {
        let url = Url::parse(login_url).map_err(io::Error::other)?;
        url.query_pairs()
            .find(|(name, _)| name == "return")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| io::Error::other("login url has no return parameter"))
    }

    /// Simulated browser: follows the redirect `requests` times at once.
    fn redirecting_browser(cookies: &'static str, requests: usize) -> BrowserOpener {
        Arc::new(move |url: &str| {
            let target = return_url(url)?;
            for _ in 0..requests {
                let target = target.clone();
                tokio::spawn(async move {
                    let _ = reqwest::Client::new()
                        .get(&target)
                        .header("Cookie", cookies)
                        .send()
                        .await;
                });
            }
            Ok(())
        })
    }

    fn idle_browser() -> BrowserOpener {
        Arc::new(|_: &str| Ok(()))
    }

    fn free_port() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = SsoFlowConfig::default();
        assert!(config.listen_address.ip().is_loopback());
        assert_eq!(config.listen_address.port(), 0);
        assert_eq!(config.timeout, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_callback_completes_login() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(
            store.clone(),
            short(Duration::from_secs(10)),
            redirecting_browser(FULL_COOKIES, 1),
        );

        let login = flow.login("org_1", &CancellationToken::new()).await.unwrap();

        assert_eq!(login.tokens, TokenPair::bearer("acc_1", "ref_1"));
        assert_eq!(login.session.as_deref(), Some("sess_1"));
        assert_eq!(load_token_pair(store.as_ref()).unwrap(), login.tokens);
        assert_eq!(load_session(store.as_ref()).unwrap().as_deref(), Some("sess_1"));
    }

    #[tokio::test]
    async fn test_concurrent_callbacks_deliver_one_result() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(
            store.clone(),
            short(Duration::from_secs(10)),
            redirecting_browser(FULL_COOKIES, 2),
        );

        let login = tokio::time::timeout(
            Duration::from_secs(10),
            flow.login("org_1", &CancellationToken::new()),
        )
        .await
        .expect("flow deadlocked")
        .unwrap();

        assert_eq!(login.tokens, TokenPair::bearer("acc_1", "ref_1"));
    }

    #[tokio::test]
    async fn test_handler_consumes_the_slot_once() {
        let store = Arc::new(MemoryStore::new());
        let (sender, mut receiver) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let state = Arc::new(CallbackState {
            result: Mutex::new(Some(sender)),
            store: store.clone(),
            session_cookie: "temporary-cookie",
            shutdown: shutdown.clone(),
        });
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static(FULL_COOKIES));

        let (first, _) = handle_callback(State(state.clone()), headers.clone()).await;
        let (second, _) = handle_callback(State(state), headers).await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::CONFLICT);
        assert!(shutdown.is_cancelled());
        let delivered = receiver.try_recv().unwrap().unwrap();
        assert_eq!(delivered.tokens, TokenPair::bearer("acc_1", "ref_1"));
    }

    #[tokio::test]
    async fn test_timeout_closes_listener() {
        let addr = free_port();
        let store = Arc::new(MemoryStore::new());
        let config = SsoFlowConfig {
            listen_address: addr,
            timeout: Duration::from_millis(50),
        };
        let flow = flow(store.clone(), config, idle_browser());

        let started = Instant::now();
        let err = flow.login("org_1", &CancellationToken::new()).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, AuthError::TimedOut(d) if d == Duration::from_millis(50)));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
        std::net::TcpListener::bind(addr).expect("listener still bound after timeout");
        assert!(load_token_pair(store.as_ref()).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cancellation_returns_promptly() {
        let addr = free_port();
        let config = SsoFlowConfig {
            listen_address: addr,
            timeout: Duration::from_secs(30),
        };
        let flow = flow(Arc::new(MemoryStore::new()), config, idle_browser());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = flow.login("org_1", &cancel).await.unwrap_err();

        assert!(matches!(err, AuthError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(2));
        std::net::TcpListener::bind(addr).expect("listener still bound after cancel");
    }

    #[tokio::test]
    async fn test_incomplete_callback_fails_without_waiting() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(
            store.clone(),
            short(Duration::from_secs(10)),
            redirecting_browser("access_token=acc_1; temporary-cookie=sess_1", 1),
        );

        let started = Instant::now();
        let err = flow.login("org_1", &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AuthError::IncompleteCallback(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(load_token_pair(store.as_ref()).unwrap_err().is_not_found());
        assert_eq!(load_session(store.as_ref()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_session_is_tolerated() {
        let store = Arc::new(MemoryStore::new());
        let flow = flow(
            store.clone(),
            short(Duration::from_secs(10)),
            redirecting_browser("access_token=acc_1; refresh_token=ref_1", 1),
        );

        let login = flow.login("org_1", &CancellationToken::new()).await.unwrap();

        assert_eq!(login.session, None);
        assert_eq!(load_session(store.as_ref()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_browser_failure_is_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let follow = redirecting_browser(FULL_COOKIES, 1);
        let failing: BrowserOpener = Arc::new(move |url: &str| {
            // The user opens the printed URL by hand
            follow(url)?;
            Err(io::Error::new(io::ErrorKind::NotFound, "no browser"))
        });
        let flow = flow(store, short(Duration::from_secs(10)), failing);

        let login = flow.login("org_1", &CancellationToken::new()).await.unwrap();

        assert_eq!(login.tokens.access_token, "acc_1");
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = SsoFlowConfig {
            listen_address: held.local_addr().unwrap(),
            timeout: Duration::from_secs(1),
        };
        let flow = flow(Arc::new(MemoryStore::new()), config, idle_browser());

        let err = flow.login("org_1", &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AuthError::ListenerBind(_)));
    }

    #[tokio::test]
    async fn test_non_loopback_listener_is_rejected() {
        let config = SsoFlowConfig {
            listen_address: "0.0.0.0:0".parse().unwrap(),
            timeout: Duration::from_secs(1),
        };
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let flow = flow(
            Arc::new(MemoryStore::new()),
            config,
            Arc::new(move |_url: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let err = flow.login("org_1", &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AuthError::NonLoopbackListener(addr) if addr.port() == 0));
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_debug_redacts_session() {
        let login = SsoLogin {
            tokens: TokenPair::bearer("acc_secret", "ref_secret"),
            session: Some("sess_secret".into()),
        };
        let rendered = format!("{:?}", login);
        assert!(!rendered.contains("secret"));
    }
}
