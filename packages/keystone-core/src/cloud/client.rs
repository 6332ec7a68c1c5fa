use crate::auth::error::AuthError;
use crate::auth::refresh::Reauthenticator;
use crate::auth::token::TokenPair;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{AUTHORIZATION, COOKIE, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Header carrying the double-submit CSRF token on mutating requests
pub const CSRF_HEADER: &str = "X-CSRF-Token";
/// Cookie the server sets the CSRF token in (must match the server config)
pub const CSRF_COOKIE: &str = "ks.csrf-token";
/// Safe endpoint requested only to obtain the CSRF cookie
pub const LIVENESS_PATH: &str = "/livez";
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
/// Session cookie name for deployed environments
pub const SESSION_COOKIE: &str = "__Secure-SessionId";
/// Session cookie name when the API runs on the local machine
pub const DEV_SESSION_COOKIE: &str = "temporary-cookie";

const REFRESH_PATH: &str = "/v1/refresh";
const LOGIN_PATH: &str = "/v1/login";
const SSO_LOGIN_PATH: &str = "/v1/sso/login";
const WEBFINGER_PATH: &str = "/.well-known/webfinger";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials and behavior fixed at client construction.
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub bearer_token: Option<String>,
    pub session: Option<String>,
    pub csrf_token: Option<String>,
    /// Log every request/response under the `keystone_core::http` target
    pub debug: bool,
    pub cookie_jar: Option<Arc<Jar>>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("session", &self.session.as_ref().map(|_| "<redacted>"))
            .field("csrf_token", &self.csrf_token.as_ref().map(|_| "<redacted>"))
            .field("debug", &self.debug)
            .field("cookie_jar", &self.cookie_jar.is_some())
            .finish()
    }
}

/// HTTP client for the Keystone API.
///
/// Credentials never change on an existing client. Attaching a CSRF token or
/// a refreshed bearer token produces a new `CloudClient`.
#[derive(Clone)]
pub struct CloudClient {
    base_url: Url,
    options: ClientOptions,
    http: reqwest::Client,
}

impl fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudClient")
            .field("base_url", &self.base_url.as_str())
            .field("options", &self.options)
            .finish()
    }
}

/// Result of the webfinger SSO discovery lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SsoStatus {
    #[serde(default)]
    pub enforced: bool,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenReply {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

impl TokenReply {
    fn into_pair(self) -> (TokenPair, Option<String>) {
        let mut pair = TokenPair::bearer(self.access_token, self.refresh_token);
        if let Some(token_type) = self.token_type.filter(|t| !t.is_empty()) {
            pair.token_type = token_type;
        }
        (pair, self.session.filter(|s| !s.is_empty()))
    }
}

/// Split a `Cookie` header value into `(name, value)` pairs.
pub(crate) fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let (name, value) = part.split_once('=').unwrap_or((part, ""));
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Session cookie name the server uses for `base_url`.
pub fn session_cookie_name(base_url: &Url) -> &'static str {
    let host = base_url
        .host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']');
    let local = host == "localhost" || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback());
    if local { DEV_SESSION_COOKIE } else { SESSION_COOKIE }
}

fn parse_url(raw: &str) -> Result<Url, AuthError> {
    Url::parse(raw).map_err(|e| AuthError::InvalidUrl(format!("{}: {}", raw, e)))
}

impl CloudClient {
    pub fn new(base_url: &str, options: ClientOptions) -> Result<Self, AuthError> {
        let base_url = parse_url(base_url.trim_end_matches('/'))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &options.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| AuthError::InvalidCredential)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let session_cookie = options
            .session
            .as_ref()
            .map(|session| format!("{}={}", session_cookie_name(&base_url), session));

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        match (&options.cookie_jar, session_cookie) {
            (Some(jar), session_cookie) => {
                if let Some(cookie) = session_cookie {
                    let secure = if base_url.scheme() == "https" { "; Secure" } else { "" };
                    jar.add_cookie_str(&format!("{}; Path=/{}", cookie, secure), &base_url);
                }
                builder = builder.cookie_provider(jar.clone());
            }
            (None, Some(cookie)) => {
                let mut value =
                    HeaderValue::from_str(&cookie).map_err(|_| AuthError::InvalidCredential)?;
                value.set_sensitive(true);
                headers.insert(COOKIE, value);
            }
            (None, None) => {}
        }

        let http = builder.default_headers(headers).build()?;

        Ok(Self {
            base_url,
            options,
            http,
        })
    }

    /// Same client with `csrf_token` attached to every mutating request.
    ///
    /// The cookie jar is carried over, so cookies set while bootstrapping
    /// (CSRF, session, auth) stay visible to the new client.
    pub fn with_csrf_token(&self, csrf_token: Option<String>) -> Self {
        let mut options = self.options.clone();
        options.csrf_token = csrf_token.filter(|t| !t.is_empty());
        Self {
            base_url: self.base_url.clone(),
            options,
            http: self.http.clone(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn csrf_token(&self) -> Option<&str> {
        self.options.csrf_token.as_deref()
    }

    pub fn cookie_jar(&self) -> Option<&Arc<Jar>> {
        self.options.cookie_jar.as_ref()
    }

    /// Cookies the jar would send to the API base URL.
    pub fn cookies(&self) -> Result<Vec<(String, String)>, AuthError> {
        let jar = self.cookie_jar().ok_or(AuthError::NoCookieJar)?;
        Ok(jar
            .cookies(&self.base_url)
            .and_then(|header| header.to_str().ok().map(parse_cookie_header))
            .unwrap_or_default())
    }

    pub fn cookie(&self, name: &str) -> Result<Option<String>, AuthError> {
        Ok(self
            .cookies()?
            .into_iter()
            .find(|(cookie_name, _)| cookie_name == name)
            .map(|(_, value)| value))
    }

    pub fn session_cookie_name(&self) -> &'static str {
        session_cookie_name(&self.base_url)
    }

    /// Session identifier currently held in the cookie jar
    pub fn session_from_cookie_jar(&self) -> Result<Option<String>, AuthError> {
        Ok(self
            .cookie(self.session_cookie_name())?
            .filter(|session| !session.is_empty()))
    }

    /// Access/refresh pair from the auth cookies, only when both are set
    pub fn auth_tokens_from_cookie_jar(&self) -> Option<TokenPair> {
        let cookies = self.cookies().ok()?;
        let find = |name: &str| {
            cookies
                .iter()
                .find(|(cookie_name, value)| cookie_name == name && !value.is_empty())
                .map(|(_, value)| value.clone())
        };
        Some(TokenPair::bearer(
            find(ACCESS_TOKEN_COOKIE)?,
            find(REFRESH_TOKEN_COOKIE)?,
        ))
    }

    pub fn url(&self, path: &str) -> Result<Url, AuthError> {
        parse_url(&format!(
            "{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            path
        ))
    }

    /// Start a request; mutating methods carry the CSRF header when known.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, AuthError> {
        let mutating = !method.is_safe();
        let mut request = self.http.request(method, self.url(path)?);
        if mutating {
            if let Some(csrf_token) = &self.options.csrf_token {
                request = request.header(CSRF_HEADER, csrf_token);
            }
        }
        Ok(request)
    }

    /// Send a request, logging it when the debug interceptor is on.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, AuthError> {
        let request = request.build()?;
        if !self.options.debug {
            return Ok(self.http.execute(request).await?);
        }

        let method = request.method().clone();
        let url = request.url().clone();
        let started = Instant::now();
        tracing::info!(target: "keystone_core::http", "--> {} {}", method, url);

        match self.http.execute(request).await {
            Ok(response) => {
                tracing::info!(
                    target: "keystone_core::http",
                    "<-- {} {} {} ({:?})",
                    response.status().as_u16(),
                    method,
                    url,
                    started.elapsed()
                );
                Ok(response)
            }
            Err(e) => {
                tracing::info!(
                    target: "keystone_core::http",
                    "<-- {} {} failed after {:?}: {}",
                    method,
                    url,
                    started.elapsed(),
                    e
                );
                Err(e.into())
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<Response, AuthError> {
        self.send(self.request(Method::GET, path)?).await
    }

    async fn expect_success(response: Response) -> Result<Response, AuthError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!("Request failed with status {}", status);
        Err(AuthError::UnexpectedStatus { status, body })
    }

    /// Exchange a refresh token for a new access/refresh pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let request = self
            .request(Method::POST, REFRESH_PATH)?
            .json(&RefreshRequest { refresh_token });
        let response = Self::expect_success(self.send(request).await?).await?;
        let reply: TokenReply = response.json().await?;
        Ok(reply.into_pair().0)
    }

    /// Password login; returns the token pair and the session, if one was issued.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(TokenPair, Option<String>), AuthError> {
        let request = self
            .request(Method::POST, LOGIN_PATH)?
            .json(&LoginRequest { username, password });
        let response = Self::expect_success(self.send(request).await?).await?;
        let reply: TokenReply = response.json().await?;
        let (pair, session) = reply.into_pair();
        let session = match session {
            Some(session) => Some(session),
            None => self.cookie(self.session_cookie_name()).ok().flatten(),
        };
        Ok((pair, session))
    }

    /// Ask the webfinger endpoint whether SSO is enforced for `email`.
    pub async fn sso_status(&self, email: &str) -> Result<SsoStatus, AuthError> {
        let mut url = self.url(WEBFINGER_PATH)?;
        url.query_pairs_mut()
            .append_pair("resource", &format!("acct:{}", email));
        let request = self.http.get(url);
        let response = Self::expect_success(self.send(request).await?).await?;
        Ok(response.json().await?)
    }

    /// Browser entry point of the SSO login for an organization.
    pub fn sso_login_url(&self, organization_id: &str, return_url: &str) -> Result<Url, AuthError> {
        let mut url = self.url(SSO_LOGIN_PATH)?;
        url.query_pairs_mut()
            .append_pair("organization_id", organization_id)
            .append_pair("return", return_url);
        Ok(url)
    }
}

impl Reauthenticator for CloudClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        CloudClient::refresh(self, refresh_token).await
    }
}
