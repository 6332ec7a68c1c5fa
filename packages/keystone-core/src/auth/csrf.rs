//! CSRF double-submit bootstrap.
//!
//! The server hands out its CSRF token as a cookie on any safe request. The
//! same value has to be echoed in a header on mutating requests, so the
//! token is read once from the cookie jar and baked into a new client.

use crate::auth::error::AuthError;
use crate::cloud::{CSRF_COOKIE, CloudClient, LIVENESS_PATH};

/// Perform the safe liveness request and read the CSRF cookie.
///
/// Returns `Ok(None)` when the server sets no CSRF cookie at all (protection
/// is off), and `EmptyCsrfToken` when the cookie is present but empty.
pub async fn fetch_csrf_token(client: &CloudClient) -> Result<Option<String>, AuthError> {
    if client.cookie_jar().is_none() {
        return Err(AuthError::NoCookieJar);
    }

    let response = client.get(LIVENESS_PATH).await?;
    tracing::debug!(
        "CSRF bootstrap request returned {}",
        response.status().as_u16()
    );
    drop(response);

    read_csrf_cookie(client)
}

/// Read the CSRF token from the jar without making a request.
pub fn read_csrf_cookie(client: &CloudClient) -> Result<Option<String>, AuthError> {
    match client.cookie(CSRF_COOKIE)? {
        Some(token) if token.is_empty() => Err(AuthError::EmptyCsrfToken),
        Some(token) => Ok(Some(token)),
        None => {
            tracing::debug!("No CSRF cookie set, CSRF protection appears disabled");
            Ok(None)
        }
    }
}

/// Bootstrap CSRF and return a new client that carries the token and the
/// cookies gathered so far.
pub async fn client_with_csrf_token(client: &CloudClient) -> Result<CloudClient, AuthError> {
    let token = fetch_csrf_token(client).await?;
    Ok(client.with_csrf_token(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CSRF_HEADER, ClientOptions};
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use reqwest::Method;
    use reqwest::cookie::Jar;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn livez_setting(cookies: &'static [&'static str]) -> Router {
        Router::new().route(
            "/livez",
            get(move || async move {
                let mut response = StatusCode::OK.into_response();
                for cookie in cookies {
                    response
                        .headers_mut()
                        .append(header::SET_COOKIE, header::HeaderValue::from_static(cookie));
                }
                response
            }),
        )
    }

    fn jar_client(base: &str) -> CloudClient {
        let options = ClientOptions {
            cookie_jar: Some(Arc::new(Jar::default())),
            ..Default::default()
        };
        CloudClient::new(base, options).unwrap()
    }

    #[tokio::test]
    async fn test_missing_jar_is_rejected() {
        let client = CloudClient::new("http://127.0.0.1:9", ClientOptions::default()).unwrap();
        assert!(matches!(
            fetch_csrf_token(&client).await,
            Err(AuthError::NoCookieJar)
        ));
    }

    #[tokio::test]
    async fn test_absent_cookie_is_not_an_error() {
        let base = serve(livez_setting(&[])).await;
        let token = fetch_csrf_token(&jar_client(&base)).await.unwrap();
        assert_eq!(token, None);
    }

    #[tokio::test]
    async fn test_empty_cookie_is_fatal() {
        let base = serve(livez_setting(&["ks.csrf-token=; Path=/"])).await;
        assert!(matches!(
            fetch_csrf_token(&jar_client(&base)).await,
            Err(AuthError::EmptyCsrfToken)
        ));
    }

    #[tokio::test]
    async fn test_token_is_read_from_cookie() {
        let base = serve(livez_setting(&["ks.csrf-token=csrf_abc; Path=/"])).await;
        let token = fetch_csrf_token(&jar_client(&base)).await.unwrap();
        assert_eq!(token.as_deref(), Some("csrf_abc"));
    }

    #[tokio::test]
    async fn test_new_client_keeps_bootstrap_cookies() {
        let posts = Arc::new(AtomicUsize::new(0));
        let posts_handler = posts.clone();
        let router = livez_setting(&[
            "ks.csrf-token=csrf_abc; Path=/",
            "temporary-cookie=sess_from_server; Path=/",
        ])
        .route(
            "/v1/things",
            post(move |headers: HeaderMap| {
                let posts = posts_handler.clone();
                async move {
                    posts.fetch_add(1, Ordering::SeqCst);
                    let cookie = headers
                        .get(header::COOKIE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    let csrf = headers
                        .get(CSRF_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    // Double-submit check as the server performs it
                    if cookie.contains(&format!("ks.csrf-token={}", csrf)) && !csrf.is_empty() {
                        StatusCode::CREATED
                    } else {
                        StatusCode::FORBIDDEN
                    }
                }
            }),
        );
        let base = serve(router).await;

        let bootstrap = jar_client(&base);
        let client = client_with_csrf_token(&bootstrap).await.unwrap();

        assert_eq!(client.csrf_token(), Some("csrf_abc"));
        assert_eq!(bootstrap.csrf_token(), None);
        assert_eq!(
            client.session_from_cookie_jar().unwrap().as_deref(),
            Some("sess_from_server")
        );

        let response = client
            .send(client.request(Method::POST, "/v1/things").unwrap())
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201);
        assert_eq!(posts.load(Ordering::SeqCst), 1);
    }
}
