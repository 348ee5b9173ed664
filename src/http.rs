//! HTTP surface: route table, handlers and error rendering

use async_trait::async_trait;
use axum::extract::{FromRequest, FromRequestParts, Query, Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, LOCATION, PRAGMA, WWW_AUTHENTICATE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::{Form, Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{AccessError, OAuthError};
use crate::oauth::{AuthorizeRequest, IntrospectionRequest, RevocationRequest, TokenRequest, TokenResponse};
use crate::AuthServer;

/// Authorization endpoint path
pub const AUTHORIZE_PATH: &str = "/oauth/authorize";
/// Token endpoint path
pub const TOKEN_PATH: &str = "/oauth/token";
/// Refresh endpoint path
pub const REFRESH_PATH: &str = "/oauth/refresh";
/// Userinfo endpoint path
pub const USERINFO_PATH: &str = "/oauth/userinfo";
/// Introspection endpoint path
pub const INTROSPECT_PATH: &str = "/oauth/introspect";
/// Revocation endpoint path
pub const REVOKE_PATH: &str = "/oauth/revoke";
/// Server metadata path
pub const METADATA_PATH: &str = "/.well-known/oauth-authorization-server";

/// HTTP method of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// GET
    Get,
    /// POST
    Post,
}

impl Verb {
    const fn filter(self) -> MethodFilter {
        match self {
            Self::Get => MethodFilter::GET,
            Self::Post => MethodFilter::POST,
        }
    }
}

/// Every endpoint the server exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Issue authorization codes
    Authorize,
    /// Exchange codes or refresh tokens
    Token,
    /// Exchange refresh tokens
    Refresh,
    /// Identity claims
    UserInfo,
    /// Token liveness
    Introspect,
    /// Token revocation
    Revoke,
    /// Server metadata
    Metadata,
}

/// The complete route table
pub const ROUTES: &[(Verb, &str, Endpoint)] = &[
    (Verb::Get, AUTHORIZE_PATH, Endpoint::Authorize),
    (Verb::Post, TOKEN_PATH, Endpoint::Token),
    (Verb::Post, REFRESH_PATH, Endpoint::Refresh),
    (Verb::Get, USERINFO_PATH, Endpoint::UserInfo),
    (Verb::Post, INTROSPECT_PATH, Endpoint::Introspect),
    (Verb::Post, REVOKE_PATH, Endpoint::Revoke),
    (Verb::Get, METADATA_PATH, Endpoint::Metadata),
];

/// Build a router serving every entry of [`ROUTES`]
pub fn router(server: AuthServer) -> Router {
    ROUTES
        .iter()
        .fold(Router::new(), |router, &(verb, path, endpoint)| {
            router.route(path, method_router(verb, endpoint))
        })
        .with_state(server)
}

fn method_router(verb: Verb, endpoint: Endpoint) -> MethodRouter<AuthServer> {
    let filter = verb.filter();
    match endpoint {
        Endpoint::Authorize => on(filter, authorize),
        Endpoint::Token => on(filter, token),
        Endpoint::Refresh => on(filter, refresh),
        Endpoint::UserInfo => on(filter, userinfo),
        Endpoint::Introspect => on(filter, introspect),
        Endpoint::Revoke => on(filter, revoke),
        Endpoint::Metadata => on(filter, metadata),
    }
}

/// Request body accepted as either JSON or form encoding
#[derive(Debug, Clone)]
pub struct OAuthBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for OAuthBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = OAuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));

        if is_json {
            let Json(body) = Json::<T>::from_request(req, state)
                .await
                .map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;
            Ok(Self(body))
        } else {
            let Form(body) = Form::<T>::from_request(req, state)
                .await
                .map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;
            Ok(Self(body))
        }
    }
}

/// Query string parameters, rejected with an OAuth error body
#[derive(Debug, Clone)]
pub struct OAuthQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for OAuthQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = OAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;
        Ok(Self(query))
    }
}

/// Client credentials from an `Authorization: Basic` header
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((
        urlencoding::decode(id).ok()?.into_owned(),
        urlencoding::decode(secret).ok()?.into_owned(),
    ))
}

/// Fill in client credentials from HTTP Basic when the body has none
fn apply_basic(headers: &HeaderMap, client_id: &mut Option<String>, client_secret: &mut Option<String>) {
    if client_id.is_some() {
        return;
    }
    if let Some((id, secret)) = basic_credentials(headers) {
        *client_id = Some(id);
        *client_secret = Some(secret);
    }
}

fn bearer_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok())
}

fn token_success(response: TokenResponse) -> Response {
    (
        [
            (CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (PRAGMA, HeaderValue::from_static("no-cache")),
        ],
        Json(response),
    )
        .into_response()
}

async fn authorize(
    State(server): State<AuthServer>,
    OAuthQuery(request): OAuthQuery<AuthorizeRequest>,
) -> Result<Response, OAuthError> {
    let redirect = server.oauth().authorize(request).await?;
    Ok((StatusCode::FOUND, [(LOCATION, redirect.location)]).into_response())
}

async fn token(
    State(server): State<AuthServer>,
    headers: HeaderMap,
    OAuthBody(mut request): OAuthBody<TokenRequest>,
) -> Result<Response, OAuthError> {
    apply_basic(&headers, &mut request.client_id, &mut request.client_secret);
    Ok(token_success(server.oauth().exchange(request).await?))
}

async fn refresh(
    State(server): State<AuthServer>,
    headers: HeaderMap,
    OAuthBody(mut request): OAuthBody<TokenRequest>,
) -> Result<Response, OAuthError> {
    apply_basic(&headers, &mut request.client_id, &mut request.client_secret);
    Ok(token_success(server.oauth().refresh(request).await?))
}

async fn userinfo(State(server): State<AuthServer>, headers: HeaderMap) -> Result<Response, OAuthError> {
    let info = server.userinfo().handle(bearer_header(&headers)).await?;
    Ok(([(CACHE_CONTROL, HeaderValue::from_static("no-store"))], Json(info)).into_response())
}

async fn introspect(
    State(server): State<AuthServer>,
    OAuthBody(request): OAuthBody<IntrospectionRequest>,
) -> Result<Response, OAuthError> {
    let response = server.oauth().introspect(request).await?;
    Ok(([(CACHE_CONTROL, HeaderValue::from_static("no-store"))], Json(response)).into_response())
}

async fn revoke(
    State(server): State<AuthServer>,
    headers: HeaderMap,
    OAuthBody(mut request): OAuthBody<RevocationRequest>,
) -> Result<StatusCode, OAuthError> {
    apply_basic(&headers, &mut request.client_id, &mut request.client_secret);
    server.oauth().revoke(request).await?;
    Ok(StatusCode::OK)
}

async fn metadata(State(server): State<AuthServer>) -> Response {
    Json(server.oauth().metadata()).into_response()
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::ServerError(_) => json!({ "error": "server_error" }),
            _ => json!({
                "error": self.code(),
                "error_description": self.description(),
            }),
        };

        let mut response = (
            self.status(),
            [(CACHE_CONTROL, HeaderValue::from_static("no-store"))],
            Json(body),
        )
            .into_response();

        if matches!(self, Self::InvalidToken(_) | Self::InsufficientScope(_)) {
            if let Ok(challenge) = HeaderValue::from_str(&format!("Bearer error=\"{}\"", self.code())) {
                response.headers_mut().insert(WWW_AUTHENTICATE, challenge);
            }
        }

        response
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::InsufficientScopes { required, granted } => json!({
                "error": self.to_string(),
                "code": self.code(),
                "required_scopes": required,
                "granted_scopes": granted,
            }),
            Self::Internal(_) => json!({
                "error": "server_error",
                "code": self.code(),
            }),
            _ => json!({
                "error": self.to_string(),
                "code": self.code(),
            }),
        };

        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::clock::ManualClock;
    use crate::pkce::s256_challenge;
    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use time::Duration;
    use tower::ServiceExt;
    use url::Url;

    const REDIRECT: &str = "https://agent.example.com/callback";
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    async fn server() -> (AuthServer, ManualClock) {
        let clock = ManualClock::starting_now();
        let server = AuthServer::builder()
            .with_client(
                Client::builder()
                    .id("agent")
                    .secret("secret")
                    .redirect_uri(REDIRECT)
                    .allowed_scopes(&["read", "book"])
                    .build()
                    .unwrap(),
            )
            .with_clock(clock.clone())
            .issuer("https://auth.example.com")
            .build()
            .await
            .unwrap();
        (server, clock)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, headers, json)
    }

    fn form_post(path: &str, body: &str) -> Request<Body> {
        Request::post(path)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn json_post(path: &str, body: &serde_json::Value) -> Request<Body> {
        Request::post(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn authorize_code(app: &Router, extra: &str) -> String {
        let uri = format!(
            "{AUTHORIZE_PATH}?response_type=code&client_id=agent&redirect_uri={}&state=abc%20123{extra}",
            urlencoding::encode(REDIRECT)
        );
        let (status, headers, _) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::FOUND);

        let location = Url::parse(headers[LOCATION].to_str().unwrap()).unwrap();
        assert_eq!(&location[..url::Position::AfterPath], REDIRECT);
        let params: std::collections::HashMap<_, _> = location.query_pairs().into_owned().collect();
        assert_eq!(params["state"], "abc 123");
        params["code"].clone()
    }

    #[test]
    fn test_route_table_is_complete() {
        let paths: Vec<_> = ROUTES.iter().map(|(_, path, _)| *path).collect();
        assert_eq!(paths.len(), 7);
        assert!(paths.contains(&TOKEN_PATH));
        assert!(paths.contains(&METADATA_PATH));
    }

    #[tokio::test]
    async fn test_authorize_errors_are_json_not_redirects() {
        let (server, _) = server().await;
        let app = server.router();

        let uri = format!(
            "{AUTHORIZE_PATH}?response_type=code&client_id=agent&redirect_uri={}",
            urlencoding::encode("https://evil.example.com/cb")
        );
        let (status, headers, body) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(headers.get(LOCATION).is_none());
        assert_eq!(body["error"], "invalid_redirect_uri");

        let uri = format!("{AUTHORIZE_PATH}?response_type=code&client_id=nobody");
        let (status, _, body) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_client");
    }

    #[tokio::test]
    async fn test_malformed_authorize_query_is_json() {
        let (server, _) = server().await;
        let app = server.router();

        let uri = format!(
            "{AUTHORIZE_PATH}?response_type=code&client_id=agent&client_id=agent&redirect_uri={}",
            urlencoding::encode(REDIRECT)
        );
        let (status, headers, body) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(headers[CONTENT_TYPE].to_str().unwrap().starts_with("application/json"));
        assert!(headers.get(LOCATION).is_none());
        assert_eq!(body["error"], "invalid_request");
        assert!(body["error_description"].as_str().unwrap().contains("client_id"));
    }

    #[tokio::test]
    async fn test_full_flow_over_http() {
        let (server, clock) = server().await;
        let app = server.router();

        let challenge = s256_challenge(VERIFIER);
        let code = authorize_code(
            &app,
            &format!("&scope=read%20book&code_challenge={challenge}&code_challenge_method=S256"),
        )
        .await;

        let body = format!(
            "grant_type=authorization_code&code={code}&redirect_uri={}&client_id=agent&client_secret=secret&code_verifier={VERIFIER}",
            urlencoding::encode(REDIRECT)
        );
        let (status, headers, tokens) = send(&app, form_post(TOKEN_PATH, &body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CACHE_CONTROL], "no-store");
        assert_eq!(tokens["token_type"], "Bearer");
        assert_eq!(tokens["expires_in"], 3600);
        assert_eq!(tokens["scope"], "read book");
        let access_token = tokens["access_token"].as_str().unwrap().to_string();
        let refresh_token = tokens["refresh_token"].as_str().unwrap().to_string();

        // Replaying the code fails
        let (status, _, err) = send(&app, form_post(TOKEN_PATH, &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "invalid_grant");

        let (status, _, info) = send(
            &app,
            json_post(INTROSPECT_PATH, &json!({ "token": access_token })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["active"], true);
        assert_eq!(info["client_id"], "agent");

        let (status, _, claims) = send(
            &app,
            Request::get(USERINFO_PATH)
                .header(AUTHORIZATION, format!("Bearer {access_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(claims["sub"].as_str().unwrap().starts_with("user_"));

        clock.advance(Duration::seconds(3601));
        let (_, _, info) = send(
            &app,
            json_post(INTROSPECT_PATH, &json!({ "token": access_token })),
        )
        .await;
        assert_eq!(info, json!({ "active": false }));

        // Refresh with HTTP Basic client authentication
        let credentials = STANDARD.encode("agent:secret");
        let (status, _, refreshed) = send(
            &app,
            Request::post(REFRESH_PATH)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(AUTHORIZATION, format!("Basic {credentials}"))
                .body(Body::from(format!("refresh_token={refresh_token}")))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refreshed["scope"], "read book");
        assert!(refreshed.get("refresh_token").is_none());
    }

    #[tokio::test]
    async fn test_token_endpoint_errors() {
        let (server, _) = server().await;
        let app = server.router();

        let (status, _, body) = send(&app, json_post(TOKEN_PATH, &json!({ "client_id": "agent" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (_, _, body) = send(
            &app,
            json_post(TOKEN_PATH, &json!({ "grant_type": "password" })),
        )
        .await;
        assert_eq!(body["error"], "unsupported_grant_type");

        let (status, _, body) = send(
            &app,
            form_post(
                TOKEN_PATH,
                "grant_type=authorization_code&code=x&client_id=agent&client_secret=wrong",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_client");
    }

    #[tokio::test]
    async fn test_userinfo_errors_carry_challenge() {
        let (server, _) = server().await;
        let app = server.router();

        let (status, headers, body) = send(&app, Request::get(USERINFO_PATH).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_token");
        assert_eq!(headers[WWW_AUTHENTICATE], "Bearer error=\"invalid_token\"");

        let code = authorize_code(&app, "&scope=book").await;
        let body = format!(
            "grant_type=authorization_code&code={code}&redirect_uri={}&client_id=agent&client_secret=secret",
            urlencoding::encode(REDIRECT)
        );
        let (_, _, tokens) = send(&app, form_post(TOKEN_PATH, &body)).await;
        let access_token = tokens["access_token"].as_str().unwrap();

        let (status, headers, body) = send(
            &app,
            Request::get(USERINFO_PATH)
                .header(AUTHORIZATION, format!("Bearer {access_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "insufficient_scope");
        assert_eq!(headers[WWW_AUTHENTICATE], "Bearer error=\"insufficient_scope\"");
    }

    #[tokio::test]
    async fn test_revoke_and_metadata() {
        let (server, _) = server().await;
        let app = server.router();

        let code = authorize_code(&app, "").await;
        let body = format!(
            "grant_type=authorization_code&code={code}&redirect_uri={}&client_id=agent&client_secret=secret",
            urlencoding::encode(REDIRECT)
        );
        let (_, _, tokens) = send(&app, form_post(TOKEN_PATH, &body)).await;
        let access_token = tokens["access_token"].as_str().unwrap();

        let (status, _, _) = send(
            &app,
            form_post(
                REVOKE_PATH,
                &format!("token={access_token}&client_id=agent&client_secret=secret"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, _, info) = send(&app, json_post(INTROSPECT_PATH, &json!({ "token": access_token }))).await;
        assert_eq!(info, json!({ "active": false }));

        let (status, _, metadata) = send(&app, Request::get(METADATA_PATH).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(metadata["issuer"], "https://auth.example.com");
        assert_eq!(metadata["revocation_endpoint"], "https://auth.example.com/oauth/revoke");
    }

    #[test]
    fn test_basic_credentials_are_url_decoded() {
        let mut headers = HeaderMap::new();
        let encoded = STANDARD.encode("my%20client:p%40ss");
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Basic {encoded}")).unwrap());
        assert_eq!(
            basic_credentials(&headers),
            Some(("my client".to_string(), "p@ss".to_string()))
        );

        let (mut id, mut secret) = (Some("body-client".to_string()), None);
        apply_basic(&headers, &mut id, &mut secret);
        assert_eq!(id.as_deref(), Some("body-client"));
        assert_eq!(secret, None);
    }

    #[test]
    fn test_server_error_body_hides_detail() {
        let response = OAuthError::ServerError("disk on fire".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
