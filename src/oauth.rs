//! OAuth2 protocol flows: authorize, token, refresh, introspect, revoke

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientRegistry};
use crate::clock::Clock;
use crate::crypto::TokenGenerator;
use crate::error::{OAuthError, Result};
use crate::http;
use crate::logging::{AuditLog, Event, GrantOperation, TokenOperation};
use crate::pkce::{PkceChallenge, PkceMethod};
use crate::scope::ScopeSet;
use crate::storage::{GrantRedemption, TokenStore};
use crate::token::{record_id, AccessToken, AuthorizationGrant, RefreshToken, TokenLifetimes};

type FlowResult<T> = std::result::Result<T, OAuthError>;

const BEARER: &str = "Bearer";

/// Decides which end user a redeemed grant acts for
#[async_trait]
pub trait SubjectResolver: Send + Sync + Debug {
    /// Subject for a grant that carries no pre-authenticated user
    async fn resolve(&self, grant: &AuthorizationGrant) -> Result<String>;
}

/// Mints a fresh random subject for every exchange.
///
/// Suitable only where no login layer exists; use
/// [`OAuth2Flow::authorize_as`] to bind a real user to the grant.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralSubjects;

#[async_trait]
impl SubjectResolver for EphemeralSubjects {
    async fn resolve(&self, _grant: &AuthorizationGrant) -> Result<String> {
        Ok(format!("user_{}", nanoid::nanoid!()))
    }
}

/// Query parameters of the authorization endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    /// Must be `code`
    pub response_type: Option<String>,
    /// The client identifier
    pub client_id: Option<String>,
    /// Must exactly match the client's registered URI
    pub redirect_uri: Option<String>,
    /// Space-separated list of requested scopes
    pub scope: Option<String>,
    /// Opaque value echoed back on the redirect
    pub state: Option<String>,
    /// PKCE code challenge
    pub code_challenge: Option<String>,
    /// `S256` or `plain` (default `plain`)
    pub code_challenge_method: Option<String>,
}

/// Successful authorization: where to send the user agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeRedirect {
    /// Full `Location` value, including `code` and `state`
    pub location: String,
    /// The issued authorization code
    pub code: String,
    /// The echoed state
    pub state: Option<String>,
}

/// Body of the token and refresh endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRequest {
    /// `authorization_code` or `refresh_token`
    pub grant_type: Option<String>,
    /// The authorization code (authorization_code grant)
    pub code: Option<String>,
    /// The refresh token (refresh_token grant)
    pub refresh_token: Option<String>,
    /// Redirect URI the code was delivered to
    pub redirect_uri: Option<String>,
    /// The client identifier
    pub client_id: Option<String>,
    /// The client secret
    pub client_secret: Option<String>,
    /// PKCE verifier
    pub code_verifier: Option<String>,
    /// Narrower scope for a refresh
    pub scope: Option<String>,
}

/// Response containing the access token and related information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The access token string
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Number of seconds until the token expires
    pub expires_in: u64,
    /// Present on code exchange, and on refresh when rotation is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Space-separated list of granted scopes
    pub scope: String,
}

/// Body of the introspection endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntrospectionRequest {
    /// The token to inspect
    pub token: Option<String>,
    /// `access_token` or `refresh_token`
    pub token_type_hint: Option<String>,
}

/// RFC 7662 introspection result. Inactive tokens serialize as `{"active":false}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// Whether the token is currently active
    pub active: bool,
    /// Space-separated list of scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// The client the token was issued to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// `Bearer` or `refresh_token`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry, Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issue time, Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Subject, for access tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

impl IntrospectionResponse {
    /// The response for anything unknown, expired, or malformed
    #[must_use]
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// Body of the revocation endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevocationRequest {
    /// The token to revoke
    pub token: Option<String>,
    /// `access_token` or `refresh_token`
    pub token_type_hint: Option<String>,
    /// The client identifier
    pub client_id: Option<String>,
    /// The client secret
    pub client_secret: Option<String>,
}

/// RFC 8414 authorization server metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Issuer identifier
    pub issuer: String,
    /// Authorization endpoint URL
    pub authorization_endpoint: String,
    /// Token endpoint URL
    pub token_endpoint: String,
    /// Introspection endpoint URL
    pub introspection_endpoint: String,
    /// Revocation endpoint URL
    pub revocation_endpoint: String,
    /// Userinfo endpoint URL
    pub userinfo_endpoint: String,
    /// Supported response types
    pub response_types_supported: Vec<String>,
    /// Supported grant types
    pub grant_types_supported: Vec<String>,
    /// Supported PKCE methods
    pub code_challenge_methods_supported: Vec<String>,
    /// Supported client authentication methods
    pub token_endpoint_auth_methods_supported: Vec<String>,
    /// Every scope any client may request
    pub scopes_supported: Vec<String>,
}

/// Handles OAuth2 protocol flows and token management
#[derive(Debug, Clone)]
pub struct OAuth2Flow {
    pub(crate) clients: Arc<ClientRegistry>,
    pub(crate) store: Arc<dyn TokenStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) subjects: Arc<dyn SubjectResolver>,
    pub(crate) lifetimes: TokenLifetimes,
    pub(crate) rotate_refresh_tokens: bool,
    pub(crate) issuer: String,
    pub(crate) audit: AuditLog,
    tokens: TokenGenerator,
}

impl OAuth2Flow {
    pub(crate) fn new(
        clients: Arc<ClientRegistry>,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clients,
            store,
            clock,
            subjects: Arc::new(EphemeralSubjects),
            lifetimes: TokenLifetimes::default(),
            rotate_refresh_tokens: false,
            issuer: "http://localhost".to_string(),
            audit: AuditLog::tracing_only(),
            tokens: TokenGenerator::new(),
        }
    }

    /// Validate an authorization request and issue a code
    pub async fn authorize(&self, request: AuthorizeRequest) -> FlowResult<AuthorizeRedirect> {
        self.issue_grant(request, None).await
    }

    /// Like [`OAuth2Flow::authorize`], binding a user already authenticated by a login layer
    pub async fn authorize_as(
        &self,
        request: AuthorizeRequest,
        subject: &str,
    ) -> FlowResult<AuthorizeRedirect> {
        self.issue_grant(request, Some(subject.to_string())).await
    }

    async fn issue_grant(
        &self,
        request: AuthorizeRequest,
        subject: Option<String>,
    ) -> FlowResult<AuthorizeRedirect> {
        if request.response_type.as_deref() != Some("code") {
            return Err(OAuthError::UnsupportedResponseType(
                "Only response_type=code is supported".into(),
            ));
        }

        let client = request
            .client_id
            .as_deref()
            .and_then(|id| self.clients.get(id))
            .ok_or_else(|| OAuthError::InvalidClient("Unknown client_id".into()))?;

        let redirect_uri = request
            .redirect_uri
            .filter(|uri| *uri == client.redirect_uri)
            .ok_or_else(|| {
                OAuthError::InvalidRedirectUri("redirect_uri does not match registration".into())
            })?;

        let requested = request.scope.as_deref().map(ScopeSet::parse).unwrap_or_default();
        let scopes = if requested.is_empty() {
            client.allowed_scopes.clone()
        } else if requested.is_subset(&client.allowed_scopes) {
            requested
        } else {
            return Err(OAuthError::InvalidScope(format!(
                "Scope not allowed for this client: {}",
                requested.difference(&client.allowed_scopes)
            )));
        };

        let pkce = parse_pkce(request.code_challenge, request.code_challenge_method.as_deref())?;

        let now = self.clock.now();
        let code = self.tokens.generate()?;
        let grant = AuthorizationGrant {
            code: code.clone(),
            client_id: client.id.clone(),
            redirect_uri: redirect_uri.clone(),
            scopes,
            state: request.state.clone(),
            pkce,
            subject,
            created_at: now,
            expires_at: now + self.lifetimes.authorization_code,
            consumed: false,
        };
        self.store.insert_grant(grant).await?;

        info!(client_id = %client.id, "Authorization code issued");
        self.audit
            .record(Event::Grant {
                operation: GrantOperation::Issued,
                client_id: client.id.clone(),
                reason: None,
            })
            .await;

        Ok(AuthorizeRedirect {
            location: redirect_location(&redirect_uri, &code, request.state.as_deref()),
            code,
            state: request.state,
        })
    }

    /// Token endpoint entry point; dispatches on `grant_type`
    pub async fn exchange(&self, request: TokenRequest) -> FlowResult<TokenResponse> {
        match request.grant_type.as_deref() {
            None | Some("") => Err(OAuthError::InvalidRequest("grant_type is required".into())),
            Some("authorization_code") => self.exchange_authorization_code(request).await,
            Some("refresh_token") => self.refresh(request).await,
            Some(other) => Err(OAuthError::UnsupportedGrantType(format!(
                "Unsupported grant_type: {other}"
            ))),
        }
    }

    /// Redeem an authorization code for an access and refresh token pair
    pub async fn exchange_authorization_code(&self, request: TokenRequest) -> FlowResult<TokenResponse> {
        let client = self
            .authenticate_client(request.client_id.as_deref(), request.client_secret.as_deref())
            .await?;

        let code = request
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("code is required".into()))?;

        let now = self.clock.now();
        let grant = match self.store.consume_grant(code, now).await? {
            GrantRedemption::Redeemed(grant) => grant,
            GrantRedemption::Unknown => {
                return Err(self.reject_grant(&client.id, "Unknown authorization code").await)
            }
            GrantRedemption::Expired => {
                return Err(self.reject_grant(&client.id, "Authorization code expired").await)
            }
            GrantRedemption::AlreadyConsumed => {
                return Err(self
                    .reject_grant(&client.id, "Authorization code already used")
                    .await)
            }
        };

        if grant.client_id != client.id {
            return Err(self
                .reject_grant(&client.id, "Authorization code was issued to another client")
                .await);
        }

        if request.redirect_uri.as_deref() != Some(grant.redirect_uri.as_str()) {
            return Err(self.reject_grant(&client.id, "redirect_uri mismatch").await);
        }

        if let Some(pkce) = &grant.pkce {
            match request.code_verifier.as_deref() {
                None => {
                    return Err(self.reject_grant(&client.id, "code_verifier is required").await)
                }
                Some(verifier) if !pkce.verify(verifier) => {
                    return Err(self.reject_grant(&client.id, "PKCE verification failed").await)
                }
                Some(_) => {}
            }
        }

        let subject = match &grant.subject {
            Some(subject) => subject.clone(),
            None => self.subjects.resolve(&grant).await?,
        };

        let access = self.new_access_token(&subject, &client.id, grant.scopes.clone(), now)?;
        let refresh = RefreshToken {
            id: record_id(),
            token: self.tokens.generate()?,
            access_token: access.token.clone(),
            subject,
            client_id: client.id.clone(),
            scopes: grant.scopes.clone(),
            created_at: now,
            expires_at: now + self.lifetimes.refresh_token,
        };

        self.store.insert_access_token(access.clone()).await?;
        self.store.insert_refresh_token(refresh.clone()).await?;

        info!(
            client_id = %client.id,
            token_id = %access.id,
            scope = %grant.scopes,
            "Access token and refresh token issued from authorization code"
        );
        self.audit
            .record(Event::Grant {
                operation: GrantOperation::Consumed,
                client_id: client.id.clone(),
                reason: None,
            })
            .await;
        self.record_token(TokenOperation::Issued, &access.id, &client.id).await;
        self.record_token(TokenOperation::Issued, &refresh.id, &client.id).await;

        Ok(TokenResponse {
            access_token: access.token.clone(),
            token_type: BEARER.to_string(),
            expires_in: access.expires_in(now),
            refresh_token: Some(refresh.token),
            scope: grant.scopes.to_string(),
        })
    }

    /// Mint a new access token from a refresh token.
    ///
    /// `grant_type` may be omitted; any value other than `refresh_token`
    /// is rejected.
    #[allow(clippy::too_many_lines)]
    pub async fn refresh(&self, request: TokenRequest) -> FlowResult<TokenResponse> {
        if let Some(grant_type) = request.grant_type.as_deref() {
            if grant_type != "refresh_token" {
                return Err(OAuthError::UnsupportedGrantType(format!(
                    "Unsupported grant_type: {grant_type}"
                )));
            }
        }

        let client = self
            .authenticate_client(request.client_id.as_deref(), request.client_secret.as_deref())
            .await?;

        let token = request
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("refresh_token is required".into()))?;

        let now = self.clock.now();
        let record = self
            .store
            .refresh_token(token)
            .await?
            .ok_or_else(|| OAuthError::InvalidGrant("Invalid refresh token".into()))?;

        if record.is_expired(now) {
            self.store.remove_refresh_token(token).await?;
            self.record_token(TokenOperation::Expired, &record.id, &record.client_id).await;
            return Err(OAuthError::InvalidGrant("Refresh token expired".into()));
        }

        if record.client_id != client.id {
            warn!(client_id = %client.id, "Refresh token presented by another client");
            return Err(OAuthError::InvalidGrant(
                "Refresh token was issued to another client".into(),
            ));
        }

        let requested = request.scope.as_deref().map(ScopeSet::parse).unwrap_or_default();
        let scopes = if requested.is_empty() {
            record.scopes.clone()
        } else if requested.is_subset(&record.scopes) {
            requested
        } else {
            return Err(OAuthError::InvalidScope(
                "Requested scope exceeds the original grant".into(),
            ));
        };

        let access = self.new_access_token(&record.subject, &client.id, scopes.clone(), now)?;
        self.store.insert_access_token(access.clone()).await?;

        let rotated = if self.rotate_refresh_tokens {
            // Removing the old token decides the winner of concurrent refreshes
            if self.store.remove_refresh_token(token).await?.is_none() {
                self.store.remove_access_token(&access.token).await?;
                return Err(OAuthError::InvalidGrant("Invalid refresh token".into()));
            }
            let successor = RefreshToken {
                id: record_id(),
                token: self.tokens.generate()?,
                access_token: access.token.clone(),
                created_at: now,
                ..record.clone()
            };
            self.store.insert_refresh_token(successor.clone()).await?;
            self.record_token(TokenOperation::Revoked, &record.id, &client.id).await;
            self.record_token(TokenOperation::Issued, &successor.id, &client.id).await;
            Some(successor.token)
        } else {
            if self.store.repoint_refresh_token(token, &access.token).await?.is_none() {
                // Revoked between lookup and repoint
                self.store.remove_access_token(&access.token).await?;
                return Err(OAuthError::InvalidGrant("Invalid refresh token".into()));
            }
            None
        };

        info!(
            client_id = %client.id,
            token_id = %access.id,
            scope = %scopes,
            "Access token refreshed"
        );
        self.record_token(TokenOperation::Refreshed, &access.id, &client.id).await;

        Ok(TokenResponse {
            access_token: access.token.clone(),
            token_type: BEARER.to_string(),
            expires_in: access.expires_in(now),
            refresh_token: rotated,
            scope: scopes.to_string(),
        })
    }

    /// Report whether a token is live, and its metadata if so
    pub async fn introspect(&self, request: IntrospectionRequest) -> FlowResult<IntrospectionResponse> {
        let Some(token) = request.token.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(IntrospectionResponse::inactive());
        };

        let now = self.clock.now();
        let refresh_first = request.token_type_hint.as_deref() == Some("refresh_token");

        for check_refresh in [refresh_first, !refresh_first] {
            let found = if check_refresh {
                self.store
                    .refresh_token(token)
                    .await?
                    .filter(|record| !record.is_expired(now))
                    .map(|record| IntrospectionResponse {
                        active: true,
                        scope: Some(record.scopes.to_string()),
                        client_id: Some(record.client_id),
                        token_type: Some("refresh_token".to_string()),
                        exp: Some(record.expires_at.unix_timestamp()),
                        iat: Some(record.created_at.unix_timestamp()),
                        sub: None,
                    })
            } else {
                self.store
                    .access_token(token)
                    .await?
                    .filter(|record| !record.is_expired(now))
                    .map(|record| IntrospectionResponse {
                        active: true,
                        scope: Some(record.scopes.to_string()),
                        client_id: Some(record.client_id),
                        token_type: Some(BEARER.to_string()),
                        exp: Some(record.expires_at.unix_timestamp()),
                        iat: Some(record.created_at.unix_timestamp()),
                        sub: Some(record.subject),
                    })
            };

            if let Some(response) = found {
                return Ok(response);
            }
        }

        Ok(IntrospectionResponse::inactive())
    }

    /// Revoke a token belonging to the calling client.
    ///
    /// Unknown tokens succeed silently. Revoking a refresh token also
    /// revokes the access token it currently points at.
    pub async fn revoke(&self, request: RevocationRequest) -> FlowResult<()> {
        let client = self
            .authenticate_client(request.client_id.as_deref(), request.client_secret.as_deref())
            .await?;

        let token = request
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("token is required".into()))?;

        let refresh_first = request.token_type_hint.as_deref() == Some("refresh_token");
        for check_refresh in [refresh_first, !refresh_first] {
            if check_refresh {
                if let Some(record) = self.store.refresh_token(token).await? {
                    if record.client_id == client.id {
                        self.store.remove_refresh_token(token).await?;
                        self.store.remove_access_token(&record.access_token).await?;
                        info!(client_id = %client.id, token_id = %record.id, "Refresh token revoked");
                        self.record_token(TokenOperation::Revoked, &record.id, &client.id).await;
                    }
                    return Ok(());
                }
            } else if let Some(record) = self.store.access_token(token).await? {
                if record.client_id == client.id {
                    self.store.remove_access_token(token).await?;
                    info!(client_id = %client.id, token_id = %record.id, "Access token revoked");
                    self.record_token(TokenOperation::Revoked, &record.id, &client.id).await;
                }
                return Ok(());
            }
        }

        debug!(client_id = %client.id, "Revocation of unknown token ignored");
        Ok(())
    }

    /// Authorization server metadata document
    #[must_use]
    pub fn metadata(&self) -> ServerMetadata {
        let issuer = self.issuer.trim_end_matches('/');
        let endpoint = |path: &str| format!("{issuer}{path}");

        let mut scopes: Vec<String> = self
            .clients
            .iter()
            .flat_map(|client| client.allowed_scopes.iter().map(str::to_owned))
            .collect();
        scopes.sort();
        scopes.dedup();

        ServerMetadata {
            issuer: issuer.to_string(),
            authorization_endpoint: endpoint(http::AUTHORIZE_PATH),
            token_endpoint: endpoint(http::TOKEN_PATH),
            introspection_endpoint: endpoint(http::INTROSPECT_PATH),
            revocation_endpoint: endpoint(http::REVOKE_PATH),
            userinfo_endpoint: endpoint(http::USERINFO_PATH),
            response_types_supported: vec!["code".into()],
            grant_types_supported: vec!["authorization_code".into(), "refresh_token".into()],
            code_challenge_methods_supported: vec![
                PkceMethod::S256.to_string(),
                PkceMethod::Plain.to_string(),
            ],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_post".into(),
                "client_secret_basic".into(),
            ],
            scopes_supported: scopes,
        }
    }

    async fn authenticate_client(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> FlowResult<&Client> {
        let client_id = client_id.unwrap_or_default();
        let result = self
            .clients
            .authenticate(client_id, client_secret.unwrap_or_default());

        self.audit
            .record(Event::ClientAuth {
                success: result.is_ok(),
                client_id: client_id.to_string(),
                error: result.as_ref().err().map(|e| e.description().to_string()),
            })
            .await;

        result
    }

    async fn reject_grant(&self, client_id: &str, reason: &str) -> OAuthError {
        self.audit
            .record(Event::Grant {
                operation: GrantOperation::Rejected,
                client_id: client_id.to_string(),
                reason: Some(reason.to_string()),
            })
            .await;
        OAuthError::InvalidGrant(reason.to_string())
    }

    async fn record_token(&self, operation: TokenOperation, token_id: &str, client_id: &str) {
        self.audit
            .record(Event::Token {
                operation,
                token_id: token_id.to_string(),
                client_id: client_id.to_string(),
            })
            .await;
    }

    fn new_access_token(
        &self,
        subject: &str,
        client_id: &str,
        scopes: ScopeSet,
        now: OffsetDateTime,
    ) -> Result<AccessToken> {
        Ok(AccessToken {
            id: record_id(),
            token: self.tokens.generate()?,
            subject: subject.to_string(),
            client_id: client_id.to_string(),
            scopes,
            created_at: now,
            expires_at: now + self.lifetimes.access_token,
        })
    }
}

fn parse_pkce(challenge: Option<String>, method: Option<&str>) -> FlowResult<Option<PkceChallenge>> {
    match (challenge.filter(|c| !c.is_empty()), method) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err(OAuthError::InvalidRequest(
            "code_challenge_method sent without code_challenge".into(),
        )),
        (Some(challenge), method) => Ok(Some(PkceChallenge {
            challenge,
            method: method.map(str::parse::<PkceMethod>).transpose()?.unwrap_or(PkceMethod::Plain),
        })),
    }
}

/// Append `code` and `state` to the registered redirect URI
fn redirect_location(redirect_uri: &str, code: &str, state: Option<&str>) -> String {
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut location = format!("{redirect_uri}{separator}code={}", urlencoding::encode(code));
    if let Some(state) = state {
        location.push_str("&state=");
        location.push_str(&urlencoding::encode(state));
    }
    location
}
