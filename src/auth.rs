//! Bearer token validation and client-side flow helpers

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

use crate::clock::Clock;
use crate::crypto::TokenGenerator;
use crate::error::{AccessError, Error, Result};
use crate::logging::{AuditLog, Event, TokenOperation};
use crate::pkce::{s256_challenge, PkceMethod};
use crate::scope::ScopeSet;
use crate::storage::TokenStore;
use crate::token::AccessToken;

/// Identity attached to a request that passed a scope gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIdentity {
    /// End user the token acts for
    pub subject: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Scopes the token carries
    pub scopes: ScopeSet,
    /// When the token was issued
    pub issued_at: OffsetDateTime,
    /// When the token expires
    pub expires_at: OffsetDateTime,
}

impl From<AccessToken> for TokenIdentity {
    fn from(token: AccessToken) -> Self {
        Self {
            subject: token.subject,
            client_id: token.client_id,
            scopes: token.scopes,
            issued_at: token.created_at,
            expires_at: token.expires_at,
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for TokenIdentity {
    type Rejection = AccessError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or(AccessError::MissingToken)
    }
}

/// Extract the credential from an `Authorization: Bearer <token>` header.
///
/// The scheme is matched case-insensitively.
#[must_use]
pub fn extract_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolves bearer tokens against the store
#[derive(Debug, Clone)]
pub struct BearerValidator {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
}

impl BearerValidator {
    pub(crate) fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>, audit: AuditLog) -> Self {
        Self { store, clock, audit }
    }

    /// Validate an `Authorization` header value against a scope requirement.
    ///
    /// An expired token is evicted from the store as a side effect.
    pub async fn validate(
        &self,
        header: Option<&str>,
        required: &ScopeSet,
    ) -> std::result::Result<AccessToken, AccessError> {
        let token = header.and_then(extract_bearer).ok_or(AccessError::MissingToken)?;

        let record = self
            .store
            .access_token(token)
            .await?
            .ok_or(AccessError::InvalidToken)?;

        if record.is_expired(self.clock.now()) {
            self.store.remove_access_token(token).await?;
            debug!(token_id = %record.id, "Evicted expired access token");
            self.audit
                .record(Event::Token {
                    operation: TokenOperation::Expired,
                    token_id: record.id,
                    client_id: record.client_id,
                })
                .await;
            return Err(AccessError::ExpiredToken);
        }

        if !record.scopes.satisfies(required) {
            return Err(AccessError::InsufficientScopes {
                required: required.clone(),
                granted: record.scopes,
            });
        }

        Ok(record)
    }
}

/// Builder for the authorization URL a client sends the user agent to
#[derive(Debug)]
pub struct AuthFlow {
    client_id: Option<String>,
    scopes: ScopeSet,
    redirect_uri: Option<String>,
    state: Option<String>,
    code_verifier: Option<String>,
}

impl AuthFlow {
    /// Start an authorization code flow
    #[must_use]
    pub fn authorization_code() -> Self {
        Self {
            client_id: None,
            scopes: ScopeSet::default(),
            redirect_uri: None,
            state: None,
            code_verifier: None,
        }
    }

    /// Specify the client for this flow
    #[must_use]
    pub fn for_client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    /// Add scopes to the authorization request
    #[must_use]
    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = ScopeSet::from(scopes);
        self
    }

    /// Add a redirect URI to the authorization request
    #[must_use]
    pub fn with_redirect_uri(mut self, uri: &str) -> Self {
        self.redirect_uri = Some(uri.to_string());
        self
    }

    /// Add a state to the authorization request
    #[must_use]
    pub fn with_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    /// Generate a PKCE verifier; its S256 challenge goes into the URL
    pub fn with_pkce(mut self) -> Result<Self> {
        self.code_verifier = Some(TokenGenerator::new().generate()?);
        Ok(self)
    }

    /// The verifier to send with the token request, if PKCE is enabled
    #[must_use]
    pub fn code_verifier(&self) -> Option<&str> {
        self.code_verifier.as_deref()
    }

    /// Generate the authorization URL
    pub fn generate_url(&self) -> Result<String> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or_else(|| Error::Client("Client ID is required".into()))?;
        let redirect_uri = self
            .redirect_uri
            .as_deref()
            .ok_or_else(|| Error::Client("Redirect URI is required".into()))?;

        let mut params = vec![
            ("response_type", "code".to_string()),
            ("client_id", client_id.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
        ];

        if !self.scopes.is_empty() {
            params.push(("scope", self.scopes.to_string()));
        }

        if let Some(state) = &self.state {
            params.push(("state", state.clone()));
        }

        if let Some(verifier) = &self.code_verifier {
            params.push(("code_challenge", s256_challenge(verifier)));
            params.push(("code_challenge_method", PkceMethod::S256.to_string()));
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        Ok(format!("{}?{query}", crate::http::AUTHORIZE_PATH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryTokenStore;
    use crate::token::record_id;
    use pretty_assertions::assert_eq;
    use time::Duration;

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("BEARER  abc123 "), Some("abc123"));
        assert_eq!(extract_bearer("Basic abc123"), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer("Bearer   "), None);
    }

    async fn validator_with_token(scopes: &str) -> (BearerValidator, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryTokenStore::new());
        let now = clock.now();
        store
            .insert_access_token(AccessToken {
                id: record_id(),
                token: "token123".to_string(),
                subject: "user123".to_string(),
                client_id: "client123".to_string(),
                scopes: ScopeSet::parse(scopes),
                created_at: now,
                expires_at: now + Duration::hours(1),
            })
            .await
            .unwrap();
        let validator = BearerValidator::new(store, Arc::new(clock.clone()), AuditLog::tracing_only());
        (validator, clock)
    }

    #[tokio::test]
    async fn test_validate_outcomes() {
        let (validator, _) = validator_with_token("read").await;
        let read = ScopeSet::parse("read");

        assert_eq!(
            validator.validate(None, &read).await.unwrap_err(),
            AccessError::MissingToken
        );
        assert_eq!(
            validator.validate(Some("Bearer nope"), &read).await.unwrap_err(),
            AccessError::InvalidToken
        );

        let token = validator.validate(Some("Bearer token123"), &read).await.unwrap();
        assert_eq!(token.subject, "user123");

        let err = validator
            .validate(Some("Bearer token123"), &ScopeSet::parse("read book"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_OAUTH_SCOPES");
    }

    #[tokio::test]
    async fn test_expired_token_is_evicted() {
        let (validator, clock) = validator_with_token("read").await;
        let read = ScopeSet::parse("read");

        clock.advance(Duration::seconds(3600));
        assert!(validator.validate(Some("Bearer token123"), &read).await.is_ok());

        clock.advance(Duration::seconds(1));
        assert_eq!(
            validator.validate(Some("Bearer token123"), &read).await.unwrap_err(),
            AccessError::ExpiredToken
        );
        // Gone from the store, so the next lookup is simply unknown
        assert_eq!(
            validator.validate(Some("Bearer token123"), &read).await.unwrap_err(),
            AccessError::InvalidToken
        );
    }

    #[test]
    fn test_auth_flow_url_generation() {
        let url = AuthFlow::authorization_code()
            .for_client("client123")
            .with_scopes(&["read", "write"])
            .with_redirect_uri("https://example.com/callback")
            .with_state("xyz789")
            .generate_url()
            .unwrap();

        assert!(url.starts_with("/oauth/authorize?"));
        assert!(url.contains("client_id=client123"));
        assert!(url.contains("scope=read%20write"));
        assert!(url.contains("state=xyz789"));
        assert!(!url.contains("code_challenge"));
    }

    #[test]
    fn test_auth_flow_with_pkce() {
        let flow = AuthFlow::authorization_code()
            .for_client("client123")
            .with_redirect_uri("https://example.com/callback")
            .with_pkce()
            .unwrap();
        let verifier = flow.code_verifier().unwrap().to_string();
        let url = flow.generate_url().unwrap();

        assert!(url.contains(&format!("code_challenge={}", s256_challenge(&verifier))));
        assert!(url.contains("code_challenge_method=S256"));
    }

    #[test]
    fn test_auth_flow_requires_client() {
        let result = AuthFlow::authorization_code()
            .with_redirect_uri("https://example.com/callback")
            .generate_url();
        assert!(matches!(result, Err(Error::Client(_))));
    }
}
