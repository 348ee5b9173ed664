//! Error types for the authorization server

use axum::http::StatusCode;
use thiserror::Error;

use crate::scope::ScopeSet;

/// Library-level faults: storage, crypto, configuration and I/O
#[derive(Error, Debug)]
pub enum Error {
    /// Client-configuration errors
    #[error("Client error: {0}")]
    Client(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cryptography-related errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol errors returned by the OAuth endpoints.
///
/// These are always rendered as JSON bodies, never as redirects, so an
/// unverified redirect target can never receive a code or token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OAuthError {
    /// The request is missing a parameter or is otherwise malformed
    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    /// Client authentication failed or the client is unknown
    #[error("invalid_client: {0}")]
    InvalidClient(String),

    /// The code or refresh token is invalid, expired, spent, or bound elsewhere
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// The redirect URI does not exactly match the registered one
    #[error("invalid_redirect_uri: {0}")]
    InvalidRedirectUri(String),

    /// The requested scope exceeds what the client or grant allows
    #[error("invalid_scope: {0}")]
    InvalidScope(String),

    /// Only `response_type=code` is supported
    #[error("unsupported_response_type: {0}")]
    UnsupportedResponseType(String),

    /// The `grant_type` is not one the token endpoint understands
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),

    /// The bearer token is missing, malformed, unknown, or expired
    #[error("invalid_token: {0}")]
    InvalidToken(String),

    /// The bearer token lacks a scope the endpoint requires
    #[error("insufficient_scope: {0}")]
    InsufficientScope(String),

    /// An internal fault. The detail is logged, never sent to the caller.
    #[error("server_error: {0}")]
    ServerError(String),
}

impl OAuthError {
    /// The RFC 6749 error code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::InvalidRedirectUri(_) => "invalid_redirect_uri",
            Self::InvalidScope(_) => "invalid_scope",
            Self::UnsupportedResponseType(_) => "unsupported_response_type",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidToken(_) => "invalid_token",
            Self::InsufficientScope(_) => "insufficient_scope",
            Self::ServerError(_) => "server_error",
        }
    }

    /// Human-readable description; empty for server errors
    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::ServerError(_) => "",
            Self::InvalidRequest(d)
            | Self::InvalidClient(d)
            | Self::InvalidGrant(d)
            | Self::InvalidRedirectUri(d)
            | Self::InvalidScope(d)
            | Self::UnsupportedResponseType(d)
            | Self::UnsupportedGrantType(d)
            | Self::InvalidToken(d)
            | Self::InsufficientScope(d) => d,
        }
    }

    /// HTTP status this error is reported with
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidClient(_) | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope(_) => StatusCode::FORBIDDEN,
            Self::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<Error> for OAuthError {
    fn from(err: Error) -> Self {
        tracing::error!(error = %err, "Internal error while handling OAuth request");
        Self::ServerError(err.to_string())
    }
}

/// Rejections produced by the scope gate in front of protected resources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// No `Authorization: Bearer` header, or it could not be parsed
    #[error("Missing or malformed bearer token")]
    MissingToken,

    /// The token is not known to the store
    #[error("Invalid access token")]
    InvalidToken,

    /// The token was found but its lifetime has elapsed
    #[error("Access token has expired")]
    ExpiredToken,

    /// The token does not carry every required scope
    #[error("Insufficient scopes: requires {required}, token has {granted}")]
    InsufficientScopes {
        /// Scopes the resource demands
        required: ScopeSet,
        /// Scopes the token actually carries
        granted: ScopeSet,
    },

    /// The store failed while validating the token
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AccessError {
    /// Machine-readable code for programmatic client handling
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "MISSING_OAUTH_TOKEN",
            Self::InvalidToken => "INVALID_OAUTH_TOKEN",
            Self::ExpiredToken => "EXPIRED_OAUTH_TOKEN",
            Self::InsufficientScopes { .. } => "INSUFFICIENT_OAUTH_SCOPES",
            Self::Internal(_) => "SERVER_ERROR",
        }
    }

    /// HTTP status this rejection is reported with
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken | Self::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }
            Self::InsufficientScopes { .. } => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map to the protocol error shape used by the userinfo endpoint
    #[must_use]
    pub fn into_oauth(self) -> OAuthError {
        match self {
            Self::MissingToken | Self::InvalidToken | Self::ExpiredToken => {
                OAuthError::InvalidToken(self.to_string())
            }
            Self::InsufficientScopes { .. } => OAuthError::InsufficientScope(self.to_string()),
            Self::Internal(detail) => OAuthError::ServerError(detail),
        }
    }
}

impl From<Error> for AccessError {
    fn from(err: Error) -> Self {
        tracing::error!(error = %err, "Internal error while validating bearer token");
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_oauth_error_codes_and_statuses() {
        let err = OAuthError::InvalidClient("unknown client".into());
        assert_eq!(err.code(), "invalid_client");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.description(), "unknown client");

        let err = OAuthError::InvalidGrant("spent".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = OAuthError::InsufficientScope("needs read".into());
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_server_error_hides_detail() {
        let err: OAuthError = Error::Storage("disk on fire".into()).into();
        assert_eq!(err.code(), "server_error");
        assert_eq!(err.description(), "");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_access_error_codes() {
        assert_eq!(AccessError::MissingToken.code(), "MISSING_OAUTH_TOKEN");
        assert_eq!(AccessError::InvalidToken.code(), "INVALID_OAUTH_TOKEN");
        assert_eq!(AccessError::ExpiredToken.code(), "EXPIRED_OAUTH_TOKEN");

        let err = AccessError::InsufficientScopes {
            required: ScopeSet::parse("read book"),
            granted: ScopeSet::parse("read"),
        };
        assert_eq!(err.code(), "INSUFFICIENT_OAUTH_SCOPES");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.into_oauth().code(), "insufficient_scope");
    }
}
