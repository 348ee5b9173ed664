//! Grant and token records

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::pkce::PkceChallenge;
use crate::scope::ScopeSet;

/// How long each kind of credential lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLifetimes {
    /// Authorization codes (default 10 minutes)
    pub authorization_code: Duration,
    /// Access tokens (default 1 hour)
    pub access_token: Duration,
    /// Refresh tokens (default 30 days)
    pub refresh_token: Duration,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            authorization_code: Duration::minutes(10),
            access_token: Duration::hours(1),
            refresh_token: Duration::days(30),
        }
    }
}

/// A short-lived, single-use authorization code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    /// The opaque code handed to the user agent
    pub code: String,
    /// Client the code was issued to
    pub client_id: String,
    /// Redirect URI the code was delivered to
    pub redirect_uri: String,
    /// Scopes the client asked for
    pub scopes: ScopeSet,
    /// Opaque state echoed back to the client
    pub state: Option<String>,
    /// PKCE challenge, if the client sent one
    pub pkce: Option<PkceChallenge>,
    /// End user already authenticated by a login layer, if any
    pub subject: Option<String>,
    /// Issue time
    pub created_at: OffsetDateTime,
    /// Expiry time
    pub expires_at: OffsetDateTime,
    /// Set once, when the code is redeemed
    pub consumed: bool,
}

impl AuthorizationGrant {
    /// Whether the code's lifetime has elapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

/// A bearer credential for protected resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    /// Non-secret identifier used in logs
    pub id: String,
    /// The opaque bearer value
    pub token: String,
    /// End user the token acts for
    pub subject: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Granted scopes
    pub scopes: ScopeSet,
    /// Issue time
    pub created_at: OffsetDateTime,
    /// Expiry time
    pub expires_at: OffsetDateTime,
}

impl AccessToken {
    /// Whether the token's lifetime has elapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Seconds of validity left at `now`
    #[must_use]
    pub fn expires_in(&self, now: OffsetDateTime) -> u64 {
        u64::try_from((self.expires_at - now).whole_seconds()).unwrap_or(0)
    }
}

/// A long-lived credential used to mint new access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    /// Non-secret identifier used in logs
    pub id: String,
    /// The opaque refresh value
    pub token: String,
    /// The access token most recently issued from this refresh token
    pub access_token: String,
    /// End user the token acts for
    pub subject: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Scopes granted by the original authorization
    pub scopes: ScopeSet,
    /// Issue time
    pub created_at: OffsetDateTime,
    /// Expiry time
    pub expires_at: OffsetDateTime,
}

impl RefreshToken {
    /// Whether the token's lifetime has elapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

/// Short random identifier for log correlation
pub(crate) fn record_id() -> String {
    nanoid::nanoid!()
}
