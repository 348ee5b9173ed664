//! AgentAuth - an embedded OAuth2 authorization server for agents
//!
//! Issues, validates, refreshes and introspects opaque credentials for a
//! third-party client (typically an LLM-driven agent) acting on behalf of
//! an end user. Codes are single-use, PKCE-bound when the client asks for
//! it, and every credential expires against an injectable clock.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use agentauth::prelude::*;
//! use axum::routing::get;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     agentauth::init_tracing("info");
//!
//!     let auth = AuthServer::builder()
//!         .with_client(
//!             Client::builder()
//!                 .id("travel-agent")
//!                 .redirect_uri("https://agent.example.com/callback")
//!                 .allowed_scopes(&["read", "book"])
//!                 .build()?,
//!         )
//!         .build()
//!         .await?;
//!     auth.sweeper().start()?;
//!
//!     let bookings = auth
//!         .require_scopes(&["read", "book"])
//!         .protect(axum::Router::new().route("/bookings", get(|| async { "ok" })));
//!     let app = auth.router().merge(bookings);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

#[cfg(test)]
use {
    pretty_assertions as _, tempfile as _, test_log as _, tokio_test as _, tower as _,
    tracing_test as _, url as _,
};

mod auth;
mod client;
mod clock;
mod crypto;
mod error;
pub mod http;
mod logging;
mod middleware;
mod oauth;
mod pkce;
pub mod scope;
mod storage;
mod sweeper;
mod token;
mod userinfo;

pub use crate::auth::{extract_bearer, AuthFlow, BearerValidator, TokenIdentity};
pub use crate::client::{Client, ClientBuilder, ClientRegistry};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::crypto::{SnapshotKey, TokenGenerator};
pub use crate::error::{AccessError, Error, OAuthError, Result};
pub use crate::logging::{
    init_tracing, AuditLog, Event, GrantOperation, LogConfig, Logger, SystemOperation,
    TokenOperation,
};
pub use crate::middleware::ScopeGate;
pub use crate::oauth::{
    AuthorizeRedirect, AuthorizeRequest, EphemeralSubjects, IntrospectionRequest,
    IntrospectionResponse, OAuth2Flow, RevocationRequest, ServerMetadata, SubjectResolver,
    TokenRequest, TokenResponse,
};
pub use crate::pkce::{s256_challenge, PkceChallenge, PkceMethod};
pub use crate::scope::ScopeSet;
pub use crate::storage::{GrantRedemption, MemoryTokenStore, SweepReport, TokenStore};
pub use crate::sweeper::{CleanupSweeper, DEFAULT_SWEEP_INTERVAL};
pub use crate::token::{AccessToken, AuthorizationGrant, RefreshToken, TokenLifetimes};
pub use crate::userinfo::{MemoryProfileStore, UserInfo, UserInfoEndpoint, UserProfile, UserProfileStore};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Core authorization server type. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AuthServer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    oauth: OAuth2Flow,
    userinfo: UserInfoEndpoint,
    validator: BearerValidator,
    sweeper: CleanupSweeper,
    store: Arc<dyn TokenStore>,
    audit: AuditLog,
}

/// Builder for configuring an [`AuthServer`]
#[derive(Debug)]
pub struct AuthServerBuilder {
    clients: Vec<Client>,
    store: Option<Arc<dyn TokenStore>>,
    profiles: Option<Arc<dyn UserProfileStore>>,
    clock: Option<Arc<dyn Clock>>,
    subjects: Option<Arc<dyn SubjectResolver>>,
    lifetimes: TokenLifetimes,
    rotate_refresh_tokens: bool,
    sweep_interval: Duration,
    issuer: String,
    log_config: Option<LogConfig>,
}

impl Default for AuthServerBuilder {
    fn default() -> Self {
        Self {
            clients: Vec::new(),
            store: None,
            profiles: None,
            clock: None,
            subjects: None,
            lifetimes: TokenLifetimes::default(),
            rotate_refresh_tokens: false,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            issuer: "http://localhost:8080".to_string(),
            log_config: None,
        }
    }
}

impl AuthServerBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.clients.push(client);
        self
    }

    /// Use a custom token store (default: [`MemoryTokenStore`])
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a profile store for the userinfo endpoint (default: empty)
    #[must_use]
    pub fn with_profiles(mut self, profiles: Arc<dyn UserProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Use a custom time source (default: [`SystemClock`])
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Decide subjects for grants issued without one (default: [`EphemeralSubjects`])
    #[must_use]
    pub fn with_subject_resolver(mut self, subjects: Arc<dyn SubjectResolver>) -> Self {
        self.subjects = Some(subjects);
        self
    }

    /// Override credential lifetimes
    #[must_use]
    pub const fn with_lifetimes(mut self, lifetimes: TokenLifetimes) -> Self {
        self.lifetimes = lifetimes;
        self
    }

    /// Issue a new refresh token on every refresh and revoke the old one
    #[must_use]
    pub const fn rotate_refresh_tokens(mut self, rotate: bool) -> Self {
        self.rotate_refresh_tokens = rotate;
        self
    }

    /// Pause between background sweeps
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Public base URL advertised in server metadata
    #[must_use]
    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = issuer.to_string();
        self
    }

    /// Also write audit events to a rotating file
    #[must_use]
    pub fn with_audit_log(mut self, config: LogConfig) -> Self {
        self.log_config = Some(config);
        self
    }

    /// Initialize the server
    pub async fn build(self) -> Result<AuthServer> {
        if self.clients.is_empty() {
            return Err(Error::Config("At least one client is required".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("Sweep interval must be non-zero".into()));
        }
        let lifetimes = self.lifetimes;
        if !lifetimes.authorization_code.is_positive()
            || !lifetimes.access_token.is_positive()
            || !lifetimes.refresh_token.is_positive()
        {
            return Err(Error::Config("Token lifetimes must be positive".into()));
        }

        let mut clients = ClientRegistry::default();
        for client in self.clients {
            clients.register(client)?;
        }

        let audit = match self.log_config {
            Some(config) => AuditLog::with_file(config)?,
            None => AuditLog::tracing_only(),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryTokenStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let profiles = self
            .profiles
            .unwrap_or_else(|| Arc::new(MemoryProfileStore::new()));

        let mut oauth = OAuth2Flow::new(Arc::new(clients), Arc::clone(&store), Arc::clone(&clock));
        if let Some(subjects) = self.subjects {
            oauth.subjects = subjects;
        }
        oauth.lifetimes = lifetimes;
        oauth.rotate_refresh_tokens = self.rotate_refresh_tokens;
        oauth.issuer = self.issuer;
        oauth.audit = audit.clone();

        let validator = BearerValidator::new(Arc::clone(&store), Arc::clone(&clock), audit.clone());
        let userinfo = UserInfoEndpoint::new(validator.clone(), profiles);
        let sweeper = CleanupSweeper::new(
            Arc::clone(&store),
            clock,
            audit.clone(),
            self.sweep_interval,
        );

        info!(
            clients = oauth.clients.len(),
            issuer = %oauth.issuer,
            rotate_refresh_tokens = oauth.rotate_refresh_tokens,
            "Authorization server initialized"
        );
        audit
            .record(Event::System {
                operation: SystemOperation::Startup,
                details: None,
            })
            .await;

        Ok(AuthServer {
            inner: Arc::new(Inner {
                oauth,
                userinfo,
                validator,
                sweeper,
                store,
                audit,
            }),
        })
    }
}

impl AuthServer {
    /// Start configuring a server
    #[must_use]
    pub fn builder() -> AuthServerBuilder {
        AuthServerBuilder::new()
    }

    /// The protocol flows
    #[must_use]
    pub fn oauth(&self) -> &OAuth2Flow {
        &self.inner.oauth
    }

    /// The userinfo endpoint
    #[must_use]
    pub fn userinfo(&self) -> &UserInfoEndpoint {
        &self.inner.userinfo
    }

    /// Bearer token validation against the shared store
    #[must_use]
    pub fn validator(&self) -> &BearerValidator {
        &self.inner.validator
    }

    /// The background cleanup task
    #[must_use]
    pub fn sweeper(&self) -> &CleanupSweeper {
        &self.inner.sweeper
    }

    /// The shared token store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.store
    }

    /// The audit sink
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// Build a gate demanding every scope in `scopes`
    #[must_use]
    pub fn require_scopes(&self, scopes: &[&str]) -> ScopeGate {
        ScopeGate::new(self.inner.validator.clone(), ScopeSet::from(scopes))
    }

    /// Router serving every OAuth endpoint
    #[must_use]
    pub fn router(&self) -> axum::Router {
        http::router(self.clone())
    }
}

/// Prelude module containing commonly used types and traits
pub mod prelude {
    pub use crate::auth::TokenIdentity;
    pub use crate::client::Client;
    pub use crate::error::{Error, OAuthError};
    pub use crate::scope::ScopeSet;
    pub use crate::storage::TokenStore;
    pub use crate::{AuthServer, AuthServerBuilder};
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn client() -> Client {
        Client::builder()
            .id("agent")
            .secret("secret")
            .redirect_uri("https://agent.example.com/callback")
            .allowed_scopes(&["read"])
            .build()
            .unwrap()
    }

    #[traced_test]
    #[tokio::test]
    async fn test_builder_defaults() {
        let server = AuthServer::builder().with_client(client()).build().await.unwrap();

        assert_eq!(server.oauth().metadata().issuer, "http://localhost:8080");
        assert!(!server.sweeper().is_running());
        assert!(logs_contain("Authorization server initialized"));
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_config() {
        assert!(matches!(
            AuthServer::builder().build().await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            AuthServer::builder()
                .with_client(client())
                .with_client(client())
                .build()
                .await,
            Err(Error::Client(_))
        ));
        assert!(matches!(
            AuthServer::builder()
                .with_client(client())
                .sweep_interval(Duration::ZERO)
                .build()
                .await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_audit_file_records_startup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        AuthServer::builder()
            .with_client(client())
            .with_audit_log(LogConfig {
                path: path.clone(),
                ..LogConfig::default()
            })
            .build()
            .await
            .unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains(r#""operation":"startup""#));
    }

    #[test]
    fn test_sweeper_lifecycle_through_server() {
        tokio_test::block_on(async {
            let server = AuthServer::builder().with_client(client()).build().await.unwrap();
            let report = server.sweeper().run_once().await.unwrap();
            assert_eq!(report.total(), 0);
        });
    }
}
