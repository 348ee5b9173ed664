//! Client registration

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use time::OffsetDateTime;

use crate::crypto::constant_time_eq;
use crate::error::{Error, OAuthError, Result};
use crate::scope::ScopeSet;

/// A registered OAuth client application. Immutable once the server is built.
#[derive(Clone, Serialize, Deserialize)]
pub struct Client {
    /// Unique identifier for the client
    pub id: String,

    /// Shared secret presented at the token endpoint
    pub secret: String,

    /// Name of the client application
    pub name: String,

    /// The single redirect URI codes may be delivered to
    pub redirect_uri: String,

    /// Scopes this client may request
    pub allowed_scopes: ScopeSet,

    /// When the client was registered
    pub created_at: OffsetDateTime,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("redirect_uri", &self.redirect_uri)
            .field("allowed_scopes", &self.allowed_scopes)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start building a client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }
}

/// Builder for [`Client`]
#[derive(Debug, Default)]
pub struct ClientBuilder {
    id: Option<String>,
    secret: Option<String>,
    name: Option<String>,
    redirect_uri: Option<String>,
    allowed_scopes: ScopeSet,
}

impl ClientBuilder {
    /// Use a fixed client id instead of a generated one
    #[must_use]
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Use a fixed secret instead of a generated one
    #[must_use]
    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    /// Set the client name
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set the registered redirect URI
    #[must_use]
    pub fn redirect_uri(mut self, uri: &str) -> Self {
        self.redirect_uri = Some(uri.to_string());
        self
    }

    /// Set the allowed scopes
    #[must_use]
    pub fn allowed_scopes(mut self, scopes: &[&str]) -> Self {
        self.allowed_scopes = ScopeSet::from(scopes);
        self
    }

    /// Create the client
    pub fn build(self) -> Result<Client> {
        let redirect_uri = self
            .redirect_uri
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| Error::Client("Redirect URI is required".into()))?;
        if self.allowed_scopes.is_empty() {
            return Err(Error::Client("At least one allowed scope is required".into()));
        }

        let id = self.id.unwrap_or_else(|| nanoid!());
        Ok(Client {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            secret: self.secret.unwrap_or_else(|| nanoid!(32)),
            redirect_uri,
            allowed_scopes: self.allowed_scopes,
            created_at: OffsetDateTime::now_utc(),
        })
    }
}

/// The fixed set of clients known to the server
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Client>,
}

impl ClientRegistry {
    /// Register a client. Fails if the id is taken.
    pub fn register(&mut self, client: Client) -> Result<()> {
        if self.clients.contains_key(&client.id) {
            return Err(Error::Client(format!("Duplicate client id {}", client.id)));
        }
        self.clients.insert(client.id.clone(), client);
        Ok(())
    }

    /// Look up a client by id
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    /// Iterate over registered clients
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Number of registered clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Check a client id and secret pair
    pub fn authenticate(&self, client_id: &str, secret: &str) -> std::result::Result<&Client, OAuthError> {
        let client = self
            .get(client_id)
            .ok_or_else(|| OAuthError::InvalidClient("Unknown client".into()))?;

        if !constant_time_eq(client.secret.as_bytes(), secret.as_bytes()) {
            return Err(OAuthError::InvalidClient("Client authentication failed".into()));
        }

        Ok(client)
    }
}
