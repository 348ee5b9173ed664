//! Identity claims for the holder of an access token

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::auth::BearerValidator;
use crate::error::{AccessError, OAuthError, Result};
use crate::scope::{ScopeSet, READ};

/// Profile data kept by the application for an end user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Name shown to the user
    pub display_name: String,
    /// Contact address
    pub email: String,
    /// Application-defined role
    pub role: String,
    /// Free-form preferences
    pub preferences: serde_json::Value,
    /// Last modification time
    pub updated_at: OffsetDateTime,
}

/// Source of user profiles, owned by the embedding application
#[async_trait]
pub trait UserProfileStore: Send + Sync + Debug {
    /// The profile for `subject`, if one exists
    async fn fetch_profile(&self, subject: &str) -> Result<Option<UserProfile>>;
}

/// In-memory [`UserProfileStore`]
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl MemoryProfileStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the profile for `subject`
    pub async fn insert(&self, subject: &str, profile: UserProfile) {
        self.profiles.write().await.insert(subject.to_string(), profile);
    }
}

#[async_trait]
impl UserProfileStore for MemoryProfileStore {
    async fn fetch_profile(&self, subject: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().await.get(subject).cloned())
    }
}

/// Claims returned by the userinfo endpoint. Only `sub` is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Subject identifier
    pub sub: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Preferences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences: Option<serde_json::Value>,
    /// Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl UserInfo {
    fn new(sub: String, profile: Option<UserProfile>) -> Self {
        match profile {
            Some(profile) => Self {
                sub,
                name: Some(profile.display_name),
                email: Some(profile.email),
                role: Some(profile.role),
                preferences: Some(profile.preferences),
                updated_at: Some(profile.updated_at.unix_timestamp()),
            },
            None => Self {
                sub,
                name: None,
                email: None,
                role: None,
                preferences: None,
                updated_at: None,
            },
        }
    }
}

/// Serves claims for bearer tokens carrying the `read` scope
#[derive(Debug, Clone)]
pub struct UserInfoEndpoint {
    validator: BearerValidator,
    profiles: Arc<dyn UserProfileStore>,
    required: ScopeSet,
}

impl UserInfoEndpoint {
    pub(crate) fn new(validator: BearerValidator, profiles: Arc<dyn UserProfileStore>) -> Self {
        Self {
            validator,
            profiles,
            required: ScopeSet::from(&[READ][..]),
        }
    }

    /// Resolve the token in `authorization` and return its subject's claims
    pub async fn handle(&self, authorization: Option<&str>) -> std::result::Result<UserInfo, OAuthError> {
        let token = self
            .validator
            .validate(authorization, &self.required)
            .await
            .map_err(AccessError::into_oauth)?;

        let profile = self.profiles.fetch_profile(&token.subject).await?;
        Ok(UserInfo::new(token.subject, profile))
    }
}
