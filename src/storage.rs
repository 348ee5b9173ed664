//! Token storage
//!
//! [`TokenStore`] is the only shared mutable state in the server. Endpoints
//! hold it as `Arc<dyn TokenStore>`, so the backend can be swapped without
//! touching protocol logic. [`MemoryTokenStore`] is the bundled backend and
//! can optionally persist an encrypted snapshot to disk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::crypto::SnapshotKey;
use crate::error::{Error, Result};
use crate::logging::{Event, SystemOperation};
use crate::token::{AccessToken, AuthorizationGrant, RefreshToken};

const SNAPSHOT_VERSION: u32 = 1;

/// Outcome of an attempt to redeem an authorization code
#[derive(Debug, Clone)]
pub enum GrantRedemption {
    /// The code was live and is now marked consumed
    Redeemed(AuthorizationGrant),
    /// No such code
    Unknown,
    /// The code's lifetime has elapsed
    Expired,
    /// The code was already redeemed
    AlreadyConsumed,
}

/// Number of records evicted by a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired authorization grants removed
    pub grants: usize,
    /// Expired access tokens removed
    pub access_tokens: usize,
    /// Expired refresh tokens removed
    pub refresh_tokens: usize,
}

impl SweepReport {
    /// Total records removed
    #[must_use]
    pub const fn total(&self) -> usize {
        self.grants + self.access_tokens + self.refresh_tokens
    }
}

/// Durable mapping from opaque strings to grant and token records.
///
/// Every method is individually atomic. [`TokenStore::consume_grant`] must
/// check and mark the grant in one step: two concurrent calls for the same
/// code may yield at most one [`GrantRedemption::Redeemed`].
#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Persist a new authorization grant
    async fn insert_grant(&self, grant: AuthorizationGrant) -> Result<()>;

    /// Atomically mark a grant consumed if it is live and unspent
    async fn consume_grant(&self, code: &str, now: OffsetDateTime) -> Result<GrantRedemption>;

    /// Persist a new access token
    async fn insert_access_token(&self, token: AccessToken) -> Result<()>;

    /// Look up an access token (expired records included)
    async fn access_token(&self, token: &str) -> Result<Option<AccessToken>>;

    /// Delete an access token, returning it if it existed
    async fn remove_access_token(&self, token: &str) -> Result<Option<AccessToken>>;

    /// Persist a new refresh token
    async fn insert_refresh_token(&self, token: RefreshToken) -> Result<()>;

    /// Look up a refresh token (expired records included)
    async fn refresh_token(&self, token: &str) -> Result<Option<RefreshToken>>;

    /// Delete a refresh token, returning it if it existed
    async fn remove_refresh_token(&self, token: &str) -> Result<Option<RefreshToken>>;

    /// Point a refresh token at a newly issued access token.
    ///
    /// Returns the previous pointer, or `None` if the refresh token is gone.
    async fn repoint_refresh_token(
        &self,
        refresh_token: &str,
        access_token: &str,
    ) -> Result<Option<String>>;

    /// Evict every record expired at `now`
    async fn purge_expired(&self, now: OffsetDateTime) -> Result<SweepReport>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    grants: HashMap<String, AuthorizationGrant>,
    access_tokens: HashMap<String, AccessToken>,
    refresh_tokens: HashMap<String, RefreshToken>,
}

/// On-disk envelope; `state` is kept as raw JSON so the checksum is stable.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: OffsetDateTime,
    checksum: String,
    state: String,
}

fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug)]
struct SnapshotTarget {
    path: PathBuf,
    key: SnapshotKey,
}

/// In-memory [`TokenStore`] with optional encrypted snapshots
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    state: Arc<RwLock<StoreState>>,
    snapshot: Option<Arc<SnapshotTarget>>,
}

impl MemoryTokenStore {
    /// Create an empty, purely in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that can be saved to and loaded from `path`
    #[must_use]
    pub fn with_snapshot(path: impl AsRef<Path>, key: SnapshotKey) -> Self {
        Self {
            state: Arc::default(),
            snapshot: Some(Arc::new(SnapshotTarget {
                path: path.as_ref().to_path_buf(),
                key,
            })),
        }
    }

    fn snapshot_target(&self) -> Result<&SnapshotTarget> {
        self.snapshot
            .as_deref()
            .ok_or_else(|| Error::Config("No snapshot path configured".into()))
    }

    /// Write the full store to the snapshot file
    pub async fn save(&self) -> Result<()> {
        let target = self.snapshot_target()?;

        let state = serde_json::to_string(&*self.state.read().await)?;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: OffsetDateTime::now_utc(),
            checksum: checksum(state.as_bytes()),
            state,
        };
        let sealed = target.key.seal(&serde_json::to_vec(&snapshot)?)?;

        // Write to a sibling file first so a crash never leaves a torn snapshot
        let temp_path = target.path.with_extension("tmp");
        tokio::fs::write(&temp_path, sealed)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write snapshot: {e}")))?;
        tokio::fs::rename(&temp_path, &target.path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to save snapshot: {e}")))?;

        info!(
            event = ?Event::System {
                operation: SystemOperation::StateSaved,
                details: None,
            },
            "Token store snapshot saved"
        );

        Ok(())
    }

    /// Replace the in-memory state with the snapshot file's contents
    pub async fn load(&self) -> Result<()> {
        let target = self.snapshot_target()?;

        let sealed = tokio::fs::read(&target.path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read snapshot: {e}")))?;
        let opened = target.key.open(&sealed)?;
        let snapshot: Snapshot = serde_json::from_slice(&opened)
            .map_err(|e| Error::Storage(format!("Failed to deserialize snapshot: {e}")))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Storage(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if checksum(snapshot.state.as_bytes()) != snapshot.checksum {
            return Err(Error::Storage("Snapshot checksum mismatch".into()));
        }

        let state: StoreState = serde_json::from_str(&snapshot.state)?;
        info!(
            grants = state.grants.len(),
            access_tokens = state.access_tokens.len(),
            refresh_tokens = state.refresh_tokens.len(),
            "Token store snapshot loaded"
        );
        *self.state.write().await = state;

        Ok(())
    }

    /// Number of records currently held, expired ones included
    pub async fn len(&self) -> usize {
        let state = self.state.read().await;
        state.grants.len() + state.access_tokens.len() + state.refresh_tokens.len()
    }

    /// Whether the store holds no records
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert_grant(&self, grant: AuthorizationGrant) -> Result<()> {
        let mut state = self.state.write().await;
        state.grants.insert(grant.code.clone(), grant);
        Ok(())
    }

    async fn consume_grant(&self, code: &str, now: OffsetDateTime) -> Result<GrantRedemption> {
        // The check and the mark happen under one write lock
        let mut state = self.state.write().await;
        let Some(grant) = state.grants.get_mut(code) else {
            return Ok(GrantRedemption::Unknown);
        };

        if grant.consumed {
            return Ok(GrantRedemption::AlreadyConsumed);
        }
        if grant.is_expired(now) {
            return Ok(GrantRedemption::Expired);
        }

        grant.consumed = true;
        Ok(GrantRedemption::Redeemed(grant.clone()))
    }

    async fn insert_access_token(&self, token: AccessToken) -> Result<()> {
        let mut state = self.state.write().await;
        state.access_tokens.insert(token.token.clone(), token);
        Ok(())
    }

    async fn access_token(&self, token: &str) -> Result<Option<AccessToken>> {
        let state = self.state.read().await;
        Ok(state.access_tokens.get(token).cloned())
    }

    async fn remove_access_token(&self, token: &str) -> Result<Option<AccessToken>> {
        let mut state = self.state.write().await;
        Ok(state.access_tokens.remove(token))
    }

    async fn insert_refresh_token(&self, token: RefreshToken) -> Result<()> {
        let mut state = self.state.write().await;
        state.refresh_tokens.insert(token.token.clone(), token);
        Ok(())
    }

    async fn refresh_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        let state = self.state.read().await;
        Ok(state.refresh_tokens.get(token).cloned())
    }

    async fn remove_refresh_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        let mut state = self.state.write().await;
        Ok(state.refresh_tokens.remove(token))
    }

    async fn repoint_refresh_token(
        &self,
        refresh_token: &str,
        access_token: &str,
    ) -> Result<Option<String>> {
        let mut state = self.state.write().await;
        Ok(state
            .refresh_tokens
            .get_mut(refresh_token)
            .map(|record| std::mem::replace(&mut record.access_token, access_token.to_owned())))
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<SweepReport> {
        // Collect candidates from a snapshot under the read lock only
        let (grants, access_tokens, refresh_tokens) = {
            let state = self.state.read().await;
            (
                expired_keys(&state.grants, |g| g.is_expired(now)),
                expired_keys(&state.access_tokens, |t| t.is_expired(now)),
                expired_keys(&state.refresh_tokens, |t| t.is_expired(now)),
            )
        };

        // Evict one record per write lock, re-checking in case it was replaced
        let mut report = SweepReport::default();
        for code in grants {
            let mut state = self.state.write().await;
            if state.grants.get(&code).is_some_and(|g| g.is_expired(now)) {
                state.grants.remove(&code);
                report.grants += 1;
            }
        }
        for token in access_tokens {
            let mut state = self.state.write().await;
            if state.access_tokens.get(&token).is_some_and(|t| t.is_expired(now)) {
                state.access_tokens.remove(&token);
                report.access_tokens += 1;
            }
        }
        for token in refresh_tokens {
            let mut state = self.state.write().await;
            if state.refresh_tokens.get(&token).is_some_and(|t| t.is_expired(now)) {
                state.refresh_tokens.remove(&token);
                report.refresh_tokens += 1;
            }
        }

        debug!(
            grants = report.grants,
            access_tokens = report.access_tokens,
            refresh_tokens = report.refresh_tokens,
            "Purged expired records"
        );

        Ok(report)
    }
}

fn expired_keys<T>(records: &HashMap<String, T>, is_expired: impl Fn(&T) -> bool) -> Vec<String> {
    records
        .iter()
        .filter(|(_, record)| is_expired(record))
        .map(|(key, _)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeSet;
    use crate::token::record_id;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use time::Duration;

    fn grant(code: &str, now: OffsetDateTime) -> AuthorizationGrant {
        AuthorizationGrant {
            code: code.to_string(),
            client_id: "client123".to_string(),
            redirect_uri: "https://example.com/callback".to_string(),
            scopes: ScopeSet::parse("read"),
            state: None,
            pkce: None,
            subject: None,
            created_at: now,
            expires_at: now + Duration::minutes(10),
            consumed: false,
        }
    }

    fn access_token(token: &str, now: OffsetDateTime, lifetime: Duration) -> AccessToken {
        AccessToken {
            id: record_id(),
            token: token.to_string(),
            subject: "user123".to_string(),
            client_id: "client123".to_string(),
            scopes: ScopeSet::parse("read"),
            created_at: now,
            expires_at: now + lifetime,
        }
    }

    fn refresh_token(token: &str, access: &str, now: OffsetDateTime) -> RefreshToken {
        RefreshToken {
            id: record_id(),
            token: token.to_string(),
            access_token: access.to_string(),
            subject: "user123".to_string(),
            client_id: "client123".to_string(),
            scopes: ScopeSet::parse("read"),
            created_at: now,
            expires_at: now + Duration::days(30),
        }
    }

    #[tokio::test]
    async fn test_grant_is_single_use() {
        let store = MemoryTokenStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert_grant(grant("code123", now)).await.unwrap();

        assert!(matches!(
            store.consume_grant("code123", now).await.unwrap(),
            GrantRedemption::Redeemed(g) if g.consumed
        ));
        assert!(matches!(
            store.consume_grant("code123", now).await.unwrap(),
            GrantRedemption::AlreadyConsumed
        ));
        assert!(matches!(
            store.consume_grant("nope", now).await.unwrap(),
            GrantRedemption::Unknown
        ));
    }

    #[tokio::test]
    async fn test_expired_grant_not_redeemable() {
        let store = MemoryTokenStore::new();
        let now = OffsetDateTime::now_utc();
        store.insert_grant(grant("code123", now)).await.unwrap();

        let later = now + Duration::minutes(11);
        assert!(matches!(
            store.consume_grant("code123", later).await.unwrap(),
            GrantRedemption::Expired
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumption_yields_one_winner() {
        let store = Arc::new(MemoryTokenStore::new());
        let now = OffsetDateTime::now_utc();
        store.insert_grant(grant("code123", now)).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.consume_grant("code123", now).await.unwrap() })
            })
            .collect();

        let mut redeemed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), GrantRedemption::Redeemed(_)) {
                redeemed += 1;
            }
        }
        assert_eq!(redeemed, 1);
    }

    #[tokio::test]
    async fn test_token_operations() {
        let store = MemoryTokenStore::new();
        let now = OffsetDateTime::now_utc();

        store
            .insert_access_token(access_token("access1", now, Duration::hours(1)))
            .await
            .unwrap();
        store
            .insert_refresh_token(refresh_token("refresh1", "access1", now))
            .await
            .unwrap();

        assert_eq!(
            store.access_token("access1").await.unwrap().unwrap().subject,
            "user123"
        );

        let previous = store.repoint_refresh_token("refresh1", "access2").await.unwrap();
        assert_eq!(previous.as_deref(), Some("access1"));
        assert_eq!(
            store.refresh_token("refresh1").await.unwrap().unwrap().access_token,
            "access2"
        );
        assert!(store
            .repoint_refresh_token("missing", "access2")
            .await
            .unwrap()
            .is_none());

        assert!(store.remove_access_token("access1").await.unwrap().is_some());
        assert!(store.access_token("access1").await.unwrap().is_none());
        assert!(store.remove_refresh_token("refresh1").await.unwrap().is_some());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_records() {
        let store = MemoryTokenStore::new();
        let now = OffsetDateTime::now_utc();

        store.insert_grant(grant("code1", now)).await.unwrap();
        store
            .insert_access_token(access_token("short", now, Duration::minutes(5)))
            .await
            .unwrap();
        store
            .insert_access_token(access_token("long", now, Duration::hours(2)))
            .await
            .unwrap();
        store
            .insert_refresh_token(refresh_token("refresh1", "long", now))
            .await
            .unwrap();

        let report = store.purge_expired(now + Duration::hours(1)).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                grants: 1,
                access_tokens: 1,
                refresh_tokens: 0,
            }
        );
        assert_eq!(report.total(), 2);
        assert!(store.access_token("long").await.unwrap().is_some());
        assert!(store.refresh_token("refresh1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.snapshot");
        let key = SnapshotKey::new(vec![3; 32]).unwrap();
        let now = OffsetDateTime::now_utc();

        let store = MemoryTokenStore::with_snapshot(&path, key.clone());
        store
            .insert_access_token(access_token("access1", now, Duration::hours(1)))
            .await
            .unwrap();
        store.insert_grant(grant("code1", now)).await.unwrap();
        store.save().await.unwrap();

        let restored = MemoryTokenStore::with_snapshot(&path, key);
        restored.load().await.unwrap();
        assert_eq!(restored.len().await, 2);
        assert_eq!(
            restored.access_token("access1").await.unwrap().unwrap().client_id,
            "client123"
        );
    }

    #[tokio::test]
    async fn test_snapshot_rejects_wrong_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.snapshot");

        let store = MemoryTokenStore::with_snapshot(&path, SnapshotKey::new(vec![1; 32]).unwrap());
        store.save().await.unwrap();

        let other = MemoryTokenStore::with_snapshot(&path, SnapshotKey::new(vec![2; 32]).unwrap());
        assert!(matches!(other.load().await, Err(Error::Crypto(_))));
    }

    #[tokio::test]
    async fn test_save_without_snapshot_path() {
        let store = MemoryTokenStore::new();
        assert!(matches!(store.save().await, Err(Error::Config(_))));
    }
}
