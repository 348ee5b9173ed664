//! Logging and audit trail functionality
//!
//! Every audit [`Event`] is mirrored to `tracing`. When a [`LogConfig`] is
//! supplied the event is also appended to a JSON-lines file with
//! size-based rotation. Codes and token values never appear in events;
//! records are referred to by their non-secret ids.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Types of events that can be logged
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Client authentication at the token, refresh or revocation endpoint
    #[serde(rename = "client_auth")]
    ClientAuth {
        /// Success or failure
        success: bool,
        /// Client ID that attempted auth
        client_id: String,
        /// Error message if failed
        error: Option<String>,
    },

    /// Authorization grant lifecycle
    #[serde(rename = "grant")]
    Grant {
        /// What happened to the grant
        operation: GrantOperation,
        /// Client the grant belongs to
        client_id: String,
        /// Why a redemption was rejected
        reason: Option<String>,
    },

    /// Token operation event
    #[serde(rename = "token")]
    Token {
        /// Type of token operation
        operation: TokenOperation,
        /// Non-secret id of the token record
        token_id: String,
        /// ID of the client
        client_id: String,
    },

    /// System event
    #[serde(rename = "system")]
    System {
        /// Type of system event
        operation: SystemOperation,
        /// Additional details
        details: Option<String>,
    },
}

/// Types of grant operations
#[derive(Debug, Clone, Copy, Serialize)]
pub enum GrantOperation {
    /// A code was issued via redirect
    #[serde(rename = "issued")]
    Issued,
    /// A code was redeemed for tokens
    #[serde(rename = "consumed")]
    Consumed,
    /// A redemption attempt failed
    #[serde(rename = "rejected")]
    Rejected,
}

/// Types of token operations
#[derive(Debug, Clone, Copy, Serialize)]
pub enum TokenOperation {
    /// Token was created by a code exchange
    #[serde(rename = "issued")]
    Issued,
    /// Access token was created from a refresh token
    #[serde(rename = "refreshed")]
    Refreshed,
    /// Token was revoked
    #[serde(rename = "revoked")]
    Revoked,
    /// Token was found expired and evicted at lookup
    #[serde(rename = "expired")]
    Expired,
}

/// Types of system operations
#[derive(Debug, Clone, Copy, Serialize)]
pub enum SystemOperation {
    /// Server started
    #[serde(rename = "startup")]
    Startup,
    /// Cleanup sweep finished
    #[serde(rename = "sweep_completed")]
    SweepCompleted,
    /// State was saved
    #[serde(rename = "state_saved")]
    StateSaved,
    /// Error occurred
    #[serde(rename = "error")]
    Error,
}

/// Configuration for the audit log file
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Path to the log file
    pub path: PathBuf,
    /// Maximum size of log file before rotation (in bytes)
    pub max_size: u64,
    /// Number of rotated files to keep
    pub keep_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/audit.log"),
            max_size: 10 * 1024 * 1024,
            keep_files: 5,
        }
    }
}

/// Appends audit events to a rotating file
#[derive(Debug)]
pub struct Logger {
    config: LogConfig,
    current_size: AtomicU64,
    write_lock: Mutex<()>,
}

impl Logger {
    /// Create a new logger
    pub fn new(config: LogConfig) -> Result<Self> {
        // Create log directory if it doesn't exist
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let current_size = std::fs::metadata(&config.path).map_or(0, |m| m.len());

        Ok(Self {
            config,
            current_size: AtomicU64::new(current_size),
            write_lock: Mutex::new(()),
        })
    }

    /// Append an event to the log file
    pub async fn write_event(&self, event: &Event) -> Result<()> {
        let entry = serde_json::json!({
            "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
            "event": event,
        });
        let log_line = format!("{}\n", serde_json::to_string(&entry)?);
        let line_len = log_line.len() as u64;

        // Serialize writers so rotation never races an append
        let _guard = self.write_lock.lock().await;

        let current = self.current_size.load(Ordering::Relaxed);
        if current > 0 && current + line_len > self.config.max_size {
            self.rotate_logs().await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .await?;
        file.write_all(log_line.as_bytes()).await?;
        file.flush().await?;

        self.current_size.fetch_add(line_len, Ordering::Relaxed);
        Ok(())
    }

    fn rotated_path(&self, generation: usize) -> PathBuf {
        let mut name = self.config.path.clone().into_os_string();
        name.push(format!(".{generation}"));
        PathBuf::from(name)
    }

    /// Shift `audit.log.N` to `audit.log.N+1` and start a fresh file
    pub async fn rotate_logs(&self) -> Result<()> {
        for generation in (1..=self.config.keep_files).rev() {
            let old_path = self.rotated_path(generation);
            if tokio::fs::try_exists(&old_path).await? {
                if generation == self.config.keep_files {
                    tokio::fs::remove_file(&old_path).await?;
                } else {
                    tokio::fs::rename(&old_path, self.rotated_path(generation + 1)).await?;
                }
            }
        }

        if self.config.keep_files == 0 {
            tokio::fs::remove_file(&self.config.path).await.ok();
        } else if tokio::fs::try_exists(&self.config.path).await? {
            tokio::fs::rename(&self.config.path, self.rotated_path(1)).await?;
        }

        self.current_size.store(0, Ordering::Relaxed);
        Ok(())
    }
}

/// Audit sink shared by every endpoint
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    file: Option<Arc<Logger>>,
}

impl AuditLog {
    /// Only emit events through `tracing`
    #[must_use]
    pub fn tracing_only() -> Self {
        Self::default()
    }

    /// Also append events to a rotating file
    pub fn with_file(config: LogConfig) -> Result<Self> {
        Ok(Self {
            file: Some(Arc::new(Logger::new(config)?)),
        })
    }

    /// Record an event. Failures to write the file are logged, not returned.
    pub async fn record(&self, event: Event) {
        match &event {
            Event::ClientAuth {
                success: false,
                client_id,
                error,
            } => {
                warn!(
                    client_id = %client_id,
                    error = %error.as_deref().unwrap_or("unknown"),
                    "Client authentication failed"
                );
            }
            Event::Grant {
                operation: GrantOperation::Rejected,
                client_id,
                reason,
            } => {
                warn!(
                    client_id = %client_id,
                    reason = %reason.as_deref().unwrap_or("unknown"),
                    "Authorization code rejected"
                );
            }
            Event::System {
                operation: SystemOperation::Error,
                details,
            } => {
                error!(details = %details.as_deref().unwrap_or("unknown"), "System error");
            }
            _ => {
                info!(event = ?event, "Audit event");
            }
        }

        if let Some(file) = &self.file {
            if let Err(e) = file.write_event(&event).await {
                error!(error = %e, "Failed to write audit log");
            }
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this more than
/// once is harmless.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // Err only means a subscriber is already installed
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
