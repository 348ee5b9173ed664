//! Background eviction of expired grants and tokens
//!
//! Expiry is always re-checked at lookup, so the sweeper only bounds memory.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::logging::{AuditLog, Event, SystemOperation};
use crate::storage::{SweepReport, TokenStore};

/// Default pause between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Periodic task purging expired records from a [`TokenStore`]
#[derive(Debug)]
pub struct CleanupSweeper {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupSweeper {
    pub(crate) fn new(
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            interval,
            handle: Mutex::new(None),
        }
    }

    /// Run a single sweep now
    pub async fn run_once(&self) -> Result<SweepReport> {
        sweep(self.store.as_ref(), self.clock.as_ref(), &self.audit).await
    }

    /// Spawn the periodic task on the current tokio runtime.
    ///
    /// Does nothing if it is already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when called outside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("Sweeper needs a tokio runtime: {e}")))?;
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let audit = self.audit.clone();
        let period = self.interval;

        *handle = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = sweep(store.as_ref(), clock.as_ref(), &audit).await {
                    error!(error = %e, "Token sweep failed");
                    audit
                        .record(Event::System {
                            operation: SystemOperation::Error,
                            details: Some(format!("Token sweep failed: {e}")),
                        })
                        .await;
                }
            }
        }));

        info!(interval_secs = period.as_secs(), "Cleanup sweeper started");
        Ok(())
    }

    /// Stop the periodic task
    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("Cleanup sweeper stopped");
        }
    }

    /// Whether the periodic task is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CleanupSweeper {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn sweep(store: &dyn TokenStore, clock: &dyn Clock, audit: &AuditLog) -> Result<SweepReport> {
    let report = store.purge_expired(clock.now()).await?;
    if report.total() > 0 {
        audit
            .record(Event::System {
                operation: SystemOperation::SweepCompleted,
                details: Some(format!(
                    "Removed {} grants, {} access tokens, {} refresh tokens",
                    report.grants, report.access_tokens, report.refresh_tokens
                )),
            })
            .await;
    }
    Ok(report)
}
