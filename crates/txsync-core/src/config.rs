//! Tunables for the synchronization manager and its context workers

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::ServerId;

/// Configuration shared by every context worker.
///
/// Loaded from JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay before re-checking a missing endpoint contract
    pub contract_retry_ms: u64,
    /// Delay between bootstrap registration attempts
    pub registration_retry_ms: u64,
    /// Pause after a pass that only requeued work
    pub requeue_delay_ms: u64,
    /// Interval between attempts to hand a request to a busy operation
    pub start_retry_ms: u64,
    /// Absolute deadline for an operation to accept a request
    pub start_timeout_ms: u64,
    /// Attempts per operation when no reply arrives
    pub max_send_attempts: u32,
    /// Upper bound for an unknown id's backoff multiplier
    pub max_backoff_multiplier: u64,
    /// Cycles between endpoint name validations
    pub name_check_interval: u64,
    /// Inbox entries accepted per ProcessInbox request
    pub inbox_batch_limit: usize,
    /// ProcessInbox attempts before giving up
    pub inbox_retries: u32,
    /// Capacity of the completion and event broadcast channels
    pub event_capacity: usize,
    /// Endpoint every local nym registers with
    pub introduction_server: Option<ServerId>,
    /// Admin passwords per endpoint
    pub admin_passwords: BTreeMap<ServerId, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            contract_retry_ms: 10_000,
            registration_retry_ms: 10_000,
            requeue_delay_ms: 1_000,
            start_retry_ms: 100,
            start_timeout_ms: 30_000,
            max_send_attempts: 3,
            max_backoff_multiplier: 1024,
            name_check_interval: 100,
            inbox_batch_limit: 100,
            inbox_retries: 3,
            event_capacity: 256,
            introduction_server: None,
            admin_passwords: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    /// Short delays for tests and simulations
    pub fn fast() -> Self {
        Self {
            contract_retry_ms: 20,
            registration_retry_ms: 20,
            requeue_delay_ms: 10,
            start_retry_ms: 5,
            start_timeout_ms: 1_000,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self =
            serde_json::from_slice(&data).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the workers
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_send_attempts == 0 {
            return Err(SyncError::Config("max_send_attempts must be at least 1".into()));
        }
        if self.inbox_retries == 0 {
            return Err(SyncError::Config("inbox_retries must be at least 1".into()));
        }
        if self.inbox_batch_limit == 0 {
            return Err(SyncError::Config("inbox_batch_limit must be at least 1".into()));
        }
        if self.max_backoff_multiplier == 0 {
            return Err(SyncError::Config(
                "max_backoff_multiplier must be at least 1".into(),
            ));
        }
        if self.name_check_interval == 0 {
            return Err(SyncError::Config("name_check_interval must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be at least 1".into()));
        }
        if self.introduction_server.as_ref().is_some_and(ServerId::is_empty) {
            return Err(SyncError::Config("introduction_server must not be empty".into()));
        }
        Ok(())
    }

    pub fn contract_retry(&self) -> Duration {
        Duration::from_millis(self.contract_retry_ms)
    }

    pub fn registration_retry(&self) -> Duration {
        Duration::from_millis(self.registration_retry_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn start_retry(&self) -> Duration {
        Duration::from_millis(self.start_retry_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn admin_password(&self, server: &ServerId) -> Option<&str> {
        self.admin_passwords.get(server).map(String::as_str)
    }
}
