//! Shared lock store contract and an in-process implementation.

use super::types::LockRecord;
use crate::clock::Clock;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically grants or renews the lock on `scope` for `holder` if it is
    /// absent, expired or already held by `holder`. Returns whether `holder`
    /// owns the lock afterwards.
    async fn acquire_lock(&self, scope: &str, timeout: Duration, holder: &str) -> Result<bool>;

    /// Releases the lock if `holder` owns it. Returns whether anything was
    /// released.
    async fn release_lock(&self, scope: &str, holder: &str) -> Result<bool>;
}

/// Lock table kept in a `DashMap`; the entry API makes each
/// compare-and-set atomic per scope.
pub struct InMemoryLockStore {
    locks: DashMap<String, LockRecord>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockStore {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            locks: DashMap::new(),
            clock,
        })
    }

    /// Current unexpired holder of `scope`.
    pub fn holder(&self, scope: &str) -> Option<LockRecord> {
        let now = self.clock.now_ms();
        self.locks
            .get(scope)
            .filter(|record| record.expires_ms > now)
            .map(|record| record.value().clone())
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire_lock(&self, scope: &str, timeout: Duration, holder: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let expires_ms = now + timeout.as_millis() as u64;

        match self.locks.entry(scope.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.holder == holder || record.expires_ms <= now {
                    if record.holder != holder {
                        tracing::debug!(
                            "Lock '{}' expired for {}, granting to {}",
                            scope,
                            record.holder,
                            holder
                        );
                    }
                    record.holder = holder.to_string();
                    record.expires_ms = expires_ms;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(LockRecord {
                    holder: holder.to_string(),
                    expires_ms,
                });
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, scope: &str, holder: &str) -> Result<bool> {
        Ok(self
            .locks
            .remove_if(scope, |_, record| record.holder == holder)
            .is_some())
    }
}
