//! Leader manager.
//!
//! A background loop renews the lease every `interval`; the lease itself
//! lives for 1.5x that so a single late renewal does not cost leadership but
//! a crashed holder's lease runs out before peers starve.

use super::store::LockStore;
use super::types::{LeaderCallback, LeaderEvent, LeaseState};
use crate::clock::Clock;
use crate::types::InstanceId;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct LeaderManager {
    scope: String,
    holder: InstanceId,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    lock_timeout: Duration,
    /// Both the renewal loop and the lazy expiry check go through this lock.
    state: Mutex<LeaseState>,
    callbacks: RwLock<Vec<LeaderCallback>>,
    /// Flips to true after the first leadership determination.
    has_leader: watch::Sender<bool>,
    /// Current leadership, updated on every acquire and release.
    leading: watch::Sender<bool>,
    quit: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderManager {
    pub fn new(
        scope: &str,
        holder: InstanceId,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Arc<Self> {
        let (has_leader, _) = watch::channel(false);
        let (leading, _) = watch::channel(false);
        let (quit, _) = watch::channel(false);

        Arc::new(Self {
            scope: scope.to_string(),
            holder,
            store,
            clock,
            interval,
            lock_timeout: interval.mul_f64(1.5),
            state: Mutex::new(LeaseState::default()),
            callbacks: RwLock::new(Vec::new()),
            has_leader,
            leading,
            quit,
            handle: Mutex::new(None),
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn holder(&self) -> &InstanceId {
        &self.holder
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Spawns the renewal loop.
    pub async fn start(self: Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }

        self.quit.send_replace(false);
        let quit = self.quit.subscribe();
        let manager = self.clone();
        *handle = Some(tokio::spawn(async move {
            manager.leader_loop(quit).await;
        }));
    }

    /// Releases leadership and terminates the loop.
    pub async fn stop(&self) {
        self.release_leader().await;
        self.quit.send_replace(true);

        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };
        let abort = handle.abort_handle();
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
            tracing::warn!("Leader loop '{}' did not exit, aborting", self.scope);
            abort.abort();
        }
    }

    /// True iff this instance holds a lease that has not expired locally.
    pub async fn is_leader(&self) -> bool {
        let mut state = self.state.lock().await;
        self.check_expiry(&mut state).await
    }

    /// Voluntarily gives up leadership, if held.
    pub async fn release_leader(&self) {
        let mut state = self.state.lock().await;
        if !self.check_expiry(&mut state).await {
            return;
        }

        if let Err(e) = self.store.release_lock(&self.scope, &self.holder.0).await {
            tracing::warn!("Failed to release leader lock '{}': {}", self.scope, e);
        }
        state.has_lock = false;
        state.expires_ms = 0;

        tracing::info!("Process {} released leadership of '{}'", self.holder, self.scope);
        self.inform(self.released_event()).await;
    }

    pub async fn add_leader_callback(&self, callback: LeaderCallback) {
        self.callbacks.write().await.push(callback);
    }

    /// Blocks until the first leadership determination has been made,
    /// whichever way it went.
    pub async fn await_leader(&self) {
        let mut rx = self.has_leader.subscribe();
        let _ = rx.wait_for(|determined| *determined).await;
    }

    /// Follows leadership transitions. Lease expiry is noticed lazily, on the
    /// next renewal or `is_leader` call.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.leading.subscribe()
    }

    async fn leader_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        tracing::info!("Starting leader loop '{}' for {}", self.scope, self.holder);

        if let Err(e) = self.check_lock().await {
            tracing::error!("Leader check '{}' failed: {}", self.scope, e);
        }
        self.has_leader.send_replace(true);

        loop {
            tokio::select! {
                biased;
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.check_lock().await {
                        tracing::error!("Leader check '{}' failed: {}", self.scope, e);
                    }
                }
            }
        }

        tracing::info!("Leader loop '{}' for {} stopped", self.scope, self.holder);
    }

    /// One acquire-or-renew round against the lock store.
    pub(crate) async fn check_lock(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();
        let was_leader = self.check_expiry(&mut state).await;

        let acquired = self
            .store
            .acquire_lock(&self.scope, self.lock_timeout, &self.holder.0)
            .await?;
        state.has_lock = acquired;

        if acquired {
            state.expires_ms = now + self.lock_timeout.as_millis() as u64;
            if !was_leader {
                tracing::info!("Process {} is now the leader for '{}'", self.holder, self.scope);
                self.inform(LeaderEvent::Acquired {
                    scope: self.scope.clone(),
                    process_id: self.holder.0.clone(),
                    expires: state.expires_ms,
                })
                .await;
            }
        } else if was_leader {
            tracing::warn!("Process {} lost the lock for '{}'", self.holder, self.scope);
            state.expires_ms = 0;
            self.inform(self.released_event()).await;
        }

        Ok(())
    }

    /// Drops a lease whose local expiry has passed. The store's copy is
    /// released best-effort; it is most likely gone already.
    async fn check_expiry(&self, state: &mut LeaseState) -> bool {
        if state.has_lock && self.clock.now_ms() >= state.expires_ms {
            tracing::warn!(
                "Leader lock '{}' held and expired by {}",
                self.scope,
                self.holder
            );
            state.has_lock = false;
            state.expires_ms = 0;

            self.inform(LeaderEvent::Error {
                scope: self.scope.clone(),
                process_id: self.holder.0.clone(),
                err_type: "lock_expired".to_string(),
            })
            .await;

            if let Err(e) = self.store.release_lock(&self.scope, &self.holder.0).await {
                tracing::debug!("Ignoring release failure for expired lock: {}", e);
            }
            self.inform(self.released_event()).await;

            return false;
        }

        state.has_lock
    }

    fn released_event(&self) -> LeaderEvent {
        LeaderEvent::Released {
            scope: self.scope.clone(),
            process_id: self.holder.0.clone(),
        }
    }

    async fn inform(&self, event: LeaderEvent) {
        match &event {
            LeaderEvent::Acquired { .. } => {
                self.leading.send_replace(true);
            }
            LeaderEvent::Released { .. } => {
                self.leading.send_replace(false);
            }
            LeaderEvent::Error { .. } => {}
        }
        for callback in self.callbacks.read().await.iter() {
            callback(&event);
        }
    }
}
