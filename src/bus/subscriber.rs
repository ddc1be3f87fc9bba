//! Queue listener with readiness synchronization.
//!
//! `Subscriber::start` returns only after the queue has been declared on the
//! bus, so a component that starts a subscriber knows every message published
//! afterwards will be seen. `stop` signals the listener, waits a bounded time
//! for it to finish its current message and aborts it otherwise.

use super::MessageBus;

use anyhow::Result;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;

/// Type-erased async callback invoked once per received message.
pub type MessageHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Boxes an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg: Value| Box::pin(handler(msg)) as Pin<Box<dyn Future<Output = ()> + Send>>)
}

pub struct Subscriber {
    queue: String,
    bus: Arc<dyn MessageBus>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    /// Spawns the listener and blocks until its queue is live.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        queue: &str,
        bindings: Vec<String>,
        handler: MessageHandler,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(listen(
            bus.clone(),
            queue.to_string(),
            bindings,
            handler,
            ready_tx,
            shutdown_rx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => anyhow::bail!("listener for '{}' exited before becoming ready", queue),
        }

        tracing::debug!("Subscriber on '{}' ready", queue);

        Ok(Self {
            queue: queue.to_string(),
            bus,
            shutdown: shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Signals the listener to exit, joins it for at most `timeout` and aborts
    /// it if it is still busy. Calling it twice is a no-op.
    pub async fn stop(&self, timeout: Duration) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };

        let _ = self.shutdown.send(true);
        let abort = handle.abort_handle();

        if tokio::time::timeout(timeout, handle).await.is_err() {
            tracing::warn!(
                "Subscriber on '{}' did not stop within {:?}, aborting",
                self.queue,
                timeout
            );
            abort.abort();
        }

        if let Err(e) = self.bus.unsubscribe(&self.queue).await {
            tracing::warn!("Failed to remove queue '{}': {}", self.queue, e);
        }
    }
}

async fn listen(
    bus: Arc<dyn MessageBus>,
    queue: String,
    bindings: Vec<String>,
    handler: MessageHandler,
    ready: oneshot::Sender<Result<()>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscription = match bus.subscribe(&queue, &bindings).await {
        Ok(subscription) => {
            let _ = ready.send(Ok(()));
            subscription
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = subscription.recv() => match msg {
                Some(msg) => handler(msg).await,
                None => break,
            },
        }
    }

    tracing::debug!("Listener on '{}' exiting", queue);
}
