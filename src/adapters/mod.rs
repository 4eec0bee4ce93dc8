//! Platform adapters.
//!
//! Every adapter is a [`ManagedAdapter`] wrapping one [`PlatformDriver`].
//! The wrapper owns what all platforms share: the lifecycle state machine,
//! the memoized in-flight connect, the sync engine and send serialization.
//! The driver supplies authentication, normalization, the sync discipline
//! and the outbound transport call. The variant is chosen once, when the
//! adapter is constructed.

pub mod chat;
pub mod conversation;
pub mod direct;
pub mod email;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::AdapterError;
use crate::events::EventBus;
use crate::lifecycle::{ConnectionState, ConnectionStatus, Lifecycle};
use crate::model::{OutgoingMessage, Platform};
use crate::sync::{Normalize, SyncEngine, SyncExit};

pub use chat::ChatDriver;
pub use conversation::ConversationDriver;
pub use direct::DirectMessageDriver;
pub use email::EmailDriver;

/// Reference initialization deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Public interface of one platform connection.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Bring the connection up and start syncing.
    ///
    /// Resolves to `false` on any failure instead of returning an error; the
    /// reason is in `status().borrow().last_error`. Concurrent calls while an
    /// attempt is in flight share that attempt's outcome.
    async fn connect(&self) -> bool;

    /// Stop syncing, release the transport and enter `Disconnected`.
    async fn disconnect(&self);

    /// Send one message. Returns the transport-assigned id.
    async fn send(&self, message: &OutgoingMessage) -> Result<String, AdapterError>;

    /// Observable connection state.
    fn status(&self) -> watch::Receiver<ConnectionState>;

    fn connection_status(&self) -> ConnectionStatus {
        self.status().borrow().status
    }
}

/// Platform-specific half of an adapter.
#[async_trait]
pub trait PlatformDriver: Normalize + Sized {
    /// Authenticate and initialize the transport client.
    async fn authenticate(&self) -> Result<(), AdapterError>;

    /// Start this platform's sync discipline. Called right after `Connected`.
    async fn start_sync(
        driver: Arc<Self>,
        engine: Arc<SyncEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<SyncExit>, AdapterError>;

    /// Perform exactly one outbound transport call.
    async fn send(&self, message: &OutgoingMessage) -> Result<String, AdapterError>;

    /// Release transport resources on disposal.
    async fn close(&self) {}
}

type ConnectFuture = Shared<BoxFuture<'static, bool>>;

struct Inner<D> {
    platform: Platform,
    driver: Arc<D>,
    lifecycle: Arc<Lifecycle>,
    engine: Arc<SyncEngine>,
    connect_timeout: Duration,
    in_flight: Mutex<Option<ConnectFuture>>,
    shutdown: watch::Sender<bool>,
    send_lock: tokio::sync::Mutex<()>,
}

/// Adapter built from a platform driver.
pub struct ManagedAdapter<D> {
    inner: Arc<Inner<D>>,
}

impl<D: PlatformDriver> ManagedAdapter<D> {
    pub fn new(driver: D, bus: EventBus) -> Self {
        Self::with_connect_timeout(driver, bus, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(driver: D, bus: EventBus, connect_timeout: Duration) -> Self {
        let platform = driver.platform();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                platform,
                driver: Arc::new(driver),
                lifecycle: Arc::new(Lifecycle::new(platform, bus.clone())),
                engine: Arc::new(SyncEngine::new(platform, bus)),
                connect_timeout,
                in_flight: Mutex::new(None),
                shutdown,
                send_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Distinct messages published by this adapter so far.
    pub fn seen_count(&self) -> usize {
        self.inner.engine.seen_count()
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, Option<ConnectFuture>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<D: PlatformDriver> Inner<D> {
    /// Start one initialization attempt on its own task, so it completes even
    /// if every caller stops waiting.
    fn spawn_attempt(self: Arc<Self>) -> ConnectFuture {
        let task = tokio::spawn(Arc::clone(&self).attempt());
        async move {
            match task.await {
                Ok(connected) => connected,
                Err(e) => {
                    error!(platform = %self.platform, error = %e, "Connect attempt aborted");
                    self.clear_in_flight();
                    false
                }
            }
        }
        .boxed()
        .shared()
    }

    /// One initialization attempt. Never errors; failures land in the lifecycle.
    async fn attempt(self: Arc<Self>) -> bool {
        let connected = self.run_attempt().await;
        self.clear_in_flight();
        connected
    }

    fn clear_in_flight(&self) {
        *self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    async fn run_attempt(&self) -> bool {
        let reason = (self.lifecycle.status() == ConnectionStatus::Failed).then(|| "retry".to_string());
        if self
            .lifecycle
            .transition(ConnectionStatus::Initializing, reason)
            .is_err()
        {
            return false;
        }

        let authenticated = match tokio::time::timeout(self.connect_timeout, self.driver.authenticate()).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::TransportTimeout {
                platform: self.platform,
                operation: "initialize".into(),
                timeout: self.connect_timeout,
            }),
        };

        if let Err(e) = authenticated {
            error!(platform = %self.platform, error = %e, "Connect failed");
            let _ = self.lifecycle.fail(e);
            return false;
        }

        // Disposed while authenticating.
        if self
            .lifecycle
            .transition(ConnectionStatus::Connected, None)
            .is_err()
        {
            return false;
        }

        let started = D::start_sync(
            Arc::clone(&self.driver),
            Arc::clone(&self.engine),
            self.shutdown.subscribe(),
        )
        .await;

        match started {
            Ok(handle) => {
                self.supervise(handle);
                true
            }
            Err(e) => {
                error!(platform = %self.platform, error = %e, "Failed to start sync");
                let _ = self.lifecycle.fail(e);
                false
            }
        }
    }

    /// Mark the connection failed if the sync loop gives up on it.
    fn supervise(&self, handle: JoinHandle<SyncExit>) {
        let platform = self.platform;
        let lifecycle = Arc::clone(&self.lifecycle);
        tokio::spawn(async move {
            match handle.await {
                Ok(SyncExit::Shutdown) => debug!(platform = %platform, "Sync stopped"),
                Ok(SyncExit::Failed(e)) => {
                    let _ = lifecycle.fail(e);
                }
                Err(e) => {
                    error!(platform = %platform, error = %e, "Sync task aborted");
                    let _ = lifecycle.fail(AdapterError::transport(platform, "sync task aborted"));
                }
            }
        });
    }
}

#[async_trait]
impl<D: PlatformDriver> Adapter for ManagedAdapter<D> {
    fn platform(&self) -> Platform {
        self.inner.platform
    }

    async fn connect(&self) -> bool {
        let attempt = {
            let mut in_flight = self.in_flight();
            match self.inner.lifecycle.status() {
                ConnectionStatus::Connected => return true,
                ConnectionStatus::Disconnected => {
                    warn!(platform = %self.inner.platform, "Connect called on a disposed adapter");
                    return false;
                }
                _ => {}
            }
            match in_flight.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = Arc::clone(&self.inner).spawn_attempt();
                    *in_flight = Some(fresh.clone());
                    fresh
                }
            }
        };
        attempt.await
    }

    async fn disconnect(&self) {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.status().is_terminal() {
            return;
        }

        self.inner.shutdown.send_replace(true);
        self.inner.driver.close().await;
        let _ = lifecycle.transition(ConnectionStatus::Disconnected, Some("disposed".into()));
        info!(platform = %self.inner.platform, "Adapter disposed");
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<String, AdapterError> {
        self.ensure_connected()?;
        let _serialized = self.inner.send_lock.lock().await;
        // Disposal may have happened while queued.
        self.ensure_connected()?;

        let id = self.inner.driver.send(message).await?;
        info!(platform = %self.inner.platform, id = %id, "Message sent");
        Ok(id)
    }

    fn status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.lifecycle.subscribe()
    }
}

impl<D: PlatformDriver> ManagedAdapter<D> {
    fn ensure_connected(&self) -> Result<(), AdapterError> {
        match self.inner.lifecycle.status() {
            ConnectionStatus::Connected => Ok(()),
            status => Err(AdapterError::NotConnected {
                platform: self.inner.platform,
                status,
            }),
        }
    }
}

impl<D> std::fmt::Debug for ManagedAdapter<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedAdapter")
            .field("platform", &self.inner.platform)
            .field("status", &self.inner.lifecycle.status())
            .finish()
    }
}
