//! BLE connection management.
//!
//! A [`Connection`] owns everything mutable about one device link: the state
//! machine, the generation counter, and the command queue. All of it sits
//! behind a single mutex that is never held across an `.await`; radio work
//! runs in spawned tasks that report back through the same mutex.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::gatt::Property;
use crate::error::{Error, Result};
use crate::native::{LinkId, NativeStack};
use crate::queue::{Command, CommandOutput, CommandQueue, Dispatch, PendingResult};
use crate::registry::DeviceRegistry;

/// Connection state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the device.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the device.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Mutable per-device state, guarded by [`Connection::inner`].
struct ConnectionInner {
    state: ConnectionState,
    /// Bumped on every successful connect.
    generation: u64,
    /// Bumped on every connect attempt and every disconnect; a stale value
    /// means the attempt was superseded.
    attempt: u64,
    /// Native link backing the current generation while connected.
    link: Option<LinkId>,
    queue: CommandQueue,
    disconnect_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Characteristic properties learned from discovery, by (service, characteristic).
    properties: HashMap<(Uuid, Uuid), Vec<Property>>,
}

/// One device link and its command queue.
pub struct Connection {
    address: String,
    native: Arc<dyn NativeStack>,
    registry: Arc<DeviceRegistry>,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    /// Create a disconnected connection record for `address`.
    pub fn new(
        address: impl Into<String>,
        native: Arc<dyn NativeStack>,
        registry: Arc<DeviceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            native,
            registry,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                generation: 0,
                attempt: 0,
                link: None,
                queue: CommandQueue::new(0),
                disconnect_waiters: Vec::new(),
                properties: HashMap::new(),
            }),
        })
    }

    /// Device address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Current connection generation.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Number of unresolved commands, including the in-flight one.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Properties learned for a characteristic during discovery.
    pub fn cached_properties(&self, service: &Uuid, characteristic: &Uuid) -> Vec<Property> {
        self.inner
            .lock()
            .properties
            .get(&(*service, *characteristic))
            .cloned()
            .unwrap_or_default()
    }

    /// Connect to the device.
    ///
    /// The native attempts run in a spawned task, so dropping this future does
    /// not leave the state machine stuck in `Connecting`.
    ///
    /// # Arguments
    ///
    /// * `attempts` - Native connect attempts before giving up
    /// * `retry_delay` - Pause between attempts
    pub async fn connect(self: &Arc<Self>, attempts: u32, retry_delay: Duration) -> Result<()> {
        let attempt = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Connected => {
                    debug!("{} already connected", self.address);
                    return Ok(());
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    return Err(Error::InProgress);
                }
                ConnectionState::Disconnected => {}
            }
            inner.attempt += 1;
            self.set_state(&mut inner, ConnectionState::Connecting);
            inner.attempt
        };

        let (tx, rx) = oneshot::channel();
        let connection = self.clone();
        tokio::spawn(async move {
            let outcome = connection.run_connect(attempt, attempts.max(1), retry_delay).await;
            let result = connection.finish_connect(attempt, outcome);
            let _ = tx.send(result);
        });

        rx.await.unwrap_or_else(|_| {
            Err(Error::ConnectionFailed {
                reason: "connect task ended without a result".to_string(),
            })
        })
    }

    async fn run_connect(
        &self,
        attempt: u64,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<LinkId> {
        let mut last_error = None;

        for n in 1..=attempts {
            debug!("Connection attempt {} of {} to {}", n, attempts, self.address);

            match self.native.connect(&self.address).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    warn!("Connection attempt {} to {} failed: {}", n, self.address, e);
                    last_error = Some(e);
                }
            }

            if n < attempts {
                tokio::time::sleep(retry_delay).await;
                let superseded = {
                    let inner = self.inner.lock();
                    inner.attempt != attempt || inner.state != ConnectionState::Connecting
                };
                if superseded {
                    debug!("Retries for {} abandoned", self.address);
                    break;
                }
            }
        }

        Err(last_error.unwrap_or(Error::ConnectionFailed {
            reason: "no attempt made".to_string(),
        }))
    }

    fn finish_connect(self: &Arc<Self>, attempt: u64, outcome: Result<LinkId>) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.attempt != attempt || inner.state != ConnectionState::Connecting {
            info!("Connect to {} superseded by disconnect", self.address);
            if outcome.is_ok() && inner.state == ConnectionState::Disconnected {
                // The teardown already ran; drop the link the late connect opened.
                let native = self.native.clone();
                let address = self.address.clone();
                tokio::spawn(async move {
                    if let Err(e) = native.disconnect(&address).await {
                        warn!("Failed to drop superseded link to {}: {}", address, e);
                    }
                });
            }
            return Err(Error::ConnectionFailed {
                reason: "superseded by disconnect".to_string(),
            });
        }

        match outcome {
            Ok(link) => {
                inner.generation += 1;
                inner.link = Some(link);
                let generation = inner.generation;
                inner.queue.reset(generation);
                self.set_state(&mut inner, ConnectionState::Connected);
                info!("Connected to {} (generation {})", self.address, generation);

                if let Some(dispatch) = inner.queue.dispatch_head() {
                    self.spawn_dispatch(dispatch);
                }
                Ok(())
            }
            Err(e) => {
                inner.queue.drain_on_disconnect();
                self.set_state(&mut inner, ConnectionState::Disconnected);
                Err(match e {
                    failed @ Error::ConnectionFailed { .. } => failed,
                    other => Error::ConnectionFailed {
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Queue a GATT command.
    ///
    /// Never blocks: the returned handle resolves once the command completes
    /// or is cancelled by a disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the device is disconnected.
    pub fn enqueue(self: &Arc<Self>, command: Command) -> Result<PendingResult> {
        let mut inner = self.inner.lock();

        match inner.state {
            ConnectionState::Disconnected => Err(Error::NotConnected),
            ConnectionState::Connecting => Ok(inner.queue.enqueue(command, false).0),
            ConnectionState::Connected => {
                let (handle, dispatch) = inner.queue.enqueue(command, true);
                if let Some(dispatch) = dispatch {
                    self.spawn_dispatch(dispatch);
                }
                Ok(handle)
            }
            ConnectionState::Disconnecting => {
                // The drain for this disconnect already ran; cancel right away.
                let (handle, _) = inner.queue.enqueue(command, false);
                inner.queue.drain_on_disconnect();
                Ok(handle)
            }
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, dispatch: Dispatch) {
        debug!(
            "Dispatching {} to {} (generation {})",
            dispatch.command.kind, self.address, dispatch.generation
        );
        let connection = self.clone();
        tokio::spawn(async move {
            let outcome = connection
                .native
                .dispatch(&connection.address, &dispatch.command)
                .await;
            if let Err(e) = &outcome {
                debug!(
                    "{} on {} failed: {}",
                    dispatch.command.kind, connection.address, e
                );
            }
            connection.on_native_completion(dispatch.generation, outcome);
        });
    }

    /// Feed a native completion back into the queue.
    pub fn on_native_completion(self: &Arc<Self>, generation: u64, outcome: Result<CommandOutput>) {
        let mut inner = self.inner.lock();

        if generation == inner.generation {
            if let Ok(CommandOutput::Characteristics(characteristics)) = &outcome {
                for characteristic in characteristics {
                    inner.properties.insert(
                        (characteristic.service, characteristic.uuid),
                        characteristic.properties.clone(),
                    );
                }
            }
        }

        let connected = inner.state.is_connected();
        if let Some(next) = inner.queue.on_native_completion(generation, outcome, connected) {
            self.spawn_dispatch(next);
        }
    }

    /// Disconnect from the device.
    ///
    /// Every pending command is cancelled before the radio is asked to tear
    /// the link down. Concurrent calls share a single native teardown and all
    /// observe its outcome.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        let rx = {
            let mut inner = self.inner.lock();
            let (tx, rx) = oneshot::channel();

            match inner.state {
                ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Disconnecting => {
                    debug!("Joining in-flight disconnect of {}", self.address);
                    inner.disconnect_waiters.push(tx);
                }
                ConnectionState::Connecting | ConnectionState::Connected => {
                    inner.attempt += 1;
                    inner.link = None;
                    self.set_state(&mut inner, ConnectionState::Disconnecting);
                    let cancelled = inner.queue.drain_on_disconnect();
                    if cancelled > 0 {
                        info!(
                            "Cancelled {} pending command(s) for {}",
                            cancelled, self.address
                        );
                    }
                    inner.disconnect_waiters.push(tx);

                    let connection = self.clone();
                    tokio::spawn(async move {
                        let outcome = connection.native.disconnect(&connection.address).await;
                        connection.finish_disconnect(outcome);
                    });
                }
            }
            rx
        };

        rx.await.unwrap_or(Ok(()))
    }

    fn finish_disconnect(&self, outcome: Result<()>) {
        let mut inner = self.inner.lock();

        match &outcome {
            Ok(()) => info!("Disconnected from {}", self.address),
            Err(e) => error!("Failed to disconnect from {}: {}", self.address, e),
        }

        inner.queue.drain_on_disconnect();
        self.set_state(&mut inner, ConnectionState::Disconnected);
        for waiter in inner.disconnect_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Handle an unsolicited loss of `link` reported by the radio.
    ///
    /// Only the link backing the current generation counts: reports about
    /// earlier links, including the echo of a local disconnect, are ignored.
    /// Returns `true` if the connection was live and has now been torn down.
    pub fn handle_link_loss(&self, link: LinkId) -> bool {
        let mut inner = self.inner.lock();

        if inner.state != ConnectionState::Connected || inner.link != Some(link) {
            debug!(
                "Ignoring loss of link {} to {} (current {:?}, {})",
                link, self.address, inner.link, inner.state
            );
            return false;
        }

        warn!("Link to {} lost", self.address);
        inner.attempt += 1;
        inner.link = None;
        inner.queue.drain_on_disconnect();
        self.set_state(&mut inner, ConnectionState::Disconnected);
        true
    }

    /// Update the connection state and mirror it into the registry.
    fn set_state(&self, inner: &mut ConnectionInner, new_state: ConnectionState) {
        let old_state = inner.state;
        inner.state = new_state;

        if old_state != new_state {
            debug!(
                "Connection state of {} changed: {} -> {}",
                self.address, old_state, new_state
            );
            self.registry.set_state(&self.address, new_state);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("queue", &inner.queue)
            .finish()
    }
}
