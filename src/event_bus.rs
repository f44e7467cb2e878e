//! Named event fan-out.
//!
//! Listeners are plain callbacks keyed by [`EventKind`]. Publishing takes a
//! snapshot of the listener list before invoking anything, so listeners may
//! call [`EventBus::on`] or [`EventBus::off`] (including on themselves)
//! without corrupting the table. Async consumers can instead take a
//! broadcast receiver with [`EventBus::subscribe`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::ble::gatt::Characteristic;
use crate::error::Error;
use crate::registry::Device;
use crate::session_manager::AdapterState;

/// Event names accepted by [`EventBus::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The adapter was powered on or off, or started/stopped discovering.
    AdapterStateChanged,
    /// A device was discovered or re-advertised while discovering.
    DeviceAdded,
    /// A connected device dropped without a local `disconnect`.
    DeviceDisconnected,
    /// A subscribed characteristic notified a new value.
    CharacteristicValueChanged,
}

impl EventKind {
    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdapterStateChanged => "adapterStateChanged",
            Self::DeviceAdded => "deviceAdded",
            Self::DeviceDisconnected => "deviceDisconnected",
            Self::CharacteristicValueChanged => "characteristicValueChanged",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adapterStateChanged" => Ok(Self::AdapterStateChanged),
            "deviceAdded" | "deviceDiscovered" => Ok(Self::DeviceAdded),
            "deviceDisconnected" => Ok(Self::DeviceDisconnected),
            "characteristicValueChanged" => Ok(Self::CharacteristicValueChanged),
            other => Err(Error::InvalidParameter {
                name: "event".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// An event published on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// New adapter state.
    AdapterStateChanged(AdapterState),
    /// Snapshot of the discovered device.
    DeviceAdded(Device),
    /// Address of the device whose link dropped.
    DeviceDisconnected {
        /// Device address.
        address: String,
    },
    /// A characteristic notification.
    CharacteristicValueChanged {
        /// Device address.
        address: String,
        /// The characteristic with its new value.
        characteristic: Characteristic,
    },
}

impl Event {
    /// The name this event is published under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AdapterStateChanged(_) => EventKind::AdapterStateChanged,
            Self::DeviceAdded(_) => EventKind::DeviceAdded,
            Self::DeviceDisconnected { .. } => EventKind::DeviceDisconnected,
            Self::CharacteristicValueChanged { .. } => EventKind::CharacteristicValueChanged,
        }
    }
}

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Publish/subscribe table scoped to one session manager.
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose broadcast stream buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            event_tx,
        }
    }

    /// Register a listener. Listeners of one kind fire in registration order.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove one listener, or every listener of `kind` when `id` is `None`.
    /// Returns the number of listeners removed.
    pub fn off(&self, kind: EventKind, id: Option<ListenerId>) -> usize {
        let mut listeners = self.listeners.write();
        let Some(registered) = listeners.get_mut(&kind) else {
            return 0;
        };

        let before = registered.len();
        match id {
            Some(id) => registered.retain(|(existing, _)| *existing != id),
            None => registered.clear(),
        }
        before - registered.len()
    }

    /// Receive every published event asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Deliver an event to its listeners and broadcast subscribers.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .get(&kind)
            .map(|registered| registered.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        trace!("Publishing {} to {} listener(s)", kind, snapshot.len());

        for listener in snapshot {
            listener(&event);
        }

        let _ = self.event_tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn disconnected(address: &str) -> Event {
        Event::DeviceDisconnected {
            address: address.to_string(),
        }
    }

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.on(EventKind::DeviceDisconnected, move |_| seen.lock().push(tag));
        }

        bus.publish(disconnected("AA"));
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_off_single_and_all() {
        let bus = EventBus::default();
        let first = bus.on(EventKind::DeviceAdded, |_| {});
        bus.on(EventKind::DeviceAdded, |_| {});

        assert_eq!(bus.off(EventKind::DeviceAdded, Some(first)), 1);
        assert_eq!(bus.off(EventKind::DeviceAdded, Some(first)), 0);
        assert_eq!(bus.off(EventKind::DeviceAdded, None), 1);
        assert_eq!(bus.off(EventKind::CharacteristicValueChanged, None), 0);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let bus = Arc::new(EventBus::default());
        let hits = Arc::new(AtomicU64::new(0));

        let bus_in_listener = bus.clone();
        let hits_in_listener = hits.clone();
        bus.on(EventKind::DeviceDisconnected, move |_| {
            hits_in_listener.fetch_add(1, Ordering::SeqCst);
            bus_in_listener.off(EventKind::DeviceDisconnected, None);
            bus_in_listener.on(EventKind::DeviceAdded, |_| {});
        });

        bus.publish(disconnected("AA"));
        bus.publish(disconnected("AA"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.off(EventKind::DeviceAdded, None), 1);
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(
            "deviceDiscovered".parse::<EventKind>().unwrap(),
            EventKind::DeviceAdded
        );
        assert_eq!(
            EventKind::CharacteristicValueChanged.to_string(),
            "characteristicValueChanged"
        );
        assert!("bogus".parse::<EventKind>().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        bus.publish(disconnected("AA"));

        match rx.recv().await.unwrap() {
            Event::DeviceDisconnected { address } => assert_eq!(address, "AA"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
