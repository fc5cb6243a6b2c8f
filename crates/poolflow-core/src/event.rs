/*!
 * Event system for PoolFlow.
 *
 * Discrete session notifications (connected, device found, ...) are published
 * on a typed broadcast bus. Continuous state is published separately as
 * snapshots by the session driver.
 */
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::types::{DeviceAddress, DiscoveredPool};

/// Maximum number of events that can be buffered in a channel
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Why a discovery scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// A controller answered; the scan stops at the first one
    Found,
    /// Every candidate was probed without success
    Exhausted,
    /// The wall-clock ceiling elapsed
    TimedOut,
    /// Stopped on request
    Stopped,
}

/// Notifications emitted by the device session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// The control socket opened
    Connected {
        /// Device address
        address: DeviceAddress,
    },
    /// The control socket closed
    Disconnected {
        /// Device address
        address: DeviceAddress,
        /// Whether a reconnect was scheduled
        will_retry: bool,
    },
    /// Every required initial datum has been received
    DataReady,
    /// A device was paired and persisted
    Paired {
        /// Device address
        address: DeviceAddress,
    },
    /// The pairing was removed
    Unpaired,
    /// Discovery found a controller
    DeviceFound {
        /// The controller
        pool: DiscoveredPool,
    },
    /// A discovery scan ended
    DiscoveryFinished {
        /// How it ended
        outcome: ScanOutcome,
        /// Number of controllers known after the scan
        found: usize,
    },
}

type EventSender<T> = broadcast::Sender<T>;
type EventReceiver<T> = broadcast::Receiver<T>;

/// Event bus for publishing and subscribing to events, one channel per type
#[derive(Debug)]
pub struct EventBus {
    channels: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity,
        }
    }

    fn sender<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventSender<T>> {
        let type_id = TypeId::of::<T>();
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Error::event("Failed to lock channels"))?;

        if let Some(sender) = channels.get(&type_id) {
            return sender
                .downcast_ref::<EventSender<T>>()
                .cloned()
                .ok_or_else(|| Error::event("Failed to downcast sender"));
        }

        let (sender, _) = broadcast::channel(self.channel_capacity);
        channels.insert(type_id, Box::new(sender.clone()));
        Ok(sender)
    }

    /// Publish an event, returning the number of receivers reached
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        let sender = self.sender::<T>()?;
        if sender.receiver_count() == 0 {
            trace!("No receivers for event {:?}", event);
            return Ok(0);
        }

        match sender.send(event) {
            Ok(n) => {
                trace!("Published event to {} receivers", n);
                Ok(n)
            }
            Err(e) => {
                warn!("Failed to publish event: {}", e);
                Err(Error::event(format!("Failed to publish event: {}", e)))
            }
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        Ok(self.sender::<T>()?.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Publish an event
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        self.0.publish(event)
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        self.0.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() -> Result<()> {
        let event_bus = EventBus::new();
        let mut rx = event_bus.subscribe::<PoolEvent>()?;

        let event = PoolEvent::Connected {
            address: DeviceAddress::new(10, 0, 0, 5),
        };
        assert_eq!(event_bus.publish(event.clone())?, 1);

        let received = rx.recv().await.map_err(|e| Error::event(e.to_string()))?;
        assert_eq!(received, event);
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_without_receivers() -> Result<()> {
        let event_bus = SharedEventBus::new();
        assert_eq!(event_bus.publish(PoolEvent::DataReady)?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_channels_are_per_type() -> Result<()> {
        #[derive(Debug, Clone, PartialEq)]
        struct Tick(u32);

        let event_bus = SharedEventBus::new();
        let mut pool_rx = event_bus.subscribe::<PoolEvent>()?;
        let mut tick_rx = event_bus.subscribe::<Tick>()?;

        event_bus.publish(Tick(7))?;
        event_bus.publish(PoolEvent::Unpaired)?;

        assert_eq!(tick_rx.recv().await.map_err(|e| Error::event(e.to_string()))?, Tick(7));
        assert_eq!(
            pool_rx.recv().await.map_err(|e| Error::event(e.to_string()))?,
            PoolEvent::Unpaired
        );
        assert!(tick_rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(PoolEvent::DiscoveryFinished {
            outcome: ScanOutcome::TimedOut,
            found: 0,
        })
        .unwrap();
        assert_eq!(json["event"], "discovery_finished");
        assert_eq!(json["outcome"], "timed_out");
    }
}
