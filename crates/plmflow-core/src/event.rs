/*!
 * Event bus for feature state changes.
 *
 * Features report state changes through the [`EventSink`] trait; the
 * [`EventBus`] fans them out to any number of broadcast subscribers.
 */
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, Result};
use crate::types::{InsteonAddress, Value};

/// Maximum number of events that can be buffered in a channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Something a device or feature reports to the rest of the platform
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureEvent {
    /// A feature published a new state
    StateChanged {
        /// Device the feature belongs to
        address: InsteonAddress,
        /// Feature name within the device
        feature: String,
        /// The new state
        value: Value,
        /// When the state was observed
        timestamp: DateTime<Utc>,
    },
    /// A device received a message, whether or not a feature consumed it
    MessageReceived {
        /// Device the message was routed to
        address: InsteonAddress,
        /// Port the message came in on
        port: String,
    },
}

impl FeatureEvent {
    /// Build a state change event stamped with the current time
    pub fn state_changed(address: InsteonAddress, feature: &str, value: Value) -> Self {
        FeatureEvent::StateChanged {
            address,
            feature: feature.to_string(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// The device the event is about
    pub fn address(&self) -> &InsteonAddress {
        match self {
            FeatureEvent::StateChanged { address, .. } => address,
            FeatureEvent::MessageReceived { address, .. } => address,
        }
    }
}

/// Receiver of feature events. Publication is fire-and-forget.
pub trait EventSink: Send + Sync + Debug {
    /// Hand an event to the sink
    fn publish(&self, event: FeatureEvent);
}

/// Broadcast bus for feature events
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<FeatureEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event, returning the number of subscribers reached
    pub fn send(&self, event: FeatureEvent) -> Result<usize> {
        if self.sender.receiver_count() == 0 {
            trace!("No receivers for event");
            return Ok(0);
        }
        self.sender
            .send(event)
            .map_err(|e| Error::event(format!("Failed to publish event: {}", e)))
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<FeatureEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: FeatureEvent) {
        if let Err(e) = self.send(event) {
            trace!("Dropped event: {}", e);
        }
    }
}

/// A shared event bus that can be cloned
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> InsteonAddress {
        InsteonAddress::new(0x11, 0x22, 0x33)
    }

    #[tokio::test]
    async fn test_publish_subscribe() -> Result<()> {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let sent = bus.send(FeatureEvent::state_changed(addr(), "switch", Value::Bool(true)))?;
        assert_eq!(sent, 1);

        match rx.recv().await {
            Ok(FeatureEvent::StateChanged { feature, value, .. }) => {
                assert_eq!(feature, "switch");
                assert_eq!(value, Value::Bool(true));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(FeatureEvent::MessageReceived {
            address: addr(),
            port: "port0".to_string(),
        });

        let first = tokio_test::block_on(rx1.recv()).unwrap();
        let second = tokio_test::block_on(rx2.recv()).unwrap();
        assert_eq!(first.address(), &addr());
        assert_eq!(second.address(), &addr());
    }

    #[test_log::test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::with_capacity(4);
        let sent = tokio_test::assert_ok!(bus.send(FeatureEvent::state_changed(addr(), "dimmer", Value::Percent(50))));
        assert_eq!(sent, 0);
    }
}
