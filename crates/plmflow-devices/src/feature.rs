/*!
 * Device features.
 *
 * A feature is one capability of a device (a relay, a dimmer level, a
 * sensor). Its behaviour comes from a [`FeatureHandler`]; the generic state
 * around it (query status, listeners, last value, back-reference to the
 * device) lives in [`DeviceFeature`]. Handlers are created by name through a
 * [`FeatureRegistry`].
 */
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::{debug, warn};

use plmflow_core::event::{EventSink, FeatureEvent};
use plmflow_core::types::{Id, Value};

use crate::device::{DeviceError, InsteonDevice, Result};
use crate::handlers::{ContactHandler, DimmerHandler, LastTimeHandler, SwitchHandler};
use crate::message::{FieldError, Msg};

/// Where a feature stands with respect to its last query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Nothing outstanding
    #[default]
    NotPending,
    /// A request went out and no answer has been seen
    QueryPending,
    /// The outstanding request was answered
    QueryAnswered,
}

/// A command from the platform for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Switch on
    On,
    /// Switch off
    Off,
    /// Set a level in percent
    Percent(u8),
    /// Re-read the state from the device
    Refresh,
}

/// Behaviour of one feature type
pub trait FeatureHandler: Send + Sync + Debug {
    /// Status features observe every message instead of claiming one
    fn is_status(&self) -> bool {
        false
    }

    /// Interpret an inbound message that arrived at `received_at`
    /// (milliseconds on the device's clock). `Some(value)` means the message
    /// was consumed and produced a new state.
    fn handle_message(
        &self,
        msg: &Msg,
        status: QueryStatus,
        received_at: i64,
    ) -> std::result::Result<Option<Value>, FieldError>;

    /// Build the message that carries out `command`, if this feature acts on it
    fn command_message(&self, _device: &InsteonDevice, _command: &Command) -> Result<Option<Msg>> {
        Ok(None)
    }

    /// Build the message that queries the current state, if any
    fn poll_message(&self, _device: &InsteonDevice) -> Result<Option<Msg>> {
        Ok(None)
    }
}

/// A feature instance attached to a device
pub struct DeviceFeature {
    name: String,
    feature_type: String,
    handler: Box<dyn FeatureHandler>,
    device: RwLock<Weak<InsteonDevice>>,
    query_status: Mutex<QueryStatus>,
    listeners: RwLock<HashSet<Id>>,
    last_value: RwLock<Value>,
}

impl DeviceFeature {
    /// Wrap a handler as a named feature
    pub fn new<N, T>(name: N, feature_type: T, handler: Box<dyn FeatureHandler>) -> Self
    where
        N: Into<String>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            feature_type: feature_type.into(),
            handler,
            device: RwLock::new(Weak::new()),
            query_status: Mutex::new(QueryStatus::NotPending),
            listeners: RwLock::new(HashSet::new()),
            last_value: RwLock::new(Value::Null),
        }
    }

    /// Feature name within its device
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name the feature was built from
    pub fn feature_type(&self) -> &str {
        &self.feature_type
    }

    /// Whether this is a passive, observing feature
    pub fn is_status_feature(&self) -> bool {
        self.handler.is_status()
    }

    /// The owning device, if it is still alive and attached
    pub fn device(&self) -> Option<Arc<InsteonDevice>> {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    /// Attach to (or, with `Weak::new()`, detach from) a device
    pub fn set_device(&self, device: Weak<InsteonDevice>) {
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = device;
    }

    /// Current query status
    pub fn query_status(&self) -> QueryStatus {
        *self.query_status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the query status
    pub fn set_query_status(&self, status: QueryStatus) {
        *self.query_status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Register a bound item
    pub fn add_listener(&self, id: Id) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    /// Remove a bound item
    pub fn remove_listener(&self, id: &Id) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Whether any item is bound to this feature
    pub fn has_listeners(&self) -> bool {
        !self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Last state the feature published
    pub fn last_value(&self) -> Value {
        self.last_value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Offer an inbound message received at `received_at`. Returns true if
    /// the feature consumed it.
    pub fn handle_message(&self, msg: &Msg, port: &str, received_at: i64, sink: &dyn EventSink) -> bool {
        let mut status = self.query_status.lock().unwrap_or_else(PoisonError::into_inner);
        let value = match self.handler.handle_message(msg, *status, received_at) {
            Ok(Some(value)) => value,
            Ok(None) => return false,
            Err(e) => {
                debug!("{} ignored {} from {}: {}", self.name, msg.name(), port, e);
                return false;
            }
        };
        if *status == QueryStatus::QueryPending {
            *status = QueryStatus::QueryAnswered;
        }
        drop(status);

        self.publish(value, sink);
        true
    }

    fn publish(&self, value: Value, sink: &dyn EventSink) {
        *self.last_value.write().unwrap_or_else(PoisonError::into_inner) = value.clone();
        match self.device() {
            Some(device) => sink.publish(FeatureEvent::state_changed(*device.address(), &self.name, value)),
            None => debug!("{} is detached, state {:?} not published", self.name, value),
        }
    }

    /// Carry out a command. Returns true if a message was queued.
    pub fn handle_command(self: &Arc<Self>, command: &Command) -> Result<bool> {
        let device = self
            .device()
            .ok_or_else(|| DeviceError::Other(format!("feature {} is not attached", self.name)))?;

        let msg = match command {
            Command::Refresh => self.handler.poll_message(&device)?,
            _ => self.handler.command_message(&device, command)?,
        };

        match msg {
            Some(msg) => {
                device.enqueue_message(msg, Arc::clone(self));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Build a poll message for this feature. Failures are logged and yield `None`.
    pub fn make_poll_msg(&self) -> Option<Msg> {
        let device = self.device()?;
        match self.handler.poll_message(&device) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("{}: cannot build poll message for {}: {}", device.address(), self.name, e);
                None
            }
        }
    }
}

impl Debug for DeviceFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFeature")
            .field("name", &self.name)
            .field("feature_type", &self.feature_type)
            .field("status_feature", &self.is_status_feature())
            .field("query_status", &self.query_status())
            .finish()
    }
}

impl fmt::Display for DeviceFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.feature_type, self.query_status())
    }
}

/// Constructor for a feature handler
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn FeatureHandler> + Send + Sync>;

/// Feature constructors keyed by feature type name
#[derive(Clone, Default)]
pub struct FeatureRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl FeatureRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in feature type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("GenericSwitch", || Box::new(SwitchHandler));
        registry.register("GenericDimmer", || Box::new(DimmerHandler));
        registry.register("GenericLastTime", || Box::new(LastTimeHandler));
        registry.register("ContactSensor", || Box::new(ContactHandler));
        registry
    }

    /// Register a constructor under a type name, replacing any earlier one
    pub fn register<F>(&mut self, feature_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn FeatureHandler> + Send + Sync + 'static,
    {
        self.factories.insert(feature_type.to_string(), Arc::new(factory));
    }

    /// Whether a type name can be constructed
    pub fn contains(&self, feature_type: &str) -> bool {
        self.factories.contains_key(feature_type)
    }

    /// All registered type names
    pub fn feature_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build a detached feature named `name` of type `feature_type`
    pub fn make(&self, name: &str, feature_type: &str) -> Option<Arc<DeviceFeature>> {
        self.factories
            .get(feature_type)
            .map(|factory| Arc::new(DeviceFeature::new(name, feature_type, factory())))
    }
}

impl Debug for FeatureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types = self.feature_types();
        types.sort_unstable();
        f.debug_struct("FeatureRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, ScriptedHandler, TestBed};

    #[test]
    fn test_registry_defaults() {
        let registry = FeatureRegistry::with_defaults();
        for name in ["GenericSwitch", "GenericDimmer", "GenericLastTime", "ContactSensor"] {
            assert!(registry.contains(name), "{} missing", name);
        }
        assert!(registry.make("x", "Nope").is_none());

        let feature = registry.make("lastheardfrom", "GenericLastTime").unwrap();
        assert_eq!(feature.name(), "lastheardfrom");
        assert_eq!(feature.feature_type(), "GenericLastTime");
        assert!(feature.is_status_feature());
        assert!(feature.device().is_none());
    }

    #[test]
    fn test_listeners() {
        let feature = FeatureRegistry::with_defaults().make("switch", "GenericSwitch").unwrap();
        assert!(!feature.has_listeners());

        let id = Id::from_string("item-1");
        assert!(feature.add_listener(id.clone()));
        assert!(!feature.add_listener(id.clone()));
        assert!(feature.has_listeners());

        assert!(feature.remove_listener(&id));
        assert!(!feature.has_listeners());
    }

    #[test]
    fn test_consumed_message_answers_pending_query() {
        let bed = TestBed::new();
        let device = bed.device();
        let handler = ScriptedHandler::active(true);
        let feature = Arc::new(DeviceFeature::new("f", "Scripted", Box::new(handler.clone())));
        device.add_feature("f", Arc::clone(&feature));
        feature.set_query_status(QueryStatus::QueryPending);

        let sink = RecordingSink::default();
        let msg = bed.inbound(0x11, 0x00);
        assert!(feature.handle_message(&msg, "port0", 0, &sink));

        assert_eq!(feature.query_status(), QueryStatus::QueryAnswered);
        assert_eq!(feature.last_value(), Value::Integer(1));
        assert_eq!(sink.events().len(), 1);
        assert_eq!(handler.message_count(), 1);
    }

    #[test]
    fn test_ignored_message_keeps_query_pending() {
        let bed = TestBed::new();
        let feature = Arc::new(DeviceFeature::new(
            "f",
            "Scripted",
            Box::new(ScriptedHandler::active(false)),
        ));
        feature.set_query_status(QueryStatus::QueryPending);

        let sink = RecordingSink::default();
        assert!(!feature.handle_message(&bed.inbound(0x11, 0x00), "port0", 0, &sink));
        assert_eq!(feature.query_status(), QueryStatus::QueryPending);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_detached_feature_rejects_commands() {
        let feature = FeatureRegistry::with_defaults().make("switch", "GenericSwitch").unwrap();
        assert!(matches!(
            feature.handle_command(&Command::On),
            Err(DeviceError::Other(_))
        ));
        assert!(feature.make_poll_msg().is_none());
    }
}
