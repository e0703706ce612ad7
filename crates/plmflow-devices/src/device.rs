/*!
 * A single addressable node on the network.
 *
 * [`InsteonDevice`] owns the device's ports, descriptors, features and
 * outbound request queue. It builds its features from the catalog, routes
 * inbound messages to them, and hands queued requests to the scheduler,
 * which calls back into [`InsteonDevice::process_request_queue`] to send
 * them one at a time.
 */
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use plmflow_core::clock::SharedClock;
use plmflow_core::error::Error as CoreError;
use plmflow_core::event::{EventSink, FeatureEvent};
use plmflow_core::types::InsteonAddress;

use crate::catalog::{DeviceCatalog, DeviceDescriptor};
use crate::feature::{Command, DeviceFeature, FeatureRegistry, QueryStatus};
use crate::message::{FieldError, Msg, MsgFactory};
use crate::transport::{Driver, RequestScheduler};

/// Quiet time forced onto every message the queue sends, in milliseconds
pub const RATE_LIMIT_FLOOR_MS: i64 = 500;

/// Flag bit marking extended framing
const EXTENDED_FLAG: u8 = 0x10;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device has no port (or the driver no default port)
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Writing to the channel failed
    #[error("I/O error: {0}")]
    Io(String),

    /// A message could not be built or read
    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    /// No device with this address is known
    #[error("Device not found: {0}")]
    NotFound(InsteonAddress),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Initialization state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitStatus {
    /// Features not yet set up
    #[default]
    Uninitialized,
    /// Features set up and in use
    Initialized,
}

impl fmt::Display for InitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStatus::Uninitialized => write!(f, "UNINITIALIZED"),
            InitStatus::Initialized => write!(f, "INITIALIZED"),
        }
    }
}

/// Feature name to feature, in instantiation order
pub type FeatureMap = IndexMap<String, Arc<DeviceFeature>>;

/// A queued request: the feature that asked and the message to send
#[derive(Debug)]
pub struct RequestEntry {
    feature: Arc<DeviceFeature>,
    msg: Msg,
}

impl RequestEntry {
    /// Pair a feature with its outbound message
    pub fn new(feature: Arc<DeviceFeature>, msg: Msg) -> Self {
        Self { feature, msg }
    }

    /// The feature that queued the request
    pub fn feature(&self) -> &Arc<DeviceFeature> {
        &self.feature
    }

    /// The message to send
    pub fn msg(&self) -> &Msg {
        &self.msg
    }

    fn into_parts(self) -> (Arc<DeviceFeature>, Msg) {
        (self.feature, self.msg)
    }
}

/// Everything a device needs from the outside world
#[derive(Debug, Clone)]
pub struct DeviceServices {
    /// Transport for outbound messages
    pub driver: Arc<dyn Driver>,
    /// Cross-device queue scheduler
    pub scheduler: Arc<dyn RequestScheduler>,
    /// Descriptor catalog
    pub catalog: Arc<DeviceCatalog>,
    /// Feature constructors
    pub features: Arc<FeatureRegistry>,
    /// Message templates
    pub messages: Arc<MsgFactory>,
    /// Time source
    pub clock: SharedClock,
}

#[derive(Debug, Default)]
struct Identity {
    descriptors: Vec<DeviceDescriptor>,
    product_key: Option<String>,
    descriptors_changed: bool,
    has_responded_to_query: bool,
    needs_querying: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-device state and request machinery
pub struct InsteonDevice {
    address: InsteonAddress,
    services: DeviceServices,
    self_ref: Weak<InsteonDevice>,
    ports: RwLock<Vec<String>>,
    identity: Mutex<Identity>,
    features: ArcSwap<FeatureMap>,
    /// Serializes feature map rebuilds; readers go through the snapshot.
    feature_writer: Mutex<()>,
    init_status: Mutex<InitStatus>,
    poll_interval: AtomicI64,
    last_polled: AtomicI64,
    last_message_received: AtomicI64,
    request_queue: Mutex<VecDeque<RequestEntry>>,
    link_records: Mutex<Vec<Msg>>,
    is_modem: AtomicBool,
    is_in_items_file: AtomicBool,
}

impl InsteonDevice {
    /// Create a device. The device is reference counted so its features and
    /// the scheduler can point back at it.
    pub fn new(address: InsteonAddress, services: DeviceServices) -> Arc<Self> {
        let now = services.clock.now_millis();
        Arc::new_cyclic(|self_ref| Self {
            address,
            services,
            self_ref: self_ref.clone(),
            ports: RwLock::new(Vec::new()),
            identity: Mutex::new(Identity::default()),
            features: ArcSwap::from_pointee(FeatureMap::new()),
            feature_writer: Mutex::new(()),
            init_status: Mutex::new(InitStatus::Uninitialized),
            poll_interval: AtomicI64::new(-1),
            last_polled: AtomicI64::new(0),
            last_message_received: AtomicI64::new(now),
            request_queue: Mutex::new(VecDeque::new()),
            link_records: Mutex::new(Vec::new()),
            is_modem: AtomicBool::new(false),
            is_in_items_file: AtomicBool::new(false),
        })
    }

    /// Device address
    pub fn address(&self) -> &InsteonAddress {
        &self.address
    }

    // Ports

    /// Add a port the device is reachable through. The first one added is
    /// the default.
    pub fn add_port<S: Into<String>>(&self, port: S) {
        let port = port.into();
        let mut ports = self.ports.write().unwrap_or_else(PoisonError::into_inner);
        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    /// Default port
    pub fn port(&self) -> Result<String> {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
            .ok_or_else(|| {
                DeviceError::NotConfigured(format!("no ports configured for device {}", self.address))
            })
    }

    /// All ports, default first
    pub fn ports(&self) -> Vec<String> {
        self.ports.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether at least one port is configured
    pub fn has_valid_ports(&self) -> bool {
        !self.ports.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    // Identity

    /// Add a descriptor unless an equal one is already known
    pub fn add_descriptor(&self, descriptor: DeviceDescriptor) {
        let mut identity = lock(&self.identity);
        if !identity.descriptors.contains(&descriptor) {
            identity.descriptors.push(descriptor);
            identity.descriptors_changed = true;
        }
    }

    /// Known descriptors
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        lock(&self.identity).descriptors.clone()
    }

    /// Forget all descriptors
    pub fn clear_descriptors(&self) {
        lock(&self.identity).descriptors.clear();
    }

    /// Whether any descriptor is known
    pub fn has_valid_descriptors(&self) -> bool {
        !lock(&self.identity).descriptors.is_empty()
    }

    /// Whether descriptors were added since the flag was last cleared
    pub fn descriptors_have_changed(&self) -> bool {
        lock(&self.identity).descriptors_changed
    }

    /// Set or clear the descriptors-changed flag
    pub fn set_descriptors_have_changed(&self, changed: bool) {
        lock(&self.identity).descriptors_changed = changed;
    }

    /// Descriptors in their compact form, concatenated
    pub fn descriptors_as_string(&self) -> String {
        lock(&self.identity)
            .descriptors
            .iter()
            .map(DeviceDescriptor::to_short_string)
            .collect()
    }

    /// Resolved product key, if any
    pub fn product_key(&self) -> Option<String> {
        lock(&self.identity).product_key.clone()
    }

    /// Whether a product key is set
    pub fn has_product_key(&self) -> bool {
        lock(&self.identity).product_key.is_some()
    }

    /// Whether the product key equals `key`
    pub fn has_product_key_of(&self, key: &str) -> bool {
        lock(&self.identity).product_key.as_deref() == Some(key)
    }

    /// Set the product key. Features must be instantiated again afterwards.
    pub fn set_product_key<S: Into<String>>(&self, product_key: S) {
        lock(&self.identity).product_key = Some(product_key.into());
    }

    /// Record product information received through a query.
    ///
    /// The queried identity replaces whatever the link tables suggested. The
    /// product key is cleared so features are instantiated again once a key
    /// is assigned. Most devices report 0 as their product key, so
    /// `reported_key` is only logged.
    pub fn set_product_info(&self, reported_key: u32, category: u8, subcategory: u8, version: u8) {
        let descriptor = DeviceDescriptor::new(category, subcategory, version);
        debug!(
            "{} updated with queried descriptor {} (reported product key {:#x})",
            self.address, descriptor, reported_key
        );

        let mut identity = lock(&self.identity);
        identity.has_responded_to_query = true;
        identity.product_key = None;
        identity.descriptors.clear();
        identity.descriptors.push(descriptor);
        identity.descriptors_changed = true;
        identity.needs_querying = false;
    }

    /// Whether the device answered a product query
    pub fn has_responded_to_query(&self) -> bool {
        lock(&self.identity).has_responded_to_query
    }

    /// Whether the device should be asked for its product info
    pub fn needs_querying(&self) -> bool {
        lock(&self.identity).needs_querying
    }

    /// Mark the device as needing a product query
    pub fn set_needs_querying(&self, needs_querying: bool) {
        lock(&self.identity).needs_querying = needs_querying;
    }

    // Status and flags

    /// Initialization state
    pub fn init_status(&self) -> InitStatus {
        *lock(&self.init_status)
    }

    /// Set the initialization state
    pub fn set_init_status(&self, status: InitStatus) {
        *lock(&self.init_status) = status;
    }

    /// Whether the device is initialized
    pub fn is_initialized(&self) -> bool {
        self.init_status() == InitStatus::Initialized
    }

    /// Initialization state as text
    pub fn status_as_string(&self) -> String {
        self.init_status().to_string()
    }

    /// Whether this node is the modem itself
    pub fn is_modem(&self) -> bool {
        self.is_modem.load(Ordering::Relaxed)
    }

    /// Mark this node as the modem
    pub fn set_is_modem(&self, is_modem: bool) {
        self.is_modem.store(is_modem, Ordering::Relaxed);
    }

    /// Whether an item configuration refers to this device
    pub fn is_in_items_file(&self) -> bool {
        self.is_in_items_file.load(Ordering::Relaxed)
    }

    /// Mark the device as referenced by item configuration
    pub fn set_is_in_items_file(&self, in_items_file: bool) {
        self.is_in_items_file.store(in_items_file, Ordering::Relaxed);
    }

    // Polling

    /// Poll interval in milliseconds; <= 0 means the device is not polled
    pub fn poll_interval(&self) -> i64 {
        self.poll_interval.load(Ordering::Relaxed)
    }

    /// Set the poll interval. Non-positive values are ignored.
    pub fn set_poll_interval(&self, interval: i64) {
        debug!("setting poll interval for {} to {}", self.address, interval);
        if interval > 0 {
            self.poll_interval.store(interval, Ordering::Relaxed);
        }
    }

    /// Whether the device takes part in periodic polling
    pub fn has_valid_polling_interval(&self) -> bool {
        self.poll_interval() > 0
    }

    /// Time of the last poll that queued at least one request
    pub fn last_polled(&self) -> i64 {
        self.last_polled.load(Ordering::SeqCst)
    }

    /// Time the last message from the device arrived
    pub fn last_message_received(&self) -> i64 {
        self.last_message_received.load(Ordering::SeqCst)
    }

    /// How long the last poll has gone unanswered: `last_polled -
    /// last_message_received`. Positive means the device is overdue.
    pub fn poll_overdue_time(&self) -> i64 {
        self.last_polled() - self.last_message_received()
    }

    // Features

    /// Snapshot of the current feature map
    pub fn features(&self) -> Arc<FeatureMap> {
        self.features.load_full()
    }

    /// Look up a feature by name
    pub fn feature(&self, name: &str) -> Option<Arc<DeviceFeature>> {
        self.features.load().get(name).cloned()
    }

    /// Attach a feature under `name`, replacing any feature of that name
    pub fn add_feature(&self, name: &str, feature: Arc<DeviceFeature>) {
        let _writer = lock(&self.feature_writer);
        feature.set_device(self.self_ref.clone());
        let mut features = FeatureMap::clone(&self.features.load());
        features.insert(name.to_string(), feature);
        self.features.store(Arc::new(features));
    }

    /// Detach and remove the feature named `name`
    pub fn remove_feature(&self, name: &str) -> Option<Arc<DeviceFeature>> {
        let _writer = lock(&self.feature_writer);
        let mut features = FeatureMap::clone(&self.features.load());
        let removed = features.shift_remove(name)?;
        removed.set_device(Weak::new());
        self.features.store(Arc::new(features));
        Some(removed)
    }

    /// Whether any feature has a bound item
    pub fn is_referenced(&self) -> bool {
        self.features.load().values().any(|f| f.has_listeners())
    }

    /// Rebuild the feature map from the descriptors and product key.
    ///
    /// Does nothing without a product key. Unknown feature types are logged
    /// and skipped. An empty result while descriptors exist is reported as a
    /// product key mismatch but leaves the device usable. Returns the number
    /// of features instantiated.
    pub fn instantiate_features(&self) -> usize {
        let _writer = lock(&self.feature_writer);
        let (product_key, descriptors) = {
            let identity = lock(&self.identity);
            match &identity.product_key {
                Some(key) => (key.clone(), identity.descriptors.clone()),
                None => return 0,
            }
        };
        debug!("instantiating features of {} for product key {}", self.address, product_key);

        let catalog = &self.services.catalog;
        let mut features = FeatureMap::new();
        for descriptor in &descriptors {
            let Some(feature_set) = catalog.features_for(descriptor, &product_key) else {
                continue;
            };
            for (name, feature_type) in feature_set {
                debug!("instantiating feature {} {}", name, feature_type);
                match self.services.features.make(name, feature_type) {
                    Some(feature) => {
                        feature.set_device(self.self_ref.clone());
                        features.insert(name.clone(), feature);
                    }
                    None => error!(
                        "catalog error: unimplemented feature type {} for feature {} of {}",
                        feature_type, name, self.address
                    ),
                }
            }
        }

        if features.is_empty() && !descriptors.is_empty() {
            warn!("device {} does not match product key {}", self.address, product_key);
            for descriptor in &descriptors {
                if let Some(sub) = catalog.lookup(descriptor.category, descriptor.subcategory) {
                    for key in sub.product_keys.keys() {
                        warn!(
                            "   cat {:#04x} subcat {:#04x} has product key {}",
                            descriptor.category, descriptor.subcategory, key
                        );
                    }
                }
            }
        }

        let count = features.len();
        self.features.store(Arc::new(features));
        count
    }

    // Inbound

    /// Route an inbound message to the features.
    ///
    /// Non-status features are offered the message in order until one
    /// consumes it; every status feature is then offered it regardless.
    pub fn handle_message(&self, port: &str, msg: &Msg, sink: &dyn EventSink) {
        let now = self.services.clock.now_millis();
        self.last_message_received.fetch_max(now, Ordering::SeqCst);
        sink.publish(FeatureEvent::MessageReceived {
            address: self.address,
            port: port.to_string(),
        });

        let features = self.features.load();
        for feature in features.values().filter(|f| !f.is_status_feature()) {
            if feature.handle_message(msg, port, now, sink) {
                break;
            }
        }
        for feature in features.values().filter(|f| f.is_status_feature()) {
            feature.handle_message(msg, port, now, sink);
        }
    }

    // Outbound

    /// Offer a command to every feature. Failures are logged per feature.
    pub fn process_command(&self, command: &Command) {
        let features = self.features.load();
        debug!("processing command {:?} for {}, features: {}", command, self.address, features.len());
        for feature in features.values() {
            if let Err(e) = feature.handle_command(command) {
                warn!("{}: feature {} failed to handle {:?}: {}", self.address, feature.name(), command, e);
            }
        }
    }

    /// Queue a poll request for every feature that has listeners and knows
    /// how to poll. Returns the number of requests queued.
    pub fn do_poll(&self) -> usize {
        let entries: Vec<RequestEntry> = self
            .features
            .load()
            .values()
            .filter(|f| f.has_listeners())
            .filter_map(|f| f.make_poll_msg().map(|msg| RequestEntry::new(Arc::clone(f), msg)))
            .collect();
        if entries.is_empty() {
            return 0;
        }

        let count = entries.len();
        lock(&self.request_queue).extend(entries);
        let now = self.services.clock.now_millis();
        self.notify_scheduler(now);
        self.last_polled.store(now, Ordering::SeqCst);
        count
    }

    /// Queue one message on behalf of `feature`, bypassing poll aggregation
    pub fn enqueue_message(&self, msg: Msg, feature: Arc<DeviceFeature>) {
        lock(&self.request_queue).push_back(RequestEntry::new(feature, msg));
        self.notify_scheduler(self.services.clock.now_millis());
    }

    /// Number of requests waiting to be sent
    pub fn queue_len(&self) -> usize {
        lock(&self.request_queue).len()
    }

    fn notify_scheduler(&self, now: i64) {
        match self.self_ref.upgrade() {
            Some(me) => self.services.scheduler.add_queue(me, now),
            None => warn!("{} is being dropped, request not scheduled", self.address),
        }
    }

    /// Send the request at the head of the queue. Called by the scheduler.
    ///
    /// Returns `None` when the queue is empty, otherwise the earliest time
    /// the scheduler should call again: `now` plus the message's quiet time.
    /// The message itself goes out with its quiet time lowered to
    /// [`RATE_LIMIT_FLOOR_MS`]. A failed write drops the entry.
    pub fn process_request_queue(&self, now: i64) -> Option<i64> {
        let entry = lock(&self.request_queue).pop_front()?;

        let (feature, mut msg) = entry.into_parts();
        feature.set_query_status(QueryStatus::QueryPending);
        let quiet_time = msg.quiet_time();
        msg.set_quiet_time(RATE_LIMIT_FLOOR_MS);
        if let Err(e) = self.write_message(&msg) {
            warn!("{}: message write failed: {}", self.address, e);
        }
        Some(now + quiet_time)
    }

    fn write_message(&self, msg: &Msg) -> Result<()> {
        let port = self.port()?;
        self.services.driver.write_message(&port, msg)
    }

    /// Build a standard-length message to this device
    pub fn make_standard_message(&self, flags: u8, cmd1: u8, cmd2: u8) -> Result<Msg> {
        let mut msg = self.addressed_message("SendStandardMessage")?;
        msg.set_byte("messageFlags", flags)?;
        msg.set_byte("command1", cmd1)?;
        msg.set_byte("command2", cmd2)?;
        Ok(msg)
    }

    /// Build an extended-length message to this device, with the extended
    /// flag set and the checksum over the command bytes in `userData14`
    pub fn make_extended_message(&self, flags: u8, cmd1: u8, cmd2: u8) -> Result<Msg> {
        let mut msg = self.addressed_message("SendExtendedMessage")?;
        msg.set_byte("messageFlags", flags | EXTENDED_FLAG)?;
        msg.set_byte("command1", cmd1)?;
        msg.set_byte("command2", cmd2)?;
        msg.set_byte("userData14", cmd1.wrapping_add(cmd2).wrapping_neg())?;
        Ok(msg)
    }

    fn addressed_message(&self, template: &str) -> Result<Msg> {
        if !self.address.is_valid() {
            return Err(FieldError::InvalidAddress(self.address).into());
        }
        let mut msg = self.services.messages.make_message(template)?;
        msg.set_address("toAddress", self.address)?;
        Ok(msg)
    }

    // Link records

    /// Remember a link-table record naming this device
    pub fn add_link_record(&self, record: Msg) {
        lock(&self.link_records).push(record);
    }

    /// Whether link records are pending erase
    pub fn has_link_records(&self) -> bool {
        !lock(&self.link_records).is_empty()
    }

    /// Erase this device's link records from the modem.
    ///
    /// Writes one management message per record through the driver's default
    /// port. The first failure aborts the remaining records. The local record
    /// list is cleared either way. Returns the number of erase messages
    /// written.
    pub fn erase_from_modem(&self) -> Result<usize> {
        let records = std::mem::take(&mut *lock(&self.link_records));
        let mut written = 0;
        for record in &records {
            if let Err(e) = self.write_erase_message(record) {
                error!(
                    "{}: erase from modem aborted after {} of {} records: {}",
                    self.address,
                    written,
                    records.len(),
                    e
                );
                return Err(e);
            }
            written += 1;
        }
        Ok(written)
    }

    fn write_erase_message(&self, record: &Msg) -> Result<()> {
        let mut msg = self.services.messages.make_message("ManageALLLinkRecord")?;
        msg.set_byte("controlCode", 0x80)?;
        msg.set_byte("recordFlags", 0x00)?;
        msg.set_byte("ALLLinkGroup", record.get_byte("ALLLinkGroup")?)?;
        msg.set_address("linkAddress", self.address)?;
        msg.set_byte("linkData1", 0x00)?;
        msg.set_byte("linkData2", 0x00)?;
        msg.set_byte("linkData3", 0x00)?;

        let driver = &self.services.driver;
        let port = driver
            .default_port()
            .ok_or_else(|| DeviceError::NotConfigured("driver has no default port".to_string()))?;
        driver.write_message(&port, &msg)?;
        info!("wrote erase message: {}", msg);
        Ok(())
    }
}

impl fmt::Debug for InsteonDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsteonDevice")
            .field("address", &self.address)
            .field("ports", &self.ports())
            .field("product_key", &self.product_key())
            .field("features", &self.features().keys().collect::<Vec<_>>())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl fmt::Display for InsteonDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        for descriptor in self.descriptors() {
            write!(f, ":{}", descriptor)?;
        }
        for (name, feature) in self.features().iter() {
            write!(f, "|{}->{}", name, feature)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SubCategory;
    use crate::testing::{RecordingSink, ScriptedHandler, TestBed};
    use plmflow_core::clock::Clock;
    use plmflow_core::event::EventBus;
    use plmflow_core::types::Id;
    use std::thread;

    fn scripted(device: &InsteonDevice, name: &str, handler: &ScriptedHandler) -> Arc<DeviceFeature> {
        let feature = Arc::new(DeviceFeature::new(name, "Scripted", Box::new(handler.clone())));
        device.add_feature(name, Arc::clone(&feature));
        feature
    }

    fn standard(bed: &TestBed, cmd1: u8, quiet_time: i64) -> Msg {
        let mut msg = bed.device().make_standard_message(0x0F, cmd1, 0x00).unwrap();
        msg.set_quiet_time(quiet_time);
        msg
    }

    #[test]
    fn test_queue_drains_in_fifo_order() {
        let bed = TestBed::new();
        let device = bed.device();
        let feature = scripted(&device, "f", &ScriptedHandler::active(false));

        for cmd1 in [0x11, 0x13, 0x19] {
            device.enqueue_message(standard(&bed, cmd1, 0), Arc::clone(&feature));
        }
        assert_eq!(device.queue_len(), 3);

        for _ in 0..3 {
            device.process_request_queue(1_000);
        }
        let sent: Vec<u8> = bed
            .driver
            .sent()
            .iter()
            .map(|(_, m)| m.get_byte("command1").unwrap())
            .collect();
        assert_eq!(sent, vec![0x11, 0x13, 0x19]);
        assert_eq!(bed.scheduler.calls().len(), 3);
    }

    #[test]
    fn test_empty_queue_returns_none_and_leaves_timestamps() {
        let bed = TestBed::new();
        let device = bed.device();
        let polled = device.last_polled();
        let received = device.last_message_received();

        assert_eq!(device.process_request_queue(5_000), None);
        assert_eq!(device.last_polled(), polled);
        assert_eq!(device.last_message_received(), received);
        assert!(bed.driver.sent().is_empty());
    }

    #[test]
    fn test_send_at_time_zero_is_not_an_empty_queue() {
        let bed = TestBed::new();
        let device = bed.device();
        let feature = scripted(&device, "f", &ScriptedHandler::active(false));
        device.enqueue_message(standard(&bed, 0x11, 0), Arc::clone(&feature));
        device.enqueue_message(standard(&bed, 0x13, 0), feature);

        assert_eq!(device.process_request_queue(0), Some(0));
        assert_eq!(device.process_request_queue(0), Some(0));
        assert_eq!(device.process_request_queue(0), None);
        assert_eq!(bed.driver.sent().len(), 2);
    }

    #[test]
    fn test_process_returns_quiet_time_and_applies_floor() {
        let bed = TestBed::new();
        let device = bed.device();
        let feature = scripted(&device, "f", &ScriptedHandler::active(false));

        device.enqueue_message(standard(&bed, 0x11, 1_800), Arc::clone(&feature));
        assert_eq!(device.process_request_queue(10_000), Some(11_800));

        let sent = bed.driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "port0");
        assert_eq!(sent[0].1.quiet_time(), RATE_LIMIT_FLOOR_MS);
        assert_eq!(feature.query_status(), QueryStatus::QueryPending);
    }

    #[test]
    fn test_write_failure_drops_entry() {
        let bed = TestBed::new();
        let device = bed.device();
        let feature = scripted(&device, "f", &ScriptedHandler::active(false));
        device.enqueue_message(standard(&bed, 0x11, 100), Arc::clone(&feature));
        device.enqueue_message(standard(&bed, 0x13, 100), Arc::clone(&feature));

        bed.driver.fail_writes(true);
        assert_eq!(device.process_request_queue(0), Some(100));
        assert_eq!(device.queue_len(), 1);

        bed.driver.fail_writes(false);
        assert_eq!(device.process_request_queue(100), Some(200));
        let sent = bed.driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.get_byte("command1").unwrap(), 0x13);
    }

    #[test_log::test]
    fn test_no_port_write_is_logged_not_fatal() {
        let bed = TestBed::new();
        let device = bed.device_without_port(InsteonAddress::new(0x44, 0x55, 0x66));
        assert!(matches!(device.port(), Err(DeviceError::NotConfigured(_))));

        let feature = scripted(&device, "f", &ScriptedHandler::active(false));
        device.enqueue_message(standard(&bed, 0x11, 300), feature);
        assert_eq!(device.process_request_queue(0), Some(300));
        assert!(bed.driver.sent().is_empty());
    }

    #[test]
    fn test_ports_are_ordered_and_unique() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_port("port1");
        device.add_port("port0");
        assert_eq!(device.ports(), vec!["port0".to_string(), "port1".to_string()]);
        assert_eq!(device.port().unwrap(), "port0");
    }

    #[test]
    fn test_set_product_info_resets_identity() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_descriptor(DeviceDescriptor::new(0x01, 0x01, 0x00));
        device.add_descriptor(DeviceDescriptor::new(0x01, 0x02, 0x00));
        device.set_product_key("F00.00.01");
        device.set_needs_querying(true);

        device.set_product_info(0, 0x02, 0x2A, 0x43);

        assert!(!device.has_product_key());
        assert_eq!(device.descriptors(), vec![DeviceDescriptor::new(0x02, 0x2A, 0x43)]);
        assert!(!device.needs_querying());
        assert!(device.has_responded_to_query());
        assert!(device.descriptors_have_changed());
    }

    #[test]
    fn test_instantiate_features_from_catalog() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_descriptor(DeviceDescriptor::new(0x02, 0x1A, 0x00));
        assert_eq!(device.instantiate_features(), 0);

        device.set_product_key("F00.00.11");
        assert_eq!(device.instantiate_features(), 2);

        let features = device.features();
        assert_eq!(features.keys().collect::<Vec<_>>(), vec!["switch", "lastheardfrom"]);
        let switch = device.feature("switch").unwrap();
        assert_eq!(switch.device().unwrap().address(), device.address());
    }

    #[test]
    fn test_instantiate_features_is_idempotent() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_descriptor(DeviceDescriptor::new(0x02, 0x1A, 0x00));
        device.set_product_key("F00.00.11");

        device.instantiate_features();
        let first: Vec<String> = device.features().keys().cloned().collect();
        device.instantiate_features();
        let second: Vec<String> = device.features().keys().cloned().collect();
        assert_eq!(first, second);
    }

    #[test_log::test]
    fn test_unknown_feature_type_is_skipped() {
        let catalog = DeviceCatalog::new()
            .with_subcategory(
                0x01,
                SubCategory::new(0x20, "Dimmer").with_product_key(
                    "F00.00.20",
                    [("dimmer", "GenericDimmer"), ("bogus", "NoSuchType"), ("lastheardfrom", "GenericLastTime")],
                ),
            )
            .unwrap();
        let bed = TestBed::with_catalog(catalog);
        let device = bed.device();
        device.add_descriptor(DeviceDescriptor::new(0x01, 0x20, 0x00));
        device.set_product_key("F00.00.20");

        assert_eq!(device.instantiate_features(), 2);
        assert!(device.feature("bogus").is_none());
        assert!(device.feature("dimmer").is_some());
    }

    #[test_log::test]
    fn test_product_key_mismatch_leaves_device_usable() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_descriptor(DeviceDescriptor::new(0x02, 0x1A, 0x00));
        device.set_product_key("F00.00.99");

        assert_eq!(device.instantiate_features(), 0);
        assert!(device.features().is_empty());
        device.handle_message("port0", &bed.inbound(0x11, 0x00), &RecordingSink::default());
        assert_eq!(device.do_poll(), 0);
    }

    #[test]
    fn test_first_consuming_feature_wins() {
        let bed = TestBed::new();
        let device = bed.device();
        let first = ScriptedHandler::active(true);
        let second = ScriptedHandler::active(true);
        let status_a = ScriptedHandler::status();
        let status_b = ScriptedHandler::status();
        scripted(&device, "first", &first);
        scripted(&device, "status_a", &status_a);
        scripted(&device, "second", &second);
        scripted(&device, "status_b", &status_b);

        let sink = RecordingSink::default();
        device.handle_message("port0", &bed.inbound(0x11, 0x00), &sink);

        assert_eq!(first.message_count(), 1);
        assert_eq!(second.message_count(), 0);
        assert_eq!(status_a.message_count(), 1);
        assert_eq!(status_b.message_count(), 1);
    }

    #[test]
    fn test_non_consuming_feature_passes_message_on() {
        let bed = TestBed::new();
        let device = bed.device();
        let first = ScriptedHandler::active(false);
        let second = ScriptedHandler::active(true);
        scripted(&device, "first", &first);
        scripted(&device, "second", &second);

        device.handle_message("port0", &bed.inbound(0x11, 0x00), &RecordingSink::default());
        assert_eq!(first.message_count(), 1);
        assert_eq!(second.message_count(), 1);
    }

    #[test]
    fn test_handle_message_updates_last_received() {
        let bed = TestBed::new();
        let device = bed.device();
        bed.clock.advance(5_000);

        let sink = RecordingSink::default();
        device.handle_message("port0", &bed.inbound(0x11, 0x00), &sink);
        assert_eq!(device.last_message_received(), bed.clock.now_millis());
        assert!(matches!(sink.events()[0], FeatureEvent::MessageReceived { .. }));

        // A clock running backwards must not move the timestamp back.
        bed.clock.advance(-1_000);
        device.handle_message("port0", &bed.inbound(0x11, 0x00), &sink);
        assert_eq!(device.last_message_received(), bed.clock.now_millis() + 1_000);
    }

    #[test]
    fn test_do_poll_queues_one_entry_and_notifies_once() {
        let bed = TestBed::new();
        let device = bed.device_without_port(InsteonAddress::new(0x0A, 0x0B, 0x0C));
        let handler = ScriptedHandler::active(false).with_poll();
        let feature = scripted(&device, "f", &handler);
        feature.add_listener(Id::from_string("item"));
        bed.clock.set(42_000);

        assert_eq!(device.do_poll(), 1);
        assert_eq!(device.queue_len(), 1);
        assert_eq!(bed.scheduler.calls(), vec![(*device.address(), 42_000)]);
        assert_eq!(device.last_polled(), 42_000);
    }

    #[test]
    fn test_do_poll_skips_features_without_listeners() {
        let bed = TestBed::new();
        let device = bed.device();
        scripted(&device, "f", &ScriptedHandler::active(false).with_poll());
        bed.clock.set(9_000);

        assert_eq!(device.do_poll(), 0);
        assert_eq!(device.queue_len(), 0);
        assert!(bed.scheduler.calls().is_empty());
        assert_eq!(device.last_polled(), 0);
    }

    #[test]
    fn test_poll_overdue_time() {
        let bed = TestBed::new();
        bed.clock.set(1_000);
        let device = bed.device();
        let feature = scripted(&device, "f", &ScriptedHandler::active(false).with_poll());
        feature.add_listener(Id::new());

        bed.clock.set(61_000);
        device.do_poll();
        assert_eq!(device.poll_overdue_time(), 60_000);

        device.handle_message("port0", &bed.inbound(0x11, 0x00), &RecordingSink::default());
        assert_eq!(device.poll_overdue_time(), 0);
    }

    #[test]
    fn test_poll_interval_ignores_non_positive() {
        let bed = TestBed::new();
        let device = bed.device();
        assert!(!device.has_valid_polling_interval());

        device.set_poll_interval(30_000);
        device.set_poll_interval(0);
        device.set_poll_interval(-5);
        assert_eq!(device.poll_interval(), 30_000);
        assert!(device.has_valid_polling_interval());
    }

    #[test]
    fn test_process_command_enqueues_switch_message() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_descriptor(DeviceDescriptor::new(0x02, 0x1A, 0x00));
        device.set_product_key("F00.00.11");
        device.instantiate_features();

        device.process_command(&Command::Off);
        assert_eq!(device.queue_len(), 1);

        device.process_request_queue(0);
        let sent = bed.driver.sent();
        assert_eq!(sent[0].1.get_byte("command1").unwrap(), 0x13);
        assert_eq!(
            device.feature("switch").unwrap().query_status(),
            QueryStatus::QueryPending
        );
    }

    #[test]
    fn test_standard_message_builder() {
        let bed = TestBed::new();
        let device = bed.device();
        let msg = device.make_standard_message(0x0F, 0x11, 0xFF).unwrap();
        assert_eq!(msg.as_bytes(), &[0x02, 0x62, 0x11, 0x22, 0x33, 0x0F, 0x11, 0xFF]);
    }

    #[test]
    fn test_extended_message_builder() {
        let bed = TestBed::new();
        let device = bed.device();
        let msg = device.make_extended_message(0x0F, 0x2E, 0x00).unwrap();

        assert_eq!(msg.get_byte("messageFlags").unwrap(), 0x1F);
        assert_eq!(msg.get_byte("userData14").unwrap(), 0xD2);

        let msg = device.make_extended_message(0x1F, 0xFF, 0x02).unwrap();
        assert_eq!(msg.get_byte("messageFlags").unwrap(), 0x1F);
        assert_eq!(msg.get_byte("userData14").unwrap(), 0xFF);
    }

    #[test]
    fn test_builders_reject_zero_address() {
        let bed = TestBed::new();
        let device = bed.device_without_port(InsteonAddress::default());
        assert!(matches!(
            device.make_standard_message(0x0F, 0x11, 0x00),
            Err(DeviceError::Field(FieldError::InvalidAddress(_)))
        ));
        assert!(matches!(
            device.make_extended_message(0x0F, 0x11, 0x00),
            Err(DeviceError::Field(FieldError::InvalidAddress(_)))
        ));
    }

    #[test]
    fn test_erase_from_modem_stops_at_first_failure() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_link_record(bed.link_record(0x01));
        // Not a link record: has no ALLLinkGroup field.
        device.add_link_record(bed.inbound(0x11, 0x00));
        device.add_link_record(bed.link_record(0x03));

        let result = device.erase_from_modem();
        assert!(matches!(
            result,
            Err(DeviceError::Field(FieldError::UnknownField { .. }))
        ));

        let sent = bed.driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "modem");
        let erase = &sent[0].1;
        assert_eq!(erase.name(), "ManageALLLinkRecord");
        assert_eq!(erase.get_byte("controlCode").unwrap(), 0x80);
        assert_eq!(erase.get_byte("ALLLinkGroup").unwrap(), 0x01);
        assert_eq!(erase.get_address("linkAddress").unwrap(), *device.address());
        assert!(!device.has_link_records());
    }

    #[test]
    fn test_erase_from_modem_writes_every_record() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_link_record(bed.link_record(0x00));
        device.add_link_record(bed.link_record(0x01));

        assert_eq!(device.erase_from_modem().unwrap(), 2);
        assert_eq!(bed.driver.sent().len(), 2);
        assert!(!device.has_link_records());
    }

    #[test]
    fn test_remove_feature_detaches() {
        let bed = TestBed::new();
        let device = bed.device();
        let feature = scripted(&device, "f", &ScriptedHandler::active(false));
        assert!(feature.device().is_some());
        feature.add_listener(Id::new());
        assert!(device.is_referenced());

        let removed = device.remove_feature("f").unwrap();
        assert!(removed.device().is_none());
        assert!(device.features().is_empty());
        assert!(!device.is_referenced());
        assert!(device.remove_feature("f").is_none());
    }

    #[test]
    fn test_snapshot_survives_rebuild() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_descriptor(DeviceDescriptor::new(0x02, 0x1A, 0x00));
        device.set_product_key("F00.00.11");
        device.instantiate_features();

        let snapshot = device.features();
        device.set_product_info(0, 0x10, 0x02, 0x00);
        device.set_product_key("F00.00.02");
        device.instantiate_features();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(device.features().keys().collect::<Vec<_>>(), vec!["contact"]);
    }

    #[test]
    fn test_display() {
        let bed = TestBed::new();
        let device = bed.device();
        device.add_descriptor(DeviceDescriptor::new(0x02, 0x1A, 0x41));
        assert_eq!(device.descriptors_as_string(), "02.1A.41");
        assert!(device.to_string().starts_with("11.22.33:cat 0x02"));
        assert_eq!(device.status_as_string(), "UNINITIALIZED");
    }

    #[test]
    fn test_feature_snapshots_stay_whole_during_rebuilds() {
        let bed = TestBed::new();
        let device = bed.device();
        let relay = ["switch", "lastheardfrom"];
        let sensor = ["contact"];
        let bus = EventBus::with_capacity(16);
        let rebuilding = AtomicBool::new(true);

        thread::scope(|s| {
            s.spawn(|| {
                for round in 0..200 {
                    if round % 2 == 0 {
                        device.set_product_info(0, 0x02, 0x1A, 0x00);
                        device.set_product_key("F00.00.11");
                    } else {
                        device.set_product_info(0, 0x10, 0x02, 0x00);
                        device.set_product_key("F00.00.02");
                    }
                    device.instantiate_features();
                }
                rebuilding.store(false, Ordering::SeqCst);
            });
            for _ in 0..2 {
                s.spawn(|| {
                    while rebuilding.load(Ordering::SeqCst) {
                        device.handle_message("port0", &bed.inbound(0x11, 0x00), &bus);
                        let features = device.features();
                        let names: Vec<&str> = features.keys().map(String::as_str).collect();
                        assert!(
                            names.is_empty() || names == relay || names == sensor,
                            "mixed feature map: {:?}",
                            names
                        );
                        for feature in features.values() {
                            assert_eq!(feature.device().unwrap().address(), device.address());
                        }
                    }
                });
            }
        });

        assert_eq!(device.features().keys().collect::<Vec<_>>(), vec!["contact"]);
    }

    #[test]
    fn test_last_message_received_never_moves_back() {
        let bed = TestBed::new();
        let device = bed.device();
        let bus = EventBus::with_capacity(16);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut last = 0;
                    for _ in 0..500 {
                        bed.clock.advance(1);
                        device.handle_message("port0", &bed.inbound(0x11, 0x00), &bus);
                        let seen = device.last_message_received();
                        assert!(seen >= last, "went back from {} to {}", last, seen);
                        last = seen;
                    }
                });
            }
        });

        assert_eq!(bed.clock.now_millis(), 2_000);
        assert_eq!(device.last_message_received(), 2_000);
    }
}
