//! Fakes for exercising devices without a modem.
//!
//! Compiled for this crate's tests and, through the `testing` feature, for
//! downstream crates' tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use plmflow_core::clock::ManualClock;
use plmflow_core::event::{EventSink, FeatureEvent};
use plmflow_core::types::{InsteonAddress, Value};

use crate::catalog::{DeviceCatalog, SubCategory};
use crate::device::{DeviceError, DeviceServices, InsteonDevice, Result};
use crate::feature::{FeatureHandler, FeatureRegistry, QueryStatus};
use crate::message::{FieldError, Msg, MsgFactory};
use crate::transport::{Driver, RequestScheduler};

/// Flags of an inbound direct message
const DIRECT_INBOUND_FLAGS: u8 = 0x0B;

/// Driver that records every write
#[derive(Debug)]
pub struct RecordingDriver {
    sent: Mutex<Vec<(String, Msg)>>,
    fail: AtomicBool,
    default_port: Option<String>,
}

impl RecordingDriver {
    /// Driver whose default port is `default_port`
    pub fn new(default_port: Option<&str>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            default_port: default_port.map(str::to_string),
        }
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far, as `(port, message)`
    pub fn sent(&self) -> Vec<(String, Msg)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Driver for RecordingDriver {
    fn write_message(&self, port: &str, msg: &Msg) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::Io(format!("port {} unavailable", port)));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((port.to_string(), msg.clone()));
        Ok(())
    }

    fn default_port(&self) -> Option<String> {
        self.default_port.clone()
    }
}

/// Scheduler that only records `add_queue` calls
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    calls: Mutex<Vec<(InsteonAddress, i64)>>,
}

impl RecordingScheduler {
    /// Calls so far, as `(device address, ready time)`
    pub fn calls(&self) -> Vec<(InsteonAddress, i64)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl RequestScheduler for RecordingScheduler {
    fn add_queue(&self, device: Arc<InsteonDevice>, ready_time: i64) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*device.address(), ready_time));
    }
}

/// Event sink that keeps everything published to it
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FeatureEvent>>,
}

impl RecordingSink {
    /// Events so far
    pub fn events(&self) -> Vec<FeatureEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: FeatureEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Handler with fixed behaviour that counts the messages it sees.
/// Clones share the counter.
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    consumes: bool,
    status: bool,
    polls: bool,
    seen: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    /// Non-status handler that consumes every message or none
    pub fn active(consumes: bool) -> Self {
        Self {
            consumes,
            status: false,
            polls: false,
            seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Status handler that accepts every message
    pub fn status() -> Self {
        Self {
            status: true,
            ..Self::active(true)
        }
    }

    /// Also answer polls with a status request
    pub fn with_poll(mut self) -> Self {
        self.polls = true;
        self
    }

    /// Messages offered so far
    pub fn message_count(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

impl FeatureHandler for ScriptedHandler {
    fn is_status(&self) -> bool {
        self.status
    }

    fn handle_message(
        &self,
        _msg: &Msg,
        _status: QueryStatus,
        _received_at: i64,
    ) -> std::result::Result<Option<Value>, FieldError> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.consumes.then(|| Value::Integer(seen as i64)))
    }

    fn poll_message(&self, device: &InsteonDevice) -> Result<Option<Msg>> {
        if !self.polls {
            return Ok(None);
        }
        device.make_standard_message(0x0F, 0x19, 0x00).map(Some)
    }
}

/// Catalog with a relay (02.1A, `F00.00.11`) and an open/close sensor
/// (10.02, `F00.00.02`)
pub fn test_catalog() -> DeviceCatalog {
    let mut catalog = DeviceCatalog::new();
    let entries = [
        (
            0x02,
            SubCategory::new(0x1A, "ToggleLinc Relay").with_product_key(
                "F00.00.11",
                [("switch", "GenericSwitch"), ("lastheardfrom", "GenericLastTime")],
            ),
        ),
        (
            0x10,
            SubCategory::new(0x02, "Open/Close Sensor")
                .with_product_key("F00.00.02", [("contact", "ContactSensor")]),
        ),
    ];
    for (category, subcategory) in entries {
        if let Err(e) = catalog.insert(category, subcategory) {
            panic!("test catalog is inconsistent: {}", e);
        }
    }
    catalog
}

/// A device at 11.22.33 on `port0`, wired to recording fakes and a manual
/// clock starting at 0. The driver's default port is `modem`.
pub struct TestBed {
    /// Recording driver
    pub driver: Arc<RecordingDriver>,
    /// Recording scheduler
    pub scheduler: Arc<RecordingScheduler>,
    /// Clock shared by every device of the bed
    pub clock: Arc<ManualClock>,
    /// Services handed to devices
    pub services: DeviceServices,
    device: OnceLock<Arc<InsteonDevice>>,
}

impl TestBed {
    /// Bed using [`test_catalog`]
    pub fn new() -> Self {
        Self::with_catalog(test_catalog())
    }

    /// Bed using `catalog`
    pub fn with_catalog(catalog: DeviceCatalog) -> Self {
        let driver = Arc::new(RecordingDriver::new(Some("modem")));
        let scheduler = Arc::new(RecordingScheduler::default());
        let clock = Arc::new(ManualClock::new(0));
        let messages = match MsgFactory::with_defaults() {
            Ok(messages) => messages,
            Err(e) => panic!("default message templates are broken: {}", e),
        };
        let services = DeviceServices {
            driver: driver.clone(),
            scheduler: scheduler.clone(),
            catalog: Arc::new(catalog),
            features: Arc::new(FeatureRegistry::with_defaults()),
            messages: Arc::new(messages),
            clock: clock.clone(),
        };
        Self {
            driver,
            scheduler,
            clock,
            services,
            device: OnceLock::new(),
        }
    }

    /// Address of the bed's device
    pub fn address() -> InsteonAddress {
        InsteonAddress::new(0x11, 0x22, 0x33)
    }

    /// The bed's device, created on first use
    pub fn device(&self) -> Arc<InsteonDevice> {
        Arc::clone(self.device.get_or_init(|| {
            let device = InsteonDevice::new(Self::address(), self.services.clone());
            device.add_port("port0");
            device
        }))
    }

    /// A fresh device with no ports
    pub fn device_without_port(&self, address: InsteonAddress) -> Arc<InsteonDevice> {
        InsteonDevice::new(address, self.services.clone())
    }

    /// Inbound direct message from the bed's device
    pub fn inbound(&self, cmd1: u8, cmd2: u8) -> Msg {
        self.inbound_with_flags(DIRECT_INBOUND_FLAGS, cmd1, cmd2)
    }

    /// Inbound message from the bed's device with explicit flags
    pub fn inbound_with_flags(&self, flags: u8, cmd1: u8, cmd2: u8) -> Msg {
        let build = || -> std::result::Result<Msg, FieldError> {
            let mut msg = self.services.messages.make_message("StandardMessageReceived")?;
            msg.set_address("fromAddress", Self::address())?;
            msg.set_address("toAddress", InsteonAddress::new(0xAA, 0xBB, 0xCC))?;
            msg.set_byte("messageFlags", flags)?;
            msg.set_byte("command1", cmd1)?;
            msg.set_byte("command2", cmd2)?;
            Ok(msg)
        };
        match build() {
            Ok(msg) => msg,
            Err(e) => panic!("cannot build inbound message: {}", e),
        }
    }

    /// Link-table record for `group` naming the bed's device
    pub fn link_record(&self, group: u8) -> Msg {
        let build = || -> std::result::Result<Msg, FieldError> {
            let mut msg = self.services.messages.make_message("ALLLinkRecordResponse")?;
            msg.set_byte("recordFlags", 0xE2)?;
            msg.set_byte("ALLLinkGroup", group)?;
            msg.set_address("linkAddress", Self::address())?;
            Ok(msg)
        };
        match build() {
            Ok(msg) => msg,
            Err(e) => panic!("cannot build link record: {}", e),
        }
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}
