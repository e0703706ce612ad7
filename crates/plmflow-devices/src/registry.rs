/*!
 * Device registry.
 *
 * Holds every known device by address, creates devices on first sight, and
 * routes inbound messages to the device that sent them.
 */
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use plmflow_core::event::EventSink;
use plmflow_core::types::InsteonAddress;

use crate::device::{DeviceError, DeviceServices, InsteonDevice, Result};
use crate::message::Msg;

/// Event types for the device registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device was added to the registry
    DeviceAdded(InsteonAddress),
    /// A device was removed from the registry
    DeviceRemoved(InsteonAddress),
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    services: DeviceServices,
    default_port: Option<String>,
    default_poll_interval: i64,
    devices: RwLock<HashMap<InsteonAddress, Arc<InsteonDevice>>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a registry whose devices share `services`
    pub fn new(services: DeviceServices) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            services,
            default_port: None,
            default_poll_interval: -1,
            devices: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Port given to devices created by the registry
    pub fn with_default_port<S: Into<String>>(mut self, port: S) -> Self {
        self.default_port = Some(port.into());
        self
    }

    /// Poll interval given to devices created by the registry; `<= 0` leaves
    /// them unpolled
    pub fn with_default_poll_interval(mut self, interval: i64) -> Self {
        self.default_poll_interval = interval;
        self
    }

    /// Services shared by the registry's devices
    pub fn services(&self) -> &DeviceServices {
        &self.services
    }

    /// Return the device at `address`, creating it if it is not known yet
    pub fn get_or_create(&self, address: InsteonAddress) -> Arc<InsteonDevice> {
        if let Some(device) = self.get(&address) {
            return device;
        }

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have won the race between the two locks.
        if let Some(device) = devices.get(&address) {
            return Arc::clone(device);
        }

        let device = InsteonDevice::new(address, self.services.clone());
        if let Some(port) = &self.default_port {
            device.add_port(port.clone());
        }
        device.set_poll_interval(self.default_poll_interval);
        devices.insert(address, Arc::clone(&device));
        drop(devices);

        let _ = self.event_sender.send(RegistryEvent::DeviceAdded(address));
        debug!("registered device {}", address);
        device
    }

    /// Get a device by address
    pub fn get(&self, address: &InsteonAddress) -> Option<Arc<InsteonDevice>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    /// Get a device by address, failing if it is unknown
    pub fn get_device(&self, address: &InsteonAddress) -> Result<Arc<InsteonDevice>> {
        self.get(address).ok_or(DeviceError::NotFound(*address))
    }

    /// Remove a device
    pub fn remove(&self, address: &InsteonAddress) -> Result<Arc<InsteonDevice>> {
        let removed = self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
            .ok_or(DeviceError::NotFound(*address))?;

        let _ = self.event_sender.send(RegistryEvent::DeviceRemoved(*address));
        debug!("unregistered device {}", address);
        Ok(removed)
    }

    /// All registered devices
    pub fn devices(&self) -> Vec<Arc<InsteonDevice>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Devices that take part in periodic polling
    pub fn polled_devices(&self) -> Vec<Arc<InsteonDevice>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|device| device.has_valid_polling_interval())
            .cloned()
            .collect()
    }

    /// Deliver an inbound message to the device named in its `fromAddress`.
    /// Returns false when no such device is registered.
    pub fn route_message(&self, port: &str, msg: &Msg, sink: &dyn EventSink) -> Result<bool> {
        let from = msg.get_address("fromAddress")?;
        match self.get(&from) {
            Some(device) => {
                device.handle_message(port, msg, sink);
                Ok(true)
            }
            None => {
                trace!("message from unknown device {} on {}", from, port);
                Ok(false)
            }
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Count registered devices
    pub fn count_devices(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if a device is registered
    pub fn has_device(&self, address: &InsteonAddress) -> bool {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }
}

/// A shared device registry that can be cloned
pub type SharedDeviceRegistry = Arc<DeviceRegistry>;
