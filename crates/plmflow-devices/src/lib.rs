/*!
 * PLMFlow Devices
 *
 * The device core: message templates, the descriptor catalog, features and
 * their handlers, per-device request queues, and the device registry.
 */

#![warn(missing_docs)]

// Re-export core types
pub use plmflow_core::prelude;

pub mod catalog;
pub mod device;
pub mod feature;
pub mod handlers;
pub mod message;
pub mod registry;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::{CatalogError, DeviceCatalog, DeviceDescriptor, SubCategory};
pub use device::{DeviceError, DeviceServices, InitStatus, InsteonDevice, RequestEntry};
pub use feature::{Command, DeviceFeature, FeatureHandler, FeatureRegistry, QueryStatus};
pub use message::{FieldError, Msg, MsgFactory};
pub use registry::{DeviceRegistry, RegistryEvent, SharedDeviceRegistry};
pub use transport::{ChannelDriver, Driver, OutboundMessage, RequestScheduler};

/// PLMFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), plmflow_core::error::Error> {
    tracing::info!("PLMFlow Devices {} initialized", VERSION);
    Ok(())
}
