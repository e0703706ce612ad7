/*!
 * Prelude module for PLMFlow Core.
 *
 * This module re-exports commonly used types and functions from the PLMFlow Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, InsteonAddress, Value};

// Re-export time sources
pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};

// Re-export event types
pub use crate::event::{EventBus, EventSink, FeatureEvent, SharedEventBus};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
