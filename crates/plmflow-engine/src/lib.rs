/*!
 * PLMFlow Engine
 *
 * Runtime services around the device core: the request queue manager that
 * serializes outbound traffic across devices, and the periodic poller.
 */

#![warn(missing_docs)]

// Re-export core types
pub use plmflow_core::prelude;

pub mod error;
pub mod poller;
pub mod scheduler;

pub use error::{Error, Result};
pub use poller::{Poller, PollerEvent};
pub use scheduler::{RequestQueueManager, SchedulerEvent};

/// PLMFlow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("PLMFlow Engine {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
