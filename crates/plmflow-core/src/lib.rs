/*!
 * PLMFlow Core
 *
 * This crate provides the shared foundation for the PLMFlow crates:
 * addresses and state values, configuration, logging, time sources and
 * the feature event bus.
 */

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// PLMFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("PLMFlow Core {} initialized", VERSION);
    Ok(())
}
