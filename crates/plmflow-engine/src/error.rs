/*!
 * Error types for the PLMFlow engine crate.
 */
use thiserror::Error;

/// Error type for PLMFlow engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Poller error
    #[error("Poller error: {0}")]
    Poller(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] plmflow_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] plmflow_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for PLMFlow engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new scheduler error
    pub fn scheduler<S: AsRef<str>>(msg: S) -> Self {
        Error::Scheduler(msg.as_ref().to_string())
    }

    /// Create a new poller error
    pub fn poller<S: AsRef<str>>(msg: S) -> Self {
        Error::Poller(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
