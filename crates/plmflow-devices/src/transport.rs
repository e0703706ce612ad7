/*!
 * Seams between a device and the services around it.
 *
 * A device writes through a [`Driver`] and hands its queue to a
 * [`RequestScheduler`]; both are injected so tests can substitute fakes.
 */
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::device::{DeviceError, InsteonDevice, Result};
use crate::message::Msg;

/// Writes messages to a physical port
pub trait Driver: Send + Sync + Debug {
    /// Write one message to `port`. Fails with [`DeviceError::Io`] when the
    /// channel is unavailable.
    fn write_message(&self, port: &str, msg: &Msg) -> Result<()>;

    /// Port used for modem management traffic
    fn default_port(&self) -> Option<String>;
}

/// Cross-device scheduler that drains device request queues
pub trait RequestScheduler: Send + Sync + Debug {
    /// Record that `device` has queued work that may be sent no earlier than
    /// `ready_time`. Calling it again for a device already known is harmless.
    fn add_queue(&self, device: Arc<InsteonDevice>, ready_time: i64);
}

/// A message handed to a [`ChannelDriver`]
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Port the message is meant for
    pub port: String,
    /// The message itself
    pub msg: Msg,
}

/// Driver that forwards written messages to a channel, for a port task to
/// put on the wire
#[derive(Debug, Clone)]
pub struct ChannelDriver {
    sender: mpsc::UnboundedSender<OutboundMessage>,
    default_port: Option<String>,
}

impl ChannelDriver {
    /// Create a driver and the receiving end of its channel
    pub fn new(default_port: Option<String>) -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                default_port,
            },
            receiver,
        )
    }
}

impl Driver for ChannelDriver {
    fn write_message(&self, port: &str, msg: &Msg) -> Result<()> {
        trace!("writing to {}: {}", port, msg);
        self.sender
            .send(OutboundMessage {
                port: port.to_string(),
                msg: msg.clone(),
            })
            .map_err(|_| DeviceError::Io(format!("port {} is closed", port)))
    }

    fn default_port(&self) -> Option<String> {
        self.default_port.clone()
    }
}
