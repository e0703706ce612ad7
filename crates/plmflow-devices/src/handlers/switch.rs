//! On/off relay.

use plmflow_core::types::Value;

use super::{
    command_bytes, is_ack, CMD_FAST_OFF, CMD_FAST_ON, CMD_OFF, CMD_ON, CMD_STATUS_REQUEST,
    DIRECT_FLAGS,
};
use crate::device::{InsteonDevice, Result};
use crate::feature::{Command, FeatureHandler, QueryStatus};
use crate::message::{FieldError, Msg};

/// Relay that is either on or off
#[derive(Debug, Default, Clone, Copy)]
pub struct SwitchHandler;

impl FeatureHandler for SwitchHandler {
    fn handle_message(
        &self,
        msg: &Msg,
        status: QueryStatus,
        _received_at: i64,
    ) -> std::result::Result<Option<Value>, FieldError> {
        let (flags, cmd1, cmd2) = command_bytes(msg)?;

        // A status reply carries the level in cmd2 and garbage in cmd1.
        if status == QueryStatus::QueryPending && is_ack(flags) {
            return Ok(Some(Value::Bool(cmd2 != 0)));
        }
        Ok(match cmd1 {
            CMD_ON | CMD_FAST_ON => Some(Value::Bool(true)),
            CMD_OFF | CMD_FAST_OFF => Some(Value::Bool(false)),
            _ => None,
        })
    }

    fn command_message(&self, device: &InsteonDevice, command: &Command) -> Result<Option<Msg>> {
        let (cmd1, cmd2) = match command {
            Command::On => (CMD_ON, 0xFF),
            Command::Off => (CMD_OFF, 0x00),
            Command::Percent(0) => (CMD_OFF, 0x00),
            Command::Percent(_) => (CMD_ON, 0xFF),
            Command::Refresh => return Ok(None),
        };
        device.make_standard_message(DIRECT_FLAGS, cmd1, cmd2).map(Some)
    }

    fn poll_message(&self, device: &InsteonDevice) -> Result<Option<Msg>> {
        device
            .make_standard_message(DIRECT_FLAGS, CMD_STATUS_REQUEST, 0x00)
            .map(Some)
    }
}
