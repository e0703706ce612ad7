//! Dimmable load.

use plmflow_core::types::Value;

use super::{
    command_bytes, is_ack, is_group_broadcast, level_to_percent, percent_to_level, CMD_FAST_OFF,
    CMD_FAST_ON, CMD_OFF, CMD_ON, CMD_STATUS_REQUEST, DIRECT_FLAGS,
};
use crate::device::{InsteonDevice, Result};
use crate::feature::{Command, FeatureHandler, QueryStatus};
use crate::message::{FieldError, Msg};

/// Load with a brightness level, reported in percent
#[derive(Debug, Default, Clone, Copy)]
pub struct DimmerHandler;

impl FeatureHandler for DimmerHandler {
    fn handle_message(
        &self,
        msg: &Msg,
        status: QueryStatus,
        _received_at: i64,
    ) -> std::result::Result<Option<Value>, FieldError> {
        let (flags, cmd1, cmd2) = command_bytes(msg)?;

        if status == QueryStatus::QueryPending && is_ack(flags) {
            return Ok(Some(Value::Percent(level_to_percent(cmd2))));
        }
        Ok(match cmd1 {
            // Group broadcasts from a paddle press carry no level.
            CMD_ON | CMD_FAST_ON if is_group_broadcast(flags) => Some(Value::Percent(100)),
            CMD_ON | CMD_FAST_ON => Some(Value::Percent(level_to_percent(cmd2))),
            CMD_OFF | CMD_FAST_OFF => Some(Value::Percent(0)),
            _ => None,
        })
    }

    fn command_message(&self, device: &InsteonDevice, command: &Command) -> Result<Option<Msg>> {
        let (cmd1, cmd2) = match command {
            Command::On => (CMD_ON, 0xFF),
            Command::Off | Command::Percent(0) => (CMD_OFF, 0x00),
            Command::Percent(p) => (CMD_ON, percent_to_level(*p)),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBed;

    #[test]
    fn test_levels_from_messages() {
        let bed = TestBed::new();

        let ack = bed.inbound_with_flags(0x2F, CMD_ON, 0x80);
        assert_eq!(
            DimmerHandler.handle_message(&ack, QueryStatus::NotPending, 0).unwrap(),
            Some(Value::Percent(50))
        );

        let paddle = bed.inbound_with_flags(0xCF, CMD_ON, 0x00);
        assert_eq!(
            DimmerHandler.handle_message(&paddle, QueryStatus::NotPending, 0).unwrap(),
            Some(Value::Percent(100))
        );

        let reply = bed.inbound_with_flags(0x2F, 0x00, 0x40);
        assert_eq!(
            DimmerHandler.handle_message(&reply, QueryStatus::QueryPending, 0).unwrap(),
            Some(Value::Percent(25))
        );
    }

    #[test]
    fn test_percent_command() {
        let bed = TestBed::new();
        let device = bed.device();

        let msg = DimmerHandler
            .command_message(&device, &Command::Percent(50))
            .unwrap()
            .unwrap();
        assert_eq!(msg.get_byte("command1").unwrap(), CMD_ON);
        assert_eq!(msg.get_byte("command2").unwrap(), 128);

        assert!(DimmerHandler.command_message(&device, &Command::Refresh).unwrap().is_none());
    }
}
