//! Open/close sensor.

use plmflow_core::types::Value;

use super::{command_bytes, is_group_broadcast, CMD_OFF, CMD_ON};
use crate::feature::{FeatureHandler, QueryStatus};
use crate::message::{FieldError, Msg};

/// Battery sensor reporting open (`true`) or closed (`false`) by group
/// broadcast. Sensors sleep, so there is nothing to poll.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContactHandler;

impl FeatureHandler for ContactHandler {
    fn is_status(&self) -> bool {
        true
    }

    fn handle_message(
        &self,
        msg: &Msg,
        _status: QueryStatus,
        _received_at: i64,
    ) -> Result<Option<Value>, FieldError> {
        let (flags, cmd1, _) = command_bytes(msg)?;
        if !is_group_broadcast(flags) {
            return Ok(None);
        }
        Ok(match cmd1 {
            CMD_ON => Some(Value::Bool(true)),
            CMD_OFF => Some(Value::Bool(false)),
            _ => None,
        })
    }
}
