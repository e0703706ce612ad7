//! Records when a device was last heard from.

use chrono::{TimeZone, Utc};

use plmflow_core::types::Value;

use crate::feature::{FeatureHandler, QueryStatus};
use crate::message::{FieldError, Msg};

/// Status feature stamping every inbound message with the time it arrived
#[derive(Debug, Default, Clone, Copy)]
pub struct LastTimeHandler;

impl FeatureHandler for LastTimeHandler {
    fn is_status(&self) -> bool {
        true
    }

    fn handle_message(
        &self,
        _msg: &Msg,
        _status: QueryStatus,
        received_at: i64,
    ) -> Result<Option<Value>, FieldError> {
        Ok(Utc.timestamp_millis_opt(received_at).single().map(Value::Timestamp))
    }
}
