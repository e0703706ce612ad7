/*!
 * Built-in feature handlers.
 *
 * These cover the common lighting and sensor capabilities; the catalog refers
 * to them by the type names registered in
 * [`FeatureRegistry::with_defaults`](crate::feature::FeatureRegistry::with_defaults).
 */

mod contact;
mod dimmer;
mod last_time;
mod switch;

pub use contact::ContactHandler;
pub use dimmer::DimmerHandler;
pub use last_time::LastTimeHandler;
pub use switch::SwitchHandler;

use crate::message::{FieldError, Msg};

pub(crate) const CMD_ON: u8 = 0x11;
pub(crate) const CMD_FAST_ON: u8 = 0x12;
pub(crate) const CMD_OFF: u8 = 0x13;
pub(crate) const CMD_FAST_OFF: u8 = 0x14;
pub(crate) const CMD_STATUS_REQUEST: u8 = 0x19;

/// Direct message, three hops allowed and left
pub(crate) const DIRECT_FLAGS: u8 = 0x0F;

const MSG_TYPE_MASK: u8 = 0xE0;
const MSG_TYPE_ACK: u8 = 0x20;
const MSG_TYPE_GROUP_BROADCAST: u8 = 0xC0;

/// Flags, command1 and command2 of a received standard or extended message
pub(crate) fn command_bytes(msg: &Msg) -> Result<(u8, u8, u8), FieldError> {
    Ok((
        msg.get_byte("messageFlags")?,
        msg.get_byte("command1")?,
        msg.get_byte("command2")?,
    ))
}

pub(crate) fn is_ack(flags: u8) -> bool {
    flags & MSG_TYPE_MASK == MSG_TYPE_ACK
}

pub(crate) fn is_group_broadcast(flags: u8) -> bool {
    flags & MSG_TYPE_MASK == MSG_TYPE_GROUP_BROADCAST
}

/// Device level 0..=255 to percent, rounded
pub(crate) fn level_to_percent(level: u8) -> u8 {
    ((u32::from(level) * 100 + 127) / 255) as u8
}

/// Percent (clamped to 100) to device level 0..=255, rounded
pub(crate) fn percent_to_level(percent: u8) -> u8 {
    ((u32::from(percent.min(100)) * 255 + 50) / 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(level_to_percent(0), 0);
        assert_eq!(level_to_percent(255), 100);
        assert_eq!(level_to_percent(128), 50);
        assert_eq!(percent_to_level(0), 0);
        assert_eq!(percent_to_level(100), 255);
        assert_eq!(percent_to_level(150), 255);
        assert_eq!(percent_to_level(50), 128);
    }

    #[test]
    fn test_flag_types() {
        assert!(is_ack(0x2F));
        assert!(!is_ack(0x0F));
        assert!(is_group_broadcast(0xCF));
        assert!(!is_group_broadcast(0x8F));
    }
}
