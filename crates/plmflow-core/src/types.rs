/*!
 * Core data types for PLMFlow.
 *
 * This module defines the identifiers and state values shared by the
 * device and engine crates.
 */
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Physical address of a node on the network, displayed as `AA.BB.CC`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct InsteonAddress([u8; 3]);

impl InsteonAddress {
    /// Create an address from its three bytes, high byte first
    pub const fn new(high: u8, middle: u8, low: u8) -> Self {
        Self([high, middle, low])
    }

    /// Create an address from a byte array
    pub const fn from_bytes(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    /// The raw address bytes
    pub const fn bytes(&self) -> [u8; 3] {
        self.0
    }

    /// `00.00.00` never names a real device and cannot be sent to
    pub fn is_valid(&self) -> bool {
        self.0 != [0, 0, 0]
    }
}

impl fmt::Display for InsteonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}.{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for InsteonAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(Error::parse(format!("invalid address: {}", s)));
        }

        let mut bytes = [0u8; 3];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            *byte = u8::from_str_radix(part, 16)
                .map_err(|e| Error::parse(format!("invalid address {}: {}", s, e)))?;
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; 3]> for InsteonAddress {
    fn from(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }
}

/// A unique identifier, used for item bindings listening on a feature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

/// State reported by a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// No state known yet
    #[default]
    Null,
    /// On/off, open/closed
    Bool(bool),
    /// Level in percent, 0..=100
    Percent(u8),
    /// Plain integer reading
    Integer(i64),
    /// Free text
    String(String),
    /// Point in time
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Percent(p) => Some(*p > 0),
            _ => None,
        }
    }

    /// Try to get a percent level
    pub fn as_percent(&self) -> Option<u8> {
        match self {
            Value::Percent(p) => Some(*p),
            Value::Bool(true) => Some(100),
            Value::Bool(false) => Some(0),
            _ => None,
        }
    }

    /// Try to get a timestamp value
    pub fn as_timestamp(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(t),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}
