/*!
 * Message templates and messages.
 *
 * A [`MsgFactory`] holds the named templates the modem understands and stamps
 * out [`Msg`] instances from them. Fields are addressed by name; the byte
 * layout lives in the template definitions (`msg_definitions.toml`).
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use serde::Deserialize;
use thiserror::Error;

use plmflow_core::types::InsteonAddress;

/// Template definitions shipped with the crate
const DEFAULT_DEFINITIONS: &str = include_str!("msg_definitions.toml");

/// Error raised while building or reading a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    /// No template with this name is known
    #[error("unknown message template: {0}")]
    UnknownTemplate(String),

    /// The message has no such field
    #[error("message {message} has no field {field}")]
    UnknownField {
        /// Template name
        message: String,
        /// Requested field
        field: String,
    },

    /// The field exists but holds a different kind of value
    #[error("field {field} of message {message} is not of type {expected}")]
    WrongType {
        /// Template name
        message: String,
        /// Requested field
        field: String,
        /// The type the caller asked for
        expected: FieldType,
    },

    /// The destination address cannot be sent to
    #[error("invalid destination address {0}")]
    InvalidAddress(InsteonAddress),

    /// Raw bytes do not match any template
    #[error("cannot decode message: {0}")]
    Decode(String),

    /// A template definition is inconsistent
    #[error("bad message definition: {0}")]
    Definition(String),
}

/// Kind of value a field holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// A single byte
    Byte,
    /// Three address bytes
    Address,
}

impl FieldType {
    /// Number of bytes the field occupies
    pub fn size(&self) -> usize {
        match self {
            FieldType::Byte => 1,
            FieldType::Address => 3,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Byte => write!(f, "byte"),
            FieldType::Address => write!(f, "address"),
        }
    }
}

/// A named field inside a template
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDefinition {
    /// Field name
    pub name: String,
    /// Field type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Byte offset from the start of the message
    pub offset: usize,
}

/// A message template
#[derive(Debug, Clone, Deserialize)]
pub struct MsgDefinition {
    /// Template name
    pub name: String,
    /// Leading bytes identifying the message
    pub header: Vec<u8>,
    /// Total message length including the header
    pub length: usize,
    /// Default quiet time in milliseconds
    #[serde(default)]
    pub quiet_time: i64,
    /// Named fields
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl MsgDefinition {
    fn field(&self, name: &str) -> Result<&FieldDefinition, FieldError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| FieldError::UnknownField {
                message: self.name.clone(),
                field: name.to_string(),
            })
    }

    fn typed_field(&self, name: &str, expected: FieldType) -> Result<&FieldDefinition, FieldError> {
        let field = self.field(name)?;
        if field.field_type != expected {
            return Err(FieldError::WrongType {
                message: self.name.clone(),
                field: name.to_string(),
                expected,
            });
        }
        Ok(field)
    }

    fn validate(&self) -> Result<(), FieldError> {
        if self.header.len() > self.length {
            return Err(FieldError::Definition(format!(
                "{}: header longer than message",
                self.name
            )));
        }
        for field in &self.fields {
            if field.offset < self.header.len() || field.offset + field.field_type.size() > self.length {
                return Err(FieldError::Definition(format!(
                    "{}: field {} at offset {} does not fit",
                    self.name, field.name, field.offset
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    #[serde(default, rename = "message")]
    messages: Vec<MsgDefinition>,
}

/// A message built from a template
#[derive(Debug, Clone)]
pub struct Msg {
    definition: Arc<MsgDefinition>,
    data: BytesMut,
    quiet_time: i64,
}

impl Msg {
    fn new(definition: Arc<MsgDefinition>) -> Self {
        let mut data = BytesMut::zeroed(definition.length);
        data[..definition.header.len()].copy_from_slice(&definition.header);
        let quiet_time = definition.quiet_time;
        Self {
            definition,
            data,
            quiet_time,
        }
    }

    /// Template name
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Raw message bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Pause the channel needs after this message, in milliseconds
    pub fn quiet_time(&self) -> i64 {
        self.quiet_time
    }

    /// Override the quiet time
    pub fn set_quiet_time(&mut self, quiet_time: i64) {
        self.quiet_time = quiet_time;
    }

    /// Whether the template has a field with this name
    pub fn has_field(&self, name: &str) -> bool {
        self.definition.field(name).is_ok()
    }

    /// Read a byte field
    pub fn get_byte(&self, name: &str) -> Result<u8, FieldError> {
        let field = self.definition.typed_field(name, FieldType::Byte)?;
        Ok(self.data[field.offset])
    }

    /// Write a byte field
    pub fn set_byte(&mut self, name: &str, value: u8) -> Result<(), FieldError> {
        let offset = self.definition.typed_field(name, FieldType::Byte)?.offset;
        self.data[offset] = value;
        Ok(())
    }

    /// Read an address field
    pub fn get_address(&self, name: &str) -> Result<InsteonAddress, FieldError> {
        let offset = self.definition.typed_field(name, FieldType::Address)?.offset;
        Ok(InsteonAddress::new(
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ))
    }

    /// Write an address field
    pub fn set_address(&mut self, name: &str, address: InsteonAddress) -> Result<(), FieldError> {
        let offset = self.definition.typed_field(name, FieldType::Address)?.offset;
        self.data[offset..offset + 3].copy_from_slice(&address.bytes());
        Ok(())
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        self.definition.name == other.definition.name && self.data == other.data
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.definition.name)?;
        for byte in self.data.iter() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Registry of message templates
#[derive(Debug, Default, Clone)]
pub struct MsgFactory {
    definitions: HashMap<String, Arc<MsgDefinition>>,
}

impl MsgFactory {
    /// Factory with the templates shipped in `msg_definitions.toml`
    pub fn with_defaults() -> Result<Self, FieldError> {
        Self::from_toml_str(DEFAULT_DEFINITIONS)
    }

    /// Load templates from a TOML document with `[[message]]` tables
    pub fn from_toml_str(s: &str) -> Result<Self, FieldError> {
        let file: DefinitionFile =
            toml::from_str(s).map_err(|e| FieldError::Definition(e.to_string()))?;

        let mut factory = Self::default();
        for definition in file.messages {
            factory.add_definition(definition)?;
        }
        Ok(factory)
    }

    /// Register one template, replacing any template of the same name
    pub fn add_definition(&mut self, definition: MsgDefinition) -> Result<(), FieldError> {
        definition.validate()?;
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Names of all known templates
    pub fn template_names(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    /// Create a zeroed message from a named template
    pub fn make_message(&self, name: &str) -> Result<Msg, FieldError> {
        self.definitions
            .get(name)
            .cloned()
            .map(Msg::new)
            .ok_or_else(|| FieldError::UnknownTemplate(name.to_string()))
    }

    /// Wrap raw bytes received from the modem in the template they match
    pub fn decode(&self, bytes: &[u8]) -> Result<Msg, FieldError> {
        let definition = self
            .definitions
            .values()
            .find(|d| d.length == bytes.len() && bytes.starts_with(&d.header))
            .ok_or_else(|| {
                FieldError::Decode(format!("no template matches {} bytes", bytes.len()))
            })?;

        let mut msg = Msg::new(Arc::clone(definition));
        msg.data.copy_from_slice(bytes);
        Ok(msg)
    }
}
