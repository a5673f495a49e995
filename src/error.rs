//! Error types for the GATT operation manager.
//!
//! Precondition failures are reported synchronously through [`GattError`]
//! and never enter the operation queue. Transport-reported outcome failures
//! are not errors at this level: they resolve the in-flight operation and
//! are only visible in the log.

use bluer::Address;
use thiserror::Error;
use uuid::Uuid;

use crate::gatt::{
   attribute::{AttributeId, DescriptorId, Properties},
   operation::WriteMode,
};

/// Main error type for the service.
#[derive(Error, Debug)]
pub enum GattError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Peer not connected: {0}")]
   NotConnected(Address),

   #[error("Peer already connected: {0}")]
   AlreadyConnected(Address),

   #[error("Unknown attribute {0} on {1}")]
   UnknownAttribute(AttributeId, Address),

   #[error("Unknown descriptor {0} on {1}")]
   UnknownDescriptor(DescriptorId, Address),

   #[error("Attribute {uuid} does not support {what} (properties: {props})")]
   Unsupported {
      uuid: Uuid,
      what: &'static str,
      props: Properties,
   },

   #[error("Descriptor {0} does not support {1}")]
   DescriptorUnsupported(DescriptorId, &'static str),

   #[error("Attribute {0} does not support {1} writes")]
   WriteModeUnsupported(Uuid, WriteMode),

   #[error("Invalid address: {0}")]
   InvalidAddress(String),

   #[error("Invalid UUID: {0}")]
   InvalidUuid(#[from] uuid::Error),

   #[error("Invalid payload: {0}")]
   InvalidPayload(#[from] hex::FromHexError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `GattError`.
pub type Result<T> = std::result::Result<T, GattError>;
