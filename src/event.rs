//! Events emitted to listeners when an operation or an unsolicited change
//! resolves successfully.
//!
//! Failures never produce an event; a listener that sees no success event
//! for a request should treat that as the error signal.

use std::sync::Arc;

use bluer::Address;

use crate::gatt::{
   attribute::{AttributeId, AttributeTree, DescriptorId},
   operation::Payload,
};

/// Events that can be emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, strum::EnumDiscriminants)]
#[strum_discriminants(name(GattEventKind), derive(strum::Display))]
pub enum GattEvent {
   ConnectionReady {
      peer: Address,
      attributes: Arc<AttributeTree>,
   },
   Disconnected {
      peer: Address,
   },
   AttributeRead {
      peer: Address,
      attribute: AttributeId,
      value: Payload,
   },
   AttributeWritten {
      peer: Address,
      attribute: AttributeId,
   },
   AttributeChanged {
      peer: Address,
      attribute: AttributeId,
      value: Payload,
   },
   DescriptorRead {
      peer: Address,
      descriptor: DescriptorId,
      value: Payload,
   },
   DescriptorWritten {
      peer: Address,
      descriptor: DescriptorId,
   },
   NotificationsEnabled {
      peer: Address,
      attribute: AttributeId,
   },
   NotificationsDisabled {
      peer: Address,
      attribute: AttributeId,
   },
   MtuChanged {
      peer: Address,
      mtu: u16,
   },
}

impl GattEvent {
   pub fn kind(&self) -> GattEventKind {
      self.into()
   }

   pub const fn peer(&self) -> Address {
      match self {
         Self::ConnectionReady { peer, .. }
         | Self::Disconnected { peer }
         | Self::AttributeRead { peer, .. }
         | Self::AttributeWritten { peer, .. }
         | Self::AttributeChanged { peer, .. }
         | Self::DescriptorRead { peer, .. }
         | Self::DescriptorWritten { peer, .. }
         | Self::NotificationsEnabled { peer, .. }
         | Self::NotificationsDisabled { peer, .. }
         | Self::MtuChanged { peer, .. } => *peer,
      }
   }

   /// Invokes the hook of `listener` matching this event.
   pub fn deliver(&self, listener: &dyn GattListener) {
      match self {
         Self::ConnectionReady { peer, attributes } => {
            listener.on_connection_ready(*peer, attributes);
         },
         Self::Disconnected { peer } => listener.on_disconnected(*peer),
         Self::AttributeRead {
            peer,
            attribute,
            value,
         } => listener.on_attribute_read(*peer, attribute, value),
         Self::AttributeWritten { peer, attribute } => {
            listener.on_attribute_written(*peer, attribute);
         },
         Self::AttributeChanged {
            peer,
            attribute,
            value,
         } => listener.on_attribute_changed(*peer, attribute, value),
         Self::DescriptorRead {
            peer,
            descriptor,
            value,
         } => listener.on_descriptor_read(*peer, descriptor, value),
         Self::DescriptorWritten { peer, descriptor } => {
            listener.on_descriptor_written(*peer, descriptor);
         },
         Self::NotificationsEnabled { peer, attribute } => {
            listener.on_notifications_enabled(*peer, attribute);
         },
         Self::NotificationsDisabled { peer, attribute } => {
            listener.on_notifications_disabled(*peer, attribute);
         },
         Self::MtuChanged { peer, mtu } => listener.on_mtu_changed(*peer, *mtu),
      }
   }
}

/// Observer of connection manager events.
///
/// Every hook has an empty default, so implementors only override the ones
/// they care about. Hooks run on the transport's event thread and must not
/// block.
pub trait GattListener: Send + Sync {
   fn on_connection_ready(&self, _peer: Address, _attributes: &Arc<AttributeTree>) {}

   fn on_disconnected(&self, _peer: Address) {}

   fn on_attribute_read(&self, _peer: Address, _attribute: &AttributeId, _value: &[u8]) {}

   fn on_attribute_written(&self, _peer: Address, _attribute: &AttributeId) {}

   fn on_attribute_changed(&self, _peer: Address, _attribute: &AttributeId, _value: &[u8]) {}

   fn on_descriptor_read(&self, _peer: Address, _descriptor: &DescriptorId, _value: &[u8]) {}

   fn on_descriptor_written(&self, _peer: Address, _descriptor: &DescriptorId) {}

   fn on_notifications_enabled(&self, _peer: Address, _attribute: &AttributeId) {}

   fn on_notifications_disabled(&self, _peer: Address, _attribute: &AttributeId) {}

   fn on_mtu_changed(&self, _peer: Address, _mtu: u16) {}
}
