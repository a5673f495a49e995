//! Capability surface the operation queue drives, and the events a
//! transport reports back.
//!
//! Every asynchronous capability returns immediately; its outcome arrives
//! later as a [`TransportEvent`] handed to
//! [`ConnectionManager::handle_event`](crate::gatt::manager::ConnectionManager::handle_event).
//! Events carry no request correlation id.

use std::fmt;

use bluer::Address;

use crate::gatt::{
   attribute::{AttributeId, AttributeTree, DescriptorId},
   operation::{Payload, SessionContext, WriteMode},
};

/// Opaque handle of an open transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "session#{}", self.0)
   }
}

/// Outcome status reported with a transport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattStatus {
   Success,
   PermissionDenied,
   Failure(u8),
}

impl fmt::Display for GattStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Success => f.write_str("success"),
         Self::PermissionDenied => f.write_str("permission denied"),
         Self::Failure(code) => write!(f, "failure ({code:#04x})"),
      }
   }
}

impl GattStatus {
   /// Generic failure code used when the transport gives no detail.
   pub const GENERIC_FAILURE: Self = Self::Failure(0x85);

   pub const fn is_success(self) -> bool {
      matches!(self, Self::Success)
   }
}

/// Events raised asynchronously by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
   /// A session was opened to `peer`.
   Connected {
      peer: Address,
      session: SessionHandle,
   },
   /// The session to `peer` closed, or could not be opened (`session` is
   /// `None`). A non-success status marks a session-level failure.
   Disconnected {
      peer: Address,
      session: Option<SessionHandle>,
      status: GattStatus,
   },
   ServicesDiscovered {
      peer: Address,
      result: Result<AttributeTree, GattStatus>,
   },
   CharacteristicRead {
      peer: Address,
      attribute: AttributeId,
      status: GattStatus,
      value: Payload,
   },
   CharacteristicWritten {
      peer: Address,
      attribute: AttributeId,
      status: GattStatus,
   },
   /// Unsolicited value change delivered by the peer.
   CharacteristicChanged {
      peer: Address,
      attribute: AttributeId,
      value: Payload,
   },
   DescriptorRead {
      peer: Address,
      descriptor: DescriptorId,
      status: GattStatus,
      value: Payload,
   },
   DescriptorWritten {
      peer: Address,
      descriptor: DescriptorId,
      status: GattStatus,
   },
   MtuChanged {
      peer: Address,
      mtu: u16,
      status: GattStatus,
   },
}

impl TransportEvent {
   pub const fn peer(&self) -> Address {
      match self {
         Self::Connected { peer, .. }
         | Self::Disconnected { peer, .. }
         | Self::ServicesDiscovered { peer, .. }
         | Self::CharacteristicRead { peer, .. }
         | Self::CharacteristicWritten { peer, .. }
         | Self::CharacteristicChanged { peer, .. }
         | Self::DescriptorRead { peer, .. }
         | Self::DescriptorWritten { peer, .. }
         | Self::MtuChanged { peer, .. } => *peer,
      }
   }
}

/// Capabilities of the underlying transport.
///
/// Implementations must not call back into the manager from within these
/// methods; outcomes are delivered later through `handle_event`.
pub trait TransportBridge: Send + Sync {
   fn open_session(&self, peer: Address, context: &SessionContext);

   /// Releases the native session resource. Synchronous.
   fn close_session(&self, session: SessionHandle);

   fn discover_attributes(&self, session: SessionHandle);

   fn read_attribute(&self, session: SessionHandle, attribute: &AttributeId);

   fn write_attribute(
      &self,
      session: SessionHandle,
      attribute: &AttributeId,
      payload: &[u8],
      mode: WriteMode,
   );

   fn read_descriptor(&self, session: SessionHandle, descriptor: &DescriptorId);

   fn write_descriptor(&self, session: SessionHandle, descriptor: &DescriptorId, payload: &[u8]);

   /// Toggles local delivery of changes for `attribute`. Synchronous;
   /// `false` means unsupported or failed.
   fn set_local_delivery(&self, session: SessionHandle, attribute: &AttributeId, enabled: bool)
   -> bool;

   fn request_mtu(&self, session: SessionHandle, size: u16);
}

#[cfg(test)]
pub(crate) mod recording {
   //! In-memory transport that records every call for inspection.

   use parking_lot::Mutex;

   use super::*;

   #[derive(Debug, Clone, PartialEq, Eq)]
   pub enum Call {
      Open(Address),
      Close(SessionHandle),
      Discover(SessionHandle),
      Read(SessionHandle, AttributeId),
      Write(SessionHandle, AttributeId, Payload, WriteMode),
      ReadDescriptor(SessionHandle, DescriptorId),
      WriteDescriptor(SessionHandle, DescriptorId, Payload),
      SetDelivery(SessionHandle, AttributeId, bool),
      Mtu(SessionHandle, u16),
   }

   pub struct RecordingTransport {
      calls: Mutex<Vec<Call>>,
      local_delivery_ok: Mutex<bool>,
   }

   impl RecordingTransport {
      pub fn new() -> Self {
         Self {
            calls: Mutex::new(Vec::new()),
            local_delivery_ok: Mutex::new(true),
         }
      }

      pub fn calls(&self) -> Vec<Call> {
         self.calls.lock().clone()
      }

      pub fn take_calls(&self) -> Vec<Call> {
         std::mem::take(&mut *self.calls.lock())
      }

      pub fn fail_local_delivery(&self, fail: bool) {
         *self.local_delivery_ok.lock() = !fail;
      }

      fn record(&self, call: Call) {
         self.calls.lock().push(call);
      }
   }

   impl TransportBridge for RecordingTransport {
      fn open_session(&self, peer: Address, _context: &SessionContext) {
         self.record(Call::Open(peer));
      }

      fn close_session(&self, session: SessionHandle) {
         self.record(Call::Close(session));
      }

      fn discover_attributes(&self, session: SessionHandle) {
         self.record(Call::Discover(session));
      }

      fn read_attribute(&self, session: SessionHandle, attribute: &AttributeId) {
         self.record(Call::Read(session, *attribute));
      }

      fn write_attribute(
         &self,
         session: SessionHandle,
         attribute: &AttributeId,
         payload: &[u8],
         mode: WriteMode,
      ) {
         self.record(Call::Write(
            session,
            *attribute,
            Payload::from_slice(payload),
            mode,
         ));
      }

      fn read_descriptor(&self, session: SessionHandle, descriptor: &DescriptorId) {
         self.record(Call::ReadDescriptor(session, *descriptor));
      }

      fn write_descriptor(&self, session: SessionHandle, descriptor: &DescriptorId, payload: &[u8]) {
         self.record(Call::WriteDescriptor(
            session,
            *descriptor,
            Payload::from_slice(payload),
         ));
      }

      fn set_local_delivery(
         &self,
         session: SessionHandle,
         attribute: &AttributeId,
         enabled: bool,
      ) -> bool {
         self.record(Call::SetDelivery(session, *attribute, enabled));
         *self.local_delivery_ok.lock()
      }

      fn request_mtu(&self, session: SessionHandle, size: u16) {
         self.record(Call::Mtu(session, size));
      }
   }
}
