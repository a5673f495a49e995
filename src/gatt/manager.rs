//! Connection manager: validates requests, serializes them through the
//! operation queue and dispatches the in-flight operation to the transport.
//!
//! Outcomes are never returned to the caller. They arrive through
//! [`ConnectionManager::handle_event`] and are fanned out to the registered
//! listeners.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};

use crate::{
   bluetooth::transport::{SessionHandle, TransportBridge},
   config::Config,
   error::{GattError, Result},
   event::{GattEvent, GattListener},
   gatt::{
      attribute::{
         AttributeId, AttributeTree, DISABLE_NOTIFICATION_VALUE, DescriptorId,
         DescriptorProperties, Located, Properties,
      },
      connection::{ConnectionTable, Session},
      listener::ListenerRegistry,
      operation::{MAX_MTU, Operation, Payload, SessionContext, WriteMode, clamp_mtu},
      queue::{InFlight, OperationId, OperationQueue},
   },
};

/// Tunables of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
   /// MTU requested automatically once a peer's attributes are discovered.
   pub preferred_mtu: u16,
}

impl Default for ManagerOptions {
   fn default() -> Self {
      Self {
         preferred_mtu: MAX_MTU,
      }
   }
}

impl From<&Config> for ManagerOptions {
   fn from(config: &Config) -> Self {
      Self {
         preferred_mtu: config.preferred_mtu(),
      }
   }
}

/// Outcome of handing an operation to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatched {
   /// The transport will report back asynchronously.
   Pending,
   /// Resolved or abandoned on the spot; the slot must be released.
   Done,
}

/// Owns the queue, the connection table and the listener registry for one
/// transport.
pub struct ConnectionManager {
   pub(crate) transport: Arc<dyn TransportBridge>,
   pub(crate) connections: ConnectionTable,
   pub(crate) queue: OperationQueue,
   pub(crate) listeners: ListenerRegistry,
   pub(crate) options: ManagerOptions,
}

impl ConnectionManager {
   pub fn new(transport: Arc<dyn TransportBridge>, options: ManagerOptions) -> Self {
      Self {
         transport,
         connections: ConnectionTable::new(),
         queue: OperationQueue::new(),
         listeners: ListenerRegistry::new(),
         options,
      }
   }

   pub fn register_listener<L: GattListener + 'static>(&self, listener: &Arc<L>) -> bool {
      self.listeners.register(listener)
   }

   pub fn unregister_listener<L: GattListener + 'static>(&self, listener: &Arc<L>) -> bool {
      self.listeners.unregister(listener)
   }

   pub fn is_connected(&self, peer: Address) -> bool {
      self.connections.contains(peer)
   }

   pub fn connected_peers(&self) -> Vec<Address> {
      self.connections.peers()
   }

   pub fn session(&self, peer: Address) -> Option<Session> {
      self.connections.get(peer)
   }

   pub fn attributes(&self, peer: Address) -> Option<Arc<AttributeTree>> {
      self.connections.attributes(peer)
   }

   pub fn in_flight(&self) -> Option<InFlight> {
      self.queue.in_flight()
   }

   pub fn pending_operations(&self) -> Vec<Operation> {
      self.queue.pending()
   }

   pub fn is_idle(&self) -> bool {
      self.queue.is_idle()
   }

   // === Request surface ===

   pub fn connect(&self, peer: Address, context: SessionContext) -> Result<OperationId> {
      if self.connections.contains(peer) {
         return Err(GattError::AlreadyConnected(peer));
      }
      self.submit(Operation::Connect { peer, context })
   }

   pub fn disconnect(&self, peer: Address) -> Result<OperationId> {
      self.submit(Operation::Disconnect { peer })
   }

   pub fn read_attribute(&self, peer: Address, attribute: AttributeId) -> Result<OperationId> {
      let (id, props) = self.locate(peer, &attribute)?;
      if !props.is_readable() {
         return Err(GattError::Unsupported {
            uuid: id.uuid,
            what: "reads",
            props,
         });
      }
      self.submit(Operation::CharacteristicRead { peer, attribute })
   }

   /// Writes `payload`, acknowledged if the attribute allows it.
   pub fn write_attribute(
      &self,
      peer: Address,
      attribute: AttributeId,
      payload: &[u8],
   ) -> Result<OperationId> {
      let (id, props) = self.locate(peer, &attribute)?;
      let mode = props
         .preferred_write_mode()
         .ok_or(GattError::Unsupported {
            uuid: id.uuid,
            what: "writes",
            props,
         })?;
      self.write_attribute_with(peer, attribute, payload, mode)
   }

   pub fn write_attribute_with(
      &self,
      peer: Address,
      attribute: AttributeId,
      payload: &[u8],
      mode: WriteMode,
   ) -> Result<OperationId> {
      let (id, props) = self.locate(peer, &attribute)?;
      if !props.supports(mode) {
         return Err(GattError::WriteModeUnsupported(id.uuid, mode));
      }
      self.submit(Operation::CharacteristicWrite {
         peer,
         attribute,
         mode,
         payload: Payload::from_slice(payload),
      })
   }

   pub fn read_descriptor(&self, peer: Address, descriptor: DescriptorId) -> Result<OperationId> {
      let props = self.locate_descriptor(peer, &descriptor)?;
      if !props.is_readable() {
         return Err(GattError::DescriptorUnsupported(descriptor, "reads"));
      }
      self.submit(Operation::DescriptorRead { peer, descriptor })
   }

   pub fn write_descriptor(
      &self,
      peer: Address,
      descriptor: DescriptorId,
      payload: &[u8],
   ) -> Result<OperationId> {
      let props = self.locate_descriptor(peer, &descriptor)?;
      if !props.is_writable() && !descriptor.is_cccd() {
         return Err(GattError::DescriptorUnsupported(descriptor, "writes"));
      }
      self.submit(Operation::DescriptorWrite {
         peer,
         descriptor,
         payload: Payload::from_slice(payload),
      })
   }

   pub fn enable_notifications(&self, peer: Address, attribute: AttributeId) -> Result<OperationId> {
      self.check_delivery(peer, &attribute)?;
      self.submit(Operation::EnableNotifications { peer, attribute })
   }

   pub fn disable_notifications(
      &self,
      peer: Address,
      attribute: AttributeId,
   ) -> Result<OperationId> {
      self.check_delivery(peer, &attribute)?;
      self.submit(Operation::DisableNotifications { peer, attribute })
   }

   /// Requests an MTU; the size is clamped into the valid range at dispatch.
   pub fn request_mtu(&self, peer: Address, size: u16) -> Result<OperationId> {
      self.submit(Operation::MtuRequest { peer, size })
   }

   /// Queues `operation` without capability validation.
   ///
   /// Anything but a connect is rejected when the peer has no session.
   pub fn submit(&self, operation: Operation) -> Result<OperationId> {
      let peer = operation.peer();
      if operation.requires_session() && !self.connections.contains(peer) {
         return Err(GattError::NotConnected(peer));
      }
      let (id, promoted) = self.queue.submit(operation);
      self.run(promoted);
      Ok(id)
   }

   /// Closes every session right away, bypassing the queue.
   ///
   /// Used at shutdown, when an operation ahead of a queued disconnect may
   /// never complete. Returns the number of sessions closed.
   pub fn close_all(&self) -> usize {
      self
         .connections
         .peers()
         .into_iter()
         .filter(|&peer| self.teardown(peer))
         .count()
   }

   /// Force-resolves an in-flight operation older than `max_age`.
   pub fn expire_stalled(&self, max_age: Duration) -> Option<OperationId> {
      let stalled = self.queue.stalled(max_age)?;
      warn!(
         "{}: {} timed out after {:?}",
         stalled.id,
         stalled.operation,
         stalled.since.elapsed()
      );
      self.complete(stalled.id);
      Some(stalled.id)
   }

   // === Validation ===

   fn discovered(&self, peer: Address) -> Result<Option<Arc<AttributeTree>>> {
      let session = self
         .connections
         .get(peer)
         .ok_or(GattError::NotConnected(peer))?;
      Ok(session.attributes)
   }

   fn locate(
      &self,
      peer: Address,
      attribute: &AttributeId,
   ) -> Result<(AttributeId, Properties)> {
      let tree = self.discovered(peer)?;
      tree
         .as_deref()
         .and_then(|t| t.find(attribute))
         .map(|l| (l.id, l.attribute.props))
         .ok_or(GattError::UnknownAttribute(*attribute, peer))
   }

   fn locate_descriptor(
      &self,
      peer: Address,
      descriptor: &DescriptorId,
   ) -> Result<DescriptorProperties> {
      let tree = self.discovered(peer)?;
      tree
         .as_deref()
         .and_then(|t| t.find_descriptor(descriptor))
         .map(|(_, d)| d.props)
         .ok_or(GattError::UnknownDescriptor(*descriptor, peer))
   }

   fn check_delivery(&self, peer: Address, attribute: &AttributeId) -> Result<()> {
      let (id, props) = self.locate(peer, attribute)?;
      if !props.supports_delivery() {
         return Err(GattError::Unsupported {
            uuid: id.uuid,
            what: "notifications",
            props,
         });
      }
      Ok(())
   }

   // === Dispatch ===

   /// Releases the slot held by `id` and dispatches whatever comes next.
   pub(crate) fn complete(&self, id: OperationId) {
      let next = self.queue.complete(id);
      self.run(next);
   }

   fn run(&self, mut next: Option<InFlight>) {
      while let Some(current) = next.take() {
         debug!("Dispatching {}: {}", current.id, current.operation);
         match self.dispatch(&current.operation) {
            Dispatched::Pending => break,
            Dispatched::Done => next = self.queue.complete(current.id),
         }
      }
   }

   fn dispatch(&self, operation: &Operation) -> Dispatched {
      let peer = operation.peer();
      match (operation, self.connections.get(peer)) {
         (Operation::Connect { .. }, Some(_)) => {
            warn!("{operation}: already connected, skipping");
            Dispatched::Done
         },
         (Operation::Connect { context, .. }, None) => {
            info!("Connecting to {peer}");
            self.transport.open_session(peer, context);
            Dispatched::Pending
         },
         (_, None) => {
            warn!("{operation}: {peer} is no longer connected, abandoning");
            Dispatched::Done
         },
         (_, Some(session)) => self.dispatch_in_session(operation, &session),
      }
   }

   fn dispatch_in_session(&self, operation: &Operation, session: &Session) -> Dispatched {
      let handle = session.handle;
      let tree = session.attributes.as_deref();
      let find = |attribute| Self::find_attribute(operation, tree, attribute);

      match operation {
         // Resolved by `dispatch` before a session lookup is meaningful.
         Operation::Connect { .. } => Dispatched::Done,
         Operation::Disconnect { peer } => {
            info!("Disconnecting from {peer}");
            self.teardown(*peer);
            Dispatched::Done
         },
         Operation::CharacteristicRead { attribute, .. } => {
            let Some(target) = find(attribute) else {
               return Dispatched::Done;
            };
            self.transport.read_attribute(handle, &target.id);
            Dispatched::Pending
         },
         Operation::CharacteristicWrite {
            attribute,
            mode,
            payload,
            ..
         } => {
            let Some(target) = find(attribute) else {
               return Dispatched::Done;
            };
            self
               .transport
               .write_attribute(handle, &target.id, payload, *mode);
            Dispatched::Pending
         },
         Operation::DescriptorRead { descriptor, .. } => {
            let Some(target) = self.find_descriptor(operation, tree, descriptor) else {
               return Dispatched::Done;
            };
            self.transport.read_descriptor(handle, &target);
            Dispatched::Pending
         },
         Operation::DescriptorWrite {
            descriptor,
            payload,
            ..
         } => {
            let Some(target) = self.find_descriptor(operation, tree, descriptor) else {
               return Dispatched::Done;
            };
            self.transport.write_descriptor(handle, &target, payload);
            Dispatched::Pending
         },
         Operation::EnableNotifications { attribute, .. } => {
            let Some(target) = find(attribute) else {
               return Dispatched::Done;
            };
            let Some(value) = target.attribute.props.delivery_enable_value() else {
               warn!("{operation}: attribute supports neither notify nor indicate");
               return Dispatched::Done;
            };
            self.toggle_delivery(operation, handle, target, true, &value)
         },
         Operation::DisableNotifications { attribute, .. } => {
            let Some(target) = find(attribute) else {
               return Dispatched::Done;
            };
            self.toggle_delivery(operation, handle, target, false, &DISABLE_NOTIFICATION_VALUE)
         },
         Operation::MtuRequest { size, .. } => {
            self.transport.request_mtu(handle, clamp_mtu(*size));
            Dispatched::Pending
         },
      }
   }

   fn find_attribute<'t>(
      operation: &Operation,
      tree: Option<&'t AttributeTree>,
      attribute: &AttributeId,
   ) -> Option<Located<'t>> {
      let found = tree.and_then(|t| t.find(attribute));
      if found.is_none() {
         warn!("{operation}: attribute {attribute} not found, abandoning");
      }
      found
   }

   fn find_descriptor(
      &self,
      operation: &Operation,
      tree: Option<&AttributeTree>,
      descriptor: &DescriptorId,
   ) -> Option<DescriptorId> {
      let found = tree
         .and_then(|t| t.find_descriptor(descriptor))
         .map(|(owner, d)| DescriptorId::new(owner.id, d.uuid));
      if found.is_none() {
         warn!("{operation}: descriptor {descriptor} not found, abandoning");
      }
      found
   }

   /// Two-step delivery toggle: local delivery first, then the
   /// delivery-configuration descriptor. The descriptor write completion
   /// resolves the operation.
   fn toggle_delivery(
      &self,
      operation: &Operation,
      handle: SessionHandle,
      target: Located<'_>,
      enabled: bool,
      value: &[u8],
   ) -> Dispatched {
      if !target.attribute.has_cccd() {
         warn!("{operation}: no delivery-configuration descriptor, abandoning");
         return Dispatched::Done;
      }
      if !self.transport.set_local_delivery(handle, &target.id, enabled) {
         warn!("{operation}: local delivery toggle failed, abandoning");
         return Dispatched::Done;
      }
      let cccd = DescriptorId::cccd(target.id);
      self.transport.write_descriptor(handle, &cccd, value);
      Dispatched::Pending
   }

   /// Drops the session of `peer`, releasing the native resource and
   /// notifying listeners. Returns `false` if the peer had no session.
   pub(crate) fn teardown(&self, peer: Address) -> bool {
      let Some(session) = self.connections.remove(peer) else {
         return false;
      };
      self.transport.close_session(session.handle);
      info!("Disconnected from {peer} ({})", session.handle);
      self.listeners.notify_all(&GattEvent::Disconnected { peer });
      true
   }
}
