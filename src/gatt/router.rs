//! Routes transport events to the in-flight operation.
//!
//! Transport events carry no correlation id. Because only one operation is
//! ever in flight, an event resolves it when the in-flight operation has the
//! matching kind and peer. Other events may still update state and notify
//! listeners, but never release the slot.

use bluer::Address;
use log::{error, info, warn};

use crate::{
   bluetooth::transport::{GattStatus, SessionHandle, TransportEvent},
   event::GattEvent,
   gatt::{
      attribute::{AttributeId, AttributeTree, DescriptorId},
      manager::ConnectionManager,
      operation::{Operation, OperationKind, Payload},
      queue::OperationId,
   },
};

impl ConnectionManager {
   /// Entry point for every asynchronous transport event.
   pub fn handle_event(&self, event: TransportEvent) {
      match event {
         TransportEvent::Connected { peer, session } => self.on_connected(peer, session),
         TransportEvent::Disconnected {
            peer,
            session,
            status,
         } => self.on_disconnected(peer, session, status),
         TransportEvent::ServicesDiscovered { peer, result } => {
            self.on_services_discovered(peer, result);
         },
         TransportEvent::CharacteristicRead {
            peer,
            attribute,
            status,
            value,
         } => self.on_characteristic_read(peer, attribute, status, value),
         TransportEvent::CharacteristicWritten {
            peer,
            attribute,
            status,
         } => self.on_characteristic_written(peer, attribute, status),
         TransportEvent::CharacteristicChanged {
            peer,
            attribute,
            value,
         } => {
            self.listeners.notify_all(&GattEvent::AttributeChanged {
               peer,
               attribute,
               value,
            });
         },
         TransportEvent::DescriptorRead {
            peer,
            descriptor,
            status,
            value,
         } => self.on_descriptor_read(peer, descriptor, status, value),
         TransportEvent::DescriptorWritten {
            peer,
            descriptor,
            status,
         } => self.on_descriptor_written(peer, descriptor, status),
         TransportEvent::MtuChanged { peer, mtu, status } => {
            self.on_mtu_changed(peer, mtu, status);
         },
      }
   }

   /// Id of the in-flight operation if it is a `kind` against `peer`.
   fn in_flight_matching(&self, peer: Address, kind: OperationKind) -> Option<OperationId> {
      self
         .queue
         .in_flight()
         .filter(|f| f.operation.peer() == peer && f.operation.kind() == kind)
         .map(|f| f.id)
   }

   fn resolve(&self, resolved: Option<OperationId>) {
      if let Some(id) = resolved {
         self.complete(id);
      }
   }

   fn on_connected(&self, peer: Address, session: SessionHandle) {
      info!("Session {session} opened to {peer}, discovering attributes");
      if let Some(previous) = self.connections.insert(peer, session)
         && previous.handle != session
      {
         warn!("{peer}: replacing stale {}", previous.handle);
         self.transport.close_session(previous.handle);
      }
      // The connect stays in flight until discovery resolves it.
      self.transport.discover_attributes(session);
   }

   fn on_disconnected(&self, peer: Address, session: Option<SessionHandle>, status: GattStatus) {
      if let Some(closed) = session
         && self.connections.handle(peer) != Some(closed)
      {
         info!("{peer}: ignoring close of released {closed}");
         return;
      }
      if status.is_success() {
         info!("{peer} disconnected");
      } else {
         error!("Session to {peer} failed: {status}");
      }
      self.teardown(peer);

      // Nothing will ever answer an operation against a dead session.
      let resolved = self
         .queue
         .in_flight()
         .filter(|f| f.operation.peer() == peer)
         .map(|f| {
            warn!("{}: {} resolved by disconnect", f.id, f.operation);
            f.id
         });
      self.resolve(resolved);
   }

   fn on_services_discovered(&self, peer: Address, result: Result<AttributeTree, GattStatus>) {
      let resolved = self.in_flight_matching(peer, OperationKind::Connect);
      match result {
         Ok(tree) => {
            tree.log_table(peer);
            match self.connections.set_attributes(peer, tree) {
               Some(attributes) => {
                  info!("{peer}: attributes discovered, requesting MTU");
                  if let Err(e) = self.request_mtu(peer, self.options.preferred_mtu) {
                     warn!("{peer}: automatic MTU request rejected: {e}");
                  }
                  self
                     .listeners
                     .notify_all(&GattEvent::ConnectionReady { peer, attributes });
               },
               None => warn!("{peer}: discovery finished after the session closed"),
            }
         },
         Err(status) => {
            error!("{peer}: attribute discovery failed: {status}");
            self.teardown(peer);
         },
      }
      self.resolve(resolved);
   }

   fn on_characteristic_read(
      &self,
      peer: Address,
      attribute: AttributeId,
      status: GattStatus,
      value: Payload,
   ) {
      let resolved = self.in_flight_matching(peer, OperationKind::CharacteristicRead);
      if status.is_success() {
         info!("{peer}: read {attribute}: {}", hex::encode(&value));
         self.listeners.notify_all(&GattEvent::AttributeRead {
            peer,
            attribute,
            value,
         });
      } else {
         report_failure(peer, "read of", &attribute, status);
      }
      self.resolve(resolved);
   }

   fn on_characteristic_written(&self, peer: Address, attribute: AttributeId, status: GattStatus) {
      let resolved = self.in_flight_matching(peer, OperationKind::CharacteristicWrite);
      if status.is_success() {
         info!("{peer}: wrote {attribute}");
         self
            .listeners
            .notify_all(&GattEvent::AttributeWritten { peer, attribute });
      } else {
         report_failure(peer, "write to", &attribute, status);
      }
      self.resolve(resolved);
   }

   fn on_descriptor_read(
      &self,
      peer: Address,
      descriptor: DescriptorId,
      status: GattStatus,
      value: Payload,
   ) {
      let resolved = self.in_flight_matching(peer, OperationKind::DescriptorRead);
      if status.is_success() {
         info!("{peer}: read {descriptor}: {}", hex::encode(&value));
         self.listeners.notify_all(&GattEvent::DescriptorRead {
            peer,
            descriptor,
            value,
         });
      } else {
         report_failure(peer, "read of", &descriptor, status);
      }
      self.resolve(resolved);
   }

   fn on_descriptor_written(&self, peer: Address, descriptor: DescriptorId, status: GattStatus) {
      let in_flight = self
         .queue
         .in_flight()
         .filter(|f| f.operation.peer() == peer);

      // A delivery-configuration write completes a pending enable/disable of
      // the same attribute; every other write is a plain descriptor write.
      let toggles = |attribute: &AttributeId| {
         descriptor.is_cccd() && attribute.selects(&descriptor.attribute)
      };
      let (resolved, success) = match in_flight.as_ref().map(|f| (f.id, &f.operation)) {
         Some((id, Operation::EnableNotifications { attribute, .. })) if toggles(attribute) => (
            Some(id),
            GattEvent::NotificationsEnabled {
               peer,
               attribute: descriptor.attribute,
            },
         ),
         Some((id, Operation::DisableNotifications { attribute, .. })) if toggles(attribute) => (
            Some(id),
            GattEvent::NotificationsDisabled {
               peer,
               attribute: descriptor.attribute,
            },
         ),
         Some((
            id,
            Operation::DescriptorWrite {
               descriptor: requested,
               ..
            },
         )) if requested.selects(&descriptor) => {
            (Some(id), GattEvent::DescriptorWritten { peer, descriptor })
         },
         _ => (None, GattEvent::DescriptorWritten { peer, descriptor }),
      };

      if status.is_success() {
         info!("{peer}: wrote {descriptor} ({})", success.kind());
         self.listeners.notify_all(&success);
      } else {
         report_failure(peer, "write to", &descriptor, status);
      }
      self.resolve(resolved);
   }

   fn on_mtu_changed(&self, peer: Address, mtu: u16, status: GattStatus) {
      let resolved = self.in_flight_matching(peer, OperationKind::MtuRequest);
      if status.is_success() {
         info!("{peer}: MTU is now {mtu}");
         self.connections.set_mtu(peer, mtu);
         self
            .listeners
            .notify_all(&GattEvent::MtuChanged { peer, mtu });
      } else {
         report_failure(peer, "MTU request for", &mtu, status);
      }
      self.resolve(resolved);
   }
}

fn report_failure(peer: Address, what: &str, target: &dyn std::fmt::Display, status: GattStatus) {
   match status {
      GattStatus::PermissionDenied => warn!("{peer}: {what} {target} not permitted"),
      _ => error!("{peer}: {what} {target} failed: {status}"),
   }
}
