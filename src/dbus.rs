use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::info;
use serde_json::json;
use uuid::Uuid;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   config::Config,
   error::GattError,
   gatt::{
      attribute::{AttributeId, DescriptorId},
      manager::ConnectionManager,
      operation::WriteMode,
      queue::OperationId,
   },
};

pub const OBJECT_PATH: &str = "/org/gattqd/manager";

pub struct GattService {
   manager: Arc<ConnectionManager>,
   config: Config,
}

impl GattService {
   pub const fn new(manager: Arc<ConnectionManager>, config: Config) -> Self {
      Self { manager, config }
   }
}

fn to_fdo(error: GattError) -> zbus::fdo::Error {
   match error {
      GattError::InvalidAddress(_) | GattError::InvalidUuid(_) | GattError::InvalidPayload(_) => {
         zbus::fdo::Error::InvalidArgs(error.to_string())
      },
      _ => zbus::fdo::Error::Failed(error.to_string()),
   }
}

fn accepted(result: crate::error::Result<OperationId>) -> zbus::fdo::Result<String> {
   result.map(|id| id.to_string()).map_err(to_fdo)
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|_| to_fdo(GattError::InvalidAddress(address.to_owned())))
}

/// An empty `container` leaves the attribute unscoped.
fn parse_attribute(container: &str, uuid: &str) -> zbus::fdo::Result<AttributeId> {
   let uuid = Uuid::parse_str(uuid).map_err(|e| to_fdo(e.into()))?;
   if container.is_empty() {
      return Ok(AttributeId::new(uuid));
   }
   let container = Uuid::parse_str(container).map_err(|e| to_fdo(e.into()))?;
   Ok(AttributeId::in_container(container, uuid))
}

fn parse_descriptor(
   container: &str,
   attribute: &str,
   descriptor: &str,
) -> zbus::fdo::Result<DescriptorId> {
   let attribute = parse_attribute(container, attribute)?;
   let uuid = Uuid::parse_str(descriptor).map_err(|e| to_fdo(e.into()))?;
   Ok(DescriptorId::new(attribute, uuid))
}

fn parse_payload(payload: &str) -> zbus::fdo::Result<Vec<u8>> {
   hex::decode(payload).map_err(|e| to_fdo(e.into()))
}

#[interface(name = "org.gattqd.Manager")]
impl GattService {
   async fn connect(&self, address: String) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      info!("D-Bus: connect {peer}");
      accepted(self.manager.connect(peer, self.config.session_context()))
   }

   async fn disconnect(&self, address: String) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      info!("D-Bus: disconnect {peer}");
      accepted(self.manager.disconnect(peer))
   }

   async fn read_attribute(
      &self,
      address: String,
      container: String,
      attribute: String,
   ) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      let attribute = parse_attribute(&container, &attribute)?;
      accepted(self.manager.read_attribute(peer, attribute))
   }

   /// `mode` is `with-response`, `without-response`, or empty to let the
   /// attribute's properties decide.
   async fn write_attribute(
      &self,
      address: String,
      container: String,
      attribute: String,
      payload: String,
      mode: String,
   ) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      let attribute = parse_attribute(&container, &attribute)?;
      let payload = parse_payload(&payload)?;
      if mode.is_empty() {
         return accepted(self.manager.write_attribute(peer, attribute, &payload));
      }
      let mode = WriteMode::from_str(&mode)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid write mode: {mode}")))?;
      accepted(
         self
            .manager
            .write_attribute_with(peer, attribute, &payload, mode),
      )
   }

   async fn read_descriptor(
      &self,
      address: String,
      container: String,
      attribute: String,
      descriptor: String,
   ) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      let descriptor = parse_descriptor(&container, &attribute, &descriptor)?;
      accepted(self.manager.read_descriptor(peer, descriptor))
   }

   async fn write_descriptor(
      &self,
      address: String,
      container: String,
      attribute: String,
      descriptor: String,
      payload: String,
   ) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      let descriptor = parse_descriptor(&container, &attribute, &descriptor)?;
      let payload = parse_payload(&payload)?;
      accepted(self.manager.write_descriptor(peer, descriptor, &payload))
   }

   async fn enable_notifications(
      &self,
      address: String,
      container: String,
      attribute: String,
   ) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      let attribute = parse_attribute(&container, &attribute)?;
      accepted(self.manager.enable_notifications(peer, attribute))
   }

   async fn disable_notifications(
      &self,
      address: String,
      container: String,
      attribute: String,
   ) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      let attribute = parse_attribute(&container, &attribute)?;
      accepted(self.manager.disable_notifications(peer, attribute))
   }

   async fn request_mtu(&self, address: String, size: u16) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      accepted(self.manager.request_mtu(peer, size))
   }

   async fn get_peers(&self) -> String {
      let peers: Vec<_> = self
         .manager
         .connected_peers()
         .into_iter()
         .filter_map(|peer| self.manager.session(peer).map(|s| (peer, s)))
         .map(|(peer, session)| {
            json!({
               "address": peer.to_string(),
               "name": self.config.known_peer(peer).map(|p| p.name.as_str()),
               "session": session.handle.to_string(),
               "mtu": session.mtu,
               "discovered": session.attributes.is_some(),
            })
         })
         .collect();
      json!(peers).to_string()
   }

   async fn get_attributes(&self, address: String) -> zbus::fdo::Result<String> {
      let peer = parse_address(&address)?;
      let tree = self
         .manager
         .attributes(peer)
         .ok_or_else(|| zbus::fdo::Error::Failed(format!("No attributes discovered on {peer}")))?;
      Ok(tree.to_json().to_string())
   }

   async fn get_queue(&self) -> String {
      let pending: Vec<_> = self
         .manager
         .pending_operations()
         .iter()
         .map(ToString::to_string)
         .collect();
      let in_flight = self.manager.in_flight().map(|f| {
         json!({
            "id": f.id.to_string(),
            "operation": f.operation.to_string(),
            "elapsed_ms": u64::try_from(f.since.elapsed().as_millis()).unwrap_or(u64::MAX),
         })
      });
      json!({
         "in_flight": in_flight,
         "pending": pending,
      })
      .to_string()
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_ready(
      emitter: &SignalEmitter<'_>,
      address: &str,
      attributes: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn disconnected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn attribute_read(
      emitter: &SignalEmitter<'_>,
      address: &str,
      attribute: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn attribute_written(
      emitter: &SignalEmitter<'_>,
      address: &str,
      attribute: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn attribute_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      attribute: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn descriptor_read(
      emitter: &SignalEmitter<'_>,
      address: &str,
      descriptor: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn descriptor_written(
      emitter: &SignalEmitter<'_>,
      address: &str,
      descriptor: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn notifications_enabled(
      emitter: &SignalEmitter<'_>,
      address: &str,
      attribute: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn notifications_disabled(
      emitter: &SignalEmitter<'_>,
      address: &str,
      attribute: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn mtu_changed(emitter: &SignalEmitter<'_>, address: &str, mtu: u16)
   -> zbus::Result<()>;

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      u32::try_from(self.manager.connected_peers().len()).unwrap_or(u32::MAX)
   }

   #[zbus(property)]
   async fn queue_length(&self) -> u32 {
      let pending = self.manager.pending_operations().len();
      let in_flight = usize::from(self.manager.in_flight().is_some());
      u32::try_from(pending + in_flight).unwrap_or(u32::MAX)
   }
}
