//! Fixtures shared by the manager and router tests.

use std::sync::Arc;

use bluer::Address;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
   bluetooth::transport::{
      GattStatus, SessionHandle, TransportEvent,
      recording::RecordingTransport,
   },
   event::{GattEvent, GattEventKind, GattListener},
   gatt::{
      attribute::{
         Attribute, AttributeId, AttributeTree, CCCD_UUID, Container, Descriptor, DescriptorId,
         DescriptorProperties, Properties,
      },
      manager::{ConnectionManager, ManagerOptions},
      operation::{MAX_MTU, Payload, SessionContext},
   },
};

pub const SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
/// Readable and notifiable.
pub const MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
/// Readable, notifiable and indicatable.
pub const STATUS: Uuid = Uuid::from_u128(0x00002a38_0000_1000_8000_00805f9b34fb);
/// Writable with response only.
pub const CONTROL: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);
/// Notifiable but without a delivery-configuration descriptor.
pub const BROKEN: Uuid = Uuid::from_u128(0x00002a3a_0000_1000_8000_00805f9b34fb);
/// User description descriptor.
pub const USER_DESCRIPTION: Uuid = Uuid::from_u128(0x00002901_0000_1000_8000_00805f9b34fb);

pub fn peer_a() -> Address {
   Address::new([0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x01])
}

pub fn peer_b() -> Address {
   Address::new([0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x02])
}

pub fn attr(uuid: Uuid) -> AttributeId {
   AttributeId::new(uuid)
}

pub fn qualified(uuid: Uuid) -> AttributeId {
   AttributeId::in_container(SERVICE, uuid)
}

fn cccd() -> Descriptor {
   Descriptor {
      uuid: CCCD_UUID,
      props: DescriptorProperties::new(true, true),
   }
}

pub fn tree() -> AttributeTree {
   AttributeTree::new(vec![Container {
      uuid: SERVICE,
      attributes: vec![
         Attribute {
            uuid: MEASUREMENT,
            props: Properties::READ | Properties::NOTIFY,
            descriptors: vec![
               cccd(),
               Descriptor {
                  uuid: USER_DESCRIPTION,
                  props: DescriptorProperties::new(true, false),
               },
            ],
         },
         Attribute {
            uuid: STATUS,
            props: Properties::READ | Properties::NOTIFY | Properties::INDICATE,
            descriptors: vec![cccd()],
         },
         Attribute {
            uuid: CONTROL,
            props: Properties::WRITE,
            descriptors: vec![],
         },
         Attribute {
            uuid: BROKEN,
            props: Properties::NOTIFY,
            descriptors: vec![],
         },
      ],
   }])
}

/// Listener recording every event it receives, in order.
#[derive(Default)]
pub struct EventLog {
   events: Mutex<Vec<GattEvent>>,
}

impl EventLog {
   pub fn events(&self) -> Vec<GattEvent> {
      self.events.lock().clone()
   }

   pub fn kinds(&self) -> Vec<GattEventKind> {
      self.events.lock().iter().map(GattEvent::kind).collect()
   }

   pub fn clear(&self) {
      self.events.lock().clear();
   }

   fn push(&self, event: GattEvent) {
      self.events.lock().push(event);
   }
}

impl GattListener for EventLog {
   fn on_connection_ready(&self, peer: Address, attributes: &Arc<AttributeTree>) {
      self.push(GattEvent::ConnectionReady {
         peer,
         attributes: attributes.clone(),
      });
   }

   fn on_disconnected(&self, peer: Address) {
      self.push(GattEvent::Disconnected { peer });
   }

   fn on_attribute_read(&self, peer: Address, attribute: &AttributeId, value: &[u8]) {
      self.push(GattEvent::AttributeRead {
         peer,
         attribute: *attribute,
         value: Payload::from_slice(value),
      });
   }

   fn on_attribute_written(&self, peer: Address, attribute: &AttributeId) {
      self.push(GattEvent::AttributeWritten {
         peer,
         attribute: *attribute,
      });
   }

   fn on_attribute_changed(&self, peer: Address, attribute: &AttributeId, value: &[u8]) {
      self.push(GattEvent::AttributeChanged {
         peer,
         attribute: *attribute,
         value: Payload::from_slice(value),
      });
   }

   fn on_descriptor_read(&self, peer: Address, descriptor: &DescriptorId, value: &[u8]) {
      self.push(GattEvent::DescriptorRead {
         peer,
         descriptor: *descriptor,
         value: Payload::from_slice(value),
      });
   }

   fn on_descriptor_written(&self, peer: Address, descriptor: &DescriptorId) {
      self.push(GattEvent::DescriptorWritten {
         peer,
         descriptor: *descriptor,
      });
   }

   fn on_notifications_enabled(&self, peer: Address, attribute: &AttributeId) {
      self.push(GattEvent::NotificationsEnabled {
         peer,
         attribute: *attribute,
      });
   }

   fn on_notifications_disabled(&self, peer: Address, attribute: &AttributeId) {
      self.push(GattEvent::NotificationsDisabled {
         peer,
         attribute: *attribute,
      });
   }

   fn on_mtu_changed(&self, peer: Address, mtu: u16) {
      self.push(GattEvent::MtuChanged { peer, mtu });
   }
}

pub struct Harness {
   pub transport: Arc<RecordingTransport>,
   pub manager: Arc<ConnectionManager>,
   pub log: Arc<EventLog>,
}

impl Harness {
   pub fn new() -> Self {
      let transport = Arc::new(RecordingTransport::new());
      let manager = Arc::new(ConnectionManager::new(
         transport.clone(),
         ManagerOptions::default(),
      ));
      let log = Arc::new(EventLog::default());
      manager.register_listener(&log);
      Self {
         transport,
         manager,
         log,
      }
   }

   /// Runs a full connect, discovery and MTU exchange, then clears the
   /// recorded calls and events.
   pub fn connected(peer: Address, session: SessionHandle) -> Self {
      let harness = Self::new();
      harness.connect(peer, session);
      harness
   }

   pub fn connect(&self, peer: Address, session: SessionHandle) {
      self
         .manager
         .connect(peer, SessionContext::default())
         .expect("connect rejected");
      self.event(TransportEvent::Connected { peer, session });
      self.event(TransportEvent::ServicesDiscovered {
         peer,
         result: Ok(tree()),
      });
      self.event(TransportEvent::MtuChanged {
         peer,
         mtu: MAX_MTU,
         status: GattStatus::Success,
      });
      assert!(self.manager.is_idle());
      self.transport.take_calls();
      self.log.clear();
   }

   pub fn event(&self, event: TransportEvent) {
      self.manager.handle_event(event);
   }
}
