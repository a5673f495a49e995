//! GATT operation manager D-Bus service
//!
//! This service keeps sessions to BLE peripherals, serializes every GATT
//! request against them through a single queue, and exposes requests and
//! outcomes over D-Bus.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{
   signal,
   sync::{Notify, mpsc},
   time::{self, MissedTickBehavior},
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use gattqd::{
   bluetooth::{bluez::BluezTransport, transport::TransportEvent},
   config::Config,
   dbus::{GattService, GattServiceSignals, OBJECT_PATH},
   error::Result,
   event::{GattEvent, GattListener},
   gatt::{
      attribute::{AttributeId, AttributeTree, DescriptorId},
      manager::{ConnectionManager, ManagerOptions},
      operation::Payload,
   },
   reconnect::Reconnector,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting gattqd D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known peers",
      config.known_peers.len()
   );

   let (transport, events) = BluezTransport::new(config.adapter.as_deref()).await?;
   let transport = Arc::new(transport);
   let manager = Arc::new(ConnectionManager::new(
      transport.clone(),
      ManagerOptions::from(&config),
   ));
   spawn_event_pump(manager.clone(), events);

   // The registry only holds a weak reference; this binding keeps it alive.
   let event_bus = EventProcessor::new();
   manager.register_listener(&event_bus);

   let service = GattService::new(manager.clone(), config.clone());
   let connection = connection::Builder::session()?
      .name("org.gattqd")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("gattqd D-Bus service started at org.gattqd");

   event_bus.clone().spawn_dispatcher(connection).await?;

   if let Some(timeout) = config.operation_timeout() {
      spawn_watchdog(manager.clone(), timeout);
   }

   tokio::spawn(
      Reconnector::new(
         manager.clone(),
         config.auto_connect_peers(),
         config.session_context(),
         config.reconnect_delay(),
      )
      .run(),
   );

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down gattqd...");

   let closed = manager.close_all();
   if closed > 0 {
      info!("Closed {closed} session(s)");
   }
   transport.shutdown().await;

   Ok(())
}

/// Feeds transport events to the router from a single task.
fn spawn_event_pump(manager: Arc<ConnectionManager>, mut events: mpsc::Receiver<TransportEvent>) {
   tokio::spawn(async move {
      while let Some(event) = events.recv().await {
         manager.handle_event(event);
      }
      warn!("Transport event channel closed");
   });
}

fn spawn_watchdog(manager: Arc<ConnectionManager>, timeout: Duration) {
   info!("Stalled-operation watchdog enabled ({timeout:?})");
   tokio::spawn(async move {
      let mut interval = time::interval((timeout / 2).max(Duration::from_secs(1)));
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
         interval.tick().await;
         manager.expire_stalled(timeout);
      }
   });
}

struct EventProcessor {
   queue: SegQueue<GattEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   fn emit(&self, event: GattEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<GattEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<GattService>, event: GattEvent) -> Result<()> {
      let address = event.peer().to_string();
      let address = address.as_str();
      match event {
         GattEvent::ConnectionReady { attributes, .. } => {
            iface
               .connection_ready(address, &attributes.to_json().to_string())
               .await?;
         },
         GattEvent::Disconnected { .. } => {
            iface.disconnected(address).await?;
         },
         GattEvent::AttributeRead {
            attribute, value, ..
         } => {
            iface
               .attribute_read(address, &attribute.to_string(), &hex::encode(value))
               .await?;
         },
         GattEvent::AttributeWritten { attribute, .. } => {
            iface
               .attribute_written(address, &attribute.to_string())
               .await?;
         },
         GattEvent::AttributeChanged {
            attribute, value, ..
         } => {
            iface
               .attribute_changed(address, &attribute.to_string(), &hex::encode(value))
               .await?;
         },
         GattEvent::DescriptorRead {
            descriptor, value, ..
         } => {
            iface
               .descriptor_read(address, &descriptor.to_string(), &hex::encode(value))
               .await?;
         },
         GattEvent::DescriptorWritten { descriptor, .. } => {
            iface
               .descriptor_written(address, &descriptor.to_string())
               .await?;
         },
         GattEvent::NotificationsEnabled { attribute, .. } => {
            iface
               .notifications_enabled(address, &attribute.to_string())
               .await?;
         },
         GattEvent::NotificationsDisabled { attribute, .. } => {
            iface
               .notifications_disabled(address, &attribute.to_string())
               .await?;
         },
         GattEvent::MtuChanged { mtu, .. } => {
            iface.mtu_changed(address, mtu).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, GattService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl GattListener for EventProcessor {
   fn on_connection_ready(&self, peer: Address, attributes: &Arc<AttributeTree>) {
      self.emit(GattEvent::ConnectionReady {
         peer,
         attributes: attributes.clone(),
      });
   }

   fn on_disconnected(&self, peer: Address) {
      self.emit(GattEvent::Disconnected { peer });
   }

   fn on_attribute_read(&self, peer: Address, attribute: &AttributeId, value: &[u8]) {
      self.emit(GattEvent::AttributeRead {
         peer,
         attribute: *attribute,
         value: Payload::from_slice(value),
      });
   }

   fn on_attribute_written(&self, peer: Address, attribute: &AttributeId) {
      self.emit(GattEvent::AttributeWritten {
         peer,
         attribute: *attribute,
      });
   }

   fn on_attribute_changed(&self, peer: Address, attribute: &AttributeId, value: &[u8]) {
      self.emit(GattEvent::AttributeChanged {
         peer,
         attribute: *attribute,
         value: Payload::from_slice(value),
      });
   }

   fn on_descriptor_read(&self, peer: Address, descriptor: &DescriptorId, value: &[u8]) {
      self.emit(GattEvent::DescriptorRead {
         peer,
         descriptor: *descriptor,
         value: Payload::from_slice(value),
      });
   }

   fn on_descriptor_written(&self, peer: Address, descriptor: &DescriptorId) {
      self.emit(GattEvent::DescriptorWritten {
         peer,
         descriptor: *descriptor,
      });
   }

   fn on_notifications_enabled(&self, peer: Address, attribute: &AttributeId) {
      self.emit(GattEvent::NotificationsEnabled {
         peer,
         attribute: *attribute,
      });
   }

   fn on_notifications_disabled(&self, peer: Address, attribute: &AttributeId) {
      self.emit(GattEvent::NotificationsDisabled {
         peer,
         attribute: *attribute,
      });
   }

   fn on_mtu_changed(&self, peer: Address, mtu: u16) {
      self.emit(GattEvent::MtuChanged { peer, mtu });
   }
}
