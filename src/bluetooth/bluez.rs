//! `TransportBridge` implementation over BlueZ.
//!
//! Every capability call spawns a task on the tokio runtime and posts the
//! outcome as a [`TransportEvent`] to a channel. The daemon drains that
//! channel from a single task, which is the only caller of
//! `ConnectionManager::handle_event`.

use std::{
   collections::HashMap,
   future::Future,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::{Duration, Instant},
};

use bluer::{
   Adapter, Address, Device, DeviceEvent, DeviceProperty, ErrorKind, Session,
   gatt::{
      WriteOp,
      remote::{Characteristic, CharacteristicWriteRequest, Descriptor as RemoteDescriptor},
   },
};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
   runtime::Handle,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::transport::{GattStatus, SessionHandle, TransportBridge, TransportEvent},
   error::Result,
   gatt::{
      attribute::{
         Attribute, AttributeId, AttributeTree, Container, Descriptor, DescriptorId,
         DescriptorProperties, Properties,
      },
      operation::{Payload, SessionContext, WriteMode},
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Maximum time BlueZ gets to resolve services after connecting
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while waiting for services to resolve
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);
/// Maximum time pending disconnects get at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Local delivery change awaiting its delivery-configuration write.
///
/// BlueZ owns that descriptor and updates it itself when a notification
/// stream starts or stops, so the write reports how the toggle went.
enum DeliveryToggle {
   /// Resolves once `StartNotify` succeeded or failed.
   Subscribing(oneshot::Receiver<std::result::Result<(), GattStatus>>),
   /// Local delivery already is in the requested state.
   Settled,
}

impl DeliveryToggle {
   async fn outcome(self) -> GattStatus {
      match self {
         Self::Settled => GattStatus::Success,
         Self::Subscribing(outcome) => match outcome.await {
            Ok(Ok(())) => GattStatus::Success,
            Ok(Err(status)) => status,
            // Stream task aborted before subscribing.
            Err(_) => GattStatus::GENERIC_FAILURE,
         },
      }
   }
}

/// Per-session state: the device and the remote objects discovered on it.
struct SessionState {
   peer: Address,
   device: Device,
   characteristics: HashMap<AttributeId, Characteristic>,
   descriptors: HashMap<DescriptorId, RemoteDescriptor>,
   notify_tasks: HashMap<AttributeId, JoinHandle<()>>,
   toggles: HashMap<AttributeId, DeliveryToggle>,
   monitor: Option<JoinHandle<()>>,
}

impl SessionState {
   fn shutdown(&mut self) {
      for (_, task) in self.notify_tasks.drain() {
         task.abort();
      }
      self.toggles.clear();
      if let Some(monitor) = self.monitor.take() {
         monitor.abort();
      }
   }
}

struct Shared {
   runtime: Handle,
   adapter: Adapter,
   events: mpsc::Sender<TransportEvent>,
   next_session: AtomicU64,
   sessions: Mutex<HashMap<SessionHandle, SessionState>>,
   closing: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
   async fn post(&self, event: TransportEvent) {
      if self.events.send(event).await.is_err() {
         debug!("Event pump closed, dropping transport event");
      }
   }

   fn peer(&self, session: SessionHandle) -> Option<Address> {
      self.sessions.lock().get(&session).map(|s| s.peer)
   }

   fn take_toggle(&self, session: SessionHandle, attribute: &AttributeId) -> Option<DeliveryToggle> {
      self.sessions.lock().get_mut(&session)?.toggles.remove(attribute)
   }

   fn stop_delivery(&self, session: SessionHandle, attribute: &AttributeId) {
      let mut sessions = self.sessions.lock();
      if let Some(task) = sessions
         .get_mut(&session)
         .and_then(|s| s.notify_tasks.remove(attribute))
      {
         task.abort();
      }
   }

   fn characteristic(
      &self,
      session: SessionHandle,
      attribute: &AttributeId,
   ) -> Option<(Address, Option<Characteristic>)> {
      let sessions = self.sessions.lock();
      let state = sessions.get(&session)?;
      Some((state.peer, state.characteristics.get(attribute).cloned()))
   }

   fn descriptor(
      &self,
      session: SessionHandle,
      descriptor: &DescriptorId,
   ) -> Option<(Address, Option<RemoteDescriptor>)> {
      let sessions = self.sessions.lock();
      let state = sessions.get(&session)?;
      Some((state.peer, state.descriptors.get(descriptor).cloned()))
   }
}

/// BlueZ-backed transport.
#[derive(Clone)]
pub struct BluezTransport {
   shared: Arc<Shared>,
}

impl BluezTransport {
   /// Opens the adapter named `adapter` (or the default one) and returns the
   /// transport along with the receiving end of its event channel.
   pub async fn new(adapter: Option<&str>) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
      let session = Session::new().await?;
      let adapter = match adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };

      if !adapter.is_powered().await? {
         info!("Powering on adapter {}", adapter.name());
         adapter.set_powered(true).await?;
      }
      info!(
         "Using adapter {} ({})",
         adapter.name(),
         adapter.address().await?
      );

      let (events, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let shared = Arc::new(Shared {
         runtime: Handle::current(),
         adapter,
         events,
         next_session: AtomicU64::new(1),
         sessions: Mutex::new(HashMap::new()),
         closing: Mutex::new(Vec::new()),
      });
      Ok((Self { shared }, rx))
   }

   /// Waits for the disconnects issued by `close_session` to finish.
   pub async fn shutdown(&self) {
      let pending = std::mem::take(&mut *self.shared.closing.lock());
      if pending.is_empty() {
         return;
      }
      info!("Waiting for {} disconnect(s)", pending.len());
      if time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(pending))
         .await
         .is_err()
      {
         warn!("Disconnects did not finish within {SHUTDOWN_TIMEOUT:?}");
      }
   }

   /// Runs `task` on the runtime and posts the event it produces, if any.
   fn spawn<F, Fut>(&self, task: F)
   where
      F: FnOnce(Arc<Shared>) -> Fut,
      Fut: Future<Output = Option<TransportEvent>> + Send + 'static,
   {
      let shared = self.shared.clone();
      let fut = task(shared.clone());
      self.shared.runtime.spawn(async move {
         if let Some(event) = fut.await {
            shared.post(event).await;
         }
      });
   }
}

impl TransportBridge for BluezTransport {
   fn open_session(&self, peer: Address, context: &SessionContext) {
      let handle = SessionHandle(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
      let timeout = context.connect_timeout;
      self.spawn(move |shared| async move {
         let opened = match connect(&shared.adapter, peer, timeout).await {
            Ok(device) => device,
            Err(status) => {
               return Some(TransportEvent::Disconnected {
                  peer,
                  session: None,
                  status,
               });
            },
         };

         let monitor = spawn_monitor(&shared, peer, handle, &opened).await;
         shared.sessions.lock().insert(
            handle,
            SessionState {
               peer,
               device: opened,
               characteristics: HashMap::new(),
               descriptors: HashMap::new(),
               notify_tasks: HashMap::new(),
               toggles: HashMap::new(),
               monitor,
            },
         );
         Some(TransportEvent::Connected {
            peer,
            session: handle,
         })
      });
   }

   fn close_session(&self, session: SessionHandle) {
      let Some(mut state) = self.shared.sessions.lock().remove(&session) else {
         debug!("Closing unknown {session}");
         return;
      };
      state.shutdown();
      let device = state.device;
      let task = self.shared.runtime.spawn(async move {
         if let Err(e) = device.disconnect().await {
            warn!("Failed to disconnect {}: {e}", device.address());
         }
      });
      let mut closing = self.shared.closing.lock();
      closing.retain(|t| !t.is_finished());
      closing.push(task);
   }

   fn discover_attributes(&self, session: SessionHandle) {
      self.spawn(move |shared| async move {
         let (peer, device) = {
            let sessions = shared.sessions.lock();
            let state = sessions.get(&session)?;
            (state.peer, state.device.clone())
         };

         let result = match services_resolved(&device).await {
            Ok(true) => discover(&device).await,
            Ok(false) => {
               error!("Services on {peer} did not resolve in time");
               return Some(TransportEvent::ServicesDiscovered {
                  peer,
                  result: Err(GattStatus::GENERIC_FAILURE),
               });
            },
            Err(e) => Err(e),
         };
         let result = match result {
            Ok(discovered) => {
               let mut sessions = shared.sessions.lock();
               let state = sessions.get_mut(&session)?;
               state.characteristics = discovered.characteristics;
               state.descriptors = discovered.descriptors;
               Ok(discovered.tree)
            },
            Err(e) => {
               error!("Service discovery on {peer} failed: {e}");
               Err(status_of(&e))
            },
         };
         Some(TransportEvent::ServicesDiscovered { peer, result })
      });
   }

   fn read_attribute(&self, session: SessionHandle, attribute: &AttributeId) {
      let attribute = *attribute;
      self.spawn(move |shared| async move {
         let (peer, characteristic) = shared.characteristic(session, &attribute)?;
         let (status, value) = match characteristic {
            Some(c) => match c.read().await {
               Ok(value) => (GattStatus::Success, Payload::from_vec(value)),
               Err(e) => {
                  debug!("{peer}: read {attribute}: {e}");
                  (status_of(&e), Payload::new())
               },
            },
            None => (GattStatus::GENERIC_FAILURE, Payload::new()),
         };
         Some(TransportEvent::CharacteristicRead {
            peer,
            attribute,
            status,
            value,
         })
      });
   }

   fn write_attribute(
      &self,
      session: SessionHandle,
      attribute: &AttributeId,
      payload: &[u8],
      mode: WriteMode,
   ) {
      let attribute = *attribute;
      let payload = Payload::from_slice(payload);
      self.spawn(move |shared| async move {
         let (peer, characteristic) = shared.characteristic(session, &attribute)?;
         let status = match characteristic {
            Some(c) => {
               let request = CharacteristicWriteRequest {
                  op_type: match mode {
                     WriteMode::WithResponse => WriteOp::Request,
                     WriteMode::WithoutResponse => WriteOp::Command,
                  },
                  ..Default::default()
               };
               match c.write_ext(&payload, &request).await {
                  Ok(()) => GattStatus::Success,
                  Err(e) => {
                     debug!("{peer}: write {attribute}: {e}");
                     status_of(&e)
                  },
               }
            },
            None => GattStatus::GENERIC_FAILURE,
         };
         Some(TransportEvent::CharacteristicWritten {
            peer,
            attribute,
            status,
         })
      });
   }

   fn read_descriptor(&self, session: SessionHandle, descriptor: &DescriptorId) {
      let descriptor = *descriptor;
      self.spawn(move |shared| async move {
         let (peer, remote) = shared.descriptor(session, &descriptor)?;
         let (status, value) = match remote {
            Some(d) => match d.read().await {
               Ok(value) => (GattStatus::Success, Payload::from_vec(value)),
               Err(e) => (status_of(&e), Payload::new()),
            },
            None => (GattStatus::GENERIC_FAILURE, Payload::new()),
         };
         Some(TransportEvent::DescriptorRead {
            peer,
            descriptor,
            status,
            value,
         })
      });
   }

   fn write_descriptor(&self, session: SessionHandle, descriptor: &DescriptorId, payload: &[u8]) {
      let descriptor = *descriptor;
      let payload = Payload::from_slice(payload);
      self.spawn(move |shared| async move {
         if descriptor.is_cccd()
            && let Some(toggle) = shared.take_toggle(session, &descriptor.attribute)
         {
            let peer = shared.peer(session)?;
            let status = toggle.outcome().await;
            if status.is_success() {
               debug!("{peer}: {descriptor} handled by bluetoothd");
            } else {
               shared.stop_delivery(session, &descriptor.attribute);
            }
            return Some(TransportEvent::DescriptorWritten {
               peer,
               descriptor,
               status,
            });
         }

         let (peer, remote) = shared.descriptor(session, &descriptor)?;
         let status = match remote {
            Some(d) => match d.write(&payload).await {
               Ok(()) => GattStatus::Success,
               Err(e) => status_of(&e),
            },
            None => GattStatus::GENERIC_FAILURE,
         };
         Some(TransportEvent::DescriptorWritten {
            peer,
            descriptor,
            status,
         })
      });
   }

   fn set_local_delivery(
      &self,
      session: SessionHandle,
      attribute: &AttributeId,
      enabled: bool,
   ) -> bool {
      let mut sessions = self.shared.sessions.lock();
      let Some(state) = sessions.get_mut(&session) else {
         return false;
      };

      if !enabled {
         if let Some(task) = state.notify_tasks.remove(attribute) {
            task.abort();
         }
         state.toggles.insert(*attribute, DeliveryToggle::Settled);
         return true;
      }

      let Some(characteristic) = state.characteristics.get(attribute).cloned() else {
         return false;
      };
      if state
         .notify_tasks
         .get(attribute)
         .is_some_and(|task| !task.is_finished())
      {
         state.toggles.insert(*attribute, DeliveryToggle::Settled);
         return true;
      }

      let peer = state.peer;
      let attribute = *attribute;
      let events = self.shared.events.clone();
      let (subscribed, outcome) = oneshot::channel();
      let task = self.shared.runtime.spawn(async move {
         let stream = match characteristic.notify().await {
            Ok(stream) => {
               let _ = subscribed.send(Ok(()));
               stream
            },
            Err(e) => {
               warn!("{peer}: failed to subscribe to {attribute}: {e}");
               let _ = subscribed.send(Err(status_of(&e)));
               return;
            },
         };
         futures::pin_mut!(stream);
         while let Some(value) = stream.next().await {
            let event = TransportEvent::CharacteristicChanged {
               peer,
               attribute,
               value: Payload::from_vec(value),
            };
            if events.send(event).await.is_err() {
               break;
            }
         }
         debug!("{peer}: notification stream for {attribute} ended");
      });
      state.notify_tasks.insert(attribute, task);
      state
         .toggles
         .insert(attribute, DeliveryToggle::Subscribing(outcome));
      true
   }

   fn request_mtu(&self, session: SessionHandle, size: u16) {
      self.spawn(move |shared| async move {
         let (peer, characteristic) = {
            let sessions = shared.sessions.lock();
            let state = sessions.get(&session)?;
            (state.peer, state.characteristics.values().next().cloned())
         };
         // BlueZ negotiates the MTU itself; report what it settled on.
         let (status, mtu) = match characteristic {
            Some(c) => match c.mtu().await {
               Ok(negotiated) => {
                  let negotiated = u16::try_from(negotiated).unwrap_or(u16::MAX);
                  (GattStatus::Success, size.min(negotiated))
               },
               Err(e) => (status_of(&e), 0),
            },
            None => (GattStatus::GENERIC_FAILURE, 0),
         };
         Some(TransportEvent::MtuChanged { peer, mtu, status })
      });
   }
}

async fn connect(
   adapter: &Adapter,
   peer: Address,
   timeout: Duration,
) -> std::result::Result<Device, GattStatus> {
   let device = adapter.device(peer).map_err(|e| {
      error!("Unknown device {peer}: {e}");
      status_of(&e)
   })?;

   if device.is_connected().await.unwrap_or(false) {
      debug!("{peer} already connected by bluetoothd");
      return Ok(device);
   }

   info!("Connecting to {peer} (timeout {timeout:?})");
   match time::timeout(timeout, device.connect()).await {
      Ok(Ok(())) => Ok(device),
      Ok(Err(e)) => {
         error!("Failed to connect to {peer}: {e}");
         Err(status_of(&e))
      },
      Err(_) => {
         error!("Connection to {peer} timed out");
         Err(GattStatus::GENERIC_FAILURE)
      },
   }
}

/// Watches the device for a link loss and reports it against `handle`.
async fn spawn_monitor(
   shared: &Arc<Shared>,
   peer: Address,
   handle: SessionHandle,
   device: &Device,
) -> Option<JoinHandle<()>> {
   let mut events = match device.events().await {
      Ok(events) => events,
      Err(e) => {
         warn!("Failed to monitor {peer}: {e}");
         return None;
      },
   };
   let shared = shared.clone();
   Some(tokio::spawn(async move {
      while let Some(event) = events.next().await {
         if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            shared
               .post(TransportEvent::Disconnected {
                  peer,
                  session: Some(handle),
                  status: GattStatus::Success,
               })
               .await;
            return;
         }
      }
   }))
}

struct Discovered {
   tree: AttributeTree,
   characteristics: HashMap<AttributeId, Characteristic>,
   descriptors: HashMap<DescriptorId, RemoteDescriptor>,
}

/// Waits for bluetoothd to finish resolving services; `false` on timeout.
async fn services_resolved(device: &Device) -> bluer::Result<bool> {
   let deadline = Instant::now() + SERVICES_RESOLVE_TIMEOUT;
   while !device.is_services_resolved().await? {
      if Instant::now() >= deadline {
         return Ok(false);
      }
      time::sleep(SERVICES_RESOLVE_POLL).await;
   }
   Ok(true)
}

async fn discover(device: &Device) -> bluer::Result<Discovered> {
   let mut containers = Vec::new();
   let mut characteristics = HashMap::new();
   let mut descriptors = HashMap::new();

   for service in device.services().await? {
      let container = service.uuid().await?;
      let mut attributes = Vec::new();

      for characteristic in service.characteristics().await? {
         let uuid = characteristic.uuid().await?;
         let flags = characteristic.flags().await?;
         let mut props = Properties::empty();
         props.set(Properties::BROADCAST, flags.broadcast);
         props.set(Properties::READ, flags.read);
         props.set(Properties::WRITE_WITHOUT_RESPONSE, flags.write_without_response);
         props.set(Properties::WRITE, flags.write);
         props.set(Properties::NOTIFY, flags.notify);
         props.set(Properties::INDICATE, flags.indicate);

         let id = AttributeId::in_container(container, uuid);
         let mut owned = Vec::new();
         for descriptor in characteristic.descriptors().await? {
            let duuid = descriptor.uuid().await?;
            let dflags = descriptor.flags().await?;
            owned.push(Descriptor {
               uuid: duuid,
               props: DescriptorProperties::new(dflags.read, dflags.write),
            });
            descriptors
               .entry(DescriptorId::new(id, duuid))
               .or_insert(descriptor);
         }

         attributes.push(Attribute {
            uuid,
            props,
            descriptors: owned,
         });
         characteristics.entry(id).or_insert(characteristic);
      }

      containers.push(Container {
         uuid: container,
         attributes,
      });
   }

   Ok(Discovered {
      tree: AttributeTree::new(containers),
      characteristics,
      descriptors,
   })
}

fn status_of(error: &bluer::Error) -> GattStatus {
   match error.kind {
      ErrorKind::NotPermitted | ErrorKind::NotAuthorized => GattStatus::PermissionDenied,
      _ => GattStatus::GENERIC_FAILURE,
   }
}
