//! Attribute tree discovered on a peer and the capability predicates used to
//! validate requests against it.
//!
//! A peer exposes containers (GATT services) holding attributes
//! (characteristics), each of which may own descriptors. The same attribute
//! UUID can appear under several containers, so lookups accept an optional
//! container UUID for disambiguation.

use std::fmt;

use bluer::Address;
use log::debug;
use serde_json::json;
use uuid::Uuid;

use crate::gatt::operation::WriteMode;

/// Delivery-configuration descriptor (Client Characteristic Configuration).
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Delivery-configuration values defined by the protocol.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Identifies an attribute, optionally scoped to its owning container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeId {
   pub container: Option<Uuid>,
   pub uuid: Uuid,
}

impl AttributeId {
   pub const fn new(uuid: Uuid) -> Self {
      Self {
         container: None,
         uuid,
      }
   }

   pub const fn in_container(container: Uuid, uuid: Uuid) -> Self {
      Self {
         container: Some(container),
         uuid,
      }
   }

   /// Whether this id selects the attribute `uuid` living under `container`.
   pub fn matches(&self, container: Uuid, uuid: Uuid) -> bool {
      self.uuid == uuid && self.container.is_none_or(|c| c == container)
   }

   /// Whether a request for `self` covers the attribute reported as `other`.
   pub fn selects(&self, other: &Self) -> bool {
      self.uuid == other.uuid && (self.container.is_none() || self.container == other.container)
   }
}

impl From<Uuid> for AttributeId {
   fn from(uuid: Uuid) -> Self {
      Self::new(uuid)
   }
}

impl fmt::Display for AttributeId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.container {
         Some(container) => write!(f, "{container}/{}", self.uuid),
         None => write!(f, "{}", self.uuid),
      }
   }
}

/// Identifies a descriptor by its owning attribute and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId {
   pub attribute: AttributeId,
   pub uuid: Uuid,
}

impl DescriptorId {
   pub const fn new(attribute: AttributeId, uuid: Uuid) -> Self {
      Self { attribute, uuid }
   }

   /// The delivery-configuration descriptor of `attribute`.
   pub const fn cccd(attribute: AttributeId) -> Self {
      Self::new(attribute, CCCD_UUID)
   }

   pub fn is_cccd(&self) -> bool {
      self.uuid == CCCD_UUID
   }

   pub fn selects(&self, other: &Self) -> bool {
      self.uuid == other.uuid && self.attribute.selects(&other.attribute)
   }
}

impl fmt::Display for DescriptorId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}/{}", self.attribute, self.uuid)
   }
}

/// Operation flags supported by an attribute.
///
/// Bit values follow the GATT characteristic properties field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Properties(u8);

bitflags::bitflags! {
   impl Properties: u8 {
      const BROADCAST = 1 << 0;
      const READ = 1 << 1;
      const WRITE_WITHOUT_RESPONSE = 1 << 2;
      const WRITE = 1 << 3;
      const NOTIFY = 1 << 4;
      const INDICATE = 1 << 5;
   }
}

impl Properties {
   pub const fn is_readable(self) -> bool {
      self.contains(Self::READ)
   }

   pub const fn is_writable(self) -> bool {
      self.contains(Self::WRITE)
   }

   pub const fn is_writable_without_response(self) -> bool {
      self.contains(Self::WRITE_WITHOUT_RESPONSE)
   }

   pub const fn is_notifiable(self) -> bool {
      self.contains(Self::NOTIFY)
   }

   pub const fn is_indicatable(self) -> bool {
      self.contains(Self::INDICATE)
   }

   /// Whether change delivery can be enabled in any mode.
   pub const fn supports_delivery(self) -> bool {
      self.intersects(Self::NOTIFY.union(Self::INDICATE))
   }

   pub const fn supports(self, mode: WriteMode) -> bool {
      match mode {
         WriteMode::WithResponse => self.is_writable(),
         WriteMode::WithoutResponse => self.is_writable_without_response(),
      }
   }

   /// Preferred write mode, acknowledged writes first.
   pub const fn preferred_write_mode(self) -> Option<WriteMode> {
      if self.is_writable() {
         Some(WriteMode::WithResponse)
      } else if self.is_writable_without_response() {
         Some(WriteMode::WithoutResponse)
      } else {
         None
      }
   }

   /// Delivery-configuration value that enables change delivery.
   ///
   /// Indications win over notifications when both are supported.
   pub const fn delivery_enable_value(self) -> Option<[u8; 2]> {
      if self.is_indicatable() {
         Some(ENABLE_INDICATION_VALUE)
      } else if self.is_notifiable() {
         Some(ENABLE_NOTIFICATION_VALUE)
      } else {
         None
      }
   }
}

impl fmt::Display for Properties {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.is_empty() {
         return f.write_str("EMPTY");
      }
      for (i, (name, _)) in self.iter_names().enumerate() {
         if i > 0 {
            f.write_str(", ")?;
         }
         f.write_str(name)?;
      }
      Ok(())
   }
}

/// Operation flags supported by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DescriptorProperties {
   pub read: bool,
   pub write: bool,
}

impl DescriptorProperties {
   pub const fn new(read: bool, write: bool) -> Self {
      Self { read, write }
   }

   pub const fn is_readable(self) -> bool {
      self.read
   }

   pub const fn is_writable(self) -> bool {
      self.write
   }
}

impl fmt::Display for DescriptorProperties {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match (self.read, self.write) {
         (true, true) => f.write_str("READABLE, WRITABLE"),
         (true, false) => f.write_str("READABLE"),
         (false, true) => f.write_str("WRITABLE"),
         (false, false) => f.write_str("EMPTY"),
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
   pub uuid: Uuid,
   pub props: DescriptorProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
   pub uuid: Uuid,
   pub props: Properties,
   pub descriptors: Vec<Descriptor>,
}

impl Attribute {
   pub fn descriptor(&self, uuid: Uuid) -> Option<&Descriptor> {
      self.descriptors.iter().find(|d| d.uuid == uuid)
   }

   pub fn has_cccd(&self) -> bool {
      self.descriptor(CCCD_UUID).is_some()
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
   pub uuid: Uuid,
   pub attributes: Vec<Attribute>,
}

/// The attribute tree exposed by one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTree {
   containers: Vec<Container>,
}

/// An attribute located in the tree, with its fully qualified id.
#[derive(Debug, Clone, Copy)]
pub struct Located<'a> {
   pub id: AttributeId,
   pub attribute: &'a Attribute,
}

impl AttributeTree {
   pub const fn new(containers: Vec<Container>) -> Self {
      Self { containers }
   }

   pub fn containers(&self) -> &[Container] {
      &self.containers
   }

   pub fn is_empty(&self) -> bool {
      self.containers.iter().all(|c| c.attributes.is_empty())
   }

   /// Finds the first attribute matching `id`, in discovery order.
   pub fn find(&self, id: &AttributeId) -> Option<Located<'_>> {
      self.containers.iter().find_map(|container| {
         container
            .attributes
            .iter()
            .find(|a| id.matches(container.uuid, a.uuid))
            .map(|attribute| Located {
               id: AttributeId::in_container(container.uuid, attribute.uuid),
               attribute,
            })
      })
   }

   /// Finds a descriptor together with its owning attribute.
   pub fn find_descriptor(&self, id: &DescriptorId) -> Option<(Located<'_>, &Descriptor)> {
      let located = self.find(&id.attribute)?;
      let descriptor = located.attribute.descriptor(id.uuid)?;
      Some((located, descriptor))
   }

   pub fn to_json(&self) -> serde_json::Value {
      let containers: Vec<_> = self
         .containers
         .iter()
         .map(|container| {
            let attributes: Vec<_> = container
               .attributes
               .iter()
               .map(|attribute| {
                  let descriptors: Vec<_> = attribute
                     .descriptors
                     .iter()
                     .map(|d| {
                        json!({
                           "uuid": d.uuid.to_string(),
                           "readable": d.props.is_readable(),
                           "writable": d.props.is_writable(),
                        })
                     })
                     .collect();
                  json!({
                     "uuid": attribute.uuid.to_string(),
                     "properties": attribute.props.bits(),
                     "descriptors": descriptors,
                  })
               })
               .collect();
            json!({
               "uuid": container.uuid.to_string(),
               "attributes": attributes,
            })
         })
         .collect();
      json!(containers)
   }

   /// Logs the whole tree, one line per node.
   pub fn log_table(&self, peer: Address) {
      if self.containers.is_empty() {
         debug!("{peer}: no containers discovered");
         return;
      }
      for container in &self.containers {
         debug!("{peer}: container {}", container.uuid);
         for attribute in &container.attributes {
            debug!("{peer}:   attribute {} [{}]", attribute.uuid, attribute.props);
            for descriptor in &attribute.descriptors {
               debug!("{peer}:     descriptor {} [{}]", descriptor.uuid, descriptor.props);
            }
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const SVC_A: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
   const SVC_B: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
   const CHR: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

   fn attribute(props: Properties, cccd: bool) -> Attribute {
      Attribute {
         uuid: CHR,
         props,
         descriptors: cccd
            .then(|| Descriptor {
               uuid: CCCD_UUID,
               props: DescriptorProperties::new(true, true),
            })
            .into_iter()
            .collect(),
      }
   }

   #[test]
   fn test_property_predicates() {
      let props = Properties::READ | Properties::NOTIFY;
      assert!(props.is_readable());
      assert!(props.is_notifiable());
      assert!(!props.is_indicatable());
      assert!(!props.is_writable());
      assert!(!props.supports(WriteMode::WithResponse));
      assert!(props.supports_delivery());
      assert_eq!(props.preferred_write_mode(), None);

      let props = Properties::WRITE_WITHOUT_RESPONSE;
      assert!(props.supports(WriteMode::WithoutResponse));
      assert!(!props.supports(WriteMode::WithResponse));
      assert_eq!(props.preferred_write_mode(), Some(WriteMode::WithoutResponse));

      let props = Properties::WRITE | Properties::WRITE_WITHOUT_RESPONSE;
      assert_eq!(props.preferred_write_mode(), Some(WriteMode::WithResponse));
   }

   #[test]
   fn test_indicate_takes_precedence() {
      assert_eq!(
         (Properties::NOTIFY | Properties::INDICATE).delivery_enable_value(),
         Some(ENABLE_INDICATION_VALUE)
      );
      assert_eq!(
         Properties::NOTIFY.delivery_enable_value(),
         Some(ENABLE_NOTIFICATION_VALUE)
      );
      assert_eq!(Properties::READ.delivery_enable_value(), None);
   }

   #[test]
   fn test_properties_display() {
      assert_eq!(Properties::empty().to_string(), "EMPTY");
      assert_eq!(
         (Properties::READ | Properties::INDICATE).to_string(),
         "READ, INDICATE"
      );
      assert_eq!(
         (Properties::WRITE_WITHOUT_RESPONSE | Properties::BROADCAST).to_string(),
         "BROADCAST, WRITE_WITHOUT_RESPONSE"
      );
   }

   #[test]
   fn test_find_disambiguates_by_container() {
      let tree = AttributeTree::new(vec![
         Container {
            uuid: SVC_A,
            attributes: vec![attribute(Properties::READ, false)],
         },
         Container {
            uuid: SVC_B,
            attributes: vec![attribute(Properties::WRITE, true)],
         },
      ]);

      let first = tree.find(&AttributeId::new(CHR)).unwrap();
      assert_eq!(first.id, AttributeId::in_container(SVC_A, CHR));
      assert!(first.attribute.props.is_readable());

      let scoped = tree.find(&AttributeId::in_container(SVC_B, CHR)).unwrap();
      assert_eq!(scoped.id.container, Some(SVC_B));
      assert!(scoped.attribute.props.is_writable());
      assert!(scoped.attribute.has_cccd());

      let missing = AttributeId::in_container(Uuid::nil(), CHR);
      assert!(tree.find(&missing).is_none());
   }

   #[test]
   fn test_request_selects_reported_attribute() {
      let reported = AttributeId::in_container(SVC_A, CHR);
      assert!(AttributeId::new(CHR).selects(&reported));
      assert!(reported.selects(&reported));
      assert!(!AttributeId::in_container(SVC_B, CHR).selects(&reported));
      assert!(!AttributeId::new(Uuid::nil()).selects(&reported));

      let cccd = DescriptorId::cccd(reported);
      assert!(DescriptorId::cccd(AttributeId::new(CHR)).selects(&cccd));
      assert!(!DescriptorId::new(AttributeId::new(CHR), Uuid::nil()).selects(&cccd));
   }

   #[test]
   fn test_find_descriptor() {
      let tree = AttributeTree::new(vec![Container {
         uuid: SVC_A,
         attributes: vec![attribute(Properties::NOTIFY, true)],
      }]);
      let id = DescriptorId::cccd(AttributeId::new(CHR));
      assert!(id.is_cccd());
      let (located, descriptor) = tree.find_descriptor(&id).unwrap();
      assert_eq!(located.id.container, Some(SVC_A));
      assert!(descriptor.props.is_writable());

      let other = DescriptorId::new(AttributeId::new(CHR), Uuid::nil());
      assert!(tree.find_descriptor(&other).is_none());
      assert!(!tree.is_empty());
      assert!(AttributeTree::default().is_empty());
   }

   #[test]
   fn test_tree_json() {
      let tree = AttributeTree::new(vec![Container {
         uuid: SVC_A,
         attributes: vec![attribute(Properties::READ | Properties::NOTIFY, true)],
      }]);
      let json = tree.to_json();
      assert_eq!(json[0]["uuid"], SVC_A.to_string());
      assert_eq!(json[0]["attributes"][0]["properties"], 0x12);
      assert_eq!(
         json[0]["attributes"][0]["descriptors"][0]["uuid"],
         CCCD_UUID.to_string()
      );
   }
}
