//! Operation descriptors accepted by the connection manager.

use std::{fmt, time::Duration};

use bluer::Address;
use smallvec::SmallVec;

use crate::gatt::attribute::{AttributeId, DescriptorId};

/// Value written to or read from an attribute. Compared by content.
pub type Payload = SmallVec<[u8; 32]>;

/// Smallest ATT MTU every peer must accept.
pub const MIN_MTU: u16 = 23;
/// Largest ATT MTU a peer may negotiate.
pub const MAX_MTU: u16 = 517;

/// Clamps a requested MTU into `[MIN_MTU, MAX_MTU]`.
pub const fn clamp_mtu(size: u16) -> u16 {
   if size < MIN_MTU {
      MIN_MTU
   } else if size > MAX_MTU {
      MAX_MTU
   } else {
      size
   }
}

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum WriteMode {
   #[strum(serialize = "with-response")]
   WithResponse,
   #[strum(serialize = "without-response")]
   WithoutResponse,
}

/// Parameters for opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionContext {
   pub connect_timeout: Duration,
}

impl Default for SessionContext {
   fn default() -> Self {
      Self {
         connect_timeout: Duration::from_secs(10),
      }
   }
}

/// One logical request against a peer.
#[derive(Debug, Clone, PartialEq, Eq, strum::EnumDiscriminants)]
#[strum_discriminants(name(OperationKind), derive(Hash, strum::Display))]
pub enum Operation {
   Connect {
      peer: Address,
      context: SessionContext,
   },
   Disconnect {
      peer: Address,
   },
   CharacteristicRead {
      peer: Address,
      attribute: AttributeId,
   },
   CharacteristicWrite {
      peer: Address,
      attribute: AttributeId,
      mode: WriteMode,
      payload: Payload,
   },
   DescriptorRead {
      peer: Address,
      descriptor: DescriptorId,
   },
   DescriptorWrite {
      peer: Address,
      descriptor: DescriptorId,
      payload: Payload,
   },
   EnableNotifications {
      peer: Address,
      attribute: AttributeId,
   },
   DisableNotifications {
      peer: Address,
      attribute: AttributeId,
   },
   MtuRequest {
      peer: Address,
      size: u16,
   },
}

impl Operation {
   pub const fn peer(&self) -> Address {
      match self {
         Self::Connect { peer, .. }
         | Self::Disconnect { peer }
         | Self::CharacteristicRead { peer, .. }
         | Self::CharacteristicWrite { peer, .. }
         | Self::DescriptorRead { peer, .. }
         | Self::DescriptorWrite { peer, .. }
         | Self::EnableNotifications { peer, .. }
         | Self::DisableNotifications { peer, .. }
         | Self::MtuRequest { peer, .. } => *peer,
      }
   }

   pub fn kind(&self) -> OperationKind {
      self.into()
   }

   /// Whether the operation may be queued for a peer that has no session.
   pub const fn requires_session(&self) -> bool {
      !matches!(self, Self::Connect { .. })
   }
}

impl fmt::Display for Operation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let peer = self.peer();
      match self {
         Self::Connect { .. } | Self::Disconnect { .. } => write!(f, "{}({peer})", self.kind()),
         Self::CharacteristicRead { attribute, .. }
         | Self::EnableNotifications { attribute, .. }
         | Self::DisableNotifications { attribute, .. } => {
            write!(f, "{}({peer}, {attribute})", self.kind())
         },
         Self::CharacteristicWrite {
            attribute,
            mode,
            payload,
            ..
         } => write!(
            f,
            "{}({peer}, {attribute}, {mode}, {})",
            self.kind(),
            hex::encode(payload)
         ),
         Self::DescriptorRead { descriptor, .. } => {
            write!(f, "{}({peer}, {descriptor})", self.kind())
         },
         Self::DescriptorWrite {
            descriptor,
            payload,
            ..
         } => write!(
            f,
            "{}({peer}, {descriptor}, {})",
            self.kind(),
            hex::encode(payload)
         ),
         Self::MtuRequest { size, .. } => write!(f, "{}({peer}, {size})", self.kind()),
      }
   }
}
