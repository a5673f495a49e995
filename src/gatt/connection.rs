//! Table of live sessions, keyed by peer.
//!
//! Presence of an entry is the definition of "connected". Lookups happen on
//! request-validation paths outside the queue lock, so the table carries its
//! own lock.

use std::{collections::HashMap, sync::Arc};

use bluer::Address;
use parking_lot::RwLock;

use crate::{
   bluetooth::transport::SessionHandle,
   gatt::{attribute::AttributeTree, operation::MIN_MTU},
};

/// State kept for one connected peer.
#[derive(Debug, Clone)]
pub struct Session {
   pub handle: SessionHandle,
   /// Attribute tree, once discovery has succeeded.
   pub attributes: Option<Arc<AttributeTree>>,
   /// Last negotiated MTU.
   pub mtu: u16,
}

impl Session {
   const fn new(handle: SessionHandle) -> Self {
      Self {
         handle,
         attributes: None,
         mtu: MIN_MTU,
      }
   }
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
   sessions: RwLock<HashMap<Address, Session>>,
}

impl ConnectionTable {
   pub fn new() -> Self {
      Self::default()
   }

   /// Records a newly opened session, returning the entry it replaced.
   pub fn insert(&self, peer: Address, handle: SessionHandle) -> Option<Session> {
      self.sessions.write().insert(peer, Session::new(handle))
   }

   pub fn remove(&self, peer: Address) -> Option<Session> {
      self.sessions.write().remove(&peer)
   }

   pub fn get(&self, peer: Address) -> Option<Session> {
      self.sessions.read().get(&peer).cloned()
   }

   pub fn handle(&self, peer: Address) -> Option<SessionHandle> {
      self.sessions.read().get(&peer).map(|s| s.handle)
   }

   pub fn contains(&self, peer: Address) -> bool {
      self.sessions.read().contains_key(&peer)
   }

   /// Stores the discovered tree. Returns it shared, or `None` if the peer
   /// is no longer connected.
   pub fn set_attributes(&self, peer: Address, tree: AttributeTree) -> Option<Arc<AttributeTree>> {
      let mut sessions = self.sessions.write();
      let session = sessions.get_mut(&peer)?;
      let tree = Arc::new(tree);
      session.attributes = Some(tree.clone());
      Some(tree)
   }

   pub fn attributes(&self, peer: Address) -> Option<Arc<AttributeTree>> {
      self
         .sessions
         .read()
         .get(&peer)
         .and_then(|s| s.attributes.clone())
   }

   pub fn set_mtu(&self, peer: Address, mtu: u16) -> bool {
      match self.sessions.write().get_mut(&peer) {
         Some(session) => {
            session.mtu = mtu;
            true
         },
         None => false,
      }
   }

   pub fn mtu(&self, peer: Address) -> Option<u16> {
      self.sessions.read().get(&peer).map(|s| s.mtu)
   }

   pub fn peers(&self) -> Vec<Address> {
      self.sessions.read().keys().copied().collect()
   }

   pub fn len(&self) -> usize {
      self.sessions.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.sessions.read().is_empty()
   }
}
