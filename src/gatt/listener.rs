//! Registry of weakly held listeners.
//!
//! The registry never keeps a listener alive: once every strong reference
//! held by the application is gone, the entry is pruned on the next
//! registration or notification pass.

use std::{
   ptr,
   sync::{Arc, Weak},
};

use log::trace;
use parking_lot::Mutex;

use crate::event::{GattEvent, GattListener};

#[derive(Default)]
pub struct ListenerRegistry {
   listeners: Mutex<Vec<Weak<dyn GattListener>>>,
}

fn same_listener(a: &Weak<dyn GattListener>, b: &Weak<dyn GattListener>) -> bool {
   ptr::addr_eq(a.as_ptr(), b.as_ptr())
}

impl ListenerRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Registers `listener`. Returns `false` if it was already registered.
   pub fn register<L: GattListener + 'static>(&self, listener: &Arc<L>) -> bool {
      let weak: Weak<L> = Arc::downgrade(listener);
      let weak: Weak<dyn GattListener> = weak;
      self.register_weak(weak)
   }

   pub fn register_weak(&self, listener: Weak<dyn GattListener>) -> bool {
      let mut listeners = self.listeners.lock();
      listeners.retain(|l| l.strong_count() > 0);
      if listeners.iter().any(|l| same_listener(l, &listener)) {
         return false;
      }
      listeners.push(listener);
      true
   }

   /// Removes `listener` if present. Idempotent.
   pub fn unregister<L: GattListener + 'static>(&self, listener: &Arc<L>) -> bool {
      let weak: Weak<L> = Arc::downgrade(listener);
      let weak: Weak<dyn GattListener> = weak;
      let mut listeners = self.listeners.lock();
      let before = listeners.len();
      listeners.retain(|l| !same_listener(l, &weak));
      listeners.len() != before
   }

   /// Number of listeners that are still alive.
   pub fn len(&self) -> usize {
      self
         .listeners
         .lock()
         .iter()
         .filter(|l| l.strong_count() > 0)
         .count()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Delivers `event` to every live listener.
   ///
   /// Dead entries are pruned first; hooks run on a snapshot, outside the
   /// registry lock, so a hook may register or unregister listeners.
   pub fn notify_all(&self, event: &GattEvent) {
      let snapshot: Vec<Arc<dyn GattListener>> = {
         let mut listeners = self.listeners.lock();
         listeners.retain(|l| l.strong_count() > 0);
         listeners.iter().filter_map(Weak::upgrade).collect()
      };
      trace!(
         "Delivering {} for {} to {} listeners",
         event.kind(),
         event.peer(),
         snapshot.len()
      );
      for listener in &snapshot {
         event.deliver(listener.as_ref());
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use bluer::Address;
   use std::sync::atomic::{AtomicUsize, Ordering};

   #[derive(Default)]
   struct Counter {
      disconnects: AtomicUsize,
   }

   impl GattListener for Counter {
      fn on_disconnected(&self, _peer: Address) {
         self.disconnects.fetch_add(1, Ordering::Relaxed);
      }
   }

   struct Silent;

   impl GattListener for Silent {}

   fn disconnected() -> GattEvent {
      GattEvent::Disconnected {
         peer: Address::any(),
      }
   }

   #[test]
   fn test_register_is_identity_based() {
      let registry = ListenerRegistry::new();
      let a = Arc::new(Counter::default());
      let b = Arc::new(Counter::default());
      assert!(registry.register(&a));
      assert!(!registry.register(&a));
      assert!(registry.register(&b));
      assert_eq!(registry.len(), 2);

      registry.notify_all(&disconnected());
      assert_eq!(a.disconnects.load(Ordering::Relaxed), 1);
      assert_eq!(b.disconnects.load(Ordering::Relaxed), 1);
   }

   #[test]
   fn test_unregister_is_idempotent() {
      let registry = ListenerRegistry::new();
      let a = Arc::new(Counter::default());
      assert!(!registry.unregister(&a));
      registry.register(&a);
      assert!(registry.unregister(&a));
      assert!(!registry.unregister(&a));
      assert!(registry.is_empty());

      registry.notify_all(&disconnected());
      assert_eq!(a.disconnects.load(Ordering::Relaxed), 0);
   }

   #[test]
   fn test_dropped_listener_is_pruned() {
      let registry = ListenerRegistry::new();
      let kept = Arc::new(Counter::default());
      registry.register(&kept);
      {
         let dropped = Arc::new(Counter::default());
         registry.register(&dropped);
         assert_eq!(registry.len(), 2);
      }
      assert_eq!(registry.len(), 1);
      registry.notify_all(&disconnected());
      assert_eq!(registry.listeners.lock().len(), 1);
      assert_eq!(kept.disconnects.load(Ordering::Relaxed), 1);
   }

   #[test]
   fn test_missing_hooks_are_skipped() {
      let registry = ListenerRegistry::new();
      let silent = Arc::new(Silent);
      registry.register(&silent);
      registry.notify_all(&GattEvent::MtuChanged {
         peer: Address::any(),
         mtu: 247,
      });
      assert_eq!(registry.len(), 1);
   }
}
