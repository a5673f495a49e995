//! FIFO of pending operations with a single in-flight slot.
//!
//! The queue only tracks state; dispatching a promoted operation is the
//! caller's job. Every mutation of the slot and the pending list happens
//! under one lock, so at most one operation is ever promoted at a time.

use std::{
   collections::VecDeque,
   fmt,
   time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::gatt::operation::Operation;

/// Sequence number assigned to every accepted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "op#{}", self.0)
   }
}

/// The operation currently owning the transport.
#[derive(Debug, Clone)]
pub struct InFlight {
   pub id: OperationId,
   pub operation: Operation,
   pub since: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
   next_id: u64,
   pending: VecDeque<(OperationId, Operation)>,
   in_flight: Option<InFlight>,
}

impl QueueState {
   fn promote(&mut self) -> Option<InFlight> {
      debug_assert!(self.in_flight.is_none());
      let (id, operation) = self.pending.pop_front()?;
      let promoted = InFlight {
         id,
         operation,
         since: Instant::now(),
      };
      self.in_flight = Some(promoted.clone());
      Some(promoted)
   }
}

#[derive(Debug, Default)]
pub struct OperationQueue {
   state: Mutex<QueueState>,
}

impl OperationQueue {
   pub fn new() -> Self {
      Self::default()
   }

   /// Appends `operation` to the tail.
   ///
   /// If nothing was in flight the head is promoted and returned; the caller
   /// must dispatch it.
   pub fn submit(&self, operation: Operation) -> (OperationId, Option<InFlight>) {
      let mut state = self.state.lock();
      let id = OperationId(state.next_id);
      state.next_id += 1;
      debug!("Queued {id}: {operation}");
      state.pending.push_back((id, operation));
      let promoted = if state.in_flight.is_none() {
         state.promote()
      } else {
         None
      };
      (id, promoted)
   }

   /// Releases the slot held by `id` and promotes the next head, if any.
   ///
   /// Completing an id that is not in flight is a no-op, so duplicate or
   /// late completions can never release somebody else's slot.
   pub fn complete(&self, id: OperationId) -> Option<InFlight> {
      let mut state = self.state.lock();
      match &state.in_flight {
         Some(current) if current.id == id => {
            debug!(
               "Completed {id} after {:?}",
               current.since.elapsed()
            );
            state.in_flight = None;
            state.promote()
         },
         Some(current) => {
            warn!("Ignoring completion of {id}, {} is in flight", current.id);
            None
         },
         None => {
            warn!("Ignoring completion of {id}, nothing in flight");
            None
         },
      }
   }

   pub fn in_flight(&self) -> Option<InFlight> {
      self.state.lock().in_flight.clone()
   }

   /// The in-flight operation, if it was dispatched longer than `max_age` ago.
   pub fn stalled(&self, max_age: Duration) -> Option<InFlight> {
      self
         .state
         .lock()
         .in_flight
         .as_ref()
         .filter(|f| f.since.elapsed() >= max_age)
         .cloned()
   }

   /// Snapshot of the operations waiting behind the in-flight one.
   pub fn pending(&self) -> Vec<Operation> {
      self
         .state
         .lock()
         .pending
         .iter()
         .map(|(_, op)| op.clone())
         .collect()
   }

   pub fn len(&self) -> usize {
      self.state.lock().pending.len()
   }

   pub fn is_empty(&self) -> bool {
      self.state.lock().pending.is_empty()
   }

   /// No operation pending or in flight.
   pub fn is_idle(&self) -> bool {
      let state = self.state.lock();
      state.in_flight.is_none() && state.pending.is_empty()
   }
}

#[cfg(test)]
mod tests {
   use std::{
      sync::{
         Arc,
         atomic::{AtomicBool, AtomicUsize, Ordering},
      },
      thread,
   };

   use bluer::Address;

   use super::*;

   fn mtu(size: u16) -> Operation {
      Operation::MtuRequest {
         peer: Address::any(),
         size,
      }
   }

   fn size_of(op: &Operation) -> u16 {
      match op {
         Operation::MtuRequest { size, .. } => *size,
         other => panic!("unexpected {other}"),
      }
   }

   #[test]
   fn test_submit_promotes_only_when_idle() {
      let queue = OperationQueue::new();
      let (first, promoted) = queue.submit(mtu(1));
      assert_eq!(promoted.map(|f| f.id), Some(first));
      let (second, promoted) = queue.submit(mtu(2));
      assert!(promoted.is_none());
      assert_eq!(queue.len(), 1);

      let next = queue.complete(first).unwrap();
      assert_eq!(next.id, second);
      assert!(queue.is_empty());
      assert!(!queue.is_idle());

      assert!(queue.complete(second).is_none());
      assert!(queue.is_idle());
   }

   #[test]
   fn test_stale_completion_is_ignored() {
      let queue = OperationQueue::new();
      let (first, _) = queue.submit(mtu(1));
      let (second, _) = queue.submit(mtu(2));
      assert!(queue.complete(second).is_none());
      assert_eq!(queue.in_flight().map(|f| f.id), Some(first));

      assert!(queue.complete(first).is_some());
      assert!(queue.complete(first).is_none());
      assert_eq!(queue.in_flight().map(|f| f.id), Some(second));
   }

   #[test]
   fn test_stalled_reports_old_in_flight() {
      let queue = OperationQueue::new();
      assert!(queue.stalled(Duration::ZERO).is_none());
      let (id, _) = queue.submit(mtu(1));
      assert_eq!(queue.stalled(Duration::ZERO).map(|f| f.id), Some(id));
      assert!(queue.stalled(Duration::from_secs(3600)).is_none());
   }

   #[test]
   fn test_concurrent_submit_keeps_fifo_and_single_slot() {
      const THREADS: u16 = 8;
      const PER_THREAD: u16 = 50;

      let queue = Arc::new(OperationQueue::new());
      // Establishes a total submission order across threads.
      let sequence = Arc::new(Mutex::new(0u16));
      let outstanding = Arc::new(AtomicUsize::new(0));
      let promoted = Arc::new(Mutex::new(Vec::new()));
      let done = Arc::new(AtomicBool::new(false));

      let producers: Vec<_> = (0..THREADS)
         .map(|_| {
            let queue = queue.clone();
            let sequence = sequence.clone();
            let outstanding = outstanding.clone();
            let promoted = promoted.clone();
            thread::spawn(move || {
               for _ in 0..PER_THREAD {
                  let mut seq = sequence.lock();
                  let (_, head) = queue.submit(mtu(*seq));
                  *seq += 1;
                  drop(seq);
                  if let Some(head) = head {
                     assert_eq!(outstanding.fetch_add(1, Ordering::SeqCst), 0);
                     promoted.lock().push(head);
                  }
               }
            })
         })
         .collect();

      let completer = {
         let queue = queue.clone();
         let outstanding = outstanding.clone();
         let promoted = promoted.clone();
         let done = done.clone();
         thread::spawn(move || {
            let mut order = Vec::new();
            loop {
               let head = promoted.lock().pop();
               match head {
                  Some(head) => {
                     order.push(size_of(&head.operation));
                     outstanding.fetch_sub(1, Ordering::SeqCst);
                     if let Some(next) = queue.complete(head.id) {
                        assert_eq!(outstanding.fetch_add(1, Ordering::SeqCst), 0);
                        promoted.lock().push(next);
                     }
                  },
                  None if done.load(Ordering::SeqCst) && queue.is_idle() => break,
                  None => thread::yield_now(),
               }
            }
            order
         })
      };

      for producer in producers {
         producer.join().unwrap();
      }
      done.store(true, Ordering::SeqCst);
      let order = completer.join().unwrap();

      let expected: Vec<u16> = (0..THREADS * PER_THREAD).collect();
      assert_eq!(order, expected);
      assert!(queue.is_idle());
   }
}
