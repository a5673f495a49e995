//! Keeps auto-connect peers connected.
//!
//! Peers are checked on a fixed tick. A peer that is neither connected nor
//! waiting on a queued connect gets a new connect request once its backoff
//! has elapsed. Failed attempts produce no event, so polling is what notices
//! them.

use std::{
   collections::HashMap,
   sync::Arc,
   time::{Duration, Instant},
};

use bluer::Address;
use log::{debug, info, warn};
use rand::Rng;
use tokio::time::{self, MissedTickBehavior};

use crate::gatt::{
   manager::ConnectionManager,
   operation::{Operation, SessionContext},
};

/// Interval between connection checks
const CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum reconnect delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
struct Backoff {
   attempts: u32,
   next_at: Instant,
}

pub struct Reconnector {
   manager: Arc<ConnectionManager>,
   peers: Vec<Address>,
   context: SessionContext,
   base_delay: Duration,
   backoff: HashMap<Address, Backoff>,
}

impl Reconnector {
   pub fn new(
      manager: Arc<ConnectionManager>,
      peers: Vec<Address>,
      context: SessionContext,
      base_delay: Duration,
   ) -> Self {
      Self {
         manager,
         peers,
         context,
         base_delay,
         backoff: HashMap::new(),
      }
   }

   pub async fn run(mut self) {
      if self.peers.is_empty() {
         return;
      }
      info!("Keeping {} peer(s) connected", self.peers.len());
      let mut interval = time::interval(CHECK_INTERVAL);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
         interval.tick().await;
         self.check(Instant::now());
      }
   }

   /// Issues connect requests for every peer that is due at `now`.
   fn check(&mut self, now: Instant) {
      for &peer in &self.peers {
         if self.manager.is_connected(peer) {
            if self.backoff.remove(&peer).is_some() {
               debug!("{peer} connected, resetting backoff");
            }
            continue;
         }
         if connect_queued(&self.manager, peer) {
            continue;
         }

         let backoff = self.backoff.entry(peer).or_insert(Backoff {
            attempts: 0,
            next_at: now,
         });
         if now < backoff.next_at {
            continue;
         }

         match self.manager.connect(peer, self.context) {
            Ok(id) => info!("Reconnecting {peer} ({id}, attempt {})", backoff.attempts + 1),
            Err(e) => warn!("Failed to queue connect for {peer}: {e}"),
         }
         backoff.next_at = now + calc_retry_delay(self.base_delay, backoff.attempts);
         backoff.attempts = backoff.attempts.saturating_add(1);
      }
   }
}

fn connect_queued(manager: &ConnectionManager, peer: Address) -> bool {
   let is_connect = |op: &Operation| matches!(op, Operation::Connect { peer: p, .. } if *p == peer);
   manager.in_flight().is_some_and(|f| is_connect(&f.operation))
      || manager.pending_operations().iter().any(is_connect)
}

fn calc_retry_delay(base_delay: Duration, retry_count: u32) -> Duration {
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
