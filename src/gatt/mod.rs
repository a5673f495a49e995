//! GATT operation sequencing.
//!
//! Requests are validated by the [`manager::ConnectionManager`], serialized
//! through the [`queue::OperationQueue`] against a single in-flight slot, and
//! resolved by the [`router`] as transport events arrive.

pub mod attribute;
pub mod connection;
pub mod listener;
pub mod manager;
pub mod operation;
pub mod queue;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;
