//! Serialized GATT operation manager.
//!
//! Requests against connected peers are validated, queued, and executed
//! strictly one at a time against a transport; outcomes are delivered to
//! registered listeners.

pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod gatt;
pub mod reconnect;
