//! Transport layer: the capability surface the queue drives and its BlueZ
//! implementation.

pub mod bluez;
pub mod transport;
