//! Outbound integrations: the VU1 dial server client and the MQTT bridge

pub mod mqtt;
pub mod traits;
pub mod vu1;

pub use traits::Startable;
