//! Mock servers for integration testing
//!
//! The mock VU1 server simulates the dial server's REST interface, allowing
//! full integration testing without real hardware.

pub mod vu1;

pub use vu1::MockVu1Server;
