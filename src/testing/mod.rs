//! Testing utilities
//!
//! An in-memory broker that lets the whole client run in tests without a
//! real MQTT server.

pub mod mocks;

pub use mocks::*;
