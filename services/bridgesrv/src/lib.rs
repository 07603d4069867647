//! PLC bridge engine.
//!
//! Bridges an industrial PLC on a half-duplex Modbus RTU fieldbus to
//! consumers that need its live I/O state and small automation logic
//! against it. The engine owns the serial port, serializes every bus
//! transaction, polls the configured data regions into a shared cache,
//! runs sandboxed user scripts, and on constrained deployments keeps
//! the WiFi link supervised with an access-point fallback.
//!
//! The presentation layer consumes [`engine::BridgeHandle`]; nothing
//! else in this crate is meant to be driven directly.

pub mod cache;
pub mod engine;
pub mod error;
pub mod gpio;
pub mod modbus;
pub mod netwatch;
pub mod scheduler;
pub mod scripts;
pub mod transaction;
pub mod transport;

pub use cache::{ConnectionHealth, Region, Snapshot};
pub use engine::{BridgeEngine, BridgeHandle, WriteOutcome, WriteValue};
pub use error::{BridgeError, Result};
