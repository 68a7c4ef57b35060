//! Servers bundled with the crate.
//!
//! - [`TestServer`]: echo and exception settings for exercising the client
//! - [`PowerMeterServer`]: a simulated multi-device power meter

pub mod power_meter;
pub mod test_server;

pub use power_meter::{PowerMeterServer, SimulatedMeter};
pub use test_server::TestServer;
