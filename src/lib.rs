//! Core library for rust_labrad.
//!
//! An in-process take on the LabRAD instrument-server model: servers register
//! with a [`manager::Manager`], clients reach them through
//! [`client::ServerProxy`] handles, and [`device::StatefulDevice`] pins a
//! device server proxy to one physical device.
//!
//! - [`value`]: dynamically typed call arguments and results
//! - [`server`]: the handler trait servers implement
//! - [`manager`]: registry and per-server request queues
//! - [`client`]: connections, server and setting proxies
//! - [`packet`]: compound requests
//! - [`device`]: device-scoped wrapper
//! - [`devices`]: per-context device selection for server authors
//! - [`servers`]: bundled test and simulated device servers

pub mod client;
pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod logging;
pub mod manager;
pub mod packet;
pub mod server;
pub mod servers;
pub mod value;

pub use client::{Connection, ServerProxy, SettingProxy};
pub use config::LabradConfig;
pub use device::{DeviceId, DeviceServer, StatefulDevice};
pub use error::{AppResult, LabradError, NotADeviceServerError, RemoteError};
pub use manager::Manager;
pub use value::Value;
