//! Device-scoped server wrapper.
//!
//! Device servers front several physical instruments and keep the "current
//! device" as per-context server state. Code that forgets to select a device
//! before a call, or that shares a context with code selecting another one,
//! silently talks to the wrong instrument. [`StatefulDevice`] keeps the device
//! locally and selects it on the server before handing out any setting.
//!
//! ```no_run
//! use rust_labrad::device::StatefulDevice;
//! # use rust_labrad::client::ServerProxy;
//!
//! # async fn run(power_meter: ServerProxy) -> rust_labrad::error::AppResult<()> {
//! let mut meter = StatefulDevice::new(&power_meter, "meter-a")?;
//! let reading = meter.call("read", ()).await?;
//!
//! meter.select_device("meter-b");
//! let other = meter.call("read", ()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The wrapper does not lock anything. Selection and the forwarded call are two
//! separate requests, so tasks sharing one wrapper (or one context) can
//! interleave and select the wrong device. Give each task its own wrapper over
//! a proxy with its own context.

use crate::client::{ServerProxy, SettingProxy};
use crate::error::{AppResult, LabradError, NotADeviceServerError};
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Name of the member every device server must expose.
pub const SELECT_DEVICE: &str = "select_device";

/// Opaque device identifier: a name or an index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    /// Device name as listed by the server
    Name(String),
    /// Position in the server's device list
    Index(u32),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Name(name) => write!(f, "{}", name),
            DeviceId::Index(index) => write!(f, "{}", index),
        }
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId::Name(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        DeviceId::Name(value)
    }
}

impl From<u32> for DeviceId {
    fn from(value: u32) -> Self {
        DeviceId::Index(value)
    }
}

impl From<&DeviceId> for Value {
    fn from(value: &DeviceId) -> Self {
        match value {
            DeviceId::Name(name) => Value::String(name.clone()),
            DeviceId::Index(index) => Value::from(*index),
        }
    }
}

impl From<DeviceId> for Value {
    fn from(value: DeviceId) -> Self {
        Value::from(&value)
    }
}

/// Capability surface a [`StatefulDevice`] needs from the object it wraps.
///
/// The member set is open-ended: members are looked up by name at runtime.
#[async_trait]
pub trait DeviceServer: Send + Sync {
    /// What a member lookup returns (a callable setting handle, typically)
    type Member: Send;
    /// Error raised by device selection
    type Error: Send;

    /// Whether a member called `name` exists.
    fn has_member(&self, name: &str) -> bool;

    /// Look up a member without any side effect.
    fn member(&self, name: &str) -> Option<Self::Member>;

    /// Names of all members.
    fn member_names(&self) -> Vec<String>;

    /// Make `device` the target of subsequent calls.
    async fn select_device(&self, device: &DeviceId) -> Result<(), Self::Error>;
}

#[async_trait]
impl<'a, T: DeviceServer + ?Sized> DeviceServer for &'a T {
    type Member = T::Member;
    type Error = T::Error;

    fn has_member(&self, name: &str) -> bool {
        (**self).has_member(name)
    }

    fn member(&self, name: &str) -> Option<Self::Member> {
        (**self).member(name)
    }

    fn member_names(&self) -> Vec<String> {
        (**self).member_names()
    }

    async fn select_device(&self, device: &DeviceId) -> Result<(), Self::Error> {
        (**self).select_device(device).await
    }
}

#[async_trait]
impl<T: DeviceServer + ?Sized> DeviceServer for Arc<T> {
    type Member = T::Member;
    type Error = T::Error;

    fn has_member(&self, name: &str) -> bool {
        (**self).has_member(name)
    }

    fn member(&self, name: &str) -> Option<Self::Member> {
        (**self).member(name)
    }

    fn member_names(&self) -> Vec<String> {
        (**self).member_names()
    }

    async fn select_device(&self, device: &DeviceId) -> Result<(), Self::Error> {
        (**self).select_device(device).await
    }
}

/// Server proxies are device servers when the remote server has a
/// `select_device` setting. Selection runs in the proxy's context.
#[async_trait]
impl DeviceServer for ServerProxy {
    type Member = SettingProxy;
    type Error = LabradError;

    fn has_member(&self, name: &str) -> bool {
        self.has_setting(name)
    }

    fn member(&self, name: &str) -> Option<SettingProxy> {
        self.setting(name)
    }

    fn member_names(&self) -> Vec<String> {
        self.settings()
    }

    async fn select_device(&self, device: &DeviceId) -> Result<(), LabradError> {
        self.call(SELECT_DEVICE, device).await.map(|_| ())
    }
}

/// Wrapper that selects its device on the server before every member access.
pub struct StatefulDevice<S> {
    server: S,
    device: DeviceId,
}

impl<S: DeviceServer> StatefulDevice<S> {
    /// Wrap `server` to refer only to `device`.
    ///
    /// The device is not validated here; an unknown device surfaces as an
    /// error from the server on first use.
    ///
    /// # Errors
    /// [`NotADeviceServerError`] if `server` has no `select_device` member.
    pub fn new(server: S, device: impl Into<DeviceId>) -> Result<Self, NotADeviceServerError> {
        if !server.has_member(SELECT_DEVICE) {
            return Err(NotADeviceServerError);
        }
        Ok(Self {
            server,
            device: device.into(),
        })
    }

    /// Change the device used by subsequent accesses. Nothing is sent to the
    /// server until the next [`get`](Self::get).
    pub fn select_device(&mut self, device: impl Into<DeviceId>) {
        self.device = device.into();
    }

    /// Currently selected device
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// The wrapped server
    pub fn server(&self) -> &S {
        &self.server
    }

    /// Select the device on the server, then return member `name`.
    ///
    /// Returns `Ok(None)` without contacting the server when the member does
    /// not exist. `select_device` is never forwarded either: it belongs to the
    /// wrapper, use [`select_device`](Self::select_device). Selection errors
    /// are returned exactly as the server raised them.
    pub async fn get(&self, name: &str) -> Result<Option<S::Member>, S::Error> {
        if name == SELECT_DEVICE {
            trace!("select_device is handled by the wrapper, not forwarded");
            return Ok(None);
        }
        if !self.server.has_member(name) {
            trace!(member = name, "Member not found on wrapped server");
            return Ok(None);
        }

        trace!(member = name, device = %self.device, "Selecting device before access");
        self.server.select_device(&self.device).await?;
        Ok(self.server.member(name))
    }

    /// Member names of the wrapped server.
    pub fn member_names(&self) -> Vec<String> {
        self.server.member_names()
    }
}

impl<S> StatefulDevice<S>
where
    S: DeviceServer<Member = SettingProxy, Error = LabradError>,
{
    /// Select the device, then call `setting` with `args`.
    ///
    /// `Ok(None)` when the server has no such setting.
    pub async fn call(&self, setting: &str, args: impl Into<Value>) -> AppResult<Option<Value>> {
        match self.get(setting).await? {
            Some(member) => member.call(args).await.map(Some),
            None => Ok(None),
        }
    }
}

impl<S: fmt::Display> fmt::Display for StatefulDevice<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stateful wrapper for device '{}' for:", self.device)?;
        write!(f, "{}", self.server)
    }
}

impl<S: fmt::Debug> fmt::Debug for StatefulDevice<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulDevice")
            .field("device", &self.device)
            .field("server", &self.server)
            .finish()
    }
}
