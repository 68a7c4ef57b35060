//! Per-context device selection for servers fronting several instruments.
//!
//! A device server keeps one device table and remembers, for each [`Context`],
//! which device that context selected. Settings then operate on
//! [`DeviceSelection::selected`]. Selection is by name or by index into
//! [`DeviceSelection::list_devices`].

use crate::error::RemoteError;
use crate::server::{Context, SettingInfo};
use crate::value::Value;
use std::collections::HashMap;
use tracing::debug;

/// Error code for selecting a device that does not exist.
pub const ERR_NO_SUCH_DEVICE: i32 = 2;
/// Error code for a device operation in a context without a selection.
pub const ERR_NO_DEVICE_SELECTED: i32 = 3;

/// Standard settings every device server exposes, numbered as LabRAD device
/// servers number them.
pub fn device_settings() -> Vec<SettingInfo> {
    vec![
        SettingInfo::new(1, "list_devices").with_description("List available devices"),
        SettingInfo::new(2, "select_device")
            .with_description("Select a device by name or index for this context"),
        SettingInfo::new(3, "deselect_device").with_description("Clear this context's selection"),
    ]
}

/// Device table plus per-context selection.
#[derive(Debug)]
pub struct DeviceSelection<D> {
    devices: Vec<(String, D)>,
    selected: HashMap<Context, String>,
}

impl<D> Default for DeviceSelection<D> {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            selected: HashMap::new(),
        }
    }
}

impl<D> DeviceSelection<D> {
    /// Empty device table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a device.
    pub fn add_device(&mut self, name: impl Into<String>, device: D) {
        let name = name.into();
        match self.devices.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = device,
            None => self.devices.push((name, device)),
        }
    }

    /// Remove a device; contexts that had it selected lose their selection.
    pub fn remove_device(&mut self, name: &str) -> Option<D> {
        let index = self.devices.iter().position(|(n, _)| n == name)?;
        self.selected.retain(|_, selected| selected.as_str() != name);
        Some(self.devices.remove(index).1)
    }

    /// `(index, name)` for every device.
    pub fn list_devices(&self) -> Vec<(u32, String)> {
        self.devices
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (i as u32, name.clone()))
            .collect()
    }

    /// Select a device for `ctx` by name (string) or index (integer).
    ///
    /// Returns the selected device's name.
    pub fn select(&mut self, ctx: Context, key: &Value) -> Result<String, RemoteError> {
        let name = match key {
            Value::String(name) => self
                .devices
                .iter()
                .find(|(n, _)| n == name)
                .map(|(n, _)| n.clone())
                .ok_or_else(|| {
                    RemoteError::with_code(ERR_NO_SUCH_DEVICE, format!("No device named '{}'", name))
                })?,
            Value::Int(index) => usize::try_from(*index)
                .ok()
                .and_then(|i| self.devices.get(i))
                .map(|(n, _)| n.clone())
                .ok_or_else(|| {
                    RemoteError::with_code(
                        ERR_NO_SUCH_DEVICE,
                        format!("Device index {} out of range", index),
                    )
                })?,
            other => {
                return Err(RemoteError::new(format!(
                    "Device must be selected by name or index, got '{}'",
                    other
                )))
            }
        };

        debug!(%ctx, device = %name, "Device selected");
        self.selected.insert(ctx, name.clone());
        Ok(name)
    }

    /// Clear the selection of `ctx`.
    pub fn deselect(&mut self, ctx: Context) {
        self.selected.remove(&ctx);
    }

    /// Name of the device selected in `ctx`.
    pub fn selected_name(&self, ctx: Context) -> Option<&str> {
        self.selected.get(&ctx).map(String::as_str)
    }

    /// The device selected in `ctx`.
    pub fn selected(&self, ctx: Context) -> Result<&D, RemoteError> {
        let name = self.selected_name(ctx).ok_or_else(no_selection)?;
        self.devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
            .ok_or_else(no_selection)
    }

    /// Mutable access to the device selected in `ctx`.
    pub fn selected_mut(&mut self, ctx: Context) -> Result<&mut D, RemoteError> {
        let name = self.selected.get(&ctx).cloned().ok_or_else(no_selection)?;
        self.devices
            .iter_mut()
            .find(|(n, _)| *n == name)
            .map(|(_, d)| d)
            .ok_or_else(no_selection)
    }

    /// Forget everything about `ctx`.
    pub fn expire(&mut self, ctx: Context) {
        self.selected.remove(&ctx);
    }

    /// Handle the standard device settings. Returns `None` for any other
    /// setting so the caller can dispatch it.
    pub fn handle_standard(
        &mut self,
        ctx: Context,
        setting: &str,
        args: &Value,
    ) -> Option<Result<Value, RemoteError>> {
        let result = match setting {
            "list_devices" => Ok(Value::List(
                self.list_devices()
                    .into_iter()
                    .map(|(i, name)| Value::List(vec![Value::from(i), Value::String(name)]))
                    .collect(),
            )),
            "select_device" => self.select(ctx, args).map(Value::String),
            "deselect_device" => {
                self.deselect(ctx);
                Ok(Value::Null)
            }
            _ => return None,
        };
        Some(result)
    }
}

fn no_selection() -> RemoteError {
    RemoteError::with_code(ERR_NO_DEVICE_SELECTED, "No device selected")
}
