//! Simulated optical power meter server.
//!
//! Fronts several meters. Each context selects one with `select_device` and
//! then reads it or changes its wavelength setting.

use crate::devices::{device_settings, DeviceSelection};
use crate::error::RemoteError;
use crate::server::{Context, ServerHandler, SettingInfo};
use crate::value::Value;
use async_trait::async_trait;
use tracing::debug;

/// Display name of the power meter server.
pub const POWER_METER_NAME: &str = "Power Meter";

const DEFAULT_WAVELENGTH_NM: f64 = 1550.0;

/// One simulated meter. Readings are deterministic: the base power scaled by
/// the detector response at the configured wavelength.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedMeter {
    base_power_w: f64,
    wavelength_nm: f64,
}

impl SimulatedMeter {
    /// Meter reading `base_power_w` at 1550 nm.
    pub fn new(base_power_w: f64) -> Self {
        Self {
            base_power_w,
            wavelength_nm: DEFAULT_WAVELENGTH_NM,
        }
    }

    /// Configured wavelength
    pub fn wavelength_nm(&self) -> f64 {
        self.wavelength_nm
    }

    /// Current reading in watts.
    pub fn power_w(&self) -> f64 {
        // InGaAs-like response, flat to 1 at the default wavelength
        let response = (1.0 - (self.wavelength_nm - DEFAULT_WAVELENGTH_NM).abs() / 1000.0).max(0.0);
        self.base_power_w * response
    }
}

/// Multi-device power meter.
#[derive(Debug, Default)]
pub struct PowerMeterServer {
    devices: DeviceSelection<SimulatedMeter>,
}

impl PowerMeterServer {
    /// Server without any meters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a meter reading `base_power_w` at the default wavelength.
    pub fn with_device(mut self, name: impl Into<String>, base_power_w: f64) -> Self {
        self.devices
            .add_device(name, SimulatedMeter::new(base_power_w));
        self
    }

    fn read(&self, ctx: Context, args: &Value) -> Result<Value, RemoteError> {
        let meter = self.devices.selected(ctx)?;
        let power = meter.power_w();
        match args.as_str() {
            None | Some("W") => Ok(Value::quantity(power, "W")),
            Some("mW") => Ok(Value::quantity(power * 1e3, "mW")),
            Some(other) => Err(RemoteError::new(format!("Unsupported unit '{}'", other))),
        }
    }

    fn wavelength(&mut self, ctx: Context, args: &Value) -> Result<Value, RemoteError> {
        let meter = self.devices.selected_mut(ctx)?;
        match args {
            Value::Null => {}
            Value::Quantity { value, unit } if unit == "nm" => meter.wavelength_nm = *value,
            Value::Quantity { value, unit } if unit == "um" => {
                meter.wavelength_nm = *value * 1e3
            }
            Value::Float(value) => meter.wavelength_nm = *value,
            other => {
                return Err(RemoteError::new(format!(
                    "wavelength expects a length, got '{}'",
                    other
                )))
            }
        }
        Ok(Value::quantity(meter.wavelength_nm, "nm"))
    }
}

#[async_trait]
impl ServerHandler for PowerMeterServer {
    fn name(&self) -> &str {
        POWER_METER_NAME
    }

    fn description(&self) -> &str {
        "Simulated multi-channel optical power meter"
    }

    fn settings(&self) -> Vec<SettingInfo> {
        let mut settings = device_settings();
        settings.push(
            SettingInfo::new(10, "read")
                .with_description("Read power from the selected meter (unit 'W' or 'mW')"),
        );
        settings.push(
            SettingInfo::new(11, "wavelength")
                .with_description("Get or set the selected meter's wavelength"),
        );
        settings
    }

    async fn handle(
        &mut self,
        ctx: Context,
        setting: &str,
        args: Value,
    ) -> Result<Value, RemoteError> {
        if let Some(result) = self.devices.handle_standard(ctx, setting, &args) {
            return result;
        }
        match setting {
            "read" => self.read(ctx, &args),
            "wavelength" => self.wavelength(ctx, &args),
            other => Err(RemoteError::new(format!("unknown setting '{}'", other))),
        }
    }

    async fn expire_context(&mut self, ctx: Context) {
        debug!(%ctx, "Dropping power meter selection");
        self.devices.expire(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ERR_NO_DEVICE_SELECTED;

    fn server() -> PowerMeterServer {
        PowerMeterServer::new()
            .with_device("A", 0.002)
            .with_device("B", 0.005)
    }

    #[tokio::test]
    async fn read_requires_selection() {
        let mut pm = server();
        let err = pm
            .handle(Context::new(1, 0), "read", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, ERR_NO_DEVICE_SELECTED);
    }

    #[tokio::test]
    async fn contexts_read_their_own_meter() {
        let mut pm = server();
        let a = Context::new(1, 0);
        let b = Context::new(1, 1);
        pm.handle(a, "select_device", Value::from("A")).await.unwrap();
        pm.handle(b, "select_device", Value::Int(1)).await.unwrap();

        let ra = pm.handle(a, "read", Value::Null).await.unwrap();
        let rb = pm.handle(b, "read", Value::from("mW")).await.unwrap();
        assert_eq!(ra, Value::quantity(0.002, "W"));
        assert_eq!(rb.unit(), Some("mW"));
        assert!((rb.as_f64().unwrap() - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn wavelength_changes_reading() {
        let mut pm = server();
        let ctx = Context::new(1, 0);
        pm.handle(ctx, "select_device", Value::from("A")).await.unwrap();
        pm.handle(ctx, "wavelength", Value::quantity(1050.0, "nm"))
            .await
            .unwrap();

        let reading = pm.handle(ctx, "read", Value::Null).await.unwrap();
        assert!((reading.as_f64().unwrap() - 0.001).abs() < 1e-12);

        let current = pm.handle(ctx, "wavelength", Value::Null).await.unwrap();
        assert_eq!(current, Value::quantity(1050.0, "nm"));
    }

    #[tokio::test]
    async fn expire_forgets_selection() {
        let mut pm = server();
        let ctx = Context::new(3, 0);
        pm.handle(ctx, "select_device", Value::from("B")).await.unwrap();
        pm.expire_context(ctx).await;
        assert!(pm.handle(ctx, "read", Value::Null).await.is_err());
    }
}
