//! Echo and failure settings used to exercise the client.
//!
//! Each `exc_in_*` setting fails from a different place: directly in the
//! handler, in a helper it calls, in a spawned task, in an error handler, and
//! after an await point. All of them must reach the caller as a remote error.

use crate::error::RemoteError;
use crate::server::{Context, ServerHandler, SettingInfo};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Display name of the test server.
pub const TEST_SERVER_NAME: &str = "Python Test Server";

/// Server with echo and failure settings.
#[derive(Debug, Default)]
pub struct TestServer {
    delays: HashMap<Context, Duration>,
}

impl TestServer {
    /// New server with zero echo delay in every context.
    pub fn new() -> Self {
        Self::default()
    }

    fn delay(&self, ctx: Context) -> Duration {
        self.delays.get(&ctx).copied().unwrap_or_default()
    }

    fn set_delay(&mut self, ctx: Context, args: &Value) -> Result<Value, RemoteError> {
        match args {
            Value::Null => Ok(Value::quantity(self.delay(ctx).as_secs_f64(), "s")),
            Value::Quantity { value, unit } if unit == "s" => store(self, ctx, *value),
            Value::Quantity { value, unit } if unit == "ms" => store(self, ctx, *value / 1000.0),
            Value::Float(_) | Value::Int(_) => {
                store(self, ctx, args.as_f64().unwrap_or_default())
            }
            other => Err(RemoteError::new(format!(
                "echo_delay expects a time, got '{}'",
                other
            ))),
        }
    }
}

fn store(server: &mut TestServer, ctx: Context, seconds: f64) -> Result<Value, RemoteError> {
    let delay = Duration::try_from_secs_f64(seconds)
        .map_err(|_| RemoteError::new(format!("invalid delay {} s", seconds)))?;
    server.delays.insert(ctx, delay);
    Ok(Value::quantity(seconds, "s"))
}

fn failing_subfunction() -> Result<Value, RemoteError> {
    Err(RemoteError::new("Exception from sub-function."))
}

async fn failing_step() -> Result<Value, RemoteError> {
    Err(RemoteError::new("Original failure."))
}

#[async_trait]
impl ServerHandler for TestServer {
    fn name(&self) -> &str {
        TEST_SERVER_NAME
    }

    fn description(&self) -> &str {
        "Server for testing client behavior"
    }

    fn settings(&self) -> Vec<SettingInfo> {
        vec![
            SettingInfo::new(1, "echo").with_description("Return the argument unchanged"),
            SettingInfo::new(2, "delayed_echo")
                .with_description("Return the argument after this context's delay"),
            SettingInfo::new(3, "echo_delay")
                .with_description("Get or set the delay used by delayed_echo"),
            SettingInfo::new(4, "exc_in_handler"),
            SettingInfo::new(5, "exc_in_subfunction"),
            SettingInfo::new(6, "exc_in_deferred"),
            SettingInfo::new(7, "exc_in_errback"),
            SettingInfo::new(8, "exc_in_inlinecallback"),
        ]
    }

    async fn handle(
        &mut self,
        ctx: Context,
        setting: &str,
        args: Value,
    ) -> Result<Value, RemoteError> {
        match setting {
            "echo" => Ok(args),
            "delayed_echo" => {
                tokio::time::sleep(self.delay(ctx)).await;
                Ok(args)
            }
            "echo_delay" => self.set_delay(ctx, &args),
            "exc_in_handler" => Err(RemoteError::new("Exception in handler.")),
            "exc_in_subfunction" => {
                let value = failing_subfunction()?;
                Ok(value)
            }
            "exc_in_deferred" => {
                let task = tokio::spawn(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<Value, _>(RemoteError::new("Exception in deferred."))
                });
                task.await
                    .map_err(|e| RemoteError::new(format!("deferred task failed: {}", e)))?
            }
            "exc_in_errback" => match failing_step().await {
                Ok(value) => Ok(value),
                Err(original) => Err(RemoteError::new(format!(
                    "Exception in errback while handling: {}",
                    original.message
                ))),
            },
            "exc_in_inlinecallback" => {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Err(RemoteError::new("Exception in inline callback."))
            }
            other => Err(RemoteError::new(format!("unknown setting '{}'", other))),
        }
    }

    async fn expire_context(&mut self, ctx: Context) {
        self.delays.remove(&ctx);
    }
}
