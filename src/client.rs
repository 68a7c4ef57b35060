//! Client connections and server proxies.
//!
//! A [`Connection`] is the entry point: it discovers servers registered with a
//! [`Manager`] and hands out [`ServerProxy`] handles. Proxies are cheap to
//! clone and carry the [`Context`] their calls execute in, so two proxies for
//! the same server with different contexts keep independent server-side state
//! (such as the selected device).
//!
//! ```no_run
//! use rust_labrad::client::Connection;
//! use rust_labrad::config::{ClientConfig, ManagerConfig};
//! use rust_labrad::manager::Manager;
//! use rust_labrad::servers::TestServer;
//!
//! # async fn run() -> rust_labrad::error::AppResult<()> {
//! let manager = Manager::start(ManagerConfig::default()).await?;
//! manager.register(TestServer::new()).await?;
//!
//! let cxn = Connection::connect(&manager, &ClientConfig::default()).await?;
//! let pts = cxn.server("python_test_server").await?;
//! let reply = pts.call("echo", "hello").await?;
//! assert_eq!(reply.as_str(), Some("hello"));
//! cxn.disconnect().await;
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use crate::error::{AppResult, LabradError};
use crate::manager::{Manager, RequestReply, ServerInfo, MANAGER_NAME};
use crate::packet::Packet;
use crate::server::Context;
use crate::value::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct ConnectionShared {
    manager: Manager,
    id: u32,
    name: String,
    timeout: Duration,
    next_context: AtomicU32,
    closed: AtomicBool,
}

impl ConnectionShared {
    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(LabradError::ConnectionClosed(format!(
                "connection {} ('{}') was disconnected",
                self.id, self.name
            )))
        } else {
            Ok(())
        }
    }
}

/// A client connection to the manager.
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Open a connection.
    pub async fn connect(manager: &Manager, config: &ClientConfig) -> AppResult<Self> {
        let id = manager.next_connection_id();
        info!(connection = id, name = %config.name, "Connected");
        Ok(Self {
            shared: Arc::new(ConnectionShared {
                manager: manager.clone(),
                id,
                name: config.name.clone(),
                timeout: config.request_timeout(),
                next_context: AtomicU32::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Connection id assigned by the manager
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Client name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Default context of this connection
    pub fn default_context(&self) -> Context {
        Context::new(self.shared.id, 0)
    }

    /// Allocate a fresh context.
    pub fn context(&self) -> Context {
        let id = self.shared.next_context.fetch_add(1, Ordering::SeqCst);
        Context::new(self.shared.id, id)
    }

    /// Names of all registered servers, as reported by the `Manager` server.
    pub async fn servers(&self) -> AppResult<Vec<String>> {
        let manager = self.server(MANAGER_NAME).await?;
        let names = manager.call("servers", Value::Null).await?;
        Ok(names
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_string)
            .collect())
    }

    /// True when a server is registered under `name` (display or pythonized).
    pub async fn has_server(&self, name: &str) -> bool {
        self.shared.manager.lookup(name).await.is_ok()
    }

    /// Proxy for a server in this connection's default context.
    pub async fn server(&self, name: &str) -> AppResult<ServerProxy> {
        self.shared.ensure_open()?;
        let info = self.shared.manager.lookup(name).await?;
        Ok(ServerProxy {
            connection: self.shared.clone(),
            info: Arc::new(info),
            ctx: self.default_context(),
        })
    }

    /// Close the connection and let every server drop its contexts.
    ///
    /// Proxies created from this connection fail with
    /// [`LabradError::ConnectionClosed`] afterwards. Dropping a connection
    /// does the same without waiting for the servers.
    pub async fn disconnect(self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.manager.expire_connection(self.shared.id).await;
        info!(connection = self.shared.id, "Disconnected");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.shared.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.shared.manager.clone();
                handle.spawn(async move {
                    manager.expire_connection(id).await;
                });
                debug!(connection = id, "Connection dropped, expiring contexts");
            }
            Err(_) => {
                warn!(connection = id, "Connection dropped outside a runtime, contexts not expired");
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

/// Handle for calling settings of one server within one context.
#[derive(Clone)]
pub struct ServerProxy {
    connection: Arc<ConnectionShared>,
    info: Arc<ServerInfo>,
    ctx: Context,
}

impl ServerProxy {
    /// Server display name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Server id
    pub fn id(&self) -> u32 {
        self.info.id
    }

    /// Context calls run in
    pub fn context(&self) -> Context {
        self.ctx
    }

    /// Full server description
    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Setting names in declaration order.
    pub fn settings(&self) -> Vec<String> {
        self.info.settings.iter().map(|s| s.name.clone()).collect()
    }

    /// True when the server exposes `name` (display or pythonized).
    pub fn has_setting(&self, name: &str) -> bool {
        self.info.setting(name).is_some()
    }

    /// Callable handle for one setting, or `None` if the server lacks it.
    pub fn setting(&self, name: &str) -> Option<SettingProxy> {
        self.info.setting(name).map(|s| SettingProxy {
            server: self.clone(),
            name: s.name.clone(),
        })
    }

    /// Same server, different context.
    pub fn with_context(&self, ctx: Context) -> Self {
        Self {
            connection: self.connection.clone(),
            info: self.info.clone(),
            ctx,
        }
    }

    /// Call a setting and wait for its result.
    pub async fn call(&self, setting: &str, args: impl Into<Value>) -> AppResult<Value> {
        self.send(setting, args).await?.wait().await
    }

    /// Queue a call without waiting; the result is collected with
    /// [`PendingResponse::wait`].
    pub async fn send(&self, setting: &str, args: impl Into<Value>) -> AppResult<PendingResponse> {
        let pending = self
            .send_records(vec![(setting.to_string(), args.into())])
            .await?;
        Ok(PendingResponse { pending })
    }

    /// Start a compound request.
    pub fn packet(&self) -> Packet {
        Packet::new(self.clone())
    }

    pub(crate) async fn send_records(
        &self,
        records: Vec<(String, Value)>,
    ) -> AppResult<PendingRecords> {
        self.connection.ensure_open()?;
        debug!(server = %self.info.name, ctx = %self.ctx, records = records.len(), "Sending request");
        let rx = self
            .connection
            .manager
            .request(self.info.id, self.ctx, records)
            .await?;
        Ok(PendingRecords {
            server: self.info.name.clone(),
            timeout: self.connection.timeout,
            rx,
        })
    }
}

impl fmt::Debug for ServerProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProxy")
            .field("name", &self.info.name)
            .field("id", &self.info.id)
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl fmt::Display for ServerProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "LabRAD Server: {} (ID={})", self.info.name, self.info.id)?;
        if !self.info.description.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", self.info.description)?;
        }
        writeln!(f)?;
        write!(f, "Settings:")?;
        for setting in &self.info.settings {
            write!(f, "\n    {}", setting.name)?;
        }
        Ok(())
    }
}

impl PartialEq for ServerProxy {
    fn eq(&self, other: &Self) -> bool {
        self.info.id == other.info.id && self.ctx == other.ctx
    }
}

/// One setting of a server, bound to the proxy's context.
#[derive(Clone, Debug, PartialEq)]
pub struct SettingProxy {
    server: ServerProxy,
    name: String,
}

impl SettingProxy {
    /// Setting display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server this setting belongs to
    pub fn server(&self) -> &ServerProxy {
        &self.server
    }

    /// Invoke the setting and wait for its result.
    pub async fn call(&self, args: impl Into<Value>) -> AppResult<Value> {
        self.server.call(&self.name, args).await
    }

    /// Invoke the setting without waiting.
    pub async fn send(&self, args: impl Into<Value>) -> AppResult<PendingResponse> {
        self.server.send(&self.name, args).await
    }
}

/// Reply channel for a queued request.
pub(crate) struct PendingRecords {
    server: String,
    timeout: Duration,
    rx: oneshot::Receiver<RequestReply>,
}

impl PendingRecords {
    pub(crate) async fn wait_all(self) -> AppResult<Vec<Value>> {
        let reply = tokio::time::timeout(self.timeout, self.rx)
            .await
            .map_err(|_| LabradError::Timeout {
                server: self.server.clone(),
                timeout: self.timeout,
            })?
            .map_err(|_| {
                LabradError::ConnectionClosed(format!(
                    "server '{}' dropped the request",
                    self.server
                ))
            })?;

        reply.map_err(|failure| LabradError::Remote {
            server: self.server,
            setting: failure.setting,
            source: failure.error,
        })
    }
}

/// Result of a call sent without waiting.
pub struct PendingResponse {
    pending: PendingRecords,
}

impl PendingResponse {
    /// Wait for the server's reply.
    pub async fn wait(self) -> AppResult<Value> {
        let mut values = self.pending.wait_all().await?;
        Ok(values.pop().unwrap_or_default())
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("server", &self.pending.server)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::servers::TestServer;

    async fn setup() -> (Manager, Connection) {
        let manager = Manager::start(ManagerConfig::default()).await.unwrap();
        manager.register(TestServer::new()).await.unwrap();
        let cxn = Connection::connect(&manager, &ClientConfig::default())
            .await
            .unwrap();
        (manager, cxn)
    }

    #[tokio::test]
    async fn contexts_are_unique_per_connection() {
        let (_manager, cxn) = setup().await;
        let a = cxn.context();
        let b = cxn.context();
        assert_ne!(a, b);
        assert_eq!(a.connection, cxn.id());
        assert_eq!(cxn.default_context().id, 0);
    }

    #[tokio::test]
    async fn setting_proxy_calls_through() {
        let (_manager, cxn) = setup().await;
        let pts = cxn.server("Python Test Server").await.unwrap();
        let echo = pts.setting("echo").unwrap();
        assert_eq!(echo.name(), "echo");
        assert_eq!(echo.call(5).await.unwrap(), Value::Int(5));
        assert!(pts.setting("nope").is_none());
    }

    #[tokio::test]
    async fn calls_fail_after_disconnect() {
        let (_manager, cxn) = setup().await;
        let pts = cxn.server("python_test_server").await.unwrap();
        cxn.disconnect().await;
        let err = pts.call("echo", 1).await.unwrap_err();
        assert!(matches!(err, LabradError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn request_timeout_is_reported() {
        let manager = Manager::start(ManagerConfig::default()).await.unwrap();
        manager.register(TestServer::new()).await.unwrap();
        let config = ClientConfig {
            request_timeout_ms: 20,
            ..ClientConfig::default()
        };
        let cxn = Connection::connect(&manager, &config).await.unwrap();
        let pts = cxn.server("python_test_server").await.unwrap();
        pts.call("echo_delay", Value::quantity(0.5, "s"))
            .await
            .unwrap();
        let err = pts.call("delayed_echo", "late").await.unwrap_err();
        assert!(matches!(err, LabradError::Timeout { .. }));
    }

    #[tokio::test]
    async fn display_lists_settings() {
        let (_manager, cxn) = setup().await;
        let pts = cxn.server("python_test_server").await.unwrap();
        let text = pts.to_string();
        assert!(text.starts_with("LabRAD Server: Python Test Server (ID=2)"));
        assert!(text.contains("\n    echo"));
    }
}
