//! In-process server manager with per-server request queues.
//!
//! The manager plays the role of a LabRAD manager without any wire protocol:
//! servers register a [`ServerHandler`], clients send requests through async
//! channels.
//!
//! # Design
//!
//! Each server gets:
//!
//! - a numeric id and a display name (unique after pythonization)
//! - a bounded FIFO request queue
//! - a dedicated task that owns the handler and executes requests one at a
//!   time, replying over oneshot channels
//!
//! Requests are packets: an ordered list of setting calls that execute
//! back-to-back in one context. The first failing record aborts the rest.
//!
//! The manager registers itself as the server `Manager` (id 1) with settings
//! for listing servers and their settings.
//!
//! # Example
//!
//! ```no_run
//! use rust_labrad::config::ManagerConfig;
//! use rust_labrad::manager::Manager;
//! use rust_labrad::servers::TestServer;
//!
//! # async fn run() -> rust_labrad::error::AppResult<()> {
//! let manager = Manager::start(ManagerConfig::default()).await?;
//! manager.register(TestServer::new()).await?;
//! for server in manager.servers().await {
//!     println!("{} ({})", server.name, server.id);
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::ManagerConfig;
use crate::error::{AppResult, LabradError, RemoteError};
use crate::server::{name_matches, Context, ServerHandler, SettingInfo};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Name under which the manager lists itself.
pub const MANAGER_NAME: &str = "Manager";

/// Public description of a registered server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    /// Numeric server id
    pub id: u32,
    /// Display name
    pub name: String,
    /// Server documentation
    pub description: String,
    /// Settings in declaration order
    pub settings: Vec<SettingInfo>,
}

impl ServerInfo {
    /// Find a setting by display or pythonized name.
    pub fn setting(&self, name: &str) -> Option<&SettingInfo> {
        self.settings.iter().find(|s| name_matches(&s.name, name))
    }
}

/// Failure of one record inside a request.
#[derive(Debug)]
pub(crate) struct RecordFailure {
    pub setting: String,
    pub error: RemoteError,
}

pub(crate) type RequestReply = Result<Vec<Value>, RecordFailure>;

/// Message delivered to a server task.
enum ServerRequest {
    /// Execute records in order within `ctx`
    Call {
        ctx: Context,
        records: Vec<(String, Value)>,
        reply: oneshot::Sender<RequestReply>,
    },
    /// Forget every context belonging to `connection`
    Expire {
        connection: u32,
        done: oneshot::Sender<()>,
    },
}

/// Internal server state held by the directory
struct ServerEntry {
    info: ServerInfo,
    request_tx: mpsc::Sender<ServerRequest>,
    /// Queue task handle (used for graceful shutdown)
    task: Option<JoinHandle<()>>,
}

struct Directory {
    servers: RwLock<BTreeMap<u32, ServerEntry>>,
    next_server_id: AtomicU32,
    next_connection_id: AtomicU32,
    config: ManagerConfig,
}

/// Registry of in-process servers.
///
/// Cloning is cheap; all clones share the same directory.
#[derive(Clone)]
pub struct Manager {
    directory: Arc<Directory>,
}

impl Manager {
    /// Create a manager and register its own `Manager` server.
    ///
    /// # Errors
    /// [`LabradError::Config`] if `config` does not validate.
    pub async fn start(config: ManagerConfig) -> AppResult<Self> {
        config.validate()?;
        let manager = Self {
            directory: Arc::new(Directory {
                servers: RwLock::new(BTreeMap::new()),
                next_server_id: AtomicU32::new(1),
                next_connection_id: AtomicU32::new(1),
                config,
            }),
        };

        let builtin = ManagerServer {
            directory: Arc::downgrade(&manager.directory),
        };
        manager.register(builtin).await?;
        Ok(manager)
    }

    /// Register a server and start its request queue.
    ///
    /// # Errors
    /// Returns [`LabradError::DuplicateServer`] if a server with the same
    /// (pythonized) name is already registered.
    pub async fn register<H: ServerHandler>(&self, handler: H) -> AppResult<ServerInfo> {
        let mut servers = self.directory.servers.write().await;

        let name = handler.name().to_string();
        if servers
            .values()
            .any(|entry| name_matches(&entry.info.name, &name))
        {
            return Err(LabradError::DuplicateServer(name));
        }

        let id = self.directory.next_server_id.fetch_add(1, Ordering::SeqCst);
        let info = ServerInfo {
            id,
            name: name.clone(),
            description: handler.description().to_string(),
            settings: handler.settings(),
        };

        let (request_tx, request_rx) = mpsc::channel(self.directory.config.queue_capacity);
        let task = tokio::spawn(run_request_queue(Box::new(handler), request_rx));

        debug!(server = %name, id, settings = info.settings.len(), "Registered server");

        servers.insert(
            id,
            ServerEntry {
                info: info.clone(),
                request_tx,
                task: Some(task),
            },
        );

        Ok(info)
    }

    /// Remove a server and wait for its queue to drain.
    pub async fn unregister(&self, name: &str) -> AppResult<()> {
        let entry = {
            let mut servers = self.directory.servers.write().await;
            let id = servers
                .values()
                .find(|entry| name_matches(&entry.info.name, name))
                .map(|entry| entry.info.id)
                .ok_or_else(|| LabradError::ServerNotFound(name.to_string()))?;
            servers.remove(&id)
        };

        if let Some(mut entry) = entry {
            debug!(server = %entry.info.name, "Unregistering server");
            drop(entry.request_tx);
            if let Some(task) = entry.task.take() {
                let _ = task.await;
            }
        }
        Ok(())
    }

    /// Unregister every server, the built-in one included.
    pub async fn shutdown(&self) {
        let entries: Vec<ServerEntry> = {
            let mut servers = self.directory.servers.write().await;
            std::mem::take(&mut *servers).into_values().collect()
        };
        for mut entry in entries {
            drop(entry.request_tx);
            if let Some(task) = entry.task.take() {
                let _ = task.await;
            }
        }
        debug!("Manager shut down");
    }

    /// Snapshot of all registered servers, ordered by id.
    pub async fn servers(&self) -> Vec<ServerInfo> {
        self.directory
            .servers
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Find a server by display or pythonized name.
    pub async fn lookup(&self, name: &str) -> AppResult<ServerInfo> {
        self.directory
            .servers
            .read()
            .await
            .values()
            .find(|entry| name_matches(&entry.info.name, name))
            .map(|entry| entry.info.clone())
            .ok_or_else(|| LabradError::ServerNotFound(name.to_string()))
    }

    pub(crate) fn next_connection_id(&self) -> u32 {
        self.directory
            .next_connection_id
            .fetch_add(1, Ordering::SeqCst)
    }

    /// Queue a request and return the channel its reply will arrive on.
    ///
    /// Setting names are resolved before anything is queued, so a packet with
    /// an unknown setting fails as a whole without side effects.
    pub(crate) async fn request(
        &self,
        server_id: u32,
        ctx: Context,
        records: Vec<(String, Value)>,
    ) -> AppResult<oneshot::Receiver<RequestReply>> {
        let (server_name, request_tx, resolved) = {
            let servers = self.directory.servers.read().await;
            let entry = servers
                .get(&server_id)
                .ok_or_else(|| LabradError::ServerNotFound(format!("id {}", server_id)))?;

            let mut resolved = Vec::with_capacity(records.len());
            for (setting, args) in records {
                let info = entry.info.setting(&setting).ok_or_else(|| {
                    LabradError::SettingNotFound {
                        server: entry.info.name.clone(),
                        setting: setting.clone(),
                    }
                })?;
                resolved.push((info.name.clone(), args));
            }
            (entry.info.name.clone(), entry.request_tx.clone(), resolved)
        };

        trace!(server = %server_name, %ctx, records = resolved.len(), "Queueing request");

        let (reply, reply_rx) = oneshot::channel();
        request_tx
            .send(ServerRequest::Call {
                ctx,
                records: resolved,
                reply,
            })
            .await
            .map_err(|_| {
                LabradError::ConnectionClosed(format!("server '{}' stopped", server_name))
            })?;
        Ok(reply_rx)
    }

    /// Tell every server that the contexts of `connection` are gone.
    pub(crate) async fn expire_connection(&self, connection: u32) {
        let senders: Vec<(String, mpsc::Sender<ServerRequest>)> = self
            .directory
            .servers
            .read()
            .await
            .values()
            .map(|entry| (entry.info.name.clone(), entry.request_tx.clone()))
            .collect();

        for (name, tx) in senders {
            let (done, done_rx) = oneshot::channel();
            if tx
                .send(ServerRequest::Expire { connection, done })
                .await
                .is_err()
            {
                trace!(server = %name, "Server stopped before context expiry");
                continue;
            }
            let _ = done_rx.await;
        }
        debug!(connection, "Expired connection contexts");
    }
}

/// Server task: execute queued requests sequentially.
async fn run_request_queue(
    mut handler: Box<dyn ServerHandler>,
    mut request_rx: mpsc::Receiver<ServerRequest>,
) {
    let name = handler.name().to_string();
    let mut contexts: HashSet<Context> = HashSet::new();

    while let Some(request) = request_rx.recv().await {
        match request {
            ServerRequest::Call {
                ctx,
                records,
                reply,
            } => {
                contexts.insert(ctx);
                let mut results = Vec::with_capacity(records.len());
                let mut failure = None;

                for (setting, args) in records {
                    trace!(server = %name, %ctx, %setting, "Executing setting");
                    match handler.handle(ctx, &setting, args).await {
                        Ok(value) => results.push(value),
                        Err(error) => {
                            warn!(server = %name, %setting, %error, "Setting failed");
                            failure = Some(RecordFailure { setting, error });
                            break;
                        }
                    }
                }

                let outcome = match failure {
                    Some(failure) => Err(failure),
                    None => Ok(results),
                };
                // Receiver may have timed out and gone away
                let _ = reply.send(outcome);
            }
            ServerRequest::Expire { connection, done } => {
                let expired: Vec<Context> = contexts
                    .iter()
                    .filter(|ctx| ctx.connection == connection)
                    .copied()
                    .collect();
                for ctx in expired {
                    contexts.remove(&ctx);
                    handler.expire_context(ctx).await;
                }
                let _ = done.send(());
            }
        }
    }

    debug!(server = %name, "Request queue closed");
}

/// The manager's own server.
struct ManagerServer {
    directory: Weak<Directory>,
}

impl ManagerServer {
    async fn find(&self, name: &str) -> Result<ServerInfo, RemoteError> {
        let directory = self
            .directory
            .upgrade()
            .ok_or_else(|| RemoteError::new("manager is shutting down"))?;
        let servers = directory.servers.read().await;
        servers
            .values()
            .find(|entry| name_matches(&entry.info.name, name))
            .map(|entry| entry.info.clone())
            .ok_or_else(|| RemoteError::with_code(1, format!("Server '{}' not found", name)))
    }
}

#[async_trait]
impl ServerHandler for ManagerServer {
    fn name(&self) -> &str {
        MANAGER_NAME
    }

    fn description(&self) -> &str {
        "Directory of in-process servers"
    }

    fn settings(&self) -> Vec<SettingInfo> {
        vec![
            SettingInfo::new(1, "servers").with_description("List registered server names"),
            SettingInfo::new(2, "settings").with_description("List the settings of a server"),
            SettingInfo::new(3, "lookup").with_description("Resolve a server name to its id"),
        ]
    }

    async fn handle(
        &mut self,
        _ctx: Context,
        setting: &str,
        args: Value,
    ) -> Result<Value, RemoteError> {
        match setting {
            "servers" => {
                let directory = self
                    .directory
                    .upgrade()
                    .ok_or_else(|| RemoteError::new("manager is shutting down"))?;
                let servers = directory.servers.read().await;
                Ok(Value::from(
                    servers
                        .values()
                        .map(|entry| entry.info.name.clone())
                        .collect::<Vec<_>>(),
                ))
            }
            "settings" | "lookup" => {
                let name = args
                    .as_str()
                    .ok_or_else(|| RemoteError::new("expected a server name"))?;
                let info = self.find(name).await?;
                if setting == "lookup" {
                    Ok(Value::from(info.id))
                } else {
                    Ok(Value::from(
                        info.settings
                            .into_iter()
                            .map(|s| s.name)
                            .collect::<Vec<_>>(),
                    ))
                }
            }
            other => Err(RemoteError::new(format!("unknown setting '{}'", other))),
        }
    }
}
