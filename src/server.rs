//! Server-side abstractions.
//!
//! A server is anything implementing [`ServerHandler`]. The [`Manager`] owns the
//! handler, runs it in its own task, and feeds it requests one at a time, so a
//! handler never sees two calls concurrently and may freely mutate itself.
//!
//! Per-client state (the selected device, for example) is keyed by
//! [`Context`]. A context belongs to one connection; when the connection goes
//! away every server receives [`ServerHandler::expire_context`] for each of
//! that connection's contexts.
//!
//! [`Manager`]: crate::manager::Manager

use crate::error::RemoteError;
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope of server-side state: `(connection id, context id)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Context {
    /// Connection that owns this context
    pub connection: u32,
    /// Context number within the connection (0 is the default context)
    pub id: u32,
}

impl Context {
    /// Create a context.
    pub fn new(connection: u32, id: u32) -> Self {
        Self { connection, id }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.connection, self.id)
    }
}

/// Metadata describing one setting of a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingInfo {
    /// Numeric setting id, unique within the server
    pub id: u32,
    /// Display name (e.g. "echo", "select_device")
    pub name: String,
    /// Free-form documentation
    pub description: String,
}

impl SettingInfo {
    /// Setting with an empty description.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
        }
    }

    /// Attach documentation.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Behavior of a server hosted by the manager.
#[async_trait]
pub trait ServerHandler: Send + 'static {
    /// Display name (e.g. "Python Test Server")
    fn name(&self) -> &str;

    /// Server documentation
    fn description(&self) -> &str {
        ""
    }

    /// Settings this server exposes
    fn settings(&self) -> Vec<SettingInfo>;

    /// Execute one setting.
    ///
    /// `setting` is always the display name of one of [`Self::settings`]; the
    /// manager resolves pythonized aliases before dispatch.
    async fn handle(
        &mut self,
        ctx: Context,
        setting: &str,
        args: Value,
    ) -> Result<Value, RemoteError>;

    /// Drop any state held for `ctx`.
    async fn expire_context(&mut self, _ctx: Context) {}
}

/// Convert a display name into the identifier form used for lookups:
/// lowercase, with every run of other characters collapsed to `_`.
///
/// `"Python Test Server"` becomes `python_test_server`.
pub fn pythonize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// True when `query` names `name` directly or in pythonized form.
pub fn name_matches(name: &str, query: &str) -> bool {
    name == query || pythonize(name) == pythonize(query)
}
