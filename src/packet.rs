//! Compound requests.
//!
//! A [`Packet`] batches several setting calls to one server into a single
//! request. Records execute in order, back-to-back, in the proxy's context.
//! A record may carry a key; keyed records are addressed by key in the
//! [`PacketResponse`] and their arguments can be replaced before the packet is
//! sent again.
//!
//! ```no_run
//! # use rust_labrad::client::ServerProxy;
//! # async fn run(pts: ServerProxy) -> rust_labrad::error::AppResult<()> {
//! let mut pkt = pts.packet();
//! pkt.call("echo", 1).call("echo", 2).call_keyed("echo", "three", "last");
//! let resp = pkt.send().await?;
//! assert_eq!(resp.get("echo").and_then(|v| v.len()), Some(2));
//! assert_eq!(resp.get("last").and_then(|v| v.as_string()).as_deref(), Some("three"));
//! # Ok(())
//! # }
//! ```

use crate::client::ServerProxy;
use crate::error::{AppResult, LabradError};
use crate::server::name_matches;
use crate::value::Value;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
struct PacketRecord {
    setting: String,
    args: Value,
    key: Option<String>,
}

/// Builder for a compound request.
#[derive(Clone)]
pub struct Packet {
    server: ServerProxy,
    records: Vec<PacketRecord>,
}

impl Packet {
    pub(crate) fn new(server: ServerProxy) -> Self {
        Self {
            server,
            records: Vec::new(),
        }
    }

    /// Append an unkeyed call.
    pub fn call(&mut self, setting: &str, args: impl Into<Value>) -> &mut Self {
        self.records.push(PacketRecord {
            setting: setting.to_string(),
            args: args.into(),
            key: None,
        });
        self
    }

    /// Append a call whose result is addressed by `key`.
    pub fn call_keyed(
        &mut self,
        setting: &str,
        args: impl Into<Value>,
        key: impl Into<String>,
    ) -> &mut Self {
        self.records.push(PacketRecord {
            setting: setting.to_string(),
            args: args.into(),
            key: Some(key.into()),
        });
        self
    }

    /// Replace the arguments of the record with `key`.
    pub fn set(&mut self, key: &str, args: impl Into<Value>) -> AppResult<&mut Self> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.key.as_deref() == Some(key))
            .ok_or_else(|| LabradError::KeyNotFound(key.to_string()))?;
        record.args = args.into();
        Ok(self)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no record was added
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Send the packet and wait for every result.
    ///
    /// The packet is left intact and may be sent again.
    pub async fn send(&self) -> AppResult<PacketResponse> {
        let records = self
            .records
            .iter()
            .map(|r| (r.setting.clone(), r.args.clone()))
            .collect();
        let values = self.server.send_records(records).await?.wait_all().await?;

        let mut entries: Vec<(String, Vec<Value>)> = Vec::new();
        for (record, value) in self.records.iter().zip(values) {
            let name = match &record.key {
                Some(key) => key.clone(),
                None => self
                    .server
                    .info()
                    .setting(&record.setting)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| record.setting.clone()),
            };
            match entries.iter_mut().find(|(n, _)| *n == name) {
                Some((_, slot)) => slot.push(value),
                None => entries.push((name, vec![value])),
            }
        }

        Ok(PacketResponse { entries })
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("server", &self.server.name())
            .field("records", &self.records)
            .finish()
    }
}

/// Results of a sent packet.
///
/// Keyed records are addressed by key. Unkeyed records are addressed by
/// setting name; when a setting was called several times its results are
/// returned together as a list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PacketResponse {
    entries: Vec<(String, Vec<Value>)>,
}

impl PacketResponse {
    /// Result for a key or setting name.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values(name).map(|values| match values {
            [single] => single.clone(),
            many => Value::List(many.to_vec()),
        })
    }

    /// All results recorded under a key or setting name.
    pub fn values(&self, name: &str) -> Option<&[Value]> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .or_else(|| self.entries.iter().find(|(n, _)| name_matches(n, name)))
            .map(|(_, values)| values.as_slice())
    }

    /// True when `name` addresses a result.
    pub fn contains(&self, name: &str) -> bool {
        self.values(name).is_some()
    }

    /// Keys and setting names, in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> PacketResponse {
        PacketResponse {
            entries: vec![
                ("echo".to_string(), vec![Value::Int(1), Value::Int(2)]),
                ("one".to_string(), vec![Value::Int(1)]),
            ],
        }
    }

    #[test]
    fn repeated_setting_becomes_list() {
        let resp = response();
        assert_eq!(resp.get("echo"), Some(Value::from(vec![1, 2])));
        assert_eq!(resp.get("one"), Some(Value::Int(1)));
        assert_eq!(resp.get("missing"), None);
    }

    #[test]
    fn keys_in_order() {
        let resp = response();
        assert_eq!(resp.keys(), vec!["echo", "one"]);
        assert!(resp.contains("one"));
        assert!(!resp.contains("echo_word"));
    }
}
