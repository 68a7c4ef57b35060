//! Client behavior against the bundled test server.

use async_trait::async_trait;
use rust_labrad::client::Connection;
use rust_labrad::config::{ClientConfig, ConfigError, ManagerConfig};
use rust_labrad::manager::{Manager, MANAGER_NAME};
use rust_labrad::server::{Context, ServerHandler, SettingInfo};
use rust_labrad::servers::TestServer;
use rust_labrad::{LabradError, RemoteError, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TEST_SERVER: &str = "Python Test Server";

/// Manager with the test server registered, plus one connection to it.
async fn connect() -> (Manager, Connection) {
    let manager = Manager::start(ManagerConfig::default())
        .await
        .expect("Failed to start manager");
    manager
        .register(TestServer::new())
        .await
        .expect("Failed to register test server");
    let cxn = Connection::connect(&manager, &ClientConfig::default())
        .await
        .expect("Failed to connect");
    (manager, cxn)
}

#[tokio::test]
async fn test_connection_lists_servers() {
    let (_manager, cxn) = connect().await;

    let servers = cxn.servers().await.expect("servers() failed");
    assert!(servers.iter().any(|s| s == MANAGER_NAME));
    assert!(servers.iter().any(|s| s == TEST_SERVER));
    assert!(cxn.has_server("manager").await);
    assert!(cxn.has_server("python_test_server").await);
    assert!(!cxn.has_server("not_a_server").await);
}

#[tokio::test]
async fn test_server_lookup_is_repeatable() {
    let (_manager, cxn) = connect().await;

    // Looking a server up twice gives the same server
    let first = cxn.server("python_test_server").await.unwrap();
    let second = cxn.server(TEST_SERVER).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.name(), TEST_SERVER);

    let mgr_a = cxn.server("manager").await.unwrap();
    let mgr_b = cxn.server("manager").await.unwrap();
    assert_eq!(mgr_a.id(), 1);
    assert_eq!(mgr_a, mgr_b);
}

#[tokio::test]
async fn test_unknown_server_is_an_error() {
    let (_manager, cxn) = connect().await;
    let err = cxn.server("Nonexistent Server").await.unwrap_err();
    assert!(matches!(err, LabradError::ServerNotFound(_)));
}

#[tokio::test]
async fn test_settings_are_discoverable() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    assert!(pts.has_setting("echo"));
    assert!(pts.settings().iter().any(|s| s == "echo"));
    assert!(!pts.has_setting("echo_word"));
}

#[tokio::test]
async fn test_echo_preserves_values() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    let reply = pts.call("echo", "this is a test").await.unwrap();
    assert_eq!(reply.as_str(), Some("this is a test"));

    let reply = pts.call("echo", Value::quantity(15.0, "s")).await.unwrap();
    assert_eq!(reply, Value::quantity(15.0, "s"));
    assert_eq!(reply.unit(), Some("s"));

    let reply = pts.call("echo", vec![1, 2, 3]).await.unwrap();
    assert_eq!(reply.len(), Some(3));
}

#[tokio::test]
async fn test_send_then_wait() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    pts.call("echo_delay", Value::quantity(50.0, "ms")).await.unwrap();

    let pending = pts.send("delayed_echo", "one").await.unwrap();
    // The call is already queued; other work can happen here
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(pending.wait().await.unwrap().as_str(), Some("one"));
}

#[tokio::test]
async fn test_echo_delay_is_per_context() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();
    let other = pts.with_context(cxn.context());

    pts.call("echo_delay", Value::quantity(0.25, "s")).await.unwrap();
    let delay = other.call("echo_delay", ()).await.unwrap();
    assert_eq!(delay, Value::quantity(0.0, "s"));
}

#[tokio::test]
async fn test_packet_repeated_setting() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    let mut pkt = pts.packet();
    pkt.call("echo", 1).call("echo", 2).call("echo", 3);
    assert_eq!(pkt.len(), 3);

    let resp = pkt.send().await.unwrap();
    assert_eq!(resp.get("echo"), Some(Value::from(vec![1, 2, 3])));
}

#[tokio::test]
async fn test_packet_keys() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    let mut pkt = pts.packet();
    pkt.call_keyed("echo", 1, "one")
        .call_keyed("delayed_echo", "two", "two")
        .call_keyed("echo", 3, "three");

    let resp = pkt.send().await.unwrap();
    assert_eq!(resp.get("one"), Some(Value::Int(1)));
    assert_eq!(resp.get("two").and_then(|v| v.as_string()).as_deref(), Some("two"));
    assert_eq!(resp.get("three"), Some(Value::Int(3)));
    assert!(!resp.contains("four"));
    assert_eq!(resp.keys(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_packet_mutation_and_resend() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    let mut pkt = pts.packet();
    pkt.call_keyed("echo", 1, "a").call_keyed("echo", 2, "b");
    let first = pkt.send().await.unwrap();
    assert_eq!(first.get("a"), Some(Value::Int(1)));

    pkt.set("a", 100).unwrap();
    let second = pkt.send().await.unwrap();
    assert_eq!(second.get("a"), Some(Value::Int(100)));
    assert_eq!(second.get("b"), Some(Value::Int(2)));

    let err = pkt.set("c", 0).unwrap_err();
    assert!(matches!(err, LabradError::KeyNotFound(ref k) if k == "c"));
}

#[tokio::test]
async fn test_packet_with_unknown_setting_runs_nothing() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    let mut pkt = pts.packet();
    pkt.call("echo_delay", Value::quantity(1.0, "s"))
        .call("no_such_setting", ());
    let err = pkt.send().await.unwrap_err();
    assert!(matches!(err, LabradError::SettingNotFound { .. }));

    // The first record must not have executed
    let delay = pts.call("echo_delay", ()).await.unwrap();
    assert_eq!(delay, Value::quantity(0.0, "s"));
}

#[tokio::test]
async fn test_exceptions_propagate() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    for setting in [
        "exc_in_handler",
        "exc_in_subfunction",
        "exc_in_deferred",
        "exc_in_errback",
        "exc_in_inlinecallback",
    ] {
        let err = pts.call(setting, ()).await.unwrap_err();
        match &err {
            LabradError::Remote {
                server,
                setting: failed,
                ..
            } => {
                assert_eq!(server, TEST_SERVER);
                assert_eq!(failed, setting);
            }
            other => panic!("{} returned {:?}", setting, other),
        }
        assert!(err.remote().is_some());
    }

    // The server keeps serving after a failure
    assert_eq!(pts.call("echo", 7).await.unwrap(), Value::Int(7));
}

#[tokio::test]
async fn test_failing_record_aborts_packet() {
    let (_manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    let mut pkt = pts.packet();
    pkt.call("exc_in_handler", ())
        .call("echo_delay", Value::quantity(1.0, "s"));
    let err = pkt.send().await.unwrap_err();
    assert!(matches!(err, LabradError::Remote { .. }));

    let delay = pts.call("echo_delay", ()).await.unwrap();
    assert_eq!(delay, Value::quantity(0.0, "s"));
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let (manager, _cxn) = connect().await;
    let err = manager.register(TestServer::new()).await.unwrap_err();
    assert!(matches!(err, LabradError::DuplicateServer(_)));
}

#[tokio::test]
async fn test_unregistered_server_disappears() {
    let (manager, cxn) = connect().await;
    let pts = cxn.server("python_test_server").await.unwrap();

    manager.unregister(TEST_SERVER).await.unwrap();
    assert!(!cxn.has_server(TEST_SERVER).await);
    assert!(pts.call("echo", 1).await.is_err());
}

/// Server that records every context it is told to forget.
struct ExpiryRecorder {
    expired: Arc<Mutex<Vec<Context>>>,
}

#[async_trait]
impl ServerHandler for ExpiryRecorder {
    fn name(&self) -> &str {
        "Expiry Recorder"
    }

    fn settings(&self) -> Vec<SettingInfo> {
        vec![SettingInfo::new(1, "touch")]
    }

    async fn handle(
        &mut self,
        _ctx: Context,
        _setting: &str,
        args: Value,
    ) -> Result<Value, RemoteError> {
        Ok(args)
    }

    async fn expire_context(&mut self, ctx: Context) {
        self.expired.lock().unwrap().push(ctx);
    }
}

async fn recording_manager() -> (Manager, Arc<Mutex<Vec<Context>>>) {
    let expired = Arc::new(Mutex::new(Vec::new()));
    let manager = Manager::start(ManagerConfig::default())
        .await
        .expect("Failed to start manager");
    manager
        .register(ExpiryRecorder {
            expired: expired.clone(),
        })
        .await
        .expect("Failed to register recorder");
    (manager, expired)
}

fn sorted(contexts: &Mutex<Vec<Context>>) -> Vec<Context> {
    let mut contexts = contexts.lock().unwrap().clone();
    contexts.sort();
    contexts
}

#[tokio::test]
async fn test_disconnect_expires_only_own_contexts() {
    let (manager, expired) = recording_manager().await;
    let config = ClientConfig::default();
    let first = Connection::connect(&manager, &config).await.unwrap();
    let second = Connection::connect(&manager, &config).await.unwrap();

    let rec_first = first.server("expiry_recorder").await.unwrap();
    let extra = first.context();
    rec_first.call("touch", 1).await.unwrap();
    rec_first.with_context(extra).call("touch", 2).await.unwrap();

    let rec_second = second.server("expiry_recorder").await.unwrap();
    rec_second.call("touch", 3).await.unwrap();

    let first_default = first.default_context();
    first.disconnect().await;

    let mut expected = vec![first_default, extra];
    expected.sort();
    assert_eq!(sorted(&expired), expected);

    // The other connection is untouched and keeps working
    assert_eq!(rec_second.call("touch", 4).await.unwrap(), Value::Int(4));
    let second_default = second.default_context();
    second.disconnect().await;
    assert!(sorted(&expired).contains(&second_default));
    assert_eq!(expired.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_dropped_connection_expires_contexts() {
    let (manager, expired) = recording_manager().await;
    let cxn = Connection::connect(&manager, &ClientConfig::default())
        .await
        .unwrap();
    let recorder = cxn.server("expiry_recorder").await.unwrap();
    recorder.call("touch", ()).await.unwrap();
    let ctx = cxn.default_context();

    drop(cxn);

    // Expiry runs in the background after a drop
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while expired.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sorted(&expired), vec![ctx]);

    let err = recorder.call("touch", ()).await.unwrap_err();
    assert!(matches!(err, LabradError::ConnectionClosed(_)));
}

#[tokio::test]
async fn test_zero_queue_capacity_fails_to_start() {
    let result = Manager::start(ManagerConfig { queue_capacity: 0 }).await;
    assert!(matches!(
        result,
        Err(LabradError::Config(ConfigError::ValidationError(_)))
    ));
}
