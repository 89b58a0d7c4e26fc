//! Connection registry tests.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use common::{MockServer, full_capabilities, pair};
use cortex_lsp_client::{
    BackendId, ClientConfig, Connection, ConnectionRegistry, ConnectionState, Language, Result, Transport,
    TransportFactory,
};

// =============================================================================
// Mock factory
// =============================================================================

/// Hands every new backend's server half to the test.
struct MockFactory {
    connects: AtomicUsize,
    servers: mpsc::UnboundedSender<(BackendId, MockServer)>,
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, backend: &BackendId) -> Result<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (transport, server) = pair();
        let _ = self.servers.send((*backend, server));
        Ok(transport)
    }
}

struct Harness {
    factory: Arc<MockFactory>,
    registry: ConnectionRegistry,
    servers: Mutex<mpsc::UnboundedReceiver<(BackendId, MockServer)>>,
}

impl Harness {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(MockFactory {
            connects: AtomicUsize::new(0),
            servers: tx,
        });
        let registry = ConnectionRegistry::new(factory.clone(), ClientConfig::default()).with_root("/work/project");
        Self {
            factory,
            registry,
            servers: Mutex::new(rx),
        }
    }

    async fn next_server(&self) -> (BackendId, MockServer) {
        self.servers.lock().await.recv().await.unwrap()
    }

    fn connects(&self) -> usize {
        self.factory.connects.load(Ordering::SeqCst)
    }
}

async fn wait_for_state(connection: &Connection, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while connection.state() != state {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

fn answer_shutdown(mut server: MockServer) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (id, _) = server.expect_request("shutdown").await;
        server.respond(id, Value::Null);
        server.expect_notification("exit").await;
    })
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_connection_is_shared_per_backend() {
    let harness = Harness::new();
    let backend = BackendId::Language(Language::Go);

    let connection = harness.registry.get_or_connect(backend).await.unwrap();
    let (announced, mut server) = harness.next_server().await;
    assert_eq!(announced, backend);

    let params = server.handshake(full_capabilities(), true).await;
    assert_eq!(params["rootUri"], json!("file:///work/project"));
    assert!(connection.wait_ready().await);

    let again = harness.registry.get_or_connect(backend).await.unwrap();
    assert!(Arc::ptr_eq(&connection, &again));

    let by_path = harness
        .registry
        .connect_for_path(Path::new("/work/project/cmd/main.go"))
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&connection, &by_path));
    assert!(harness.registry.connect_for_path(Path::new("/work/Makefile")).await.unwrap().is_none());

    assert_eq!(harness.connects(), 1);
    assert_eq!(harness.registry.backends().await, vec![backend]);
}

#[tokio::test]
async fn test_closed_connection_is_replaced() {
    let harness = Harness::new();
    let backend = BackendId::Language(Language::Rust);

    let first = harness.registry.get_or_connect(backend).await.unwrap();
    let (_, mut server) = harness.next_server().await;
    server.handshake(full_capabilities(), true).await;
    assert!(first.wait_ready().await);

    server.hang_up();
    wait_for_state(&first, ConnectionState::Closed).await;

    let second = harness.registry.get_or_connect(backend).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(harness.connects(), 2);

    let (_, mut server) = harness.next_server().await;
    server.handshake(full_capabilities(), true).await;
    assert!(second.wait_ready().await);
}

#[tokio::test]
async fn test_failed_connection_is_not_retried() {
    let harness = Harness::new();

    let connection = harness.registry.get_or_connect(BackendId::Assist).await.unwrap();
    let (_, mut server) = harness.next_server().await;
    let (id, _) = server.expect_request("initialize").await;
    server.respond_error(id, -32603, "not signed in");

    assert!(!connection.wait_ready().await);
    assert_eq!(connection.state(), ConnectionState::Failed);

    let again = harness.registry.get_or_connect(BackendId::Assist).await.unwrap();
    assert!(Arc::ptr_eq(&connection, &again));
    assert_eq!(harness.connects(), 1);
}

#[tokio::test]
async fn test_shutdown_forgets_connection() {
    let harness = Harness::new();
    let backend = BackendId::Language(Language::Go);

    let connection = harness.registry.get_or_connect(backend).await.unwrap();
    let (_, mut server) = harness.next_server().await;
    server.handshake(full_capabilities(), true).await;
    assert!(connection.wait_ready().await);

    let answered = answer_shutdown(server);
    harness.registry.shutdown(backend).await.unwrap();
    answered.await.unwrap();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(harness.registry.get(backend).await.is_none());

    // unknown backends are ignored
    harness.registry.shutdown(BackendId::Assist).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_all() {
    let harness = Harness::new();
    let mut connections = Vec::new();
    let mut answered = Vec::new();

    for backend in [BackendId::Language(Language::Go), BackendId::Assist] {
        let connection = harness.registry.get_or_connect(backend).await.unwrap();
        let (_, mut server) = harness.next_server().await;
        server
            .handshake(full_capabilities(), backend != BackendId::Assist)
            .await;
        assert!(connection.wait_ready().await);
        answered.push(answer_shutdown(server));
        connections.push(connection);
    }

    harness.registry.shutdown_all().await;
    for handle in answered {
        handle.await.unwrap();
    }

    assert!(connections.iter().all(|c| c.state() == ConnectionState::Closed));
    assert!(harness.registry.backends().await.is_empty());
}
