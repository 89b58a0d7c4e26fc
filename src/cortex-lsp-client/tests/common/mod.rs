//! In-memory backend used by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use cortex_lsp_client::{
    BackendId, ClientConfig, Connection, LspError, Message, RequestId, ResponseError, Result, Transport,
};

// =============================================================================
// Mock transport
// =============================================================================

/// Client half of an in-memory channel.
pub struct MockTransport {
    outgoing: mpsc::UnboundedSender<Message>,
    incoming: Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LspError::TransportFailure("transport closed".into()));
        }
        self.outgoing
            .send(message)
            .map_err(|_| LspError::TransportFailure("backend gone".into()))
    }

    async fn recv(&self) -> Result<Option<Message>> {
        Ok(self.incoming.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Backend half of an in-memory channel.
pub struct MockServer {
    from_client: mpsc::UnboundedReceiver<Message>,
    to_client: Option<mpsc::UnboundedSender<Message>>,
}

pub fn pair() -> (Arc<MockTransport>, MockServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        outgoing: client_tx,
        incoming: Mutex::new(client_rx),
        closed: AtomicBool::new(false),
    });
    let server = MockServer {
        from_client: server_rx,
        to_client: Some(server_tx),
    };
    (transport, server)
}

impl MockServer {
    /// Next message from the client; panics if none arrives in time.
    pub async fn next(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(60), self.from_client.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client side dropped")
    }

    /// Message already sent by the client, if any.
    pub fn try_next(&mut self) -> Option<Message> {
        self.from_client.try_recv().ok()
    }

    /// Next request named `method`; other messages are skipped.
    pub async fn expect_request(&mut self, method: &str) -> (RequestId, Value) {
        loop {
            match self.next().await {
                Message::Request {
                    id,
                    method: m,
                    params,
                } if m == method => return (id, params),
                _ => continue,
            }
        }
    }

    /// Next notification named `method`; other messages are skipped.
    pub async fn expect_notification(&mut self, method: &str) -> Value {
        loop {
            match self.next().await {
                Message::Notification { method: m, params } if m == method => return params,
                _ => continue,
            }
        }
    }

    /// Next response to a backend-initiated request.
    pub async fn expect_response(&mut self) -> (RequestId, std::result::Result<Value, ResponseError>) {
        loop {
            if let Message::Response { id, result } = self.next().await {
                return (id, result);
            }
        }
    }

    fn send(&self, message: Message) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(message);
        }
    }

    pub fn respond(&self, id: RequestId, result: Value) {
        self.send(Message::response(id, Ok(result)));
    }

    pub fn respond_error(&self, id: RequestId, code: i64, message: &str) {
        self.send(Message::response(id, Err(ResponseError::new(code, message))));
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send(Message::notification(method, params));
    }

    /// Send a backend-to-client request.
    pub fn request(&self, id: &str, method: &str, params: Value) {
        self.send(Message::request(RequestId::String(id.into()), method, params));
    }

    /// Drop the backend's sending half, as if the process died.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Answer `initialize` with `capabilities` and consume the follow-up
    /// notifications. Returns the initialize params.
    pub async fn handshake(&mut self, capabilities: Value, expect_settings: bool) -> Value {
        let (id, params) = self.expect_request("initialize").await;
        self.respond(
            id,
            json!({ "capabilities": capabilities, "serverInfo": { "name": "mock", "version": "1.0" } }),
        );
        self.expect_notification("initialized").await;
        if expect_settings {
            self.expect_notification("workspace/didChangeConfiguration").await;
        }
        params
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn full_capabilities() -> Value {
    json!({
        "textDocumentSync": 1,
        "hoverProvider": true,
        "definitionProvider": true,
        "referencesProvider": true,
        "documentHighlightProvider": true,
        "documentSymbolProvider": true,
        "workspaceSymbolProvider": true,
        "completionProvider": { "resolveProvider": true, "triggerCharacters": ["."] },
        "codeActionProvider": true,
        "documentLinkProvider": {},
        "executeCommandProvider": { "commands": ["fix.all"] },
        "semanticTokensProvider": {
            "legend": { "tokenTypes": ["keyword", "variable"], "tokenModifiers": ["declaration"] },
            "full": true
        }
    })
}

/// A connection that completed its handshake with `capabilities`.
pub async fn ready_connection(
    backend: BackendId,
    capabilities: Value,
    config: ClientConfig,
) -> (Arc<Connection>, MockServer) {
    let (transport, mut server) = pair();
    let connection = Connection::new(backend, transport, Arc::new(config));
    let expect_settings = connection
        .language()
        .is_some_and(|language| !language.settings.is_null());

    let init = tokio::spawn({
        let connection = connection.clone();
        async move { connection.initialize(None).await }
    });
    server.handshake(capabilities, expect_settings).await;
    init.await.unwrap().unwrap();
    assert!(connection.is_ready());

    (connection, server)
}
