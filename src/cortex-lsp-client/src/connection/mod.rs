//! One backend connection: request correlation, readiness and routing.

mod capabilities;
mod requests;
mod server_requests;

pub use capabilities::{Capability, ServerCapabilitySet};
pub use server_requests::ServerRequest;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lsp_types::{
    InitializeResult, LogMessageParams, MessageType, PublishDiagnosticsParams, Url,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::document::hash_text;
use crate::jsonrpc::{Message, RequestId};
use crate::language::{Language, LanguageConfig};
use crate::transport::Transport;
use crate::{LspError, Result};

/// Identity of a backend: one per language, plus the AI completion backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendId {
    Language(Language),
    Assist,
}

/// Readiness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    Initializing,
    Ready,
    Closed,
    /// The initialize handshake failed; the connection is never retried.
    Failed,
}

/// Events routed from the backend to attached sessions.
#[derive(Debug, Clone)]
pub enum ServerNotification {
    PublishDiagnostics(PublishDiagnosticsParams),
    SemanticTokensRefresh,
}

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>;

/// Removes a request from the pending table however its caller finishes.
struct PendingRequest<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Sync state of one open document, shared by every session attached to it.
#[derive(Debug)]
struct OpenDocument {
    version: i32,
    last_sent_hash: u64,
    sessions: usize,
}

/// A connection to one backend over a [`Transport`].
pub struct Connection {
    backend: BackendId,
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    language: Option<LanguageConfig>,
    next_id: AtomicU64,
    pending: PendingTable,
    state: watch::Sender<ConnectionState>,
    pub(crate) capabilities: RwLock<ServerCapabilitySet>,
    documents: Mutex<HashMap<Url, OpenDocument>>,
    /// Serializes version assignment with the didChange send.
    document_sync: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
    sessions: Mutex<HashMap<u64, mpsc::UnboundedSender<ServerNotification>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Bind a connection to `transport` and start reading from it.
    pub fn new(backend: BackendId, transport: Arc<dyn Transport>, config: Arc<ClientConfig>) -> Arc<Self> {
        let language = match backend {
            BackendId::Language(language) => Some(config.language_config(language)),
            BackendId::Assist => None,
        };

        let connection = Arc::new(Self {
            backend,
            transport: transport.clone(),
            config,
            language,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            state: watch::Sender::new(ConnectionState::NotStarted),
            capabilities: RwLock::new(ServerCapabilitySet::default()),
            documents: Mutex::new(HashMap::new()),
            document_sync: tokio::sync::Mutex::new(()),
            next_session: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::read_loop(Arc::downgrade(&connection), transport));
        *connection.reader.lock() = Some(handle);
        connection
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Language quirks; `None` for the AI completion backend.
    pub fn language(&self) -> Option<&LanguageConfig> {
        self.language.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Wait until the handshake settles. Returns whether the connection is Ready.
    pub async fn wait_ready(&self) -> bool {
        let mut state = self.state.subscribe();
        let settled = state
            .wait_for(|s| !matches!(s, ConnectionState::NotStarted | ConnectionState::Initializing))
            .await
            .map(|s| *s);
        matches!(settled, Ok(ConnectionState::Ready))
    }

    pub fn capabilities(&self) -> ServerCapabilitySet {
        self.capabilities.read().clone()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.read().supports(capability)
    }

    /// Gate for feature requests: Ready and advertised.
    pub fn ensure_feature(&self, capability: Capability) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(LspError::NotReady(state));
        }
        if !self.supports(capability) {
            return Err(LspError::CapabilityMissing(capability.method()));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            state @ (ConnectionState::Closed | ConnectionState::Failed) => Err(LspError::NotReady(state)),
            _ => Ok(()),
        }
    }

    /// Send a request and wait for the response with the same id.
    pub async fn send_request<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        self.ensure_open()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let params = serde_json::to_value(params)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _pending = PendingRequest {
            pending: &self.pending,
            id,
        };

        if let Err(e) = self
            .transport
            .send(Message::request(RequestId::Number(id), method, params))
            .await
        {
            self.fail_transport(&e.to_string());
            return Err(e);
        }

        let value = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(LspError::TransportFailure(
                    "connection dropped before the response arrived".into(),
                ));
            }
            Err(_) => {
                warn!(
                    "LSP request '{}' (id={}) timed out after {:?}",
                    method, id, self.config.request_timeout
                );
                return Err(LspError::Timeout(method.to_string()));
            }
        };

        serde_json::from_value(value)
            .map_err(|e| LspError::MalformedResponse(format!("{}: {}", method, e)))
    }

    /// Send a one-way notification.
    pub async fn send_notification<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        self.ensure_open()?;
        let params = serde_json::to_value(params)?;
        if let Err(e) = self.transport.send(Message::notification(method, params)).await {
            self.fail_transport(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Run the initialize handshake. A failure is terminal.
    pub async fn initialize(&self, root: Option<Url>) -> Result<()> {
        let started = self.state.send_if_modified(|state| {
            if *state == ConnectionState::NotStarted {
                *state = ConnectionState::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(LspError::InitializationFailure(format!(
                "connection already {:?}",
                self.state()
            )));
        }

        match self.handshake(root).await {
            Ok(()) => {
                self.state.send_replace(ConnectionState::Ready);
                info!(backend = ?self.backend, "Backend ready");
                Ok(())
            }
            Err(e) => {
                self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Initializing {
                        *state = ConnectionState::Failed;
                        true
                    } else {
                        false
                    }
                });
                error!(backend = ?self.backend, error = %e, "Initialize handshake failed");
                Err(LspError::InitializationFailure(e.to_string()))
            }
        }
    }

    async fn handshake(&self, root: Option<Url>) -> Result<()> {
        let result: InitializeResult = self.send_request("initialize", self.initialize_params(root)).await?;
        *self.capabilities.write() = ServerCapabilitySet::from_server_capabilities(&result.capabilities);

        if let Some(info) = &result.server_info {
            debug!(
                backend = ?self.backend,
                server = %info.name,
                version = info.version.as_deref().unwrap_or("unknown"),
                "Backend identified"
            );
        }

        self.send_notification("initialized", json!({})).await?;

        if let Some(language) = &self.language {
            if !language.settings.is_null() {
                self.send_notification(
                    "workspace/didChangeConfiguration",
                    json!({ "settings": language.settings }),
                )
                .await?;
            }
        }
        Ok(())
    }

    fn initialize_params(&self, root: Option<Url>) -> Value {
        let mut text_document = json!({
            "synchronization": {
                "dynamicRegistration": true,
                "didSave": false,
                "willSave": false,
                "willSaveWaitUntil": false
            },
            "hover": {
                "dynamicRegistration": true,
                "contentFormat": ["markdown", "plaintext"]
            },
            "completion": {
                "dynamicRegistration": true,
                "contextSupport": true,
                "completionItem": {
                    "snippetSupport": true,
                    "documentationFormat": ["markdown", "plaintext"],
                    "resolveSupport": { "properties": ["documentation", "detail", "additionalTextEdits"] },
                    "insertReplaceSupport": true
                }
            },
            "definition": { "dynamicRegistration": true, "linkSupport": true },
            "references": { "dynamicRegistration": true },
            "documentHighlight": { "dynamicRegistration": true },
            "documentSymbol": { "dynamicRegistration": true, "hierarchicalDocumentSymbolSupport": true },
            "documentLink": { "dynamicRegistration": true },
            "codeAction": {
                "dynamicRegistration": true,
                "isPreferredSupport": true,
                "codeActionLiteralSupport": {
                    "codeActionKind": {
                        "valueSet": ["", "quickfix", "refactor", "refactor.extract", "refactor.inline",
                                     "refactor.rewrite", "source", "source.organizeImports"]
                    }
                }
            },
            "publishDiagnostics": { "relatedInformation": false }
        });

        let mut workspace = json!({
            "applyEdit": false,
            "workspaceEdit": { "documentChanges": true },
            "symbol": { "dynamicRegistration": true },
            "executeCommand": { "dynamicRegistration": true },
            "didChangeConfiguration": { "dynamicRegistration": true }
        });

        if self.backend != BackendId::Assist {
            text_document["semanticTokens"] = json!({
                "dynamicRegistration": true,
                "requests": { "full": true },
                "tokenTypes": STANDARD_TOKEN_TYPES,
                "tokenModifiers": STANDARD_TOKEN_MODIFIERS,
                "formats": ["relative"],
                "overlappingTokenSupport": false,
                "multilineTokenSupport": false
            });
            workspace["configuration"] = json!(true);
            workspace["semanticTokens"] = json!({ "refreshSupport": true });
        }

        let folders = root.as_ref().map(|uri| {
            json!([{
                "uri": uri,
                "name": uri.path_segments().and_then(|mut s| s.next_back()).unwrap_or("workspace"),
            }])
        });

        json!({
            "processId": std::process::id(),
            "clientInfo": { "name": "cortex", "version": env!("CARGO_PKG_VERSION") },
            "rootUri": root,
            "workspaceFolders": folders,
            "capabilities": {
                "textDocument": text_document,
                "workspace": workspace,
                "window": { "workDoneProgress": true }
            }
        })
    }

    /// Announce an open document. Opening an already open URI only counts
    /// another holder and returns `false`. Allowed before the connection is Ready.
    pub async fn did_open(&self, uri: &Url, language_id: &str, text: &str) -> Result<bool> {
        self.ensure_open()?;
        {
            let mut documents = self.documents.lock();
            if let Some(document) = documents.get_mut(uri) {
                document.sessions += 1;
                trace!(uri = %uri, holders = document.sessions, "Document already open");
                return Ok(false);
            }
            documents.insert(
                uri.clone(),
                OpenDocument {
                    version: 0,
                    last_sent_hash: hash_text(text),
                    sessions: 1,
                },
            );
        }

        let params = json!({
            "textDocument": {
                "uri": uri,
                "languageId": language_id,
                "version": 0,
                "text": text,
            }
        });
        if let Err(e) = self.send_notification("textDocument/didOpen", params).await {
            self.documents.lock().remove(uri);
            return Err(e);
        }
        Ok(true)
    }

    /// Send the full text of an open `uri` under the next version. Returns
    /// the version sent, or `None` when the backend already has this text or
    /// the document is not open.
    pub async fn did_change(&self, uri: &Url, text: &str) -> Result<Option<i32>> {
        let _sync = self.document_sync.lock().await;
        let hash = hash_text(text);
        let version = {
            let mut documents = self.documents.lock();
            let Some(document) = documents.get_mut(uri) else {
                return Ok(None);
            };
            if document.last_sent_hash == hash {
                return Ok(None);
            }
            document.last_sent_hash = hash;
            document.version += 1;
            document.version
        };

        let params = json!({
            "textDocument": { "uri": uri, "version": version },
            "contentChanges": [{ "text": text }],
        });
        self.send_notification("textDocument/didChange", params).await?;
        Ok(Some(version))
    }

    /// Release one holder of `uri`; the last one closes it. Returns whether
    /// `didClose` was sent.
    pub async fn did_close(&self, uri: &Url) -> Result<bool> {
        {
            let mut documents = self.documents.lock();
            let Some(document) = documents.get_mut(uri) else {
                return Ok(false);
            };
            document.sessions -= 1;
            if document.sessions > 0 {
                return Ok(false);
            }
            documents.remove(uri);
        }
        self.send_notification("textDocument/didClose", json!({ "textDocument": { "uri": uri } }))
            .await?;
        Ok(true)
    }

    pub fn is_open(&self, uri: &Url) -> bool {
        self.documents.lock().contains_key(uri)
    }

    /// Version of the last text sent for `uri`, if it is open.
    pub fn document_version(&self, uri: &Url) -> Option<i32> {
        self.documents.lock().get(uri).map(|document| document.version)
    }

    /// Register a session for routed notifications; returns its handle.
    pub fn attach_session(&self, sender: mpsc::UnboundedSender<ServerNotification>) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().insert(id, sender);
        id
    }

    pub fn detach_session(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn broadcast(&self, notification: ServerNotification) {
        self.sessions
            .lock()
            .retain(|_, sender| sender.send(notification.clone()).is_ok());
    }

    /// Mark the transport broken: reject pending requests and detach sessions.
    pub fn fail_transport(&self, reason: &str) {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }
        warn!(backend = ?self.backend, reason, "Backend connection lost");
        self.reject_pending(reason);
        self.sessions.lock().clear();
        self.documents.lock().clear();
    }

    fn reject_pending(&self, reason: &str) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, sender) in pending {
            let _ = sender.send(Err(LspError::TransportFailure(reason.to_string())));
        }
    }

    /// Orderly shutdown: `shutdown`, `exit`, close the transport.
    pub async fn shutdown(&self) -> Result<()> {
        let state = self.state();
        if state == ConnectionState::Closed {
            return Ok(());
        }

        if matches!(state, ConnectionState::Ready | ConnectionState::Initializing) {
            let acknowledged = tokio::time::timeout(
                self.config.shutdown_timeout,
                self.send_request::<_, Value>("shutdown", Value::Null),
            )
            .await;
            match acknowledged {
                Ok(Ok(_)) => debug!(backend = ?self.backend, "Backend acknowledged shutdown"),
                Ok(Err(e)) => warn!(backend = ?self.backend, error = %e, "Shutdown request failed"),
                Err(_) => warn!(backend = ?self.backend, "Backend did not acknowledge shutdown in time"),
            }
            if let Err(e) = self.send_notification("exit", Value::Null).await {
                debug!(error = %e, "Failed to send exit");
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        self.reject_pending("connection shut down");
        self.sessions.lock().clear();
        self.documents.lock().clear();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.transport.close().await
    }

    async fn read_loop(weak: Weak<Connection>, transport: Arc<dyn Transport>) {
        loop {
            let received = transport.recv().await;
            let Some(connection) = weak.upgrade() else {
                break;
            };
            match received {
                Ok(Some(message)) => connection.dispatch(message).await,
                Ok(None) => {
                    connection.fail_transport("backend closed the channel");
                    break;
                }
                Err(LspError::InvalidMessage { id, reason }) => connection.reject_invalid(id, reason),
                Err(e) => {
                    connection.fail_transport(&e.to_string());
                    break;
                }
            }
        }
    }

    /// A bad message fails at most the request it answers.
    fn reject_invalid(&self, id: Option<RequestId>, reason: String) {
        warn!(backend = ?self.backend, id = ?id, reason = %reason, "Discarding invalid message");
        let Some(RequestId::Number(id)) = id else {
            return;
        };
        let Some(sender) = self.pending.lock().remove(&id) else {
            return;
        };
        let _ = sender.send(Err(LspError::MalformedResponse(reason)));
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::Response { id, result } => {
                let RequestId::Number(id) = id else {
                    debug!(id = %id, "Dropping response with a foreign id");
                    return;
                };
                let Some(sender) = self.pending.lock().remove(&id) else {
                    debug!(id, "Dropping response for an unknown or expired request");
                    return;
                };
                let _ = sender.send(result.map_err(LspError::from));
            }
            Message::Notification { method, params } => self.handle_notification(&method, params),
            Message::Request { id, method, params } => {
                let reply = ServerRequest::parse(&method, params)
                    .and_then(|request| self.answer_server_request(request));
                if let Err(e) = self.transport.send(Message::response(id, reply)).await {
                    self.fail_transport(&e.to_string());
                }
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "textDocument/publishDiagnostics" => {
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(params) => self.broadcast(ServerNotification::PublishDiagnostics(params)),
                    Err(e) => warn!(error = %e, "Malformed publishDiagnostics"),
                }
            }
            "window/logMessage" | "window/showMessage" => {
                let Ok(params) = serde_json::from_value::<LogMessageParams>(params) else {
                    return;
                };
                let backend = self.backend;
                match params.typ {
                    MessageType::ERROR => error!(?backend, "{}", params.message),
                    MessageType::WARNING => warn!(?backend, "{}", params.message),
                    MessageType::INFO => info!(?backend, "{}", params.message),
                    _ => debug!(?backend, "{}", params.message),
                }
            }
            _ => trace!(method, "Ignoring backend notification"),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

const STANDARD_TOKEN_TYPES: &[&str] = &[
    "namespace", "type", "class", "enum", "interface", "struct", "typeParameter", "parameter",
    "variable", "property", "enumMember", "event", "function", "method", "macro", "keyword",
    "modifier", "comment", "string", "number", "regexp", "operator", "decorator",
];

const STANDARD_TOKEN_MODIFIERS: &[&str] = &[
    "declaration", "definition", "readonly", "static", "deprecated", "abstract", "async",
    "modification", "documentation", "defaultLibrary",
];
