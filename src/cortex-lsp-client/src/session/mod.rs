//! Per-document synchronization and feature operations.
//!
//! Feature calls never fail towards the editor layer: backend errors, a
//! missing capability or a connection that is not Ready all resolve to an
//! empty result and a log line.

pub mod completion;

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use lsp_types::{
    DocumentHighlightKind, DocumentSymbolResponse, GotoDefinitionResponse, HoverContents, Location,
    MarkedString, Range, SymbolKind, Url,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::clock::{Debouncer, Timer};
use crate::code_actions::{ActionTransaction, CodeAction, actions_from_response};
use crate::config::ClientConfig;
use crate::connection::{Capability, Connection, ServerNotification};
use crate::diagnostics::{self, Diagnostic, DiagnosticOrigin};
use crate::document::{TextChange, TextDocument, TextSnapshot};
use crate::language::{Language, LanguageConfig};
use crate::semantic_tokens::{self, SemanticToken};
use crate::{LspError, Result};

use completion::CompletionCache;

/// A published value and the document version it was computed against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Versioned<T> {
    pub version: i32,
    pub value: T,
}

impl<T> Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Flattened hover contents.
#[derive(Debug, Clone, PartialEq)]
pub struct HoverInfo {
    pub contents: String,
    /// Range the hover applies to, in absolute offsets.
    pub range: Option<(usize, usize)>,
    /// Document version the hover was computed against.
    pub version: i32,
}

/// Where a definition lives. The range is kept in wire positions since the
/// target is usually another document.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionTarget {
    pub path: PathBuf,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Highlight {
    pub from: usize,
    pub to: usize,
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolEntry {
    pub name: String,
    pub kind: SymbolKind,
    pub detail: Option<String>,
    pub from: usize,
    pub to: usize,
    /// Nesting depth; top-level symbols are 0.
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkTarget {
    pub from: usize,
    pub to: usize,
    pub target: Option<Url>,
}

/// One open document bound to a [`Connection`].
pub struct DocumentSession {
    id: u64,
    connection: Arc<Connection>,
    document: Arc<dyn TextDocument>,
    uri: Url,
    language: LanguageConfig,
    config: Arc<ClientConfig>,
    timer: Arc<dyn Timer>,
    /// Last version this session saw, for when the document is no longer open.
    version: AtomicI32,
    pending_text: Mutex<Option<String>>,
    change_debounce: Debouncer,
    tokens_debounce: Debouncer,
    diagnostics_debounce: Debouncer,
    diagnostics_tx: watch::Sender<Versioned<Vec<Diagnostic>>>,
    tokens_tx: watch::Sender<Versioned<Vec<SemanticToken>>>,
    completion: CompletionCache,
    listener: Mutex<Option<JoinHandle<()>>>,
    detached: AtomicBool,
}

fn log_failure(operation: &str, error: &LspError) {
    match error {
        LspError::NotReady(_) | LspError::CapabilityMissing(_) => {
            trace!(operation, error = %error, "Feature unavailable")
        }
        _ => warn!(operation, error = %error, "Backend request failed"),
    }
}

impl DocumentSession {
    /// Open `document` on `connection`. The open is sent even while the
    /// connection is still initializing. Sessions on the same path share the
    /// backend's copy of the document and its version sequence.
    pub async fn attach(
        connection: Arc<Connection>,
        document: Arc<dyn TextDocument>,
        timer: Arc<dyn Timer>,
    ) -> Result<Arc<Self>> {
        let uri = document.uri()?;
        let language = match connection.language() {
            Some(language) => language.clone(),
            None => Language::from_path(document.path())
                .map(|language| connection.config().language_config(language))
                .ok_or_else(|| LspError::InvalidPath(document.path().display().to_string()))?,
        };
        let config = connection.config().clone();
        let text = document.current_text();

        let (tx, rx) = mpsc::unbounded_channel();
        let id = connection.attach_session(tx);

        let session = Arc::new(Self {
            id,
            connection: connection.clone(),
            uri: uri.clone(),
            language,
            change_debounce: Debouncer::new(timer.clone(), config.change_debounce),
            tokens_debounce: Debouncer::new(timer.clone(), config.semantic_tokens_debounce),
            diagnostics_debounce: Debouncer::new(timer.clone(), config.diagnostics_debounce),
            config,
            timer,
            document,
            version: AtomicI32::new(0),
            pending_text: Mutex::new(None),
            diagnostics_tx: watch::Sender::new(Versioned::default()),
            tokens_tx: watch::Sender::new(Versioned::default()),
            completion: CompletionCache::default(),
            listener: Mutex::new(None),
            detached: AtomicBool::new(false),
        });

        let listener = tokio::spawn(Self::listen(Arc::downgrade(&session), rx));
        *session.listener.lock() = Some(listener);

        if let Err(e) = connection.did_open(&uri, session.language.language.id(), &text).await {
            session.detached.store(true, Ordering::SeqCst);
            connection.detach_session(id);
            return Err(e);
        }
        session.version.store(session.version(), Ordering::SeqCst);

        debug!(uri = %uri, "Attached document session");
        Ok(session)
    }

    async fn listen(weak: Weak<Self>, mut rx: mpsc::UnboundedReceiver<ServerNotification>) {
        while let Some(notification) = rx.recv().await {
            let Some(session) = weak.upgrade() else {
                break;
            };
            session.process_notification(notification);
        }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Version of the last change sent to the backend for this document.
    pub fn version(&self) -> i32 {
        self.connection
            .document_version(&self.uri)
            .unwrap_or_else(|| self.version.load(Ordering::SeqCst))
    }

    /// Queue the document's new text; it is sent after the change debounce.
    pub fn send_change(self: &Arc<Self>, text: impl Into<String>) {
        *self.pending_text.lock() = Some(text.into());
        let weak = Arc::downgrade(self);
        self.change_debounce.schedule(async move {
            if let Some(session) = weak.upgrade() {
                session.flush_change().await;
            }
        });
    }

    /// Send any queued change now. Without a queued change the current text
    /// is synced, which is a no-op if the backend already has it.
    pub async fn flush_change(&self) {
        self.change_debounce.cancel();
        let text = self
            .pending_text
            .lock()
            .take()
            .unwrap_or_else(|| self.document.current_text());
        self.sync_text(&text).await;
    }

    async fn sync_text(&self, text: &str) {
        match self.connection.did_change(&self.uri, text).await {
            Ok(Some(version)) => self.version.store(version, Ordering::SeqCst),
            Ok(None) => {}
            Err(e) => warn!(uri = %self.uri, error = %e, "Failed to send document change"),
        }
    }

    pub async fn hover(&self, offset: usize) -> Option<HoverInfo> {
        let version = self.version();
        let position = self.document.offset_to_position(offset);
        let hover = match self.connection.hover(&self.uri, position).await {
            Ok(hover) => hover?,
            Err(e) => {
                log_failure("hover", &e);
                return None;
            }
        };

        let contents = match hover.contents {
            HoverContents::Scalar(marked) => marked_text(marked),
            HoverContents::Array(items) => items
                .into_iter()
                .map(marked_text)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n"),
            HoverContents::Markup(markup) => markup.value,
        };
        if contents.trim().is_empty() {
            return None;
        }

        let snapshot = self.document.snapshot();
        let range = hover
            .range
            .map(|range| (snapshot.position_to_offset(range.start), snapshot.position_to_offset(range.end)));

        Some(HoverInfo {
            contents,
            range,
            version,
        })
    }

    pub async fn goto_definition(&self, offset: usize) -> Option<DefinitionTarget> {
        let position = self.document.offset_to_position(offset);
        let response = match self.connection.goto_definition(&self.uri, position).await {
            Ok(response) => response?,
            Err(e) => {
                log_failure("definition", &e);
                return None;
            }
        };

        let (uri, range) = match response {
            GotoDefinitionResponse::Scalar(location) => (location.uri, location.range),
            GotoDefinitionResponse::Array(locations) => {
                let location = locations.into_iter().next()?;
                (location.uri, location.range)
            }
            GotoDefinitionResponse::Link(links) => {
                let link = links.into_iter().next()?;
                (link.target_uri, link.target_selection_range)
            }
        };

        Some(DefinitionTarget {
            path: uri.to_file_path().ok()?,
            range,
        })
    }

    pub async fn references(&self, offset: usize) -> Vec<Location> {
        let position = self.document.offset_to_position(offset);
        match self.connection.references(&self.uri, position, true).await {
            Ok(locations) => locations.unwrap_or_default(),
            Err(e) => {
                log_failure("references", &e);
                Vec::new()
            }
        }
    }

    pub async fn document_highlights(&self, offset: usize) -> Vec<Highlight> {
        let position = self.document.offset_to_position(offset);
        let highlights = match self.connection.document_highlight(&self.uri, position).await {
            Ok(highlights) => highlights.unwrap_or_default(),
            Err(e) => {
                log_failure("documentHighlight", &e);
                return Vec::new();
            }
        };

        let snapshot = self.document.snapshot();
        highlights
            .into_iter()
            .map(|highlight| Highlight {
                from: snapshot.position_to_offset(highlight.range.start),
                to: snapshot.position_to_offset(highlight.range.end),
                write: highlight.kind == Some(DocumentHighlightKind::WRITE),
            })
            .collect()
    }

    /// Document symbols flattened in pre-order.
    pub async fn document_symbols(&self) -> Vec<SymbolEntry> {
        let response = match self.connection.document_symbols(&self.uri).await {
            Ok(Some(response)) => response,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log_failure("documentSymbol", &e);
                return Vec::new();
            }
        };

        let snapshot = self.document.snapshot();
        let mut entries = Vec::new();
        match response {
            DocumentSymbolResponse::Flat(symbols) => {
                for symbol in symbols.into_iter().filter(|s| s.location.uri == self.uri) {
                    entries.push(SymbolEntry {
                        name: symbol.name,
                        kind: symbol.kind,
                        detail: symbol.container_name,
                        from: snapshot.position_to_offset(symbol.location.range.start),
                        to: snapshot.position_to_offset(symbol.location.range.end),
                        depth: 0,
                    });
                }
            }
            DocumentSymbolResponse::Nested(symbols) => {
                let mut stack: Vec<_> = symbols.into_iter().rev().map(|s| (s, 0)).collect();
                while let Some((symbol, depth)) = stack.pop() {
                    entries.push(SymbolEntry {
                        name: symbol.name,
                        kind: symbol.kind,
                        detail: symbol.detail,
                        from: snapshot.position_to_offset(symbol.range.start),
                        to: snapshot.position_to_offset(symbol.range.end),
                        depth,
                    });
                    if let Some(children) = symbol.children {
                        stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
                    }
                }
            }
        }
        entries
    }

    pub async fn document_links(&self) -> Vec<LinkTarget> {
        let links = match self.connection.document_links(&self.uri).await {
            Ok(links) => links.unwrap_or_default(),
            Err(e) => {
                log_failure("documentLink", &e);
                return Vec::new();
            }
        };

        let snapshot = self.document.snapshot();
        links
            .into_iter()
            .map(|link| LinkTarget {
                from: snapshot.position_to_offset(link.range.start),
                to: snapshot.position_to_offset(link.range.end),
                target: link.target,
            })
            .collect()
    }

    /// Schedule a semantic token refresh. Documents above the configured
    /// line ceiling are skipped.
    pub fn request_semantic_tokens(self: &Arc<Self>) {
        let lines = self.document.line_count();
        if lines > self.config.semantic_tokens_max_lines {
            trace!(uri = %self.uri, lines, "Document too long for semantic tokens");
            return;
        }
        let weak = Arc::downgrade(self);
        self.tokens_debounce.schedule(async move {
            if let Some(session) = weak.upgrade() {
                session.refresh_semantic_tokens().await;
            }
        });
    }

    async fn refresh_semantic_tokens(&self) {
        let Some(legend) = self.connection.capabilities().semantic_tokens else {
            return;
        };
        let version = self.version();
        let raw = match self.connection.semantic_tokens_full(&self.uri).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                log_failure("semanticTokens", &e);
                return;
            }
        };

        let snapshot = self.document.snapshot();
        let tokens = semantic_tokens::decode(&raw.data, &legend, |p| snapshot.position_to_offset(p));
        trace!(uri = %self.uri, version, count = tokens.len(), "Decoded semantic tokens");
        self.tokens_tx.send_replace(Versioned { version, value: tokens });
    }

    /// Route a backend event. Diagnostics for other documents are ignored.
    pub fn process_notification(self: &Arc<Self>, notification: ServerNotification) {
        match notification {
            ServerNotification::PublishDiagnostics(params) => {
                if params.uri != self.uri {
                    return;
                }
                let weak = Arc::downgrade(self);
                self.diagnostics_debounce.schedule(async move {
                    if let Some(session) = weak.upgrade() {
                        let version = params.version.unwrap_or_else(|| session.version());
                        session.update_backend_diagnostics(params.diagnostics, version).await;
                    }
                });
            }
            ServerNotification::SemanticTokensRefresh => self.request_semantic_tokens(),
        }
    }

    async fn update_backend_diagnostics(&self, raw: Vec<lsp_types::Diagnostic>, version: i32) {
        let fetch_actions = self.connection.is_ready() && self.connection.supports(Capability::CodeAction);
        let snapshot = self.document.snapshot();
        let snapshot = snapshot.as_ref();

        let converted = join_all(raw.into_iter().map(|raw| async move {
            let mut diagnostic = Diagnostic::from_lsp(&raw, snapshot, &self.language);
            if fetch_actions {
                diagnostic.actions = self
                    .code_actions_for(raw, (diagnostic.from, diagnostic.to), snapshot)
                    .await;
            }
            diagnostic
        }))
        .await;

        debug!(uri = %self.uri, version, count = converted.len(), "Updated backend diagnostics");
        self.diagnostics_tx.send_modify(|current| {
            current.value = diagnostics::merge(&current.value, DiagnosticOrigin::Backend, converted);
            current.version = version;
        });
    }

    async fn code_actions_for(
        &self,
        raw: lsp_types::Diagnostic,
        span: (usize, usize),
        snapshot: &TextSnapshot,
    ) -> Vec<CodeAction> {
        let range = raw.range;
        match self.connection.code_actions(&self.uri, range, vec![raw]).await {
            Ok(Some(response)) => actions_from_response(response, &self.uri, span, snapshot),
            Ok(None) => Vec::new(),
            Err(e) => {
                log_failure("codeAction", &e);
                Vec::new()
            }
        }
    }

    /// Replace the diagnostics maintained outside the backend. The published
    /// version stays that of the backend's diagnostics.
    pub fn set_external_diagnostics(&self, external: Vec<Diagnostic>) {
        self.diagnostics_tx.send_modify(|current| {
            current.value = diagnostics::merge(&current.value, DiagnosticOrigin::External, external)
        });
    }

    /// Merged diagnostics sorted by start offset, tagged with the version the
    /// backend reported them for.
    pub fn diagnostics(&self) -> watch::Receiver<Versioned<Vec<Diagnostic>>> {
        self.diagnostics_tx.subscribe()
    }

    /// Decoded tokens, tagged with the version they were requested at.
    pub fn semantic_tokens(&self) -> watch::Receiver<Versioned<Vec<SemanticToken>>> {
        self.tokens_tx.subscribe()
    }

    /// Whether the cached completion lookup is known to be complete.
    pub fn completion_word_completed(&self) -> bool {
        self.completion.is_word_completed()
    }

    /// Resolve the transaction list of a code action into edits, running
    /// backend commands for [`ExternalFix`](crate::ActionTransaction::ExternalFix) entries.
    pub async fn apply_code_action(&self, diagnostic: &Diagnostic, action: &CodeAction) -> Vec<TextChange> {
        let mut changes = Vec::new();
        for transaction in &action.transactions {
            if let Some(change) = transaction.to_change(diagnostic.from) {
                changes.push(change);
            } else if let ActionTransaction::ExternalFix { command, arguments } = transaction {
                if let Err(e) = self.connection.execute_command(command, arguments.clone()).await {
                    log_failure("executeCommand", &e);
                }
            }
        }
        changes
    }

    /// Stop routing events to this session. The document is closed once its
    /// last session detaches.
    pub async fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.change_debounce.cancel();
        self.tokens_debounce.cancel();
        self.diagnostics_debounce.cancel();
        self.completion.clear();
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.connection.detach_session(self.id);
        if let Err(e) = self.connection.did_close(&self.uri).await {
            debug!(uri = %self.uri, error = %e, "Failed to close document");
        }
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.connection.detach_session(self.id);
    }
}

fn marked_text(marked: MarkedString) -> String {
    match marked {
        MarkedString::String(text) => text,
        MarkedString::LanguageString(code) => code.value,
    }
}
