//! Language intelligence client layer for Cortex.
//!
//! Talks to per-language analysis backends (and an AI completion backend)
//! over an asynchronous JSON-RPC channel and turns their results into
//! editor-agnostic data:
//! - Request/response correlation with many concurrent in-flight calls
//! - Per-document synchronization with debounced change propagation
//! - Hover, go to definition, references, highlights, symbols and links
//! - Completion with caching, racing and cancellation
//! - Semantic token decoding
//! - Diagnostics with code actions, merged with external sources

pub mod assist;
pub mod clock;
pub mod code_actions;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod document;
pub mod jsonrpc;
pub mod language;
pub mod registry;
pub mod semantic_tokens;
pub mod session;
pub mod transport;

pub use assist::{AssistClient, AssistCompletion, AssistDocument, AssistStatus, SignInPrompt};
pub use clock::{Debouncer, Timer, TokioTimer};
pub use code_actions::{ActionTransaction, CodeAction};
pub use config::ClientConfig;
pub use connection::{
    BackendId, Capability, Connection, ConnectionState, ServerCapabilitySet, ServerNotification,
    ServerRequest,
};
pub use diagnostics::{Diagnostic, DiagnosticOrigin, DiagnosticSeverity};
pub use document::{TextBuffer, TextChange, TextDocument, TextSnapshot};
pub use jsonrpc::{Message, RequestId, ResponseError};
pub use language::{Language, LanguageConfig};
pub use registry::{ConnectionRegistry, TransportFactory};
pub use semantic_tokens::{RawSemanticTokens, SemanticToken};
pub use session::completion::{
    CompletionApply, CompletionEntry, CompletionRequest, CompletionResult, CompletionTrigger,
    CompletionTriggerKind,
};
pub use session::{
    DefinitionTarget, DocumentSession, Highlight, HoverInfo, LinkTarget, SymbolEntry, Versioned,
};
pub use transport::{StreamTransport, Transport};

pub use lsp_types;
pub use tokio_util::sync::CancellationToken;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LspError {
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// A complete frame whose body is not a valid message; the channel stays usable.
    #[error("invalid message: {reason}")]
    InvalidMessage { id: Option<RequestId>, reason: String },
    #[error("backend does not support '{0}'")]
    CapabilityMissing(&'static str),
    #[error("initialization failed: {0}")]
    InitializationFailure(String),
    #[error("connection is not ready (state: {0:?})")]
    NotReady(ConnectionState),
    #[error("timeout waiting for response to '{0}'")]
    Timeout(String),
    #[error("backend error {code}: {message}")]
    ResponseError { code: i64, message: String },
    #[error("invalid document path: {0}")]
    InvalidPath(String),
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LspError>;
