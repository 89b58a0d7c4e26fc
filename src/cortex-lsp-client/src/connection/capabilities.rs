//! Negotiated backend capabilities.

use lsp_types::{
    CodeActionProviderCapability, HoverProviderCapability, OneOf, SemanticTokensFullOptions,
    SemanticTokensLegend, SemanticTokensOptions, SemanticTokensServerCapabilities,
    ServerCapabilities,
};
use serde_json::Value;

/// Backend features a session may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Hover,
    Definition,
    References,
    DocumentHighlight,
    DocumentSymbol,
    WorkspaceSymbol,
    Completion,
    CompletionResolve,
    CodeAction,
    DocumentLink,
    ExecuteCommand,
    SemanticTokens,
}

impl Capability {
    /// Wire method guarded by this capability.
    pub fn method(&self) -> &'static str {
        match self {
            Capability::Hover => "textDocument/hover",
            Capability::Definition => "textDocument/definition",
            Capability::References => "textDocument/references",
            Capability::DocumentHighlight => "textDocument/documentHighlight",
            Capability::DocumentSymbol => "textDocument/documentSymbol",
            Capability::WorkspaceSymbol => "workspace/symbol",
            Capability::Completion => "textDocument/completion",
            Capability::CompletionResolve => "completionItem/resolve",
            Capability::CodeAction => "textDocument/codeAction",
            Capability::DocumentLink => "textDocument/documentLink",
            Capability::ExecuteCommand => "workspace/executeCommand",
            Capability::SemanticTokens => "textDocument/semanticTokens",
        }
    }

    /// Capability named by a dynamic registration method.
    pub fn from_method(method: &str) -> Option<Self> {
        let capability = match method {
            "textDocument/hover" => Capability::Hover,
            "textDocument/definition" => Capability::Definition,
            "textDocument/references" => Capability::References,
            "textDocument/documentHighlight" => Capability::DocumentHighlight,
            "textDocument/documentSymbol" => Capability::DocumentSymbol,
            "workspace/symbol" => Capability::WorkspaceSymbol,
            "textDocument/completion" => Capability::Completion,
            "completionItem/resolve" => Capability::CompletionResolve,
            "textDocument/codeAction" => Capability::CodeAction,
            "textDocument/documentLink" => Capability::DocumentLink,
            "workspace/executeCommand" => Capability::ExecuteCommand,
            "textDocument/semanticTokens" | "textDocument/semanticTokens/full" => {
                Capability::SemanticTokens
            }
            _ => return None,
        };
        Some(capability)
    }
}

/// Server capabilities cached from initialization, updated by dynamic
/// (un)registration.
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilitySet {
    pub hover: bool,
    pub definition: bool,
    pub references: bool,
    pub document_highlight: bool,
    pub document_symbol: bool,
    pub workspace_symbol: bool,
    pub completion: bool,
    pub completion_resolve: bool,
    pub code_action: bool,
    pub document_link: bool,
    pub execute_command: bool,
    /// Legend for decoding semantic tokens; `None` when unsupported.
    pub semantic_tokens: Option<SemanticTokensLegend>,
    pub semantic_tokens_delta: bool,
    pub trigger_characters: Vec<String>,
}

fn enabled<T>(provider: &Option<OneOf<bool, T>>) -> bool {
    matches!(provider, Some(OneOf::Left(true)) | Some(OneOf::Right(_)))
}

fn semantic_options(provider: &SemanticTokensServerCapabilities) -> &SemanticTokensOptions {
    match provider {
        SemanticTokensServerCapabilities::SemanticTokensOptions(options) => options,
        SemanticTokensServerCapabilities::SemanticTokensRegistrationOptions(options) => {
            &options.semantic_tokens_options
        }
    }
}

impl ServerCapabilitySet {
    /// Parse capabilities from the `initialize` result.
    pub fn from_server_capabilities(caps: &ServerCapabilities) -> Self {
        let completion = caps.completion_provider.as_ref();
        let semantic = caps.semantic_tokens_provider.as_ref().map(semantic_options);

        Self {
            hover: matches!(
                caps.hover_provider,
                Some(HoverProviderCapability::Simple(true)) | Some(HoverProviderCapability::Options(_))
            ),
            definition: enabled(&caps.definition_provider),
            references: enabled(&caps.references_provider),
            document_highlight: enabled(&caps.document_highlight_provider),
            document_symbol: enabled(&caps.document_symbol_provider),
            workspace_symbol: enabled(&caps.workspace_symbol_provider),
            completion: completion.is_some(),
            completion_resolve: completion.and_then(|c| c.resolve_provider).unwrap_or(false),
            code_action: matches!(
                caps.code_action_provider,
                Some(CodeActionProviderCapability::Simple(true))
                    | Some(CodeActionProviderCapability::Options(_))
            ),
            document_link: caps.document_link_provider.is_some(),
            execute_command: caps.execute_command_provider.is_some(),
            semantic_tokens: semantic.map(|options| options.legend.clone()),
            semantic_tokens_delta: matches!(
                semantic.and_then(|options| options.full.as_ref()),
                Some(SemanticTokensFullOptions::Delta { delta: Some(true) })
            ),
            trigger_characters: completion
                .and_then(|c| c.trigger_characters.clone())
                .unwrap_or_default(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Hover => self.hover,
            Capability::Definition => self.definition,
            Capability::References => self.references,
            Capability::DocumentHighlight => self.document_highlight,
            Capability::DocumentSymbol => self.document_symbol,
            Capability::WorkspaceSymbol => self.workspace_symbol,
            Capability::Completion => self.completion,
            Capability::CompletionResolve => self.completion_resolve,
            Capability::CodeAction => self.code_action,
            Capability::DocumentLink => self.document_link,
            Capability::ExecuteCommand => self.execute_command,
            Capability::SemanticTokens => self.semantic_tokens.is_some(),
        }
    }

    /// Apply a `client/registerCapability` entry. Returns `false` for methods
    /// that do not map to a tracked capability.
    pub fn register(&mut self, method: &str, options: Option<&Value>) -> bool {
        let Some(capability) = Capability::from_method(method) else {
            return false;
        };

        match capability {
            Capability::Completion => {
                self.completion = true;
                if let Some(options) = options {
                    if options.get("resolveProvider").and_then(Value::as_bool) == Some(true) {
                        self.completion_resolve = true;
                    }
                    if let Some(chars) = options.get("triggerCharacters").and_then(Value::as_array) {
                        self.trigger_characters = chars
                            .iter()
                            .filter_map(|c| c.as_str().map(str::to_string))
                            .collect();
                    }
                }
            }
            Capability::SemanticTokens => {
                let legend = options
                    .and_then(|o| o.get("legend"))
                    .and_then(|l| serde_json::from_value::<SemanticTokensLegend>(l.clone()).ok());
                // without a legend the tokens cannot be decoded
                let Some(legend) = legend else {
                    return false;
                };
                self.semantic_tokens = Some(legend);
            }
            other => self.set(other, true),
        }
        true
    }

    /// Apply a `client/unregisterCapability` entry.
    pub fn unregister(&mut self, method: &str) -> bool {
        let Some(capability) = Capability::from_method(method) else {
            return false;
        };
        match capability {
            Capability::SemanticTokens => {
                self.semantic_tokens = None;
                self.semantic_tokens_delta = false;
            }
            Capability::Completion => {
                self.completion = false;
                self.completion_resolve = false;
                self.trigger_characters.clear();
            }
            other => self.set(other, false),
        }
        true
    }

    fn set(&mut self, capability: Capability, value: bool) {
        match capability {
            Capability::Hover => self.hover = value,
            Capability::Definition => self.definition = value,
            Capability::References => self.references = value,
            Capability::DocumentHighlight => self.document_highlight = value,
            Capability::DocumentSymbol => self.document_symbol = value,
            Capability::WorkspaceSymbol => self.workspace_symbol = value,
            Capability::Completion => self.completion = value,
            Capability::CompletionResolve => self.completion_resolve = value,
            Capability::CodeAction => self.code_action = value,
            Capability::DocumentLink => self.document_link = value,
            Capability::ExecuteCommand => self.execute_command = value,
            Capability::SemanticTokens => {
                if !value {
                    self.semantic_tokens = None;
                }
            }
        }
    }
}
