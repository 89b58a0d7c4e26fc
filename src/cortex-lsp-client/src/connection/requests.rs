//! Typed feature requests.
//!
//! Every method checks readiness and the negotiated capability first, so a
//! call against a backend that is still initializing fails fast with
//! [`LspError::NotReady`](crate::LspError::NotReady) instead of queuing.

use lsp_types::*;
use serde_json::{Value, json};

use super::{Capability, Connection};
use crate::Result;
use crate::semantic_tokens::RawSemanticTokens;

fn position_params(uri: &Url, position: Position) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier { uri: uri.clone() },
        position,
    }
}

impl Connection {
    /// Get hover information.
    pub async fn hover(&self, uri: &Url, position: Position) -> Result<Option<Hover>> {
        self.ensure_feature(Capability::Hover)?;

        let params = HoverParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: Default::default(),
        };

        self.send_request("textDocument/hover", params).await
    }

    /// Go to definition.
    pub async fn goto_definition(
        &self,
        uri: &Url,
        position: Position,
    ) -> Result<Option<GotoDefinitionResponse>> {
        self.ensure_feature(Capability::Definition)?;

        let params = GotoDefinitionParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        self.send_request("textDocument/definition", params).await
    }

    /// Find all references to a symbol.
    pub async fn references(
        &self,
        uri: &Url,
        position: Position,
        include_declaration: bool,
    ) -> Result<Option<Vec<Location>>> {
        self.ensure_feature(Capability::References)?;

        let params = ReferenceParams {
            text_document_position: position_params(uri, position),
            context: ReferenceContext {
                include_declaration,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        self.send_request("textDocument/references", params).await
    }

    /// Occurrences of the symbol under the cursor in the same document.
    pub async fn document_highlight(
        &self,
        uri: &Url,
        position: Position,
    ) -> Result<Option<Vec<DocumentHighlight>>> {
        self.ensure_feature(Capability::DocumentHighlight)?;

        let params = DocumentHighlightParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        self.send_request("textDocument/documentHighlight", params).await
    }

    /// Get document symbols (functions, classes, variables, etc.).
    pub async fn document_symbols(&self, uri: &Url) -> Result<Option<DocumentSymbolResponse>> {
        self.ensure_feature(Capability::DocumentSymbol)?;

        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        self.send_request("textDocument/documentSymbol", params).await
    }

    /// Search for symbols across the workspace.
    pub async fn workspace_symbols(&self, query: &str) -> Result<Option<Vec<SymbolInformation>>> {
        self.ensure_feature(Capability::WorkspaceSymbol)?;

        let params = WorkspaceSymbolParams {
            query: query.to_string(),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        self.send_request("workspace/symbol", params).await
    }

    /// Get completion items at a position.
    pub async fn completion(
        &self,
        uri: &Url,
        position: Position,
        context: Option<CompletionContext>,
    ) -> Result<Option<CompletionResponse>> {
        self.ensure_feature(Capability::Completion)?;

        let params = CompletionParams {
            text_document_position: position_params(uri, position),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context,
        };

        self.send_request("textDocument/completion", params).await
    }

    /// Fill in the lazily computed fields of a completion item.
    pub async fn resolve_completion(&self, item: CompletionItem) -> Result<CompletionItem> {
        self.ensure_feature(Capability::CompletionResolve)?;
        self.send_request("completionItem/resolve", item).await
    }

    /// Code actions for `range`, scoped to `diagnostics`.
    pub async fn code_actions(
        &self,
        uri: &Url,
        range: Range,
        diagnostics: Vec<Diagnostic>,
    ) -> Result<Option<CodeActionResponse>> {
        self.ensure_feature(Capability::CodeAction)?;

        let params = CodeActionParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            range,
            context: CodeActionContext {
                diagnostics,
                only: None,
                trigger_kind: None,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        self.send_request("textDocument/codeAction", params).await
    }

    pub async fn document_links(&self, uri: &Url) -> Result<Option<Vec<DocumentLink>>> {
        self.ensure_feature(Capability::DocumentLink)?;

        let params = DocumentLinkParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        self.send_request("textDocument/documentLink", params).await
    }

    /// Full semantic token array for a document.
    pub async fn semantic_tokens_full(&self, uri: &Url) -> Result<Option<RawSemanticTokens>> {
        self.ensure_feature(Capability::SemanticTokens)?;

        let params = json!({ "textDocument": { "uri": uri } });
        self.send_request("textDocument/semanticTokens/full", params).await
    }

    /// Edits against a previous token result. Sessions always refetch in
    /// full; this is kept for embedders that track result ids themselves.
    pub async fn semantic_tokens_full_delta(&self, uri: &Url, previous_result_id: &str) -> Result<Value> {
        self.ensure_feature(Capability::SemanticTokens)?;

        let params = json!({
            "textDocument": { "uri": uri },
            "previousResultId": previous_result_id,
        });
        self.send_request("textDocument/semanticTokens/full/delta", params).await
    }

    /// Run a backend command, typically an [`ExternalFix`](crate::ActionTransaction::ExternalFix).
    pub async fn execute_command(&self, command: &str, arguments: Vec<Value>) -> Result<Option<Value>> {
        self.ensure_feature(Capability::ExecuteCommand)?;

        let params = ExecuteCommandParams {
            command: command.to_string(),
            arguments,
            work_done_progress_params: Default::default(),
        };

        self.send_request("workspace/executeCommand", params).await
    }
}
