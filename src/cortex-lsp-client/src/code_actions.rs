//! Conversion of code action responses into editor-agnostic transactions.
//!
//! Only edits that touch the document the diagnostic belongs to survive.
//! Commands are searched recursively for nested workspace edits; a command
//! with no edit payload at all becomes an [`ActionTransaction::ExternalFix`].

use lsp_types::{CodeActionOrCommand, Command, DocumentChangeOperation, DocumentChanges, OneOf, TextEdit, Url, WorkspaceEdit};
use serde_json::Value;
use tracing::trace;

use crate::document::{TextChange, TextSnapshot};

/// One step of applying a code action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionTransaction {
    /// Replace a range given relative to the diagnostic's start offset.
    ReplaceRelative {
        start_delta: usize,
        end_delta: usize,
        insert: String,
    },
    /// Replace an explicit absolute range.
    ReplaceRange {
        from: usize,
        to: usize,
        insert: String,
    },
    /// Ask the backend to run a command (`workspace/executeCommand`).
    ExternalFix {
        command: String,
        arguments: Vec<Value>,
    },
}

impl ActionTransaction {
    /// The concrete edit for a diagnostic currently starting at `diagnostic_from`.
    pub fn to_change(&self, diagnostic_from: usize) -> Option<TextChange> {
        match self {
            ActionTransaction::ReplaceRelative {
                start_delta,
                end_delta,
                insert,
            } => Some(TextChange::new(
                diagnostic_from + start_delta,
                diagnostic_from + end_delta,
                insert.clone(),
            )),
            ActionTransaction::ReplaceRange { from, to, insert } => {
                Some(TextChange::new(*from, *to, insert.clone()))
            }
            ActionTransaction::ExternalFix { .. } => None,
        }
    }
}

/// A named group of transactions offered for a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeAction {
    pub title: String,
    pub kind: Option<String>,
    pub preferred: bool,
    pub transactions: Vec<ActionTransaction>,
}

/// Convert a code action response for the diagnostic spanning `diagnostic`
/// (absolute offsets) in the document identified by `uri`.
pub fn actions_from_response(
    response: Vec<CodeActionOrCommand>,
    uri: &Url,
    diagnostic: (usize, usize),
    snapshot: &TextSnapshot,
) -> Vec<CodeAction> {
    response
        .into_iter()
        .filter_map(|entry| {
            let action = match entry {
                CodeActionOrCommand::Command(command) => CodeAction {
                    title: command.title.clone(),
                    kind: None,
                    preferred: false,
                    transactions: command_transactions(&command, uri, diagnostic, snapshot),
                },
                CodeActionOrCommand::CodeAction(action) => {
                    let mut transactions = Vec::new();
                    if let Some(edit) = &action.edit {
                        transactions.extend(to_transactions(
                            workspace_edits_for(edit, uri),
                            diagnostic,
                            snapshot,
                        ));
                    }
                    if let Some(command) = &action.command {
                        transactions.extend(command_transactions(command, uri, diagnostic, snapshot));
                    }
                    CodeAction {
                        title: action.title,
                        kind: action.kind.map(|k| k.as_str().to_string()),
                        preferred: action.is_preferred.unwrap_or(false),
                        transactions,
                    }
                }
            };

            if action.transactions.is_empty() {
                trace!(title = %action.title, "Dropping code action without local edits");
                None
            } else {
                Some(action)
            }
        })
        .collect()
}

/// Edits in `edit` that target `uri`.
pub fn workspace_edits_for(edit: &WorkspaceEdit, uri: &Url) -> Vec<TextEdit> {
    let mut edits = Vec::new();

    if let Some(changes) = &edit.changes {
        if let Some(file_edits) = changes.get(uri) {
            edits.extend(file_edits.iter().cloned());
        }
    }

    let document_edits = match &edit.document_changes {
        Some(DocumentChanges::Edits(edits)) => edits.iter().collect::<Vec<_>>(),
        Some(DocumentChanges::Operations(ops)) => ops
            .iter()
            .filter_map(|op| match op {
                DocumentChangeOperation::Edit(edit) => Some(edit),
                DocumentChangeOperation::Op(_) => None,
            })
            .collect(),
        None => Vec::new(),
    };

    for doc_edit in document_edits {
        if &doc_edit.text_document.uri != uri {
            continue;
        }
        edits.extend(doc_edit.edits.iter().map(|e| match e {
            OneOf::Left(edit) => edit.clone(),
            OneOf::Right(annotated) => annotated.text_edit.clone(),
        }));
    }

    edits
}

fn command_transactions(
    command: &Command,
    uri: &Url,
    diagnostic: (usize, usize),
    snapshot: &TextSnapshot,
) -> Vec<ActionTransaction> {
    let arguments = command.arguments.clone().unwrap_or_default();
    let mut nested = Vec::new();
    let mut found_payload = false;
    for argument in &arguments {
        found_payload |= collect_nested_edits(argument, uri, &mut nested);
    }

    if found_payload {
        to_transactions(nested, diagnostic, snapshot)
    } else {
        vec![ActionTransaction::ExternalFix {
            command: command.command.clone(),
            arguments,
        }]
    }
}

/// Walk a command argument looking for `changes` / `documentChanges`
/// payloads. Returns whether any payload was found, even if none of its
/// edits target `uri`.
fn collect_nested_edits(value: &Value, uri: &Url, out: &mut Vec<TextEdit>) -> bool {
    match value {
        Value::Array(items) => items
            .iter()
            .fold(false, |found, item| collect_nested_edits(item, uri, out) | found),
        Value::Object(object) => {
            let mut found = false;

            if let Some(Value::Object(changes)) = object.get("changes") {
                found = true;
                if let Some(file_edits) = changes.get(uri.as_str()) {
                    out.extend(parse_edits(file_edits));
                }
            }

            if let Some(Value::Array(document_changes)) = object.get("documentChanges") {
                found = true;
                for change in document_changes {
                    let target = change
                        .get("textDocument")
                        .and_then(|d| d.get("uri"))
                        .and_then(Value::as_str);
                    if target == Some(uri.as_str()) {
                        if let Some(file_edits) = change.get("edits") {
                            out.extend(parse_edits(file_edits));
                        }
                    }
                }
            }

            for (key, nested) in object {
                if key != "changes" && key != "documentChanges" {
                    found |= collect_nested_edits(nested, uri, out);
                }
            }
            found
        }
        _ => false,
    }
}

fn parse_edits(value: &Value) -> Vec<TextEdit> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<TextEdit>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn to_transactions(
    edits: Vec<TextEdit>,
    (diag_from, diag_to): (usize, usize),
    snapshot: &TextSnapshot,
) -> Vec<ActionTransaction> {
    edits
        .into_iter()
        .map(|edit| {
            let from = snapshot.position_to_offset(edit.range.start);
            let to = snapshot.position_to_offset(edit.range.end).max(from);
            if from >= diag_from && to <= diag_to {
                ActionTransaction::ReplaceRelative {
                    start_delta: from - diag_from,
                    end_delta: to - diag_from,
                    insert: edit.new_text,
                }
            } else {
                ActionTransaction::ReplaceRange {
                    from,
                    to,
                    insert: edit.new_text,
                }
            }
        })
        .collect()
}
