//! Completion coordination.
//!
//! A session keeps one cached lookup keyed by (path, line, prefix start).
//! Typing further into the same word reuses the cached lookup; once the
//! backend reported a complete result set for it, no further round trips
//! are made until the key changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lsp_types::{
    CompletionContext, CompletionItem, CompletionItemKind, CompletionResponse, CompletionTextEdit,
    Documentation, InsertTextFormat, Position,
};
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::DocumentSession;
use crate::connection::Capability;
use crate::document::{TextChange, TextSnapshot};

lazy_static::lazy_static! {
    static ref SNIPPET_PLACEHOLDER: Regex = Regex::new(r"\$\{\d+:([^}]*)\}").unwrap();
    static ref SNIPPET_TABSTOP: Regex = Regex::new(r"\$\{\d+\}|\$\d+").unwrap();
}

/// What caused a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTriggerKind {
    /// Typing or an explicit invocation.
    Invoked,
    TriggerCharacter(char),
    /// Re-trigger because the previous result set was incomplete.
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionTrigger {
    pub kind: CompletionTriggerKind,
    /// The user asked for completion explicitly (e.g. a keybinding).
    pub explicit: bool,
}

impl CompletionTrigger {
    pub fn typing() -> Self {
        Self {
            kind: CompletionTriggerKind::Invoked,
            explicit: false,
        }
    }

    pub fn explicit() -> Self {
        Self {
            kind: CompletionTriggerKind::Invoked,
            explicit: true,
        }
    }

    pub fn character(ch: char) -> Self {
        Self {
            kind: CompletionTriggerKind::TriggerCharacter(ch),
            explicit: false,
        }
    }

    fn to_context(self) -> CompletionContext {
        use lsp_types::CompletionTriggerKind as Kind;
        match self.kind {
            CompletionTriggerKind::Invoked => CompletionContext {
                trigger_kind: Kind::INVOKED,
                trigger_character: None,
            },
            CompletionTriggerKind::TriggerCharacter(ch) => CompletionContext {
                trigger_kind: Kind::TRIGGER_CHARACTER,
                trigger_character: Some(ch.to_string()),
            },
            CompletionTriggerKind::Incomplete => CompletionContext {
                trigger_kind: Kind::TRIGGER_FOR_INCOMPLETE_COMPLETIONS,
                trigger_character: None,
            },
        }
    }
}

/// A completion request from the editor layer.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Caret offset.
    pub offset: usize,
    pub trigger: CompletionTrigger,
    /// Fires when the caller no longer wants the result.
    pub cancel: CancellationToken,
}

impl CompletionRequest {
    pub fn new(offset: usize, trigger: CompletionTrigger) -> Self {
        Self {
            offset,
            trigger,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// How to apply an entry.
#[derive(Debug, Clone)]
pub struct CompletionApply {
    pub from: usize,
    pub to: usize,
    pub insert: String,
    /// `None` when the backend left additional edits for `completionItem/resolve`.
    pub additional_edits: Option<Vec<TextChange>>,
    /// Original item, sent back when resolving.
    pub item: CompletionItem,
}

#[derive(Debug, Clone)]
pub struct CompletionEntry {
    pub label: String,
    pub detail: Option<String>,
    pub documentation: Option<String>,
    pub kind: Option<CompletionItemKind>,
    /// Ranking hint; strictly decreasing in result order.
    pub boost: i32,
    pub apply: CompletionApply,
}

#[derive(Debug, Clone)]
pub struct CompletionResult {
    /// Start of the word being completed.
    pub from: usize,
    /// Caret offset the result was computed for.
    pub to: usize,
    pub entries: Vec<CompletionEntry>,
    /// Matches prefixes for which `entries` remain valid without a new request.
    pub valid_for: Option<Regex>,
    /// Document version the backend computed the entries against.
    pub version: i32,
    pub is_incomplete: bool,
}

#[derive(Debug)]
pub(crate) struct RawCompletion {
    items: Vec<CompletionItem>,
    is_incomplete: bool,
    version: i32,
}

type SharedCompletion = Shared<BoxFuture<'static, Option<Arc<RawCompletion>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryKey {
    path: PathBuf,
    line: u32,
    start: usize,
}

struct CachedQuery {
    key: QueryKey,
    generation: u64,
    result: SharedCompletion,
    word_completed: bool,
}

/// Single-slot cache of the latest completion lookup.
#[derive(Default)]
pub(crate) struct CompletionCache {
    slot: Mutex<Option<CachedQuery>>,
    generations: AtomicU64,
}

impl CompletionCache {
    fn lookup(&self, key: &QueryKey) -> Option<(SharedCompletion, u64, bool)> {
        self.slot
            .lock()
            .as_ref()
            .filter(|cached| &cached.key == key)
            .map(|cached| (cached.result.clone(), cached.generation, cached.word_completed))
    }

    fn store(&self, key: QueryKey, result: SharedCompletion) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        *self.slot.lock() = Some(CachedQuery {
            key,
            generation,
            result,
            word_completed: false,
        });
        generation
    }

    fn mark_word_completed(&self, generation: u64) {
        if let Some(cached) = self.slot.lock().as_mut() {
            if cached.generation == generation {
                cached.word_completed = true;
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.slot.lock().take();
    }

    pub(crate) fn is_word_completed(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|cached| cached.word_completed)
    }
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

/// Start of the word ending at `offset`.
pub fn word_start(text: &str, offset: usize) -> usize {
    text[..offset]
        .char_indices()
        .rev()
        .take_while(|(_, ch)| is_word_char(*ch))
        .last()
        .map(|(i, _)| i)
        .unwrap_or(offset)
}

fn clamp_offset(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Case-insensitive subsequence match.
pub fn fuzzy_matches(prefix: &str, candidate: &str) -> bool {
    let mut candidate = candidate.chars().flat_map(char::to_lowercase);
    prefix
        .chars()
        .flat_map(char::to_lowercase)
        .all(|wanted| candidate.any(|ch| ch == wanted))
}

/// `^[first][rest]*$` over the candidates' characters.
pub fn filter_regex<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Option<Regex> {
    let mut first = Vec::new();
    let mut rest = Vec::new();
    for candidate in candidates {
        let mut chars = candidate.chars();
        if let Some(ch) = chars.next() {
            if !first.contains(&ch) {
                first.push(ch);
            }
        }
        for ch in chars {
            if !rest.contains(&ch) {
                rest.push(ch);
            }
        }
    }
    if first.is_empty() {
        return None;
    }

    let class = |chars: &[char]| -> String { chars.iter().map(|c| regex::escape(&c.to_string())).collect() };
    let pattern = if rest.is_empty() {
        format!("^[{}]$", class(&first))
    } else {
        format!("^[{}][{}]*$", class(&first), class(&rest))
    };
    Regex::new(&pattern).ok()
}

fn strip_snippet(text: &str) -> String {
    let text = SNIPPET_PLACEHOLDER.replace_all(text, "$1");
    SNIPPET_TABSTOP.replace_all(&text, "").into_owned()
}

fn sort_key(item: &CompletionItem) -> &str {
    item.sort_text.as_deref().unwrap_or(&item.label)
}

fn documentation_text(documentation: &Documentation) -> String {
    match documentation {
        Documentation::String(text) => text.clone(),
        Documentation::MarkupContent(markup) => markup.value.clone(),
    }
}

impl DocumentSession {
    /// Completion at `request.offset`. Failures and cancellation resolve to `None`.
    pub async fn request_completion(self: &Arc<Self>, request: CompletionRequest) -> Option<CompletionResult> {
        if let Err(e) = self.connection.ensure_feature(Capability::Completion) {
            trace!(error = %e, "Completion unavailable");
            return None;
        }

        let snapshot = self.document.snapshot();
        let text = snapshot.text();
        let offset = clamp_offset(text, request.offset);
        let start = word_start(text, offset);
        let explicit = request.trigger.explicit;
        if start == offset && request.trigger.kind == CompletionTriggerKind::Invoked && !explicit {
            return None;
        }

        let position = snapshot.offset_to_position(offset);
        let key = QueryKey {
            path: self.document.path().to_path_buf(),
            line: position.line,
            start,
        };
        let cached = self.completion.lookup(&key);
        let reuse_only = matches!(cached, Some((_, _, true)))
            && request.trigger.kind != CompletionTriggerKind::Incomplete;

        let (fresh, generation) = if reuse_only {
            (None, cached.as_ref().map(|(_, generation, _)| *generation))
        } else {
            let fresh = self.spawn_completion(position, request.trigger);
            let generation = if self.language.cache_completions {
                Some(self.completion.store(key, fresh.clone()))
            } else {
                None
            };
            (Some(fresh), generation)
        };

        let cancel = request.cancel.clone();
        let raw = match (cached.map(|(result, _, _)| result), fresh) {
            (Some(cached), None) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                raw = cached => raw,
            },
            (None, Some(fresh)) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                raw = fresh => raw,
            },
            (Some(cached), Some(fresh)) => match cached.peek().cloned().flatten() {
                Some(ready) => {
                    let grace = self.timer.sleep(self.config.completion_grace);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        raw = fresh => raw.or(Some(ready)),
                        _ = grace => Some(ready),
                    }
                }
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    raw = fresh => raw,
                    Some(raw) = cached => Some(raw),
                },
            },
            (None, None) => None,
        }?;

        if !raw.is_incomplete {
            if let Some(generation) = generation {
                self.completion.mark_word_completed(generation);
            }
        }

        let snapshot = self.document.snapshot();
        let offset = offset.min(snapshot.text().len());
        Some(self.build_result(&raw, &snapshot, start, offset))
    }

    fn spawn_completion(self: &Arc<Self>, position: Position, trigger: CompletionTrigger) -> SharedCompletion {
        let session = self.clone();
        let task = tokio::spawn(async move {
            session.flush_change().await;
            let version = session.version();
            let response = session
                .connection
                .completion(&session.uri, position, Some(trigger.to_context()))
                .await;
            match response {
                Ok(Some(CompletionResponse::Array(items))) => Some(Arc::new(RawCompletion {
                    items,
                    is_incomplete: false,
                    version,
                })),
                Ok(Some(CompletionResponse::List(list))) => Some(Arc::new(RawCompletion {
                    items: list.items,
                    is_incomplete: list.is_incomplete,
                    version,
                })),
                Ok(None) => None,
                Err(e) => {
                    debug!(uri = %session.uri, error = %e, "Completion request failed");
                    None
                }
            }
        });
        async move { task.await.ok().flatten() }.boxed().shared()
    }

    fn build_result(
        &self,
        raw: &RawCompletion,
        snapshot: &TextSnapshot,
        start: usize,
        offset: usize,
    ) -> CompletionResult {
        let prefix = snapshot.text().get(start.min(offset)..offset).unwrap_or("");
        let prefiltered = self.language.prefiltered_completions;

        let mut items: Vec<&CompletionItem> = raw.items.iter().collect();
        if items.iter().any(|item| item.sort_text.is_some()) {
            items.sort_by(|a, b| sort_key(a).cmp(sort_key(b)));
        }
        if prefiltered {
            items.retain(|item| {
                fuzzy_matches(prefix, item.filter_text.as_deref().unwrap_or(&item.label))
            });
        }

        let entries: Vec<CompletionEntry> = items
            .iter()
            .enumerate()
            .map(|(rank, item)| CompletionEntry {
                label: item.label.clone(),
                detail: item.detail.clone(),
                documentation: item.documentation.as_ref().map(documentation_text),
                kind: item.kind,
                boost: -(rank as i32),
                apply: self.completion_apply(item, snapshot, start, offset),
            })
            .collect();

        let valid_for = if prefiltered {
            None
        } else {
            filter_regex(
                items
                    .iter()
                    .map(|item| item.filter_text.as_deref().unwrap_or(&item.label)),
            )
        };

        CompletionResult {
            from: start,
            to: offset,
            entries,
            valid_for,
            version: raw.version,
            is_incomplete: raw.is_incomplete,
        }
    }

    fn completion_apply(
        &self,
        item: &CompletionItem,
        snapshot: &TextSnapshot,
        start: usize,
        offset: usize,
    ) -> CompletionApply {
        let (from, to, insert) = match &item.text_edit {
            Some(CompletionTextEdit::Edit(edit)) => (
                snapshot.position_to_offset(edit.range.start),
                snapshot.position_to_offset(edit.range.end),
                edit.new_text.clone(),
            ),
            Some(CompletionTextEdit::InsertAndReplace(edit)) => (
                snapshot.position_to_offset(edit.replace.start),
                snapshot.position_to_offset(edit.replace.end),
                edit.new_text.clone(),
            ),
            None => (
                start,
                offset,
                item.insert_text.clone().unwrap_or_else(|| item.label.clone()),
            ),
        };
        // a reused result still has ranges ending at the caret it was computed for
        let to = if from == start { to.max(offset) } else { to };

        let insert = if item.insert_text_format == Some(InsertTextFormat::SNIPPET) {
            strip_snippet(&insert)
        } else {
            insert
        };

        CompletionApply {
            from,
            to,
            insert,
            additional_edits: item.additional_text_edits.as_ref().map(|edits| {
                edits
                    .iter()
                    .map(|edit| TextChange::from_range(edit.range, edit.new_text.clone(), snapshot))
                    .collect()
            }),
            item: item.clone(),
        }
    }

    /// Changes for accepting `entry`: the primary edit followed by any
    /// additional edits, resolving the item first when the backend deferred them.
    pub async fn apply_completion(&self, entry: &CompletionEntry) -> Vec<TextChange> {
        let apply = &entry.apply;
        let mut changes = vec![TextChange::new(apply.from, apply.to, apply.insert.clone())];

        match &apply.additional_edits {
            Some(edits) => changes.extend(edits.iter().cloned()),
            None if self.connection.supports(Capability::CompletionResolve) => {
                match self.connection.resolve_completion(apply.item.clone()).await {
                    Ok(resolved) => {
                        let snapshot = self.document.snapshot();
                        changes.extend(
                            resolved
                                .additional_text_edits
                                .unwrap_or_default()
                                .into_iter()
                                .map(|edit| TextChange::from_range(edit.range, edit.new_text, &snapshot)),
                        );
                    }
                    Err(e) => debug!(label = %entry.label, error = %e, "Failed to resolve completion"),
                }
            }
            None => {}
        }

        changes
    }
}
