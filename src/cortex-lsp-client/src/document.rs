//! Text document collaborator and position conversion.
//!
//! Offsets are byte offsets into the document text. Positions follow the
//! wire convention: 0-based lines, columns in UTF-16 code units.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lsp_types::{Position, Range, Url};
use parking_lot::RwLock;

use crate::{LspError, Result};

/// Editor-side view of one document.
pub trait TextDocument: Send + Sync {
    fn path(&self) -> &Path;

    fn current_text(&self) -> String;

    fn uri(&self) -> Result<Url> {
        Url::from_file_path(self.path())
            .map_err(|_| LspError::InvalidPath(self.path().display().to_string()))
    }

    /// The current text with its line index. Batch conversions should go
    /// through one snapshot.
    fn snapshot(&self) -> Arc<TextSnapshot> {
        Arc::new(TextSnapshot::new(self.current_text()))
    }

    fn line_count(&self) -> usize {
        line_count(&self.current_text())
    }

    fn offset_to_position(&self, offset: usize) -> Position {
        offset_to_position(&self.current_text(), offset)
    }

    fn position_to_offset(&self, position: Position) -> usize {
        position_to_offset(&self.current_text(), position)
    }
}

/// Immutable text with the start offset of every line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSnapshot {
    text: String,
    line_starts: Vec<usize>,
}

impl TextSnapshot {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { text, line_starts }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Same clamping as [`offset_to_position`].
    pub fn offset_to_position(&self, offset: usize) -> Position {
        let offset = floor_char_boundary(&self.text, offset);
        let line = self.line_starts.partition_point(|start| *start <= offset) - 1;
        let character = self.text[self.line_starts[line]..offset].encode_utf16().count() as u32;
        Position {
            line: line as u32,
            character,
        }
    }

    /// Same clamping as [`position_to_offset`].
    pub fn position_to_offset(&self, position: Position) -> usize {
        let line = position.line as usize;
        let Some(&line_start) = self.line_starts.get(line) else {
            return self.text.len();
        };
        let line_end = self
            .line_starts
            .get(line + 1)
            .map(|next| next - 1)
            .unwrap_or(self.text.len());
        column_offset(&self.text, line_start, line_end, position.character)
    }
}

/// An edit expressed in absolute offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub from: usize,
    pub to: usize,
    pub insert: String,
}

impl TextChange {
    pub fn new(from: usize, to: usize, insert: impl Into<String>) -> Self {
        Self {
            from,
            to,
            insert: insert.into(),
        }
    }

    pub fn from_range(range: Range, insert: impl Into<String>, snapshot: &TextSnapshot) -> Self {
        Self::new(
            snapshot.position_to_offset(range.start),
            snapshot.position_to_offset(range.end),
            insert,
        )
    }
}

/// Apply changes to `text`. Changes must not overlap; order does not matter.
pub fn apply_changes(text: &str, changes: &[TextChange]) -> String {
    let mut sorted: Vec<&TextChange> = changes.iter().collect();
    sorted.sort_by(|a, b| b.from.cmp(&a.from));

    let mut result = text.to_string();
    for change in sorted {
        let from = change.from.min(result.len());
        let to = change.to.clamp(from, result.len());
        result.replace_range(from..to, &change.insert);
    }
    result
}

/// In-memory document used by embedders without their own buffer type.
/// The line index is rebuilt once per edit.
pub struct TextBuffer {
    path: PathBuf,
    snapshot: RwLock<Arc<TextSnapshot>>,
}

impl TextBuffer {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(Arc::new(TextSnapshot::new(text))),
        }
    }

    pub fn set_text(&self, text: impl Into<String>) {
        *self.snapshot.write() = Arc::new(TextSnapshot::new(text));
    }

    pub fn apply(&self, changes: &[TextChange]) {
        let mut snapshot = self.snapshot.write();
        *snapshot = Arc::new(TextSnapshot::new(apply_changes(snapshot.text(), changes)));
    }
}

impl TextDocument for TextBuffer {
    fn path(&self) -> &Path {
        &self.path
    }

    fn current_text(&self) -> String {
        self.snapshot.read().text().to_string()
    }

    fn snapshot(&self) -> Arc<TextSnapshot> {
        self.snapshot.read().clone()
    }

    fn line_count(&self) -> usize {
        self.snapshot.read().line_count()
    }

    fn offset_to_position(&self, offset: usize) -> Position {
        self.snapshot.read().offset_to_position(offset)
    }

    fn position_to_offset(&self, position: Position) -> usize {
        self.snapshot.read().position_to_offset(position)
    }
}

pub(crate) fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

fn floor_char_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Byte offset of UTF-16 column `character` within `line_start..line_end`.
fn column_offset(text: &str, line_start: usize, line_end: usize, character: u32) -> usize {
    let mut units = 0u32;
    for (i, ch) in text[line_start..line_end].char_indices() {
        if units >= character {
            return line_start + i;
        }
        units += ch.len_utf16() as u32;
    }
    line_end
}

pub fn line_count(text: &str) -> usize {
    text.bytes().filter(|b| *b == b'\n').count() + 1
}

/// Convert a byte offset to a position. Offsets past the end clamp to the end.
pub fn offset_to_position(text: &str, offset: usize) -> Position {
    let offset = floor_char_boundary(text, offset);
    let before = &text[..offset];
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line = before.bytes().filter(|b| *b == b'\n').count() as u32;
    let character = before[line_start..].encode_utf16().count() as u32;
    Position { line, character }
}

/// Convert a position to a byte offset. Lines past the end clamp to the end of
/// the text, columns past the end of a line clamp to the end of that line.
pub fn position_to_offset(text: &str, position: Position) -> usize {
    let mut line_start = 0;
    for _ in 0..position.line {
        match text[line_start..].find('\n') {
            Some(i) => line_start += i + 1,
            None => return text.len(),
        }
    }

    let line_end = text[line_start..]
        .find('\n')
        .map(|i| line_start + i)
        .unwrap_or(text.len());
    column_offset(text, line_start, line_end, position.character)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_round_trip() {
        let text = "fn main() {\n    let x = 1;\n}\n";
        for offset in 0..=text.len() {
            let position = offset_to_position(text, offset);
            assert_eq!(position_to_offset(text, position), offset);
        }
        assert_eq!(offset_to_position(text, 16), Position { line: 1, character: 4 });
    }

    #[test]
    fn test_utf16_columns() {
        // 'é' is 2 bytes / 1 unit, '😀' is 4 bytes / 2 units
        let text = "é😀x";
        assert_eq!(offset_to_position(text, 6), Position { line: 0, character: 3 });
        assert_eq!(position_to_offset(text, Position { line: 0, character: 3 }), 6);
        assert_eq!(position_to_offset(text, Position { line: 0, character: 99 }), text.len());
    }

    #[test]
    fn test_clamping() {
        let text = "ab\ncd";
        assert_eq!(position_to_offset(text, Position { line: 7, character: 0 }), text.len());
        assert_eq!(offset_to_position(text, 100), Position { line: 1, character: 2 });
        assert_eq!(line_count(text), 2);
    }

    #[test]
    fn test_snapshot_matches_scanning_conversions() {
        let text = "fn main() {\n    let é = \"😀\";\n\n}";
        let snapshot = TextSnapshot::new(text);
        assert_eq!(snapshot.line_count(), line_count(text));

        for offset in 0..=text.len() + 2 {
            assert_eq!(snapshot.offset_to_position(offset), offset_to_position(text, offset));
        }
        for line in 0..6 {
            for character in 0..20 {
                let position = Position { line, character };
                assert_eq!(
                    snapshot.position_to_offset(position),
                    position_to_offset(text, position)
                );
            }
        }
    }

    #[test]
    fn test_buffer_reindexes_on_edit() {
        let doc = TextBuffer::new("/work/a.go", "a\nb");
        assert_eq!(doc.line_count(), 2);
        doc.apply(&[TextChange::new(1, 1, "\nx")]);
        assert_eq!(doc.current_text(), "a\nx\nb");
        assert_eq!(doc.snapshot().line_count(), 3);
        assert_eq!(doc.position_to_offset(Position { line: 2, character: 0 }), 4);
    }

    #[test]
    fn test_hash_text_distinguishes_content() {
        assert_eq!(hash_text("abc"), hash_text("abc"));
        assert_ne!(hash_text("abc"), hash_text("abd"));
    }

    #[test]
    fn test_uri_requires_absolute_path() {
        let doc = TextBuffer::new("/work/src/main.rs", "");
        assert_eq!(doc.uri().unwrap().as_str(), "file:///work/src/main.rs");
        assert!(TextBuffer::new("relative.rs", "").uri().is_err());
    }

    #[test]
    fn test_apply_changes() {
        let text = "let a = b;";
        let changes = vec![TextChange::new(4, 5, "alpha"), TextChange::new(8, 9, "beta")];
        assert_eq!(apply_changes(text, &changes), "let alpha = beta;");
    }
}
