//! Semantic token decoding.
//!
//! The backend sends a flat array of 5-tuples
//! `(line_delta, char_delta, length, type_index, modifier_bits)`. Lines
//! accumulate; the column accumulates too but restarts from 0 on every new
//! line. Types and modifiers index into the legend negotiated at initialize.
//!
//! Every refresh decodes the full array. `semanticTokens/full/delta` exists
//! on the wire but is never requested.

use lsp_types::{Position, SemanticTokensLegend};
use serde::Deserialize;

/// A classified range in absolute byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticToken {
    pub from: usize,
    pub to: usize,
    pub token_type: String,
    /// Modifier names in legend order.
    pub modifiers: Vec<String>,
}

/// Raw `textDocument/semanticTokens/full` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSemanticTokens {
    #[serde(default)]
    pub result_id: Option<String>,
    #[serde(default)]
    pub data: Vec<u32>,
}

/// Decode `data` against `legend`, resolving positions with `to_offset`.
///
/// Tokens with an unknown type index are dropped, unknown modifier bits are
/// ignored and a trailing partial tuple is discarded.
pub fn decode<F>(data: &[u32], legend: &SemanticTokensLegend, to_offset: F) -> Vec<SemanticToken>
where
    F: Fn(Position) -> usize,
{
    let mut tokens = Vec::with_capacity(data.len() / 5);
    let mut line = 0u32;
    let mut character = 0u32;

    for chunk in data.chunks_exact(5) {
        let [line_delta, char_delta, length, type_index, modifier_bits] =
            [chunk[0], chunk[1], chunk[2], chunk[3], chunk[4]];

        if line_delta != 0 {
            line = line.saturating_add(line_delta);
            character = char_delta;
        } else {
            character = character.saturating_add(char_delta);
        }

        let Some(token_type) = legend.token_types.get(type_index as usize) else {
            continue;
        };

        let modifiers = legend
            .token_modifiers
            .iter()
            .enumerate()
            .filter(|(bit, _)| *bit < 32 && modifier_bits & (1 << bit) != 0)
            .map(|(_, modifier)| modifier.as_str().to_string())
            .collect();

        let from = to_offset(Position { line, character });
        let to = to_offset(Position {
            line,
            character: character.saturating_add(length),
        });

        tokens.push(SemanticToken {
            from,
            to,
            token_type: token_type.as_str().to_string(),
            modifiers,
        });
    }

    tokens.sort_by_key(|token| token.from);
    tokens
}

/// Encode absolute tokens back into the wire array.
///
/// Tokens must be single-line and non-overlapping; ones whose type is not in
/// the legend are skipped.
pub fn encode<F>(tokens: &[SemanticToken], legend: &SemanticTokensLegend, to_position: F) -> Vec<u32>
where
    F: Fn(usize) -> Position,
{
    let mut sorted: Vec<&SemanticToken> = tokens.iter().collect();
    sorted.sort_by_key(|token| token.from);

    let mut data = Vec::with_capacity(sorted.len() * 5);
    let mut prev_line = 0u32;
    let mut prev_char = 0u32;

    for token in sorted {
        let Some(type_index) = legend
            .token_types
            .iter()
            .position(|t| t.as_str() == token.token_type)
        else {
            continue;
        };

        let modifier_bits = legend
            .token_modifiers
            .iter()
            .enumerate()
            .filter(|(bit, m)| *bit < 32 && token.modifiers.iter().any(|name| name == m.as_str()))
            .fold(0u32, |bits, (bit, _)| bits | (1 << bit));

        let start = to_position(token.from);
        let end = to_position(token.to);
        let line_delta = start.line.saturating_sub(prev_line);
        let char_delta = if line_delta == 0 {
            start.character.saturating_sub(prev_char)
        } else {
            start.character
        };

        data.extend_from_slice(&[
            line_delta,
            char_delta,
            end.character.saturating_sub(start.character),
            type_index as u32,
            modifier_bits,
        ]);
        prev_line = start.line;
        prev_char = start.character;
    }

    data
}
