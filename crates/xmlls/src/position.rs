//
// position.rs
//
// Conversion between LSP positions and flat character offsets, and
// application of ordered content-change batches.
//

use ropey::Rope;
use tower_lsp::lsp_types::{Position, TextDocumentContentChangeEvent};

/// Convert a zero-based (line, character) position into a character offset.
///
/// The offset is the length of every preceding line (terminators included)
/// plus the character index. `character` counts UTF-16 code units, as LSP
/// clients send them. Positions at or past the end of the content clamp to
/// the content length. Empty content is a single empty line.
pub fn offset(content: &str, position: Position) -> usize {
    offset_in_rope(&Rope::from_str(content), position)
}

/// Same as [`offset`], against an existing rope.
pub fn offset_in_rope(rope: &Rope, position: Position) -> usize {
    let line = position.line as usize;
    if line >= rope.len_lines() {
        return rope.len_chars();
    }

    let line_start = rope.line_to_char(line);
    let wanted = position.character as usize;
    let mut utf16_count = 0;
    let mut char_idx = line_start;

    // Walking past the end of the line continues into the following lines,
    // so an over-long character index behaves like a plain sum.
    for ch in rope.chars_at(line_start) {
        if utf16_count >= wanted {
            return char_idx;
        }
        utf16_count += ch.len_utf16();
        char_idx += 1;
    }
    rope.len_chars()
}

/// Convert a character offset back into a zero-based position.
///
/// Offsets past the end clamp to the end of the content.
pub fn position_at(rope: &Rope, char_offset: usize) -> Position {
    let char_offset = char_offset.min(rope.len_chars());
    let line = rope.char_to_line(char_offset);
    let line_start = rope.line_to_char(line);
    let character: usize = rope
        .slice(line_start..char_offset)
        .chars()
        .map(char::len_utf16)
        .sum();
    Position::new(line as u32, character as u32)
}

/// Apply an ordered batch of edits to `content`.
///
/// An edit without a range replaces the whole document. A ranged edit
/// replaces the span between its two positions; both offsets are computed
/// against the content left by the previous edit in the batch.
pub fn apply_edits(content: &str, changes: &[TextDocumentContentChangeEvent]) -> String {
    let mut rope = Rope::from_str(content);
    apply_edits_to_rope(&mut rope, changes);
    rope.to_string()
}

/// In-place variant of [`apply_edits`].
pub fn apply_edits_to_rope(rope: &mut Rope, changes: &[TextDocumentContentChangeEvent]) {
    for change in changes {
        match change.range {
            None => *rope = Rope::from_str(&change.text),
            Some(range) => {
                let start = offset_in_rope(rope, range.start);
                let end = offset_in_rope(rope, range.end);
                let (start, end) = if end < start { (end, start) } else { (start, end) };
                rope.remove(start..end);
                rope.insert(start, &change.text);
            }
        }
    }
}
