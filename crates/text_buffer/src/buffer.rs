use std::str::FromStr;

use piece_tree::{LineEnding, PieceTree, PieceTreeSnapshot, Position, Range, StringBuffer};

#[derive(Debug)]
pub struct ParseError;

/// A text document backed by a piece tree. Offsets are 0-based byte
/// positions; lines and columns are 1-based.
#[derive(Debug)]
pub struct TextBuffer {
    tree: PieceTree,
}

impl TextBuffer {
    /// Build from read-only chunks, declaring the buffer's EOL and whether
    /// the chunks are already normalized to it.
    pub fn from_chunks(chunks: Vec<StringBuffer>, eol: LineEnding, eol_normalized: bool) -> Self {
        Self {
            tree: PieceTree::new(chunks, eol, eol_normalized),
        }
    }

    /// Insert `value` at byte `offset`; an offset past the end appends.
    pub fn insert(&mut self, offset: usize, value: &str) {
        self.tree.insert(offset, value, false);
    }

    /// Delete `len` bytes starting at byte `offset`.
    pub fn delete(&mut self, offset: usize, len: usize) {
        self.tree.delete(offset, len);
    }

    /// Convenience: insert at (line, column), both 1-based.
    pub fn insert_at(&mut self, line: usize, column: usize, value: &str) {
        let offset = self.get_offset_at(line, column);
        self.insert(offset, value);
    }

    /// Convenience: delete `len` bytes starting at a (line, column) position.
    pub fn delete_at(&mut self, line: usize, column: usize, len: usize) {
        let offset = self.get_offset_at(line, column);
        self.delete(offset, len);
    }

    /// Complete text content.
    pub fn get_text(&self) -> String {
        self.tree.get_text()
    }

    /// Text covered by a (line, column) range.
    pub fn get_value_in_range(&self, range: Range) -> String {
        self.tree.get_value_in_range(range)
    }

    /// Text covered by `range`, with every terminator rewritten to `eol`.
    pub fn get_value_in_range_eol(&self, range: Range, eol: LineEnding) -> String {
        self.tree.get_value_in_range_eol(range, eol)
    }

    /// Number of lines (1-based; an empty document has 1 line).
    pub fn get_line_count(&self) -> usize {
        self.tree.get_line_count()
    }

    /// Document byte length.
    pub fn get_length(&self) -> usize {
        self.tree.get_length()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Content of a line (1-based), without its terminator.
    pub fn get_line_content(&self, line_number: usize) -> String {
        self.tree.get_line_content(line_number)
    }

    /// All lines, without terminators.
    pub fn get_lines_content(&self) -> Vec<String> {
        self.tree.get_lines_content()
    }

    /// Byte length of a line (1-based), without its terminator.
    pub fn get_line_length(&self, line_number: usize) -> usize {
        self.tree.get_line_length(line_number)
    }

    /// Byte at the 0-based `index` on a line; `index == line length` peeks
    /// the terminator, past the final line yields `0`.
    pub fn get_line_char_code(&self, line_number: usize, index: usize) -> u8 {
        self.tree.get_line_char_code(line_number, index)
    }

    /// 1-based (line, column) to 0-based byte offset.
    pub fn get_offset_at(&self, line_number: usize, column: usize) -> usize {
        self.tree.get_offset_at(line_number, column)
    }

    /// 0-based byte offset to 1-based position.
    pub fn get_position_at(&self, offset: usize) -> Position {
        self.tree.get_position_at(offset)
    }

    /// UI-friendly: max column on a line (1-based).
    pub fn get_line_max_column(&self, line_number: usize) -> usize {
        self.get_line_length(line_number) + 1
    }

    pub fn get_eol(&self) -> LineEnding {
        self.tree.get_eol()
    }

    /// Rewrite the document to `new_eol` line endings.
    pub fn set_eol(&mut self, new_eol: LineEnding) {
        self.tree.set_eol(new_eol);
    }

    /// Streaming view of the current content; `bom` prefixes the first
    /// chunk.
    pub fn create_snapshot<'a>(&'a self, bom: &str) -> PieceTreeSnapshot<'a> {
        self.tree.create_snapshot(bom)
    }

    /// Content equality, independent of how either buffer is chunked.
    pub fn equal(&self, other: &TextBuffer) -> bool {
        self.tree.equal(&other.tree)
    }
}

impl FromStr for TextBuffer {
    type Err = ParseError;

    /// Build from a single string, defaulting to `\n` line endings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chunk = StringBuffer::new(s.to_string());
        Ok(Self::from_chunks(
            vec![chunk],
            LineEnding::Lf,
            false,
        ))
    }
}
