use std::cell::RefCell;
use std::rc::Rc;

use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace};

use crate::buffer::{create_line_starts_fast, StringBuffer};
use crate::cache::{CacheEntry, LineCache, SearchCache};
use crate::piece::{node_color, rightmost, BufferCursor, NodeColor, NodeRef, Piece};
use crate::snapshot::PieceTreeSnapshot;
use crate::{LineEnding, AVERAGE_BUFFER_SIZE};

/// A document position: 1-based line number and 1-based column, the column
/// measured in bytes from the start of the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line_number: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line_number: usize, column: usize) -> Self {
        Self {
            line_number,
            column,
        }
    }
}

/// A document range in 1-based (line, column) coordinates, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start_line_number: usize,
    pub start_column: usize,
    pub end_line_number: usize,
    pub end_column: usize,
}

impl Range {
    pub fn new(
        start_line_number: usize,
        start_column: usize,
        end_line_number: usize,
        end_column: usize,
    ) -> Self {
        Self {
            start_line_number,
            start_column,
            end_line_number,
            end_column,
        }
    }
}

/// Where a document coordinate landed: the owning node, the byte remainder
/// within its piece (`0..=piece.length`), and the document offset at which
/// the node begins.
pub(crate) struct NodePosition {
    pub node: NodeRef,
    pub remainder: usize,
    pub node_start_offset: usize,
}

#[derive(Debug)]
pub struct PieceTree {
    pub(crate) root: Option<NodeRef>,
    /// Index 0 is the append-only change buffer; the rest are read-only.
    pub(crate) buffers: Vec<StringBuffer>,
    pub(crate) length: usize,
    pub(crate) line_count: usize,
    pub(crate) eol: LineEnding,
    pub(crate) eol_normalized: bool,
    /// Cursor one past the last byte appended to the change buffer.
    pub(crate) last_change_buffer_pos: BufferCursor,
    pub(crate) search_cache: RefCell<SearchCache>,
    pub(crate) line_cache: RefCell<LineCache>,
}

impl PieceTree {
    /// Build a tree whose document is the concatenation of `chunks`, each
    /// becoming one read-only buffer. No chunk may end with the `\r` of a
    /// `\r\n` pair whose `\n` opens the next chunk; `TextBufferBuilder`
    /// re-unites such pairs before they get here.
    pub fn new(chunks: Vec<StringBuffer>, eol: LineEnding, eol_normalized: bool) -> Self {
        let mut tree = Self {
            root: None,
            buffers: vec![StringBuffer::new(String::new())],
            length: 0,
            line_count: 1,
            eol,
            eol_normalized,
            last_change_buffer_pos: BufferCursor::default(),
            search_cache: RefCell::new(SearchCache::new(1)),
            line_cache: RefCell::new(LineCache::default()),
        };
        tree.create(chunks, eol, eol_normalized);
        tree
    }

    fn create(&mut self, chunks: Vec<StringBuffer>, eol: LineEnding, eol_normalized: bool) {
        self.buffers = vec![StringBuffer::new(String::new())];
        self.last_change_buffer_pos = BufferCursor::default();
        self.root = None;
        self.line_count = 1;
        self.length = 0;
        self.eol = eol;
        self.eol_normalized = eol_normalized;
        self.search_cache.borrow_mut().clear();
        self.line_cache.borrow_mut().invalidate();

        let mut last_node: Option<NodeRef> = None;
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            let last_line = chunk.line_starts.len() - 1;
            let piece = Piece::new(
                self.buffers.len(),
                BufferCursor::new(0, 0),
                BufferCursor::new(last_line, chunk.len() - chunk.line_starts[last_line]),
                chunk.len(),
                last_line,
            );
            self.buffers.push(chunk);
            last_node = Some(self.rb_insert_right(last_node.as_ref(), piece));
        }
        self.compute_buffer_metadata();
    }

    pub fn get_length(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn get_line_count(&self) -> usize {
        self.line_count
    }

    pub fn get_eol(&self) -> LineEnding {
        self.eol
    }

    /// Number of pieces currently in the tree.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.for_each_inorder(|_| {
            count += 1;
            true
        });
        count
    }

    // ---------- buffer store ----------

    fn node_char_code_at(&self, node: &NodeRef, offset: usize) -> u8 {
        let piece = node.borrow().piece;
        let buffer = &self.buffers[piece.buffer_idx];
        buffer.buffer.as_bytes()[buffer.offset_of(piece.start) + offset]
    }

    /// Backing-buffer cursor for the byte `local_offset` into `node`'s
    /// piece, clamped to the piece's end.
    pub(crate) fn cursor_in_piece(&self, node: &NodeRef, local_offset: usize) -> BufferCursor {
        let piece = node.borrow().piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let target =
            (buffer.offset_of(piece.start) + local_offset).min(buffer.offset_of(piece.end));
        buffer.cursor_at(target)
    }

    // ---------- navigation ----------

    /// Piece-local offset of the first byte after the piece's `nth` line
    /// break (0-based), i.e. where intra-piece line `nth + 1` starts. A
    /// negative `nth` is the piece's own start; past the last break the
    /// answer clamps to the piece's length.
    fn line_start_within_piece(&self, node: &NodeRef, nth: isize) -> usize {
        if nth < 0 {
            return 0;
        }
        let piece = node.borrow().piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let piece_end = buffer.offset_of(piece.end);
        buffer
            .line_starts
            .get(piece.start.line + nth as usize + 1)
            .map_or(piece_end, |&s| s.min(piece_end))
            - buffer.offset_of(piece.start)
    }

    /// Intra-piece line index and column of a piece-local byte offset. A
    /// piece may end between the `\r` and `\n` of a pair; that cut break
    /// still belongs to the piece, so its very end reads as the start of
    /// the following line rather than a column on the pair's line.
    fn piece_coordinates(&self, node: &NodeRef, local_offset: usize) -> (usize, usize) {
        let piece = node.borrow().piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let target =
            (buffer.offset_of(piece.start) + local_offset).min(buffer.offset_of(piece.end));
        let cursor = buffer.cursor_at(target);

        if local_offset == piece.length && buffer.splits_crlf(target) {
            (cursor.line - piece.start.line + 1, 0)
        } else {
            (cursor.line - piece.start.line, cursor.column)
        }
    }

    /// Locate the node containing document offset `offset` (`0..=length`).
    pub(crate) fn node_at(&self, mut offset: usize) -> NodePosition {
        if let Some(entry) = self.search_cache.borrow().get(offset) {
            return NodePosition {
                node: entry.node.clone(),
                remainder: offset - entry.node_start_offset,
                node_start_offset: entry.node_start_offset,
            };
        }

        let mut x = self.root.clone();
        let mut node_start_offset = 0;

        while let Some(n) = x {
            let (size_left, piece_len, left, right) = {
                let nb = n.borrow();
                (
                    nb.size_left,
                    nb.piece.length,
                    nb.left.clone(),
                    nb.right.clone(),
                )
            };

            if size_left > offset {
                x = left;
            } else if size_left + piece_len >= offset {
                node_start_offset += size_left;
                let remainder = offset - size_left;
                self.search_cache.borrow_mut().set(CacheEntry {
                    node: n.clone(),
                    node_start_offset,
                    node_start_line_number: None,
                });
                return NodePosition {
                    node: n,
                    remainder,
                    node_start_offset,
                };
            } else {
                offset -= size_left + piece_len;
                node_start_offset += size_left + piece_len;
                x = right;
            }
        }

        unreachable!("offset out of bounds for a non-empty tree")
    }

    /// Locate the node containing 1-based `(line_number, column)`. A column
    /// past end-of-line clips to end-of-line; a line past the last line
    /// clips to the last line.
    pub(crate) fn node_at_position(&self, line_number: usize, column: usize) -> NodePosition {
        let mut line_number = line_number.clamp(1, self.line_count);
        let mut column = column.max(1);
        let mut node_start_offset = 0usize;
        let mut cur = self.root.clone();
        let mut overflow_node: Option<NodeRef> = None;

        while let Some(n) = cur {
            let (left, right, lf_left, size_left, piece) = {
                let nb = n.borrow();
                (
                    nb.left.clone(),
                    nb.right.clone(),
                    nb.lf_left,
                    nb.size_left,
                    nb.piece,
                )
            };

            if left.is_some() && lf_left >= line_number - 1 {
                cur = left;
            } else if lf_left + piece.line_feed_cnt > line_number - 1 {
                let prev_acc =
                    self.line_start_within_piece(&n, line_number as isize - lf_left as isize - 2);
                let acc =
                    self.line_start_within_piece(&n, line_number as isize - lf_left as isize - 1);
                node_start_offset += size_left;
                return NodePosition {
                    node: n,
                    remainder: (prev_acc + column - 1).min(acc),
                    node_start_offset,
                };
            } else if lf_left + piece.line_feed_cnt == line_number - 1 {
                // the requested line ends exactly at this piece's last byte
                node_start_offset += size_left;
                let prev_acc =
                    self.line_start_within_piece(&n, line_number as isize - lf_left as isize - 2);
                if prev_acc + column - 1 <= piece.length {
                    return NodePosition {
                        node: n,
                        remainder: prev_acc + column - 1,
                        node_start_offset,
                    };
                }
                column -= piece.length - prev_acc;
                overflow_node = Some(n);
                break;
            } else {
                line_number -= lf_left + piece.line_feed_cnt;
                node_start_offset += size_left + piece.length;
                cur = right;
            }
        }

        // consume the remaining column across zero-line-feed successors
        if let Some(start) = overflow_node {
            let mut cur = self.next_node(&start);
            while let Some(n) = cur {
                let piece = n.borrow().piece;
                if piece.line_feed_cnt > 0 {
                    let acc = self.line_start_within_piece(&n, 0);
                    let node_start_offset = self.offset_of_node(&n);
                    return NodePosition {
                        node: n,
                        remainder: (column - 1).min(acc),
                        node_start_offset,
                    };
                }
                if piece.length >= column - 1 {
                    let node_start_offset = self.offset_of_node(&n);
                    return NodePosition {
                        node: n,
                        remainder: column - 1,
                        node_start_offset,
                    };
                }
                column -= piece.length;
                cur = self.next_node(&n);
            }
        }

        // column ran past the document: clamp to the last piece's end
        let last = rightmost(self.root.clone().expect("tree is non-empty"));
        let remainder = last.borrow().piece.length;
        let node_start_offset = self.offset_of_node(&last);
        NodePosition {
            node: last,
            remainder,
            node_start_offset,
        }
    }

    /// 1-based (line, column) to 0-based byte offset.
    pub fn get_offset_at(&self, line_number: usize, column: usize) -> usize {
        self.start_of_line_offset(line_number.clamp(1, self.line_count)) + column.max(1) - 1
    }

    /// Document offset of the first byte of `line_number` (already clamped
    /// to a real line). Descends by skipping whole subtrees' break counts,
    /// then resolves the surviving break index inside the owning piece.
    fn start_of_line_offset(&self, line_number: usize) -> usize {
        let mut remaining = line_number - 1; // breaks before the line opens
        let mut offset = 0;
        let mut cur = self.root.clone();

        while let Some(n) = cur {
            let (left, right, lf_left, size_left, piece) = {
                let nb = n.borrow();
                (
                    nb.left.clone(),
                    nb.right.clone(),
                    nb.lf_left,
                    nb.size_left,
                    nb.piece,
                )
            };

            if left.is_some() && lf_left >= remaining {
                cur = left;
            } else if lf_left + piece.line_feed_cnt >= remaining {
                // the line opens in this piece, right after its
                // (remaining - lf_left)-th break
                let nth = remaining as isize - lf_left as isize - 1;
                return offset + size_left + self.line_start_within_piece(&n, nth);
            } else {
                remaining -= lf_left + piece.line_feed_cnt;
                offset += size_left + piece.length;
                cur = right;
            }
        }

        offset
    }

    /// 0-based byte offset to 1-based position; the offset clamps to
    /// `[0, length]`.
    pub fn get_position_at(&self, offset: usize) -> Position {
        let mut offset = offset.min(self.length);
        let original_offset = offset;
        let mut lf_cnt = 0usize;
        let mut x = self.root.clone();

        while let Some(n) = x {
            let (left, right, lf_left, size_left, piece) = {
                let nb = n.borrow();
                (
                    nb.left.clone(),
                    nb.right.clone(),
                    nb.lf_left,
                    nb.size_left,
                    nb.piece,
                )
            };

            if size_left != 0 && size_left >= offset {
                x = left;
            } else if size_left + piece.length >= offset {
                let (line_in_piece, column) = self.piece_coordinates(&n, offset - size_left);
                lf_cnt += lf_left + line_in_piece;

                if line_in_piece == 0 {
                    // the line started in an earlier piece
                    let line_start_offset = self.start_of_line_offset(lf_cnt + 1);
                    return Position::new(lf_cnt + 1, original_offset - line_start_offset + 1);
                }
                return Position::new(lf_cnt + 1, column + 1);
            } else {
                offset -= size_left + piece.length;
                lf_cnt += lf_left + piece.line_feed_cnt;

                if right.is_none() {
                    let line_start_offset = self.start_of_line_offset(lf_cnt + 1);
                    let column = original_offset - offset - line_start_offset;
                    return Position::new(lf_cnt + 1, column + 1);
                }
                x = right;
            }
        }

        Position::new(1, 1)
    }

    // ---------- edit engine ----------

    /// Insert `value` at byte offset `offset`; an offset past the end
    /// appends. `eol_normalized` declares whether every terminator in
    /// `value` already matches the tree's EOL.
    pub fn insert(&mut self, offset: usize, value: &str, eol_normalized: bool) {
        self.eol_normalized = self.eol_normalized && eol_normalized;
        self.line_cache.borrow_mut().invalidate();
        if value.is_empty() {
            return;
        }
        let offset = offset.min(self.length);
        trace!(offset, bytes = value.len(), "insert");

        if self.root.is_some() {
            let NodePosition {
                node,
                remainder,
                node_start_offset,
            } = self.node_at(offset);
            let piece = node.borrow().piece;

            if piece.buffer_idx == 0
                && piece.end == self.last_change_buffer_pos
                && node_start_offset + piece.length == offset
                && value.len() < AVERAGE_BUFFER_SIZE
            {
                // the piece ends where the change buffer ends: extend in place
                self.append_to_node(&node, value);
                self.validate_search_cache(offset);
                self.compute_buffer_metadata();
                return;
            }

            if node_start_offset == offset {
                self.insert_content_to_node_left(value, &node);
            } else if node_start_offset + piece.length > offset {
                // splitting the node into left and right
                let mut nodes_to_del: Vec<NodeRef> = Vec::new();
                let insert_pos = self.cursor_in_piece(&node, remainder);
                let mut value = value.to_string();

                let buffer = &self.buffers[piece.buffer_idx];
                let mut new_right_piece = Piece::new(
                    piece.buffer_idx,
                    insert_pos,
                    piece.end,
                    buffer.offset_of(piece.end) - buffer.offset_of(insert_pos),
                    buffer.break_count(insert_pos, piece.end),
                );

                if self.should_check_crlf()
                    && value.ends_with('\r')
                    && self.node_char_code_at(&node, remainder) == b'\n'
                {
                    // steal the \n right of the split into the inserted text
                    let new_start = BufferCursor::new(new_right_piece.start.line + 1, 0);
                    new_right_piece = Piece::new(
                        new_right_piece.buffer_idx,
                        new_start,
                        new_right_piece.end,
                        new_right_piece.length - 1,
                        self.buffers[new_right_piece.buffer_idx]
                            .break_count(new_start, new_right_piece.end),
                    );
                    value.push('\n');
                }

                if self.should_check_crlf()
                    && value.starts_with('\n')
                    && self.node_char_code_at(&node, remainder - 1) == b'\r'
                {
                    // pull the \r left of the split into the inserted text
                    let previous_pos = self.cursor_in_piece(&node, remainder - 1);
                    self.delete_node_tail(&node, previous_pos);
                    value.insert(0, '\r');
                    if node.borrow().piece.length == 0 {
                        nodes_to_del.push(node.clone());
                    }
                } else {
                    self.delete_node_tail(&node, insert_pos);
                }

                let new_pieces = self.create_new_pieces(&value);
                if new_right_piece.length > 0 {
                    self.rb_insert_right(Some(&node), new_right_piece);
                }
                let mut tmp_node = node;
                for p in new_pieces {
                    tmp_node = self.rb_insert_right(Some(&tmp_node), p);
                }
                self.delete_nodes(nodes_to_del);
            } else {
                self.insert_content_to_node_right(value, &node);
            }
        } else {
            let pieces = self.create_new_pieces(value);
            let mut node: Option<NodeRef> = None;
            for p in pieces {
                node = Some(match &node {
                    None => self.rb_insert_left(None, p),
                    Some(prev) => self.rb_insert_right(Some(prev), p),
                });
            }
        }

        self.validate_search_cache(offset);
        self.compute_buffer_metadata();
    }

    /// Delete `cnt` bytes starting at `offset`. A zero count, an empty tree
    /// or an offset at/past the end is a no-op; the count clamps to the end.
    pub fn delete(&mut self, offset: usize, cnt: usize) {
        self.line_cache.borrow_mut().invalidate();
        if cnt == 0 || self.root.is_none() || offset >= self.length {
            return;
        }
        let cnt = cnt.min(self.length - offset);
        trace!(offset, cnt, "delete");

        let start_position = self.node_at(offset);
        let end_position = self.node_at(offset + cnt);
        let start_node = start_position.node.clone();
        let end_node = end_position.node.clone();

        if Rc::ptr_eq(&start_node, &end_node) {
            let start_split = self.cursor_in_piece(&start_node, start_position.remainder);
            let end_split = self.cursor_in_piece(&start_node, end_position.remainder);

            if start_position.node_start_offset == offset {
                if cnt == start_node.borrow().piece.length {
                    // the whole node goes
                    let next = self.next_node(&start_node);
                    self.rb_delete(&start_node);
                    if let Some(next) = &next {
                        self.validate_crlf_with_prev_node(next);
                    }
                } else {
                    self.delete_node_head(&start_node, end_split);
                    self.validate_crlf_with_prev_node(&start_node);
                }
            } else if start_position.node_start_offset + start_node.borrow().piece.length
                == offset + cnt
            {
                self.delete_node_tail(&start_node, start_split);
                self.validate_crlf_with_next_node(&start_node);
            } else {
                self.shrink_node(&start_node, start_split, end_split);
            }

            self.validate_search_cache(offset);
            self.compute_buffer_metadata();
            return;
        }

        let mut nodes_to_del: Vec<NodeRef> = Vec::new();

        let start_split = self.cursor_in_piece(&start_node, start_position.remainder);
        self.delete_node_tail(&start_node, start_split);
        if start_node.borrow().piece.length == 0 {
            nodes_to_del.push(start_node.clone());
        }

        let end_split = self.cursor_in_piece(&end_node, end_position.remainder);
        self.delete_node_head(&end_node, end_split);
        if end_node.borrow().piece.length == 0 {
            nodes_to_del.push(end_node.clone());
        }

        let mut cur = self.next_node(&start_node);
        while let Some(n) = cur {
            if Rc::ptr_eq(&n, &end_node) {
                break;
            }
            nodes_to_del.push(n.clone());
            cur = self.next_node(&n);
        }

        let prev = if start_node.borrow().piece.length == 0 {
            self.prev_node(&start_node)
        } else {
            Some(start_node)
        };
        self.delete_nodes(nodes_to_del);
        if let Some(prev) = &prev {
            self.validate_crlf_with_next_node(prev);
        }
        self.validate_search_cache(offset);
        self.compute_buffer_metadata();
    }

    fn insert_content_to_node_left(&mut self, value: &str, node: &NodeRef) {
        let mut nodes_to_del: Vec<NodeRef> = Vec::new();
        let mut value = value.to_string();

        if self.should_check_crlf() && value.ends_with('\r') && self.node_starts_with_lf(node) {
            // value ends with \r and the node starts with \n: move the \n
            let piece = node.borrow().piece;
            let new_start = BufferCursor::new(piece.start.line + 1, 0);
            let n_piece = Piece::new(
                piece.buffer_idx,
                new_start,
                piece.end,
                piece.length - 1,
                self.buffers[piece.buffer_idx].break_count(new_start, piece.end),
            );
            node.borrow_mut().piece = n_piece;
            value.push('\n');
            self.update_tree_metadata(node, -1, -1);
            if n_piece.length == 0 {
                nodes_to_del.push(node.clone());
            }
        }

        let new_pieces = self.create_new_pieces(&value);
        let mut new_node = self.rb_insert_left(Some(node), new_pieces[new_pieces.len() - 1]);
        for k in (0..new_pieces.len() - 1).rev() {
            new_node = self.rb_insert_left(Some(&new_node), new_pieces[k]);
        }
        self.validate_crlf_with_prev_node(&new_node);
        self.delete_nodes(nodes_to_del);
    }

    fn insert_content_to_node_right(&mut self, value: &str, node: &NodeRef) {
        let mut value = value.to_string();
        if self.adjust_carriage_return_from_next(&value, node) {
            value.push('\n');
        }

        let new_pieces = self.create_new_pieces(&value);
        let new_node = self.rb_insert_right(Some(node), new_pieces[0]);
        let mut tmp_node = new_node.clone();
        for k in 1..new_pieces.len() {
            tmp_node = self.rb_insert_right(Some(&tmp_node), new_pieces[k]);
        }
        self.validate_crlf_with_prev_node(&new_node);
    }

    /// Append fast path: extend the piece that ends at the change buffer's
    /// tail without creating a new node.
    fn append_to_node(&mut self, node: &NodeRef, value: &str) {
        let mut value = value.to_string();
        if self.adjust_carriage_return_from_next(&value, node) {
            value.push('\n');
        }

        let hit_crlf =
            self.should_check_crlf() && value.starts_with('\n') && self.node_ends_with_cr(node);
        let start_offset = self.buffers[0].buffer.len();
        self.buffers[0].buffer.push_str(&value);

        let mut line_starts = create_line_starts_fast(&value);
        for ls in line_starts.iter_mut() {
            *ls += start_offset;
        }
        if hit_crlf {
            // the appended \n fuses with the \r already at the buffer tail;
            // the break the lone \r produced is no longer its own
            self.buffers[0].line_starts.pop();
        }
        self.buffers[0]
            .line_starts
            .extend_from_slice(&line_starts[1..]);

        let end_index = self.buffers[0].line_starts.len() - 1;
        let end_column = self.buffers[0].buffer.len() - self.buffers[0].line_starts[end_index];
        let new_end = BufferCursor::new(end_index, end_column);

        let piece = node.borrow().piece;
        let new_length = piece.length + value.len();
        let new_lf = self.buffers[0].break_count(piece.start, new_end);
        let lf_delta = new_lf as isize - piece.line_feed_cnt as isize;
        node.borrow_mut().piece = Piece::new(0, piece.start, new_end, new_length, new_lf);
        self.last_change_buffer_pos = new_end;
        self.update_tree_metadata(node, value.len() as isize, lf_delta);
    }

    /// Turn `text` into pieces. Large texts become read-only buffers of at
    /// most [`AVERAGE_BUFFER_SIZE`] bytes, never splitting a `\r\n` pair or
    /// a multi-byte character across buffers; everything else is appended to
    /// the change buffer.
    fn create_new_pieces(&mut self, mut text: &str) -> SmallVec<[Piece; 2]> {
        if text.len() > AVERAGE_BUFFER_SIZE {
            let mut new_pieces: SmallVec<[Piece; 2]> = SmallVec::new();
            while text.len() > AVERAGE_BUFFER_SIZE {
                let mut split = AVERAGE_BUFFER_SIZE;
                if text.as_bytes()[split - 1] == b'\r' {
                    split -= 1;
                } else {
                    while !text.is_char_boundary(split) {
                        split -= 1;
                    }
                }

                let (chunk, rest) = text.split_at(split);
                let line_starts = create_line_starts_fast(chunk);
                let last_line = line_starts.len() - 1;
                new_pieces.push(Piece::new(
                    self.buffers.len(),
                    BufferCursor::new(0, 0),
                    BufferCursor::new(last_line, chunk.len() - line_starts[last_line]),
                    chunk.len(),
                    last_line,
                ));
                self.buffers
                    .push(StringBuffer::with_line_starts(chunk.to_string(), line_starts));
                text = rest;
            }

            let line_starts = create_line_starts_fast(text);
            let last_line = line_starts.len() - 1;
            new_pieces.push(Piece::new(
                self.buffers.len(),
                BufferCursor::new(0, 0),
                BufferCursor::new(last_line, text.len() - line_starts[last_line]),
                text.len(),
                last_line,
            ));
            self.buffers
                .push(StringBuffer::with_line_starts(text.to_string(), line_starts));
            return new_pieces;
        }

        let mut start_offset = self.buffers[0].buffer.len();
        let mut line_starts = create_line_starts_fast(text);
        let mut start = self.last_change_buffer_pos;

        let ends_at_line_break =
            self.buffers[0].line_starts[self.buffers[0].line_starts.len() - 1] == start_offset;
        if ends_at_line_break
            && start_offset != 0
            && text.starts_with('\n')
            && self.buffers[0].buffer.ends_with('\r')
        {
            // the buffer tail is a lone \r and the new text leads with \n;
            // writing them adjacently would fabricate a \r\n pair, so a
            // filler byte keeps them apart and the piece starts past it
            self.last_change_buffer_pos = BufferCursor::new(
                self.last_change_buffer_pos.line,
                self.last_change_buffer_pos.column + 1,
            );
            start = self.last_change_buffer_pos;
            for ls in line_starts.iter_mut() {
                *ls += start_offset + 1;
            }
            self.buffers[0]
                .line_starts
                .extend_from_slice(&line_starts[1..]);
            self.buffers[0].buffer.push('_');
            self.buffers[0].buffer.push_str(text);
            start_offset += 1;
        } else {
            if start_offset != 0 {
                for ls in line_starts.iter_mut() {
                    *ls += start_offset;
                }
            }
            self.buffers[0]
                .line_starts
                .extend_from_slice(&line_starts[1..]);
            self.buffers[0].buffer.push_str(text);
        }

        let end_offset = self.buffers[0].buffer.len();
        let end_index = self.buffers[0].line_starts.len() - 1;
        let end_column = end_offset - self.buffers[0].line_starts[end_index];
        let end_pos = BufferCursor::new(end_index, end_column);
        let piece = Piece::new(
            0,
            start,
            end_pos,
            end_offset - start_offset,
            self.buffers[0].break_count(start, end_pos),
        );
        self.last_change_buffer_pos = end_pos;
        smallvec![piece]
    }

    fn delete_nodes(&mut self, nodes: Vec<NodeRef>) {
        for node in nodes {
            self.rb_delete(&node);
        }
    }

    fn delete_node_tail(&mut self, node: &NodeRef, pos: BufferCursor) {
        let piece = node.borrow().piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let original_lf_cnt = piece.line_feed_cnt;
        let original_end_offset = buffer.offset_of(piece.end);

        let new_end_offset = buffer.offset_of(pos);
        let new_lf = buffer.break_count(piece.start, pos);

        let lf_delta = new_lf as isize - original_lf_cnt as isize;
        let size_delta = new_end_offset as isize - original_end_offset as isize;
        let new_length = (piece.length as isize + size_delta) as usize;

        node.borrow_mut().piece = Piece::new(piece.buffer_idx, piece.start, pos, new_length, new_lf);
        self.update_tree_metadata(node, size_delta, lf_delta);
    }

    fn delete_node_head(&mut self, node: &NodeRef, pos: BufferCursor) {
        let piece = node.borrow().piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let original_lf_cnt = piece.line_feed_cnt;
        let original_start_offset = buffer.offset_of(piece.start);

        let new_start_offset = buffer.offset_of(pos);
        let new_lf = buffer.break_count(pos, piece.end);

        let lf_delta = new_lf as isize - original_lf_cnt as isize;
        let size_delta = original_start_offset as isize - new_start_offset as isize;
        let new_length = (piece.length as isize + size_delta) as usize;

        node.borrow_mut().piece = Piece::new(piece.buffer_idx, pos, piece.end, new_length, new_lf);
        self.update_tree_metadata(node, size_delta, lf_delta);
    }

    /// Cut `[start, end)` out of the middle of `node`'s piece: the node
    /// keeps the head, the tail is re-inserted as its right neighbor.
    fn shrink_node(&mut self, node: &NodeRef, start: BufferCursor, end: BufferCursor) {
        let piece = node.borrow().piece;
        let original_start = piece.start;
        let original_end = piece.end;
        let old_length = piece.length;
        let old_lf_cnt = piece.line_feed_cnt;

        let new_end = start;
        let buffer = &self.buffers[piece.buffer_idx];
        let new_lf = buffer.break_count(original_start, new_end);
        let new_length = buffer.offset_of(start) - buffer.offset_of(original_start);
        let new_piece = Piece::new(
            piece.buffer_idx,
            end,
            original_end,
            buffer.offset_of(original_end) - buffer.offset_of(end),
            buffer.break_count(end, original_end),
        );
        node.borrow_mut().piece =
            Piece::new(piece.buffer_idx, original_start, new_end, new_length, new_lf);
        self.update_tree_metadata(
            node,
            new_length as isize - old_length as isize,
            new_lf as isize - old_lf_cnt as isize,
        );
        let new_node = self.rb_insert_right(Some(node), new_piece);
        self.validate_crlf_with_prev_node(&new_node);
    }

    fn validate_search_cache(&self, offset: usize) {
        self.search_cache
            .borrow_mut()
            .validate(offset, self.root.as_ref());
    }

    // ---------- CRLF boundary guard ----------

    fn should_check_crlf(&self) -> bool {
        !(self.eol_normalized && self.eol == LineEnding::Lf)
    }

    fn node_starts_with_lf(&self, node: &NodeRef) -> bool {
        // a piece with any break at all is non-empty, so the byte read is
        // always in bounds
        node.borrow().piece.line_feed_cnt > 0 && self.node_char_code_at(node, 0) == b'\n'
    }

    fn node_ends_with_cr(&self, node: &NodeRef) -> bool {
        let len = node.borrow().piece.length;
        if len == 0 {
            return false;
        }
        self.node_char_code_at(node, len - 1) == b'\r'
    }

    fn validate_crlf_with_prev_node(&mut self, next_node: &NodeRef) {
        if self.should_check_crlf() && self.node_starts_with_lf(next_node) {
            if let Some(prev) = self.prev_node(next_node) {
                if self.node_ends_with_cr(&prev) {
                    self.fix_crlf(&prev, next_node);
                }
            }
        }
    }

    fn validate_crlf_with_next_node(&mut self, node: &NodeRef) {
        if self.should_check_crlf() && self.node_ends_with_cr(node) {
            if let Some(next) = self.next_node(node) {
                if self.node_starts_with_lf(&next) {
                    self.fix_crlf(node, &next);
                }
            }
        }
    }

    /// `prev` ends with `\r`, `next` starts with `\n`: move both bytes into
    /// one fresh piece so the pair never straddles a boundary.
    fn fix_crlf(&mut self, prev: &NodeRef, next: &NodeRef) {
        let mut nodes_to_del: Vec<NodeRef> = Vec::new();

        let prev_piece = prev.borrow().piece;
        // drop the trailing \r: one byte back, whichever line that lands on
        let new_end = {
            let buffer = &self.buffers[prev_piece.buffer_idx];
            buffer.cursor_at(buffer.offset_of(prev_piece.end) - 1)
        };
        let prev_new_length = prev_piece.length - 1;
        let prev_new_lf = prev_piece.line_feed_cnt - 1;
        prev.borrow_mut().piece = Piece::new(
            prev_piece.buffer_idx,
            prev_piece.start,
            new_end,
            prev_new_length,
            prev_new_lf,
        );
        self.update_tree_metadata(prev, -1, -1);
        if prev_new_length == 0 {
            nodes_to_del.push(prev.clone());
        }

        let next_piece = next.borrow().piece;
        let new_start = BufferCursor::new(next_piece.start.line + 1, 0);
        let next_new_length = next_piece.length - 1;
        let next_new_lf = self.buffers[next_piece.buffer_idx].break_count(new_start, next_piece.end);
        next.borrow_mut().piece = Piece::new(
            next_piece.buffer_idx,
            new_start,
            next_piece.end,
            next_new_length,
            next_new_lf,
        );
        self.update_tree_metadata(next, -1, -1);
        if next_new_length == 0 {
            nodes_to_del.push(next.clone());
        }

        let pieces = self.create_new_pieces("\r\n");
        self.rb_insert_right(Some(prev), pieces[0]);
        for node in nodes_to_del {
            self.rb_delete(&node);
        }
    }

    /// When `value` ends with `\r` and `node`'s successor begins with `\n`,
    /// steal that `\n` (the caller appends it to `value`).
    fn adjust_carriage_return_from_next(&mut self, value: &str, node: &NodeRef) -> bool {
        if !(self.should_check_crlf() && value.ends_with('\r')) {
            return false;
        }
        let Some(next) = self.next_node(node) else {
            return false;
        };
        if !self.node_starts_with_lf(&next) {
            return false;
        }

        if next.borrow().piece.length == 1 {
            self.rb_delete(&next);
        } else {
            let piece = next.borrow().piece;
            let new_start = BufferCursor::new(piece.start.line + 1, 0);
            let new_lf = self.buffers[piece.buffer_idx].break_count(new_start, piece.end);
            next.borrow_mut().piece = Piece::new(
                piece.buffer_idx,
                new_start,
                piece.end,
                piece.length - 1,
                new_lf,
            );
            self.update_tree_metadata(&next, -1, -1);
        }
        true
    }

    // ---------- reader surface ----------

    fn get_node_content(&self, node: &NodeRef) -> String {
        let piece = node.borrow().piece;
        self.get_piece_content(&piece)
    }

    pub(crate) fn get_piece_content(&self, piece: &Piece) -> String {
        let buffer = &self.buffers[piece.buffer_idx];
        buffer.buffer[buffer.offset_of(piece.start)..buffer.offset_of(piece.end)].to_string()
    }

    /// Extract the text covered by `range`.
    pub fn get_value_in_range(&self, range: Range) -> String {
        if self.root.is_none()
            || (range.start_line_number == range.end_line_number
                && range.start_column == range.end_column)
        {
            return String::new();
        }

        let start = self.node_at_position(range.start_line_number, range.start_column);
        let end = self.node_at_position(range.end_line_number, range.end_column);
        self.get_value_between(&start, &end)
    }

    /// Like [`Self::get_value_in_range`], but rewrites every terminator in
    /// the result to `eol`.
    pub fn get_value_in_range_eol(&self, range: Range, eol: LineEnding) -> String {
        let value = self.get_value_in_range(range);
        if eol == self.eol && self.eol_normalized {
            return value;
        }
        replace_line_endings(&value, eol.as_str())
    }

    fn get_value_between(&self, start: &NodePosition, end: &NodePosition) -> String {
        if Rc::ptr_eq(&start.node, &end.node) {
            let piece = start.node.borrow().piece;
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            return buffer.buffer[start_offset + start.remainder..start_offset + end.remainder]
                .to_string();
        }

        let mut ret = String::new();
        {
            let piece = start.node.borrow().piece;
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            ret.push_str(
                &buffer.buffer[start_offset + start.remainder..start_offset + piece.length],
            );
        }

        let mut x = self.next_node(&start.node);
        while let Some(n) = x {
            let piece = n.borrow().piece;
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            if Rc::ptr_eq(&n, &end.node) {
                ret.push_str(&buffer.buffer[start_offset..start_offset + end.remainder]);
                break;
            }
            ret.push_str(&buffer.buffer[start_offset..start_offset + piece.length]);
            x = self.next_node(&n);
        }
        ret
    }

    /// All lines of the document, without their terminators.
    pub fn get_lines_content(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        let mut current_line = String::new();
        let mut dangling_cr = false;

        self.for_each_inorder(|node| {
            let piece = node.borrow().piece;
            if piece.length == 0 {
                return true;
            }

            let buffer = &self.buffers[piece.buffer_idx].buffer;
            let line_starts = &self.buffers[piece.buffer_idx].line_starts;

            let piece_start_line = piece.start.line;
            let piece_end_line = piece.end.line;
            let mut piece_start_offset = line_starts[piece_start_line] + piece.start.column;
            let piece_end_offset = line_starts[piece_end_line] + piece.end.column;
            let mut piece_length = piece_end_offset - piece_start_offset;

            if dangling_cr {
                if buffer.as_bytes().get(piece_start_offset) == Some(&b'\n') {
                    // that \n paired with the previous piece's \r
                    piece_start_offset += 1;
                    piece_length -= 1;
                }
                lines.push(std::mem::take(&mut current_line));
                dangling_cr = false;

                if piece_length == 0 {
                    return true;
                }
            }

            if piece_start_line == piece_end_line {
                // no full line break inside this piece segment
                let end = piece_start_offset + piece_length;
                if buffer.as_bytes()[end - 1] == b'\r' {
                    dangling_cr = true;
                    current_line.push_str(&buffer[piece_start_offset..end - 1]);
                } else {
                    current_line.push_str(&buffer[piece_start_offset..end]);
                }
                return true;
            }

            // text before the first line start inside this piece
            let first_line_next_start = line_starts[piece_start_line + 1].min(piece_end_offset);
            let seg_end =
                strip_trailing_eol_range(buffer, piece_start_offset, first_line_next_start);
            current_line.push_str(&buffer[piece_start_offset..seg_end]);
            lines.push(std::mem::take(&mut current_line));

            // whole lines inside the piece
            for line in (piece_start_line + 1)..piece_end_line {
                let start = line_starts[line];
                let end = strip_trailing_eol_range(buffer, start, line_starts[line + 1]);
                lines.push(buffer[start..end].to_string());
            }

            // the trailing partial line
            let end_line_start = line_starts[piece_end_line];
            if piece.end.column == 0 {
                // the piece ends exactly at a line start; a \r right before
                // it may still pair with a \n in the next piece, so undo the
                // push and let the next iteration settle that line
                if buffer.as_bytes()[end_line_start - 1] == b'\r' {
                    dangling_cr = true;
                    current_line = lines.pop().unwrap_or_default();
                } else {
                    current_line.clear();
                }
            } else if buffer.as_bytes()[piece_end_offset - 1] == b'\r' {
                dangling_cr = true;
                current_line.clear();
                current_line.push_str(&buffer[end_line_start..piece_end_offset - 1]);
            } else {
                current_line.clear();
                current_line.push_str(&buffer[end_line_start..piece_end_offset]);
            }

            true
        });

        if dangling_cr {
            lines.push(std::mem::take(&mut current_line));
        }
        lines.push(current_line);
        lines
    }

    /// Content of a 1-based line, without its terminator. Out-of-range line
    /// numbers clamp to the last line.
    pub fn get_line_content(&self, line_number: usize) -> String {
        let line_number = line_number.clamp(1, self.line_count);
        {
            let cache = self.line_cache.borrow();
            if cache.line_number == line_number {
                return cache.value.clone();
            }
        }

        let value = if line_number == self.line_count {
            self.get_line_raw_content(line_number, 0)
        } else if self.eol_normalized {
            self.get_line_raw_content(line_number, self.eol.len())
        } else {
            let raw = self.get_line_raw_content(line_number, 0);
            let end = strip_trailing_eol_range(&raw, 0, raw.len());
            raw[..end].to_string()
        };

        let mut cache = self.line_cache.borrow_mut();
        cache.line_number = line_number;
        cache.value = value.clone();
        value
    }

    /// Raw content of a line with `end_offset` bytes of its terminator
    /// trimmed.
    fn get_line_raw_content(&self, mut line_number: usize, end_offset: usize) -> String {
        let x: NodeRef;
        let mut ret;

        let cache_hit = self.search_cache.borrow().get_by_line(line_number);
        if let Some(entry) = cache_hit {
            x = entry.node.clone();
            let start_line = entry
                .node_start_line_number
                .expect("line entries carry a start line");
            let piece = x.borrow().piece;
            let prev_acc =
                self.line_start_within_piece(&x, line_number as isize - start_line as isize - 1);
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            if start_line + piece.line_feed_cnt == line_number {
                // the line spills into following nodes
                ret = buffer.buffer[start_offset + prev_acc..start_offset + piece.length]
                    .to_string();
            } else {
                let acc =
                    self.line_start_within_piece(&x, line_number as isize - start_line as isize);
                return buffer.buffer[start_offset + prev_acc..start_offset + acc - end_offset]
                    .to_string();
            }
        } else {
            let mut node_start_offset = 0usize;
            let original_line_number = line_number;
            let mut cur = self.root.clone();
            let mut spill: Option<(NodeRef, String)> = None;

            while let Some(n) = cur {
                let (left, right, lf_left, size_left, piece) = {
                    let nb = n.borrow();
                    (
                        nb.left.clone(),
                        nb.right.clone(),
                        nb.lf_left,
                        nb.size_left,
                        nb.piece,
                    )
                };

                if left.is_some() && lf_left >= line_number - 1 {
                    cur = left;
                } else if lf_left + piece.line_feed_cnt > line_number - 1 {
                    let prev_acc = self
                        .line_start_within_piece(&n, line_number as isize - lf_left as isize - 2);
                    let acc = self
                        .line_start_within_piece(&n, line_number as isize - lf_left as isize - 1);
                    node_start_offset += size_left;
                    self.search_cache.borrow_mut().set(CacheEntry {
                        node: n.clone(),
                        node_start_offset,
                        node_start_line_number: Some(
                            original_line_number - (line_number - 1 - lf_left),
                        ),
                    });
                    let buffer = &self.buffers[piece.buffer_idx];
                    let start_offset = buffer.offset_of(piece.start);
                    return buffer.buffer
                        [start_offset + prev_acc..start_offset + acc - end_offset]
                        .to_string();
                } else if lf_left + piece.line_feed_cnt == line_number - 1 {
                    let prev_acc = self
                        .line_start_within_piece(&n, line_number as isize - lf_left as isize - 2);
                    let buffer = &self.buffers[piece.buffer_idx];
                    let start_offset = buffer.offset_of(piece.start);
                    let head = buffer.buffer
                        [start_offset + prev_acc..start_offset + piece.length]
                        .to_string();
                    spill = Some((n, head));
                    break;
                } else {
                    line_number -= lf_left + piece.line_feed_cnt;
                    node_start_offset += size_left + piece.length;
                    cur = right;
                }
            }

            match spill {
                Some((n, head)) => {
                    x = n;
                    ret = head;
                }
                None => return String::new(),
            }
        }

        // the line continues into following nodes until the next line feed
        let mut cur = self.next_node(&x);
        while let Some(n) = cur {
            let piece = n.borrow().piece;
            if piece.line_feed_cnt > 0 {
                let acc = self.line_start_within_piece(&n, 0);
                let buffer = &self.buffers[piece.buffer_idx];
                let start_offset = buffer.offset_of(piece.start);
                ret.push_str(&buffer.buffer[start_offset..start_offset + acc - end_offset]);
                return ret;
            }
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            ret.push_str(&buffer.buffer[start_offset..start_offset + piece.length]);
            cur = self.next_node(&n);
        }
        ret
    }

    /// Byte at the 0-based `index` on a line; asking for the byte right
    /// after the line's content yields its terminator's first byte. Past the
    /// end of the final line the answer is `0`.
    pub fn get_line_char_code(&self, line_number: usize, index: usize) -> u8 {
        if self.root.is_none() {
            return 0;
        }

        let node_pos = self.node_at_position(line_number, index + 1);
        if node_pos.remainder == node_pos.node.borrow().piece.length {
            // the byte lives at the head of the next node
            let Some(matching) = self.next_node(&node_pos.node) else {
                return 0;
            };
            self.node_char_code_at(&matching, 0)
        } else {
            self.node_char_code_at(&node_pos.node, node_pos.remainder)
        }
    }

    /// Byte length of a line's content, without its terminator.
    pub fn get_line_length(&self, line_number: usize) -> usize {
        let line_number = line_number.clamp(1, self.line_count);
        if line_number == self.line_count {
            let start_offset = self.get_offset_at(line_number, 1);
            return self.length - start_offset;
        }
        if self.eol_normalized {
            self.get_offset_at(line_number + 1, 1) - self.get_offset_at(line_number, 1)
                - self.eol.len()
        } else {
            self.get_line_content(line_number).len()
        }
    }

    /// The whole document as one string.
    pub fn get_text(&self) -> String {
        let mut out = String::with_capacity(self.length);
        self.for_each_inorder(|node| {
            out.push_str(&self.get_node_content(node));
            true
        });
        out
    }

    /// Capture a read-only stream over the current pieces. The first chunk
    /// is prefixed with `bom` (possibly empty).
    pub fn create_snapshot<'a>(&'a self, bom: &str) -> PieceTreeSnapshot<'a> {
        PieceTreeSnapshot::new(self, bom)
    }

    /// Content equality with another tree, compared chunk-wise without
    /// materializing either document.
    pub fn equal(&self, other: &PieceTree) -> bool {
        if self.length != other.length {
            return false;
        }
        if self.line_count != other.line_count {
            return false;
        }

        let mut a = self.create_snapshot("");
        let mut b = other.create_snapshot("");
        let mut chunk_a = next_non_empty(&mut a);
        let mut chunk_b = next_non_empty(&mut b);
        let (mut ia, mut ib) = (0usize, 0usize);

        loop {
            let (sa, sb) = match (chunk_a.as_ref(), chunk_b.as_ref()) {
                (None, None) => return true,
                (Some(_), None) | (None, Some(_)) => return false,
                (Some(a), Some(b)) => (a, b),
            };
            let n = (sa.len() - ia).min(sb.len() - ib);
            if sa.as_bytes()[ia..ia + n] != sb.as_bytes()[ib..ib + n] {
                return false;
            }
            ia += n;
            ib += n;
            let advance_a = ia == sa.len();
            let advance_b = ib == sb.len();
            if advance_a {
                chunk_a = next_non_empty(&mut a);
                ia = 0;
            }
            if advance_b {
                chunk_b = next_non_empty(&mut b);
                ib = 0;
            }
        }
    }

    // ---------- EOL normalization ----------

    /// Rewrite the whole document to `new_eol` and rebuild the tree from
    /// normalized read-only buffers.
    pub fn set_eol(&mut self, new_eol: LineEnding) {
        self.eol = new_eol;
        self.normalize_eol(new_eol);
    }

    fn normalize_eol(&mut self, eol: LineEnding) {
        let min = AVERAGE_BUFFER_SIZE - AVERAGE_BUFFER_SIZE / 3;
        let max = min * 2;

        let mut chunks: Vec<StringBuffer> = Vec::new();
        let mut temp = String::new();
        self.for_each_inorder(|node| {
            let content = self.get_node_content(node);
            if temp.len() <= min || temp.len() + content.len() < max {
                temp.push_str(&content);
                return true;
            }
            let text = replace_line_endings(&temp, eol.as_str());
            chunks.push(StringBuffer::new(text));
            temp = content;
            true
        });
        if !temp.is_empty() {
            let text = replace_line_endings(&temp, eol.as_str());
            chunks.push(StringBuffer::new(text));
        }

        debug!(
            chunks = chunks.len(),
            eol = eol.as_str(),
            "normalized line endings"
        );
        self.create(chunks, eol, true);
    }

    // ---------- invariant checking ----------

    /// Validate the tree's internal invariants; panics on violation.
    /// Intended for tests and debugging.
    #[doc(hidden)]
    pub fn assert_invariants(&self) {
        fn walk(tree: &PieceTree, node: &Option<NodeRef>) -> (usize, usize, usize) {
            let Some(n) = node else {
                return (0, 0, 1);
            };
            let nb = n.borrow();
            let (l_size, l_lf, l_bh) = walk(tree, &nb.left);
            let (r_size, r_lf, r_bh) = walk(tree, &nb.right);

            assert_eq!(nb.size_left, l_size, "size_left out of sync");
            assert_eq!(nb.lf_left, l_lf, "lf_left out of sync");
            assert_eq!(l_bh, r_bh, "black height differs between subtrees");
            if nb.color == NodeColor::Red {
                assert_eq!(
                    node_color(nb.left.as_ref()),
                    NodeColor::Black,
                    "red node with red left child"
                );
                assert_eq!(
                    node_color(nb.right.as_ref()),
                    NodeColor::Black,
                    "red node with red right child"
                );
            }

            let piece = nb.piece;
            let buffer = &tree.buffers[piece.buffer_idx];
            assert_eq!(
                piece.length,
                buffer.offset_of(piece.end) - buffer.offset_of(piece.start),
                "piece length out of sync"
            );
            assert_eq!(
                piece.line_feed_cnt,
                buffer.break_count(piece.start, piece.end),
                "piece line feed count out of sync"
            );

            let bh = if nb.color == NodeColor::Black {
                l_bh + 1
            } else {
                l_bh
            };
            (
                l_size + piece.length + r_size,
                l_lf + piece.line_feed_cnt + r_lf,
                bh,
            )
        }

        if let Some(root) = &self.root {
            assert_eq!(
                node_color(Some(root)),
                NodeColor::Black,
                "root must be black"
            );
        }
        let (size, lf, _) = walk(self, &self.root);
        assert_eq!(self.length, size, "tree length out of sync");
        assert_eq!(self.line_count, lf + 1, "tree line count out of sync");

        // CR-LF-UNITY across adjacent pieces
        let mut prev: Option<NodeRef> = None;
        self.for_each_inorder(|n| {
            if let Some(p) = &prev {
                assert!(
                    !(self.node_ends_with_cr(p) && self.node_starts_with_lf(n)),
                    "a \\r\\n pair straddles two pieces"
                );
            }
            prev = Some(n.clone());
            true
        });
    }

    pub(crate) fn compute_buffer_metadata(&mut self) {
        let mut x = self.root.clone();
        let mut lf_cnt = 1;
        let mut len = 0;

        while let Some(n) = x {
            let nb = n.borrow();
            lf_cnt += nb.lf_left + nb.piece.line_feed_cnt;
            len += nb.size_left + nb.piece.length;
            x = nb.right.clone();
        }

        self.line_count = lf_cnt;
        self.length = len;
    }
}

fn next_non_empty(snapshot: &mut PieceTreeSnapshot<'_>) -> Option<String> {
    loop {
        match snapshot.read() {
            Some(s) if s.is_empty() => continue,
            other => return other,
        }
    }
}

/// Rewrite every `\r\n`, `\r` and `\n` in `value` to `eol`.
pub fn replace_line_endings(value: &str, eol: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut seg_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                out.push_str(&value[seg_start..i]);
                out.push_str(eol);
                if i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
                    i += 1;
                }
                seg_start = i + 1;
            }
            b'\n' => {
                out.push_str(&value[seg_start..i]);
                out.push_str(eol);
                seg_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    out.push_str(&value[seg_start..]);
    out
}

/// New end index for `[start, end)` with one trailing `\r\n`, `\n` or `\r`
/// removed.
fn strip_trailing_eol_range(s: &str, start: usize, end: usize) -> usize {
    if end <= start {
        return end;
    }
    let bytes = s.as_bytes();
    if end >= start + 2 && bytes[end - 2] == b'\r' && bytes[end - 1] == b'\n' {
        return end - 2;
    }
    if bytes[end - 1] == b'\n' || bytes[end - 1] == b'\r' {
        return end - 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_tree(eol: LineEnding) -> PieceTree {
        PieceTree::new(Vec::new(), eol, false)
    }

    fn tree_from(chunks: &[&str], eol: LineEnding) -> PieceTree {
        let chunks = chunks
            .iter()
            .map(|c| StringBuffer::new((*c).to_string()))
            .collect();
        PieceTree::new(chunks, eol, false)
    }

    fn doc(tree: &PieceTree) -> String {
        tree.get_text()
    }

    #[test]
    fn insert_splits_piece() {
        let mut tree = tree_from(&["hello world"], LineEnding::Lf);
        tree.insert(5, " there", false);

        assert_eq!(tree.get_lines_content(), vec!["hello there world"]);
        assert_eq!(tree.get_length(), 17);
        assert_eq!(tree.get_line_count(), 1);
        tree.assert_invariants();
    }

    #[test]
    fn crlf_pair_reunited_at_append_boundary() {
        let mut tree = empty_tree(LineEnding::Crlf);
        tree.insert(0, "a\r", false);
        tree.insert(2, "\nb", false);

        assert_eq!(doc(&tree), "a\r\nb");
        assert_eq!(tree.get_lines_content(), vec!["a", "b"]);
        assert_eq!(tree.get_line_count(), 2);
        tree.assert_invariants();
    }

    #[test]
    fn append_fast_path_extends_single_node() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "abc", false);
        tree.insert(3, "def", false);
        tree.insert(6, "ghi", false);

        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.get_lines_content(), vec!["abcdefghi"]);
        assert_eq!(tree.get_length(), 9);
        tree.assert_invariants();
    }

    #[test]
    fn large_insert_is_chunked_without_splitting_crlf() {
        // \r at byte 65534, \n at 65535: the chunk boundary would fall
        // between them
        let mut text = "a".repeat(65534);
        text.push_str("\r\n");
        text.push_str(&"b".repeat(200_000 - text.len()));
        assert_eq!(text.len(), 200_000);

        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, &text, false);

        assert_eq!(tree.get_length(), 200_000);
        assert_eq!(tree.get_line_count(), 2);
        assert!(tree.node_count() > 1);
        assert_eq!(doc(&tree), text);
        tree.assert_invariants();
    }

    #[test]
    fn delete_across_pieces() {
        let mut tree = tree_from(&["foo\n", "bar\n", "baz"], LineEnding::Lf);
        assert_eq!(tree.get_line_count(), 3);

        tree.delete(2, 7);
        assert_eq!(doc(&tree), "foaz");
        assert_eq!(tree.get_line_count(), 1);
        assert_eq!(tree.get_length(), 4);
        tree.assert_invariants();
    }

    #[test]
    fn eol_normalization_rewrites_mixed_endings() {
        let mut tree = tree_from(&["a\r\nb\nc\rd"], LineEnding::Lf);
        assert_eq!(tree.get_line_count(), 4);

        tree.set_eol(LineEnding::Lf);
        assert_eq!(doc(&tree), "a\nb\nc\nd");
        assert_eq!(tree.get_line_count(), 4);
        assert!(tree.eol_normalized);
        let full = Range::new(1, 1, 4, 2);
        assert_eq!(tree.get_value_in_range(full), "a\nb\nc\nd");
        tree.assert_invariants();

        // normalizing again must not change anything
        tree.set_eol(LineEnding::Lf);
        assert_eq!(doc(&tree), "a\nb\nc\nd");
        assert_eq!(tree.get_line_count(), 4);
        tree.assert_invariants();
    }

    #[test]
    fn set_eol_to_crlf() {
        let mut tree = tree_from(&["a\nb\nc"], LineEnding::Lf);
        tree.set_eol(LineEnding::Crlf);

        assert_eq!(doc(&tree), "a\r\nb\r\nc");
        assert_eq!(tree.get_line_count(), 3);
        assert_eq!(tree.get_lines_content(), vec!["a", "b", "c"]);
        tree.assert_invariants();
    }

    #[test]
    fn lines_basic_unix() {
        let tree = tree_from(&["Hello\nWorld"], LineEnding::Lf);
        assert_eq!(tree.get_lines_content(), vec!["Hello", "World"]);
        assert_eq!(tree.get_line_content(1), "Hello");
        assert_eq!(tree.get_line_content(2), "World");
    }

    #[test]
    fn lines_crlf_single_buffer() {
        let tree = tree_from(&["abc\r\ndef\r\nxyz"], LineEnding::Crlf);
        assert_eq!(tree.get_lines_content(), vec!["abc", "def", "xyz"]);
        assert_eq!(tree.get_line_content(1), "abc");
        assert_eq!(tree.get_line_content(2), "def");
        assert_eq!(tree.get_line_content(3), "xyz");
    }

    #[test]
    fn lines_multiple_chunks() {
        let tree = tree_from(&["foo\n", "bar\nbaz"], LineEnding::Lf);
        assert_eq!(tree.get_lines_content(), vec!["foo", "bar", "baz"]);
        assert_eq!(tree.get_line_content(2), "bar");
    }

    #[test]
    fn lines_trailing_newline_yields_empty_last_line() {
        let tree = tree_from(&["a\nb\n"], LineEnding::Lf);
        assert_eq!(tree.get_lines_content(), vec!["a", "b", ""]);
        assert_eq!(tree.get_line_content(3), "");
    }

    #[test]
    fn insert_into_empty_and_middle_and_end() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "Hello\nWorld", false);
        assert_eq!(tree.get_lines_content(), vec!["Hello", "World"]);

        tree.insert(5, " Rust", false);
        assert_eq!(tree.get_lines_content(), vec!["Hello Rust", "World"]);

        let end = tree.get_length();
        tree.insert(end, "\n!!!", false);
        assert_eq!(tree.get_lines_content(), vec!["Hello Rust", "World", "!!!"]);
        tree.assert_invariants();
    }

    #[test]
    fn insert_at_beginning() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "abc\ndef", false);
        tree.insert(0, ">>", false);
        assert_eq!(tree.get_lines_content(), vec![">>abc", "def"]);
        tree.assert_invariants();
    }

    #[test]
    fn delete_within_single_node() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "Hello\nWorld", false);

        // delete "lo\nWo"
        tree.delete(3, 5);
        assert_eq!(doc(&tree), "Helrld");
        assert_eq!(tree.get_lines_content(), vec!["Helrld"]);
        tree.assert_invariants();
    }

    #[test]
    fn delete_everything_leaves_one_empty_line() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "foo\n", false);
        let end = tree.get_length();
        tree.insert(end, "bar\n", false);
        let end = tree.get_length();
        tree.insert(end, "baz", false);
        assert_eq!(doc(&tree), "foo\nbar\nbaz");

        tree.delete(2, 6);
        assert_eq!(doc(&tree), "fobaz");
        tree.assert_invariants();

        let total = tree.get_length();
        tree.delete(0, total);
        assert_eq!(tree.get_lines_content(), vec![""]);
        assert_eq!(tree.get_line_count(), 1);
        assert!(tree.is_empty());
        tree.assert_invariants();
    }

    #[test]
    fn delete_trailing_and_middle_newline() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "a\nb\n", false);
        assert_eq!(tree.get_lines_content(), vec!["a", "b", ""]);

        let total = tree.get_length();
        tree.delete(total - 1, 1);
        assert_eq!(tree.get_lines_content(), vec!["a", "b"]);

        tree.delete(1, 1);
        assert_eq!(tree.get_lines_content(), vec!["ab"]);
        tree.assert_invariants();
    }

    #[test]
    fn delete_rejoins_crlf_pair() {
        let mut tree = empty_tree(LineEnding::Crlf);
        tree.insert(0, "a\r", false);
        tree.insert(2, "x", false);
        tree.insert(3, "\nb", false);
        assert_eq!(doc(&tree), "a\rx\nb");
        assert_eq!(tree.get_line_count(), 3);

        // removing the x leaves ...\r | \n... which must fuse into one piece
        tree.delete(2, 1);
        assert_eq!(doc(&tree), "a\r\nb");
        assert_eq!(tree.get_line_count(), 2);
        assert_eq!(tree.get_lines_content(), vec!["a", "b"]);
        tree.assert_invariants();
    }

    #[test]
    fn change_buffer_never_fabricates_crlf() {
        let mut tree = empty_tree(LineEnding::Crlf);
        tree.insert(0, "a\r", false);
        // appending "\nb" at offset 0 lands next to the \r inside buffer 0;
        // the filler byte must keep the two appends apart
        tree.insert(0, "\nb", false);

        assert_eq!(doc(&tree), "\nba\r");
        assert_eq!(tree.get_line_count(), 3);
        assert_eq!(tree.get_lines_content(), vec!["", "ba", ""]);
        tree.assert_invariants();
    }

    #[test]
    fn insert_carriage_return_before_lone_lf() {
        let mut tree = empty_tree(LineEnding::Crlf);
        tree.insert(0, "\n", false);
        tree.insert(0, "x\r", false);

        assert_eq!(doc(&tree), "x\r\n");
        assert_eq!(tree.get_line_count(), 2);
        assert_eq!(tree.get_lines_content(), vec!["x", ""]);
        tree.assert_invariants();
    }

    #[test]
    fn crlf_steal_on_split() {
        let mut tree = tree_from(&["ab\ncd"], LineEnding::Crlf);
        // inserting "x\r" right before the \n forces the \n into the
        // inserted text's piece
        tree.insert(2, "x\r", false);

        assert_eq!(doc(&tree), "abx\r\ncd");
        assert_eq!(tree.get_line_count(), 2);
        assert_eq!(tree.get_lines_content(), vec!["abx", "cd"]);
        tree.assert_invariants();
    }

    #[test]
    fn offset_and_position_roundtrip() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "012\n45\n789", false);

        assert_eq!(tree.get_offset_at(1, 1), 0);
        assert_eq!(tree.get_offset_at(1, 4), 3);
        assert_eq!(tree.get_offset_at(2, 1), 4);
        assert_eq!(tree.get_offset_at(2, 3), 6);
        assert_eq!(tree.get_offset_at(3, 1), 7);
        assert_eq!(tree.get_offset_at(3, 4), 10);

        for offset in 0..=tree.get_length() {
            let pos = tree.get_position_at(offset);
            assert_eq!(
                tree.get_offset_at(pos.line_number, pos.column),
                offset,
                "round trip at offset {offset}"
            );
        }
    }

    #[test]
    fn position_at_clamps_past_end() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "ab\ncd", false);
        assert_eq!(tree.get_position_at(1000), Position::new(2, 3));
        assert_eq!(tree.get_offset_at(99, 1), 3);
    }

    #[test]
    fn get_value_in_range_spans_pieces() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "a\nb", false);
        tree.insert(1, "XY", false);
        assert_eq!(doc(&tree), "aXY\nb");

        assert_eq!(tree.get_value_in_range(Range::new(1, 1, 1, 4)), "aXY");
        assert_eq!(tree.get_value_in_range(Range::new(1, 2, 2, 2)), "XY\nb");
        assert_eq!(tree.get_value_in_range(Range::new(1, 1, 1, 1)), "");
    }

    #[test]
    fn get_value_in_range_with_eol_rewrite() {
        let tree = tree_from(&["a\r\nb\nc"], LineEnding::Crlf);
        let full = Range::new(1, 1, 3, 2);
        assert_eq!(
            tree.get_value_in_range_eol(full, LineEnding::Lf),
            "a\nb\nc"
        );
        assert_eq!(
            tree.get_value_in_range_eol(full, LineEnding::Crlf),
            "a\r\nb\r\nc"
        );
    }

    #[test]
    fn line_char_code_peeks_terminator() {
        let tree = tree_from(&["abc\ndef"], LineEnding::Lf);
        assert_eq!(tree.get_line_char_code(1, 0), b'a');
        assert_eq!(tree.get_line_char_code(1, 2), b'c');
        assert_eq!(tree.get_line_char_code(1, 3), b'\n');
        assert_eq!(tree.get_line_char_code(2, 2), b'f');
        assert_eq!(tree.get_line_char_code(2, 3), 0);
    }

    #[test]
    fn line_lengths() {
        let tree = tree_from(&["abc\nde\n"], LineEnding::Lf);
        assert_eq!(tree.get_line_length(1), 3);
        assert_eq!(tree.get_line_length(2), 2);
        assert_eq!(tree.get_line_length(3), 0);
    }

    #[test]
    fn snapshot_streams_pieces() {
        let mut tree = empty_tree(LineEnding::Lf);
        tree.insert(0, "foo", false);
        tree.insert(0, "bar\n", false);

        let collected: String = tree.create_snapshot("").collect();
        assert_eq!(collected, doc(&tree));

        let with_bom: String = tree.create_snapshot("\u{feff}").collect();
        assert_eq!(with_bom, format!("\u{feff}{}", doc(&tree)));
    }

    #[test]
    fn snapshot_of_empty_tree_yields_bom_only() {
        let tree = empty_tree(LineEnding::Lf);
        let mut snapshot = tree.create_snapshot("\u{feff}");
        assert_eq!(snapshot.read().as_deref(), Some("\u{feff}"));
        assert_eq!(snapshot.read(), None);
    }

    #[test]
    fn equal_compares_content_not_layout() {
        let mut a = empty_tree(LineEnding::Lf);
        a.insert(0, "hello ", false);
        let end = a.get_length();
        a.insert(end, "world", false);

        let b = tree_from(&["hello world"], LineEnding::Lf);
        assert!(a.equal(&b));
        assert!(b.equal(&a));

        let c = tree_from(&["hello worle"], LineEnding::Lf);
        assert!(!a.equal(&c));
    }

    #[test]
    fn invariants_hold_through_scripted_edits() {
        let mut tree = tree_from(&["one\r\ntwo\r\nthree"], LineEnding::Crlf);
        let script: &[(usize, &str, usize)] = &[
            (0, "start\r", 0),
            (6, "\nnext", 0),
            (3, "", 4),
            (0, "", 2),
            (1, "mid\r\nline", 0),
            (8, "", 6),
        ];

        for &(offset, ins, del) in script {
            if !ins.is_empty() {
                tree.insert(offset, ins, false);
            }
            if del > 0 {
                tree.delete(offset, del);
            }
            tree.assert_invariants();
        }
    }

    #[test]
    fn many_random_edits_keep_tree_balanced() {
        // deterministic pseudo-random walk, no external entropy
        let mut tree = empty_tree(LineEnding::Lf);
        let mut state: u64 = 0x9e3779b97f4a7c15;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for i in 0..400 {
            let len = tree.get_length();
            let r = next();
            if r % 3 != 0 || len == 0 {
                let offset = if len == 0 { 0 } else { (r as usize / 7) % (len + 1) };
                let text = match r % 5 {
                    0 => "a",
                    1 => "hello\n",
                    2 => "\r\n",
                    3 => "x\ry",
                    _ => "line\nline\nline\n",
                };
                tree.insert(offset, text, false);
            } else {
                let offset = (r as usize / 7) % len;
                let cnt = 1 + (r as usize / 11) % 8;
                tree.delete(offset, cnt);
            }

            if i % 16 == 0 {
                tree.assert_invariants();
            }
        }
        tree.assert_invariants();

        // the tree must stay logarithmic in the number of pieces
        let text = tree.get_text();
        assert_eq!(text.len(), tree.get_length());
    }

    #[test]
    fn lines_content_matches_line_queries_after_edits() {
        let mut tree = tree_from(&["alpha\r\nbeta\rgamma\ndelta"], LineEnding::Crlf);
        tree.insert(7, "ins\r\n", false);
        tree.delete(0, 2);

        let lines = tree.get_lines_content();
        assert_eq!(lines.len(), tree.get_line_count());
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(&tree.get_line_content(i + 1), line, "line {}", i + 1);
            assert_eq!(tree.get_line_length(i + 1), line.len());
        }
    }

    #[test]
    fn line_cache_survives_reads_and_edits() {
        let mut tree = tree_from(&["aa\nbb\ncc"], LineEnding::Lf);
        assert_eq!(tree.get_line_content(2), "bb");
        // cached read
        assert_eq!(tree.get_line_content(2), "bb");

        tree.insert(3, "X", false);
        assert_eq!(tree.get_line_content(2), "Xbb");
        tree.delete(3, 1);
        assert_eq!(tree.get_line_content(2), "bb");
    }

    #[test]
    fn search_cache_hits_agree_with_cold_lookups() {
        // separate original buffers, so line lookups actually descend
        let mut tree = tree_from(&["aaaa\n", "bbbb\n", "cccc\n", "dddd"], LineEnding::Lf);

        let cold = tree_from(&["aaaa\nbbbb\ncccc\ndddd"], LineEnding::Lf);
        // read lines in an order that warms the cache between lookups
        for line in [3, 3, 1, 4, 2, 4, 1, 3] {
            assert_eq!(tree.get_line_content(line), cold.get_line_content(line));
        }

        // an edit must invalidate whatever the cache held past its offset
        tree.insert(5, "zz", false);
        assert_eq!(tree.get_line_content(2), "zzbbbb");
        assert_eq!(tree.get_line_content(4), "dddd");
        tree.assert_invariants();
    }

    #[test]
    fn multibyte_content_round_trips() {
        let unit = "α😀β\r\n";
        let mut text = String::new();
        for _ in 0..8_000 {
            text.push_str(unit);
        }
        assert!(text.len() > AVERAGE_BUFFER_SIZE);

        let mut tree = empty_tree(LineEnding::Crlf);
        tree.insert(0, &text, false);

        assert_eq!(doc(&tree), text);
        assert_eq!(tree.get_line_count(), 8_001);
        assert_eq!(tree.get_line_content(1), "α😀β");
        assert_eq!(tree.get_line_content(8_001), "");
        tree.assert_invariants();
    }
}
