use crate::piece::Piece;
use crate::piece_tree::PieceTree;

/// A pull-based stream over the piece values captured when the snapshot was
/// created. Each [`read`](Self::read) yields one piece's content; the first
/// chunk carries the BOM prefix, and `None` marks end of stream. Pieces are
/// value copies and buffers only ever grow, so the captured view stays
/// coherent for the snapshot's lifetime.
pub struct PieceTreeSnapshot<'a> {
    pieces: Vec<Piece>,
    tree: &'a PieceTree,
    bom: String,
    index: usize,
}

impl<'a> PieceTreeSnapshot<'a> {
    pub(crate) fn new(tree: &'a PieceTree, bom: &str) -> Self {
        let mut pieces = Vec::new();
        tree.for_each_inorder(|node| {
            pieces.push(node.borrow().piece);
            true
        });
        Self {
            pieces,
            tree,
            bom: bom.to_string(),
            index: 0,
        }
    }

    /// One piece's worth of content per call, then `None`. An empty document
    /// still yields the BOM (possibly the empty string) on the first call.
    pub fn read(&mut self) -> Option<String> {
        if self.pieces.is_empty() {
            if self.index == 0 {
                self.index += 1;
                return Some(self.bom.clone());
            }
            return None;
        }

        if self.index > self.pieces.len() - 1 {
            return None;
        }

        let content = self.tree.get_piece_content(&self.pieces[self.index]);
        let chunk = if self.index == 0 {
            format!("{}{}", self.bom, content)
        } else {
            content
        };
        self.index += 1;
        Some(chunk)
    }
}

impl Iterator for PieceTreeSnapshot<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.read()
    }
}
