use std::cell::RefCell;
use std::rc::{Rc, Weak};

pub(crate) type NodeRef = Rc<RefCell<TreeNode>>;
pub(crate) type WeakNodeRef = Weak<RefCell<TreeNode>>;

/// A (line, column) coordinate inside one backing buffer. The column is a
/// byte offset from the start of that buffer's line and may equal the line's
/// length (one past its last byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCursor {
    pub line: usize,
    pub column: usize,
}

impl BufferCursor {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// A view into `buffers[buffer_idx]` covering `[start, end)`. `line_feed_cnt`
/// counts the line breaks inside that range, with the CRLF-at-tail
/// correction applied: a `\r` at the very end whose `\n` lies just past the
/// piece counts as one break, owned by this piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub buffer_idx: usize,
    pub start: BufferCursor,
    pub end: BufferCursor,
    pub length: usize,
    pub line_feed_cnt: usize,
}

impl Piece {
    pub fn new(
        buffer_idx: usize,
        start: BufferCursor,
        end: BufferCursor,
        length: usize,
        line_feed_cnt: usize,
    ) -> Self {
        Self {
            buffer_idx,
            start,
            end,
            length,
            line_feed_cnt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeColor {
    Red,
    Black,
}

#[derive(Debug)]
pub(crate) struct TreeNode {
    pub piece: Piece,
    pub color: NodeColor,
    pub parent: Option<WeakNodeRef>,
    pub left: Option<NodeRef>,
    pub right: Option<NodeRef>,
    /// Total byte length of all pieces in the left subtree.
    pub size_left: usize,
    /// Total line-feed count of all pieces in the left subtree.
    pub lf_left: usize,
}

impl TreeNode {
    pub fn new(piece: Piece) -> Self {
        Self {
            piece,
            color: NodeColor::Red,
            parent: None,
            left: None,
            right: None,
            size_left: 0,
            lf_left: 0,
        }
    }
}

pub(crate) fn parent_of(node: &NodeRef) -> Option<NodeRef> {
    node.borrow().parent.as_ref().and_then(|w| w.upgrade())
}

pub(crate) fn left_of(node: &NodeRef) -> Option<NodeRef> {
    node.borrow().left.clone()
}

pub(crate) fn right_of(node: &NodeRef) -> Option<NodeRef> {
    node.borrow().right.clone()
}

pub(crate) fn set_parent(child: &NodeRef, parent: Option<&NodeRef>) {
    child.borrow_mut().parent = parent.map(Rc::downgrade);
}

pub(crate) fn node_color(node: Option<&NodeRef>) -> NodeColor {
    match node {
        None => NodeColor::Black,
        Some(n) => n.borrow().color,
    }
}

pub(crate) fn set_color(node: &NodeRef, color: NodeColor) {
    node.borrow_mut().color = color;
}

/// Whether `node` is the left child of `parent`.
pub(crate) fn is_left_child(parent: &NodeRef, node: &NodeRef) -> bool {
    parent
        .borrow()
        .left
        .as_ref()
        .is_some_and(|l| Rc::ptr_eq(l, node))
}

pub(crate) fn leftmost(mut x: NodeRef) -> NodeRef {
    loop {
        let left = left_of(&x);
        match left {
            Some(l) => x = l,
            None => return x,
        }
    }
}

pub(crate) fn rightmost(mut x: NodeRef) -> NodeRef {
    loop {
        let right = right_of(&x);
        match right {
            Some(r) => x = r,
            None => return x,
        }
    }
}

/// In-order successor, or `None` at the last node.
pub(crate) fn next(node: &NodeRef) -> Option<NodeRef> {
    if let Some(r) = right_of(node) {
        return Some(leftmost(r));
    }

    let mut cur = node.clone();
    while let Some(p) = parent_of(&cur) {
        if is_left_child(&p, &cur) {
            return Some(p);
        }
        cur = p;
    }
    None
}

/// In-order predecessor, or `None` at the first node.
pub(crate) fn prev(node: &NodeRef) -> Option<NodeRef> {
    if let Some(l) = left_of(node) {
        return Some(rightmost(l));
    }

    let mut cur = node.clone();
    while let Some(p) = parent_of(&cur) {
        if !is_left_child(&p, &cur) {
            return Some(p);
        }
        cur = p;
    }
    None
}

/// Unlink a removed node so stale references (e.g. cache entries) cannot
/// reach back into the tree through it.
pub(crate) fn detach(node: &NodeRef) {
    let mut nb = node.borrow_mut();
    nb.parent = None;
    nb.left = None;
    nb.right = None;
}
