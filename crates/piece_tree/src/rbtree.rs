use std::cell::RefCell;
use std::rc::Rc;

use crate::piece::{
    detach, is_left_child, left_of, leftmost, next, node_color, parent_of, right_of, rightmost,
    set_color, set_parent, NodeColor, NodeRef, Piece, TreeNode,
};
use crate::piece_tree::PieceTree;

impl PieceTree {
    /// Insert `piece` as the in-order right neighbor of `node` (or at the
    /// rightmost position when `node` is `None`).
    pub(crate) fn rb_insert_right(&mut self, node: Option<&NodeRef>, piece: Piece) -> NodeRef {
        let z: NodeRef = Rc::new(RefCell::new(TreeNode::new(piece)));

        if self.root.is_none() {
            z.borrow_mut().color = NodeColor::Black;
            self.root = Some(z.clone());
            return z;
        }

        match node {
            Some(parent_rc) => match right_of(parent_rc) {
                None => {
                    parent_rc.borrow_mut().right = Some(z.clone());
                    set_parent(&z, Some(parent_rc));
                }
                Some(right_child) => {
                    // attach as the left child of the subtree's leftmost node
                    let succ = leftmost(right_child);
                    succ.borrow_mut().left = Some(z.clone());
                    set_parent(&z, Some(&succ));
                }
            },
            None => {
                let x = rightmost(self.root.clone().expect("root exists"));
                x.borrow_mut().right = Some(z.clone());
                set_parent(&z, Some(&x));
            }
        }

        self.fix_insert(z.clone());
        z
    }

    /// Insert `piece` as the in-order left neighbor of `node` (or at the
    /// leftmost position when `node` is `None`).
    pub(crate) fn rb_insert_left(&mut self, node: Option<&NodeRef>, piece: Piece) -> NodeRef {
        let z: NodeRef = Rc::new(RefCell::new(TreeNode::new(piece)));

        if self.root.is_none() {
            z.borrow_mut().color = NodeColor::Black;
            self.root = Some(z.clone());
            return z;
        }

        match node {
            Some(parent_rc) => match left_of(parent_rc) {
                None => {
                    parent_rc.borrow_mut().left = Some(z.clone());
                    set_parent(&z, Some(parent_rc));
                }
                Some(left_child) => {
                    let pred = rightmost(left_child);
                    pred.borrow_mut().right = Some(z.clone());
                    set_parent(&z, Some(&pred));
                }
            },
            None => {
                let x = leftmost(self.root.clone().expect("root exists"));
                x.borrow_mut().left = Some(z.clone());
                set_parent(&z, Some(&x));
            }
        }

        self.fix_insert(z.clone());
        z
    }

    /// Remove `z` from the tree, re-establishing red-black balance and the
    /// subtree aggregates on the affected root path.
    pub(crate) fn rb_delete(&mut self, z: &NodeRef) {
        self.search_cache.borrow_mut().remove_node(z);

        let y: NodeRef;
        let x: Option<NodeRef>;

        let z_left = left_of(z);
        let z_right = right_of(z);
        if z_left.is_none() {
            y = z.clone();
            x = z_right;
        } else if z_right.is_none() {
            y = z.clone();
            x = z_left;
        } else {
            y = leftmost(z_right.expect("checked above"));
            x = right_of(&y);
        }

        if self.root.as_ref().is_some_and(|r| Rc::ptr_eq(r, &y)) {
            // y == z == root, with at most one child
            self.root = x.clone();
            if let Some(x) = &x {
                set_color(x, NodeColor::Black);
                x.borrow_mut().parent = None;
            }
            detach(z);
            return;
        }

        let y_was_red = node_color(Some(&y)) == NodeColor::Red;
        let y_parent = parent_of(&y).expect("y is not the root");
        let y_parent_is_z = Rc::ptr_eq(&y_parent, z);

        // splice x into y's slot
        if is_left_child(&y_parent, &y) {
            y_parent.borrow_mut().left = x.clone();
        } else {
            y_parent.borrow_mut().right = x.clone();
        }

        let x_parent: NodeRef;
        if Rc::ptr_eq(&y, z) {
            x_parent = y_parent;
            if let Some(x) = &x {
                set_parent(x, Some(&x_parent));
            }
        } else {
            // y (z's in-order successor) takes z's position
            x_parent = if y_parent_is_z { y.clone() } else { y_parent };
            if let Some(x) = &x {
                set_parent(x, Some(&x_parent));
            }

            // read z's children after the splice: when y was z's right child,
            // z.right now points at x, which must become y.right again
            let new_left = left_of(z);
            let new_right = right_of(z);
            {
                let mut yb = y.borrow_mut();
                yb.left = new_left.clone();
                yb.right = new_right.clone();
            }
            if let Some(l) = &new_left {
                set_parent(l, Some(&y));
            }
            if let Some(r) = &new_right {
                set_parent(r, Some(&y));
            }

            let z_parent = parent_of(z);
            set_parent(&y, z_parent.as_ref());
            {
                let zb = z.borrow();
                let mut yb = y.borrow_mut();
                yb.color = zb.color;
                yb.size_left = zb.size_left;
                yb.lf_left = zb.lf_left;
            }
            match z_parent {
                None => self.root = Some(y.clone()),
                Some(p) => {
                    if is_left_child(&p, z) {
                        p.borrow_mut().left = Some(y.clone());
                    } else {
                        p.borrow_mut().right = Some(y.clone());
                    }
                }
            }
        }

        detach(z);
        self.recompute_metadata_upward(&x_parent);

        if !y_was_red {
            self.fix_delete(x, x_parent);
        }
    }

    fn fix_insert(&mut self, mut x: NodeRef) {
        self.recompute_metadata_upward(&x);

        while let Some(parent) = parent_of(&x) {
            if node_color(Some(&parent)) != NodeColor::Red {
                break;
            }
            let Some(grand) = parent_of(&parent) else {
                break;
            };

            if is_left_child(&grand, &parent) {
                let uncle = right_of(&grand);
                if node_color(uncle.as_ref()) == NodeColor::Red {
                    set_color(&parent, NodeColor::Black);
                    if let Some(u) = &uncle {
                        set_color(u, NodeColor::Black);
                    }
                    set_color(&grand, NodeColor::Red);
                    x = grand;
                } else {
                    if !is_left_child(&parent, &x) {
                        x = parent;
                        self.left_rotate(&x);
                    }
                    let parent2 = parent_of(&x).expect("parent after rotate");
                    let grand2 = parent_of(&parent2).expect("grandparent after rotate");
                    set_color(&parent2, NodeColor::Black);
                    set_color(&grand2, NodeColor::Red);
                    self.right_rotate(&grand2);
                }
            } else {
                let uncle = left_of(&grand);
                if node_color(uncle.as_ref()) == NodeColor::Red {
                    set_color(&parent, NodeColor::Black);
                    if let Some(u) = &uncle {
                        set_color(u, NodeColor::Black);
                    }
                    set_color(&grand, NodeColor::Red);
                    x = grand;
                } else {
                    if is_left_child(&parent, &x) {
                        x = parent;
                        self.right_rotate(&x);
                    }
                    let parent2 = parent_of(&x).expect("parent after rotate");
                    let grand2 = parent_of(&parent2).expect("grandparent after rotate");
                    set_color(&parent2, NodeColor::Black);
                    set_color(&grand2, NodeColor::Red);
                    self.left_rotate(&grand2);
                }
            }
        }

        if let Some(root) = &self.root {
            set_color(root, NodeColor::Black);
            root.borrow_mut().parent = None;
        }
    }

    /// Delete fix-up. `x` is the child that replaced the removed black node
    /// (possibly absent), `parent` its current parent; threading the pair
    /// lets the loop locate a missing child.
    fn fix_delete(&mut self, mut x: Option<NodeRef>, parent: NodeRef) {
        let mut parent = Some(parent);

        loop {
            let Some(p) = parent.clone() else {
                break; // x is the root
            };
            if node_color(x.as_ref()) == NodeColor::Red {
                break;
            }

            // when x is absent its sibling must exist (it carries the
            // remaining black height), so a missing left child means x
            // is on the left
            let x_is_left = match &x {
                Some(n) => is_left_child(&p, n),
                None => p.borrow().left.is_none(),
            };

            if x_is_left {
                let mut w = right_of(&p).expect("sibling of a double-black node");
                if node_color(Some(&w)) == NodeColor::Red {
                    set_color(&w, NodeColor::Black);
                    set_color(&p, NodeColor::Red);
                    self.left_rotate(&p);
                    w = right_of(&p).expect("sibling after rotate");
                }

                let w_left = left_of(&w);
                let w_right = right_of(&w);
                if node_color(w_left.as_ref()) == NodeColor::Black
                    && node_color(w_right.as_ref()) == NodeColor::Black
                {
                    set_color(&w, NodeColor::Red);
                    x = Some(p.clone());
                    parent = parent_of(&p);
                } else {
                    if node_color(w_right.as_ref()) == NodeColor::Black {
                        if let Some(wl) = &w_left {
                            set_color(wl, NodeColor::Black);
                        }
                        set_color(&w, NodeColor::Red);
                        self.right_rotate(&w);
                        w = right_of(&p).expect("sibling after rotate");
                    }
                    set_color(&w, node_color(Some(&p)));
                    set_color(&p, NodeColor::Black);
                    if let Some(wr) = right_of(&w) {
                        set_color(&wr, NodeColor::Black);
                    }
                    self.left_rotate(&p);
                    x = self.root.clone();
                    parent = None;
                }
            } else {
                let mut w = left_of(&p).expect("sibling of a double-black node");
                if node_color(Some(&w)) == NodeColor::Red {
                    set_color(&w, NodeColor::Black);
                    set_color(&p, NodeColor::Red);
                    self.right_rotate(&p);
                    w = left_of(&p).expect("sibling after rotate");
                }

                let w_left = left_of(&w);
                let w_right = right_of(&w);
                if node_color(w_left.as_ref()) == NodeColor::Black
                    && node_color(w_right.as_ref()) == NodeColor::Black
                {
                    set_color(&w, NodeColor::Red);
                    x = Some(p.clone());
                    parent = parent_of(&p);
                } else {
                    if node_color(w_left.as_ref()) == NodeColor::Black {
                        if let Some(wr) = &w_right {
                            set_color(wr, NodeColor::Black);
                        }
                        set_color(&w, NodeColor::Red);
                        self.left_rotate(&w);
                        w = left_of(&p).expect("sibling after rotate");
                    }
                    set_color(&w, node_color(Some(&p)));
                    set_color(&p, NodeColor::Black);
                    if let Some(wl) = left_of(&w) {
                        set_color(&wl, NodeColor::Black);
                    }
                    self.right_rotate(&p);
                    x = self.root.clone();
                    parent = None;
                }
            }
        }

        if let Some(x) = &x {
            set_color(x, NodeColor::Black);
        }
    }

    fn left_rotate(&mut self, x: &NodeRef) {
        let y = right_of(x).expect("left rotation needs a right child");

        // y absorbs x into its left subtree
        {
            let (x_size_left, x_lf_left, x_len, x_lf) = {
                let xb = x.borrow();
                (
                    xb.size_left,
                    xb.lf_left,
                    xb.piece.length,
                    xb.piece.line_feed_cnt,
                )
            };
            let mut yb = y.borrow_mut();
            yb.size_left += x_size_left + x_len;
            yb.lf_left += x_lf_left + x_lf;
        }

        let y_left = left_of(&y);
        x.borrow_mut().right = y_left.clone();
        if let Some(yl) = &y_left {
            set_parent(yl, Some(x));
        }

        let x_parent = parent_of(x);
        set_parent(&y, x_parent.as_ref());
        match x_parent {
            None => self.root = Some(y.clone()),
            Some(p) => {
                if is_left_child(&p, x) {
                    p.borrow_mut().left = Some(y.clone());
                } else {
                    p.borrow_mut().right = Some(y.clone());
                }
            }
        }

        y.borrow_mut().left = Some(x.clone());
        set_parent(x, Some(&y));
    }

    fn right_rotate(&mut self, y: &NodeRef) {
        let x = left_of(y).expect("right rotation needs a left child");

        let x_right = right_of(&x);
        y.borrow_mut().left = x_right.clone();
        if let Some(xr) = &x_right {
            set_parent(xr, Some(y));
        }

        // y gives up x's share of its left subtree
        {
            let (x_size_left, x_lf_left, x_len, x_lf) = {
                let xb = x.borrow();
                (
                    xb.size_left,
                    xb.lf_left,
                    xb.piece.length,
                    xb.piece.line_feed_cnt,
                )
            };
            let mut yb = y.borrow_mut();
            yb.size_left -= x_size_left + x_len;
            yb.lf_left -= x_lf_left + x_lf;
        }

        let y_parent = parent_of(y);
        set_parent(&x, y_parent.as_ref());
        match y_parent {
            None => self.root = Some(x.clone()),
            Some(p) => {
                if is_left_child(&p, y) {
                    p.borrow_mut().left = Some(x.clone());
                } else {
                    p.borrow_mut().right = Some(x.clone());
                }
            }
        }

        x.borrow_mut().right = Some(y.clone());
        set_parent(y, Some(&x));
    }

    /// Add `delta`/`lf_delta` to every ancestor that holds `node` in its
    /// left subtree. Called when a node's piece changes size in place.
    pub(crate) fn update_tree_metadata(&self, node: &NodeRef, delta: isize, lf_delta: isize) {
        if delta == 0 && lf_delta == 0 {
            return;
        }

        let mut child = node.clone();
        while let Some(p) = parent_of(&child) {
            if is_left_child(&p, &child) {
                let mut pb = p.borrow_mut();
                pb.size_left = (pb.size_left as isize + delta) as usize;
                pb.lf_left = (pb.lf_left as isize + lf_delta) as usize;
            }
            child = p;
        }
    }

    /// Recompute `size_left`/`lf_left` for `start` and every ancestor, bottom
    /// up. Subtree totals come from cached aggregates along the right spine,
    /// so the whole walk is O(log² n).
    pub(crate) fn recompute_metadata_upward(&self, start: &NodeRef) {
        let mut cur = Some(start.clone());
        while let Some(n) = cur {
            let left = left_of(&n);
            let (size, lf) = subtree_totals(left.as_ref());
            {
                let mut nb = n.borrow_mut();
                nb.size_left = size;
                nb.lf_left = lf;
            }
            cur = parent_of(&n);
        }
    }

    /// In-order traversal; stops early when `f` returns `false`.
    pub(crate) fn for_each_inorder<F: FnMut(&NodeRef) -> bool>(&self, mut f: F) {
        let mut stack: Vec<NodeRef> = Vec::new();
        let mut cur = self.root.clone();

        while cur.is_some() || !stack.is_empty() {
            while let Some(c) = cur {
                let left = left_of(&c);
                stack.push(c);
                cur = left;
            }

            let node = stack.pop().expect("stack is non-empty");
            if !f(&node) {
                break;
            }
            cur = right_of(&node);
        }
    }

    /// Document offset at which `node`'s piece begins.
    pub(crate) fn offset_of_node(&self, node: &NodeRef) -> usize {
        let mut pos = node.borrow().size_left;
        let mut cur = node.clone();
        while let Some(p) = parent_of(&cur) {
            if !is_left_child(&p, &cur) {
                let pb = p.borrow();
                pos += pb.size_left + pb.piece.length;
            }
            cur = p;
        }
        pos
    }

    pub(crate) fn next_node(&self, node: &NodeRef) -> Option<NodeRef> {
        next(node)
    }

    pub(crate) fn prev_node(&self, node: &NodeRef) -> Option<NodeRef> {
        crate::piece::prev(node)
    }
}

/// Total (bytes, line feeds) of the subtree rooted at `node`, read off the
/// right spine using the cached left-subtree aggregates.
pub(crate) fn subtree_totals(node: Option<&NodeRef>) -> (usize, usize) {
    let (mut size, mut lf) = (0, 0);
    let mut cur = node.cloned();
    while let Some(n) = cur {
        let nb = n.borrow();
        size += nb.size_left + nb.piece.length;
        lf += nb.lf_left + nb.piece.line_feed_cnt;
        cur = nb.right.clone();
    }
    (size, lf)
}
