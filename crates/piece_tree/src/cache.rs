use std::rc::Rc;

use crate::piece::NodeRef;

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub node: NodeRef,
    pub node_start_offset: usize,
    pub node_start_line_number: Option<usize>,
}

/// Bounded LIFO of recently visited nodes. Entries must never outlive a
/// structural change that moves or renumbers them: edits call
/// [`SearchCache::validate`] with the edit offset, and node removal calls
/// [`SearchCache::remove_node`].
#[derive(Debug)]
pub(crate) struct SearchCache {
    limit: usize,
    cache: Vec<CacheEntry>,
}

impl SearchCache {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            cache: Vec::with_capacity(limit),
        }
    }

    /// Most recent entry whose piece spans `offset`.
    pub fn get(&self, offset: usize) -> Option<CacheEntry> {
        self.cache.iter().rev().find_map(|entry| {
            let len = entry.node.borrow().piece.length;
            (entry.node_start_offset <= offset && entry.node_start_offset + len >= offset)
                .then(|| entry.clone())
        })
    }

    /// Most recent entry whose piece contains the start of `line_number`.
    pub fn get_by_line(&self, line_number: usize) -> Option<CacheEntry> {
        self.cache.iter().rev().find_map(|entry| {
            let start_line = entry.node_start_line_number?;
            let lf_cnt = entry.node.borrow().piece.line_feed_cnt;
            (start_line < line_number && start_line + lf_cnt >= line_number)
                .then(|| entry.clone())
        })
    }

    pub fn set(&mut self, entry: CacheEntry) {
        if self.cache.len() >= self.limit {
            self.cache.remove(0);
        }
        self.cache.push(entry);
    }

    /// Drop every entry at or past the edit offset, and every entry whose
    /// node has been detached from the tree.
    pub fn validate(&mut self, offset: usize, root: Option<&NodeRef>) {
        self.cache.retain(|entry| {
            if entry.node_start_offset >= offset {
                return false;
            }
            let detached = entry.node.borrow().parent.is_none()
                && !root.is_some_and(|r| Rc::ptr_eq(r, &entry.node));
            !detached
        });
    }

    pub fn remove_node(&mut self, node: &NodeRef) {
        self.cache.retain(|entry| !Rc::ptr_eq(&entry.node, node));
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// One-entry cache for the most recently read line.
#[derive(Debug, Default)]
pub(crate) struct LineCache {
    pub line_number: usize, // 0 = empty
    pub value: String,
}

impl LineCache {
    pub fn invalidate(&mut self) {
        self.line_number = 0;
        self.value.clear();
    }
}
