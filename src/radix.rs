//! Ordered byte-keyed associative container with prefix iteration.
//!
//! This is a byte-at-a-time trie rather than an edge-compressed PATRICIA
//! radix tree: each level consumes exactly one key byte. It keeps ordering,
//! prefix iteration and whole-tree-copy semantics simple, at the cost of one
//! node per key byte instead of one node per shared edge; set names are
//! short (≤ 200 bytes) and few enough in practice that this is the right
//! trade for clarity over compression.
//!
//! Children are kept in a byte-sorted [`SmallVec`] rather than a 256-slot
//! array, since most nodes have very few children and a full array would
//! waste memory on every leaf set name.

use std::sync::Arc;

use smallvec::SmallVec;

struct Node<V> {
    value: Option<Arc<V>>,
    children: SmallVec<[(u8, Box<Node<V>>); 4]>,
}

impl<V> Node<V> {
    fn empty() -> Self {
        Node {
            value: None,
            children: SmallVec::new(),
        }
    }

    fn child(&self, byte: u8) -> Option<&Node<V>> {
        self.children
            .binary_search_by_key(&byte, |(b, _)| *b)
            .ok()
            .map(|idx| &*self.children[idx].1)
    }

    fn child_mut_or_insert(&mut self, byte: u8) -> &mut Node<V> {
        match self.children.binary_search_by_key(&byte, |(b, _)| *b) {
            Ok(idx) => &mut self.children[idx].1,
            Err(idx) => {
                self.children.insert(idx, (byte, Box::new(Node::empty())));
                &mut self.children[idx].1
            }
        }
    }
}

impl<V> Clone for Node<V> {
    fn clone(&self) -> Self {
        Node {
            value: self.value.clone(),
            children: self
                .children
                .iter()
                .map(|(byte, child)| (*byte, Box::new((**child).clone())))
                .collect(),
        }
    }
}

/// An ordered map from byte-string keys to `Arc<V>` values.
pub struct RadixTree<V> {
    root: Node<V>,
}

impl<V> Default for RadixTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RadixTree<V> {
    /// Creates an empty tree.
    pub fn new() -> Self {
        RadixTree { root: Node::empty() }
    }

    /// Inserts `value` under `key`, replacing and returning any prior value.
    pub fn insert(&mut self, key: &[u8], value: Arc<V>) -> Option<Arc<V>> {
        let mut node = &mut self.root;
        for &byte in key {
            node = node.child_mut_or_insert(byte);
        }
        node.value.replace(value)
    }

    /// Removes `key`, returning its value if present.
    pub fn delete(&mut self, key: &[u8]) -> Option<Arc<V>> {
        let mut node = &mut self.root;
        for &byte in key {
            node = node.child_mut_or_insert(byte);
        }
        node.value.take()
    }

    /// Exact lookup.
    pub fn search(&self, key: &[u8]) -> Option<Arc<V>> {
        let mut node = &self.root;
        for &byte in key {
            node = node.child(byte)?;
        }
        node.value.clone()
    }

    /// Visits every `(key, value)` pair in lexicographic key order.
    pub fn iter(&self, mut visit: impl FnMut(&[u8], &Arc<V>)) {
        let mut buf = Vec::new();
        Self::walk(&self.root, &mut buf, &mut visit);
    }

    /// Visits every `(key, value)` pair whose key starts with `prefix`, in
    /// lexicographic order.
    pub fn iter_prefix(&self, prefix: &[u8], mut visit: impl FnMut(&[u8], &Arc<V>)) {
        let mut node = &self.root;
        for &byte in prefix {
            match node.child(byte) {
                Some(next) => node = next,
                None => return,
            }
        }
        let mut buf = prefix.to_vec();
        Self::walk(node, &mut buf, &mut visit);
    }

    fn walk(node: &Node<V>, buf: &mut Vec<u8>, visit: &mut impl FnMut(&[u8], &Arc<V>)) {
        if let Some(value) = &node.value {
            visit(buf, value);
        }
        for (byte, child) in node.children.iter() {
            buf.push(*byte);
            Self::walk(child, buf, visit);
            buf.pop();
        }
    }

    /// Overwrites `self` with a deep structural copy of `src`, sharing no
    /// tree nodes with it (though leaf `Arc<V>` values are shared — copying
    /// the tree never duplicates the values it points at).
    pub fn copy_from(&mut self, src: &Self) {
        self.root = src.root.clone();
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.value.is_none() && self.root.children.is_empty()
    }

    /// Drops every entry, releasing all nodes.
    pub fn destroy(&mut self) {
        self.root = Node::empty();
    }
}

impl<V> Clone for RadixTree<V> {
    fn clone(&self) -> Self {
        RadixTree {
            root: self.root.clone(),
        }
    }
}
