//! Topic Trie for subscription matching
//!
//! Nodes live in a slab arena and refer to each other by index, so pruning
//! a node never has to chase owned back-references.
//!
//! Each node has literal children keyed by layer bytes, one `+` child slot,
//! and a `#` value list holding patterns that end in `#` at that depth.
//! A published topic walks at most three branches per layer (literal, `+`,
//! `#`), which keeps matching linear in topic depth.

use ahash::AHashMap;
use bytes::Bytes;
use slab::Slab;
use smallvec::SmallVec;

use super::validation::{Role, Token, ValidTopic, MAX_TOPIC_LAYERS};

type NodeId = usize;

/// How a node hangs off its parent
#[derive(Debug, Clone)]
enum Edge {
    Root,
    Literal(Bytes),
    SingleLayer,
}

#[derive(Debug)]
struct TrieNode<V> {
    parent: Option<NodeId>,
    edge: Edge,
    /// Children indexed by literal layer
    children: AHashMap<Bytes, NodeId>,
    /// `+` child
    single_layer: Option<NodeId>,
    /// Patterns ending exactly at this node
    values: SmallVec<[V; 1]>,
    /// Patterns ending in `#` at this node
    multi_layer: SmallVec<[V; 1]>,
}

impl<V> TrieNode<V> {
    fn new(parent: Option<NodeId>, edge: Edge) -> Self {
        Self {
            parent,
            edge,
            children: AHashMap::new(),
            single_layer: None,
            values: SmallVec::new(),
            multi_layer: SmallVec::new(),
        }
    }

    fn is_unused(&self) -> bool {
        self.children.is_empty()
            && self.single_layer.is_none()
            && self.values.is_empty()
            && self.multi_layer.is_empty()
    }
}

/// Topic Trie mapping subscription patterns to values
#[derive(Debug)]
pub struct TopicTrie<V> {
    nodes: Slab<TrieNode<V>>,
    root: NodeId,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        let mut nodes = Slab::new();
        let root = nodes.insert(TrieNode::new(None, Edge::Root));
        Self { nodes, root }
    }

    /// Attach `value` to the node for `pattern`, creating nodes as needed
    pub fn insert(&mut self, pattern: &ValidTopic, value: V) {
        let mut node = self.root;

        for token in pattern.tokens() {
            node = match token {
                Token::MultiLayer => {
                    self.nodes[node].multi_layer.push(value);
                    return;
                }
                Token::SingleLayer => {
                    let existing = self.nodes[node].single_layer;
                    match existing {
                        Some(child) => child,
                        None => {
                            let child = self
                                .nodes
                                .insert(TrieNode::new(Some(node), Edge::SingleLayer));
                            self.nodes[node].single_layer = Some(child);
                            child
                        }
                    }
                }
                Token::Literal(layer) => {
                    let existing = self.nodes[node].children.get(layer).copied();
                    match existing {
                        Some(child) => child,
                        None => {
                            // Copy the layer so the trie never pins a frame buffer
                            let key = Bytes::copy_from_slice(layer);
                            let child = self
                                .nodes
                                .insert(TrieNode::new(Some(node), Edge::Literal(key.clone())));
                            self.nodes[node].children.insert(key, child);
                            child
                        }
                    }
                }
            };
        }

        self.nodes[node].values.push(value);
    }

    /// Detach the first value under `pattern` for which `pred` returns true,
    /// pruning nodes left with nothing attached
    pub fn remove<F>(&mut self, pattern: &ValidTopic, mut pred: F) -> Option<V>
    where
        F: FnMut(&V) -> bool,
    {
        let mut node = self.root;
        let mut ends_in_multi = false;

        for token in pattern.tokens() {
            match token {
                Token::MultiLayer => {
                    ends_in_multi = true;
                    break;
                }
                Token::SingleLayer => node = self.nodes[node].single_layer?,
                Token::Literal(layer) => node = *self.nodes[node].children.get(layer)?,
            }
        }

        let slot = if ends_in_multi {
            &mut self.nodes[node].multi_layer
        } else {
            &mut self.nodes[node].values
        };
        let pos = slot.iter().position(|v| pred(v))?;
        let removed = slot.remove(pos);

        self.prune(node);
        Some(removed)
    }

    fn prune(&mut self, mut node: NodeId) {
        while node != self.root && self.nodes[node].is_unused() {
            let Some(parent) = self.nodes[node].parent else {
                break;
            };
            let removed = self.nodes.remove(node);
            match removed.edge {
                Edge::Literal(key) => {
                    self.nodes[parent].children.remove(&key);
                }
                Edge::SingleLayer => self.nodes[parent].single_layer = None,
                Edge::Root => {}
            }
            node = parent;
        }
    }

    /// Call `callback` once for every value whose pattern matches `topic`.
    ///
    /// Every node corresponds to one distinct pattern prefix and is reached
    /// by at most one path, so a value is never reported twice.
    pub fn matches<'a, F>(&'a self, topic: &ValidTopic, mut callback: F)
    where
        F: FnMut(&'a V),
    {
        debug_assert_eq!(topic.role(), Role::Publish);

        let layers: SmallVec<[&[u8]; MAX_TOPIC_LAYERS]> = topic.layers().collect();
        self.matches_recursive(self.root, &layers, 0, &mut callback);
    }

    fn matches_recursive<'a, F>(
        &'a self,
        node: NodeId,
        layers: &[&[u8]],
        index: usize,
        callback: &mut F,
    ) where
        F: FnMut(&'a V),
    {
        let current = &self.nodes[node];

        // `#` matches this node and everything below it
        current.multi_layer.iter().for_each(&mut *callback);

        if index >= layers.len() {
            current.values.iter().for_each(&mut *callback);
            return;
        }

        if let Some(child) = current.single_layer {
            self.matches_recursive(child, layers, index + 1, callback);
        }

        if let Some(&child) = current.children.get(layers[index]) {
            self.matches_recursive(child, layers, index + 1, callback);
        }
    }

    /// Number of live nodes, root included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing is attached anywhere
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[self.root].is_unused()
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
