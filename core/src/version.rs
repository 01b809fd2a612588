use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// One node of the version DAG of an id-hash. Multiple parents arise
/// from concurrent writes merged later.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VersionNode {
    pub hash: Hash,
    pub previous: Vec<Hash>,
    pub time: u64,
}

/// The loaded version DAG of one id-hash, in append order.
#[derive(Clone, Debug, Default)]
pub struct VersionGraph {
    nodes: Vec<VersionNode>,
    index: HashMap<Hash, usize>,
}

impl VersionGraph {
    pub fn from_nodes(nodes: Vec<VersionNode>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.hash, i))
            .collect();
        Self { nodes, index }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[VersionNode] {
        &self.nodes
    }

    /// The current version: the last appended node. Appends happen under
    /// the id lock, and a merge node is appended last, so this pointer
    /// advances monotonically.
    pub fn current(&self) -> Option<Hash> {
        self.nodes.last().map(|n| n.hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn node(&self, hash: &Hash) -> Option<&VersionNode> {
        self.index.get(hash).map(|i| &self.nodes[*i])
    }

    /// All ancestors of `hash`, including itself.
    pub fn ancestors(&self, hash: &Hash) -> BTreeSet<Hash> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![*hash];
        while let Some(h) = stack.pop() {
            if !seen.insert(h) {
                continue;
            }
            if let Some(node) = self.node(&h) {
                stack.extend(node.previous.iter().copied());
            }
        }
        seen
    }

    pub fn is_ancestor(&self, ancestor: &Hash, descendant: &Hash) -> bool {
        self.ancestors(descendant).contains(ancestor)
    }

    /// The lowest common ancestor of two versions: the shared ancestor
    /// with the greatest creation time, ties broken by hash order.
    /// `None` when the histories are disjoint.
    pub fn lowest_common_ancestor(&self, a: &Hash, b: &Hash) -> Option<Hash> {
        let ancestors_a = self.ancestors(a);
        let ancestors_b = self.ancestors(b);
        ancestors_a
            .intersection(&ancestors_b)
            .filter_map(|h| self.node(h).map(|n| (n.time, *h)))
            .max()
            .map(|(_, h)| h)
    }

    /// The versions a head carries beyond `ancestor`: every ancestor of
    /// `head` that is not an ancestor of `ancestor`, linearized by
    /// ascending `(time, hash)`. A value scan over this sequence
    /// attributes each write to the version that made it, which keeps
    /// last-writer-wins stable across chained merges.
    pub fn branch_of(&self, ancestor: Option<&Hash>, head: &Hash) -> Vec<Hash> {
        let excluded = ancestor.map(|a| self.ancestors(a)).unwrap_or_default();
        let mut branch: Vec<(u64, Hash)> = self
            .ancestors(head)
            .into_iter()
            .filter(|h| !excluded.contains(h))
            .filter_map(|h| self.node(&h).map(|n| (n.time, h)))
            .collect();
        branch.sort_unstable();
        branch.into_iter().map(|(_, h)| h).collect()
    }
}
