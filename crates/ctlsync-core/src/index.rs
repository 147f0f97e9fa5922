use crate::node::{Node, NodeId, NodeRef};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

#[derive(Debug)]
struct IndexEntry {
    node: Weak<Node>,
    owner: Option<(NodeId, String)>,
    children: Vec<NodeId>,
    links: Vec<(String, NodeId)>,
}

/// Per-session id lookup over every node the client currently knows about.
///
/// Entries hold weak handles; the index never keeps a node alive. The
/// ownership relation recorded here is what the last diff pass sent, and so
/// are the link fields, kept in both directions.
#[derive(Debug, Default)]
pub struct ControlIndex {
    entries: HashMap<NodeId, IndexEntry>,
    inbound: HashMap<NodeId, HashSet<(NodeId, String)>>,
}

impl ControlIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.inbound.clear();
    }

    /// Live node for `id`, if the client knows it and it still exists.
    pub fn get(&self, id: NodeId) -> Option<NodeRef> {
        self.entries.get(&id).and_then(|entry| entry.node.upgrade())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn owner(&self, id: NodeId) -> Option<(NodeId, &str)> {
        self.entries
            .get(&id)
            .and_then(|entry| entry.owner.as_ref())
            .map(|(parent, field)| (*parent, field.as_str()))
    }

    /// Whether the last pass sent `id` as a child of `parent.field`.
    pub fn is_owned_by(&self, id: NodeId, parent: NodeId, field: &str) -> bool {
        matches!(self.owner(id), Some((p, f)) if p == parent && f == field)
    }

    pub fn children_of(&self, id: NodeId) -> &[NodeId] {
        self.entries
            .get(&id)
            .map(|entry| entry.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    /// Known nodes whose link fields point at `target`, as `(node, field)`.
    pub fn linked_from(&self, target: NodeId) -> Vec<(NodeId, String)> {
        let mut sources: Vec<(NodeId, String)> = self
            .inbound
            .get(&target)
            .map(|sources| {
                sources
                    .iter()
                    .filter(|(source, _)| self.entries.contains_key(source))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sources.sort();
        sources
    }

    pub(crate) fn insert(&mut self, node: &NodeRef, owner: Option<(NodeId, String)>) {
        let previous = self.entries.insert(
            node.id(),
            IndexEntry {
                node: Arc::downgrade(node),
                owner,
                children: Vec::new(),
                links: Vec::new(),
            },
        );
        if let Some(previous) = previous {
            self.unlink(node.id(), &previous.links);
        }
    }

    /// Records the link fields `id` holds after this pass.
    pub(crate) fn set_links(&mut self, id: NodeId, links: Vec<(String, NodeId)>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let old = std::mem::replace(&mut entry.links, links.clone());
        self.unlink(id, &old);
        for (field, target) in links {
            self.inbound.entry(target).or_default().insert((id, field));
        }
    }

    /// Forgets who linked to `target` once it is gone from the client.
    pub(crate) fn forget_target(&mut self, target: NodeId) {
        self.inbound.remove(&target);
    }

    fn unlink(&mut self, source: NodeId, links: &[(String, NodeId)]) {
        for (field, target) in links {
            if let Some(sources) = self.inbound.get_mut(target) {
                sources.remove(&(source, field.clone()));
                if sources.is_empty() {
                    self.inbound.remove(target);
                }
            }
        }
    }

    fn drop_entry(&mut self, id: NodeId) -> Option<IndexEntry> {
        let entry = self.entries.remove(&id)?;
        self.unlink(id, &entry.links);
        Some(entry)
    }

    pub(crate) fn set_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.children = children;
        }
    }

    /// Drops `root` and its recorded descendants, skipping ids in `keep`
    /// together with their subtrees. Returns the dropped ids.
    pub(crate) fn remove_subtree(&mut self, root: NodeId, keep: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut dropped = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if keep.contains(&id) {
                continue;
            }
            if let Some(entry) = self.drop_entry(id) {
                stack.extend(entry.children);
                dropped.push(id);
            }
        }
        dropped
    }

    /// Removes entries whose node has been dropped. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let dead: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.node.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.drop_entry(*id);
        }
        dead.len()
    }
}
