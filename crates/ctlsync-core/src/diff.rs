use crate::index::ControlIndex;
use crate::node::{NodeId, NodeRef, Shadow, Slot};
use crate::patch::{Edit, FieldPatch, NodeSnapshot, Patch, SnapshotField};
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("node {node} field '{field}' links to node {target}, which is not in the tree")]
    DanglingLink {
        node: NodeId,
        field: String,
        target: NodeId,
    },
    #[error("node {node} is reachable more than once")]
    DuplicateNode { node: NodeId },
}

/// Computes the edits that bring the client from what it was last sent to
/// `new_root`, updating shadows, dirty flags and `index` along the way.
pub fn diff(
    old_root: Option<&NodeRef>,
    new_root: &NodeRef,
    index: &mut ControlIndex,
) -> Result<Patch, DiffError> {
    let mut pass = DiffPass::new(index);
    match old_root {
        Some(old) if old.id() == new_root.id() && pass.index.contains(old.id()) => {
            pass.update(new_root)?;
        }
        _ => {
            if let Some(old) = old_root {
                if pass.index.contains(old.id()) {
                    pass.removed.push(old.id());
                }
            }
            let snapshot = pass.create(new_root, None)?;
            pass.edits.push(Edit::CreateNode {
                owner: None,
                snapshot,
            });
        }
    }
    pass.finish()
}

/// Full snapshot of `page`, as sent on first registration or resync.
pub fn full_patch(page: &NodeRef, index: &mut ControlIndex) -> Result<Patch, DiffError> {
    index.clear();
    diff(None, page, index)
}

/// Structural child of a node, queued while the node's lock is held.
enum Pending {
    Create(NodeRef, String),
    Update(NodeRef),
}

/// Field content copied out of a node being created.
enum Captured {
    Value(Value),
    Link(Option<NodeId>),
    Child(Option<NodeRef>),
    Children(Vec<NodeRef>),
    NamedChildren(IndexMap<String, NodeRef>),
}

struct DiffPass<'a> {
    index: &'a mut ControlIndex,
    edits: Vec<Edit>,
    removed: Vec<NodeId>,
    created: HashSet<NodeId>,
    seen: HashSet<NodeId>,
    links: Vec<(NodeId, String, NodeId)>,
    visited: usize,
}

impl<'a> DiffPass<'a> {
    fn new(index: &'a mut ControlIndex) -> Self {
        Self {
            index,
            edits: Vec::new(),
            removed: Vec::new(),
            created: HashSet::new(),
            seen: HashSet::new(),
            links: Vec::new(),
            visited: 0,
        }
    }

    fn visit(&mut self, id: NodeId) -> Result<(), DiffError> {
        if !self.seen.insert(id) {
            return Err(DiffError::DuplicateNode { node: id });
        }
        self.visited += 1;
        Ok(())
    }

    fn update(&mut self, node: &NodeRef) -> Result<(), DiffError> {
        let id = node.id();
        let mut pending = Vec::new();
        let mut child_ids = Vec::new();
        let mut node_links = Vec::new();
        {
            let mut guard = node.lock();
            if !guard.dirty && !guard.subtree_dirty {
                return Ok(());
            }
            self.visit(id)?;
            let dirty = guard.dirty;
            let state = &mut *guard;
            for (name, slot) in state.fields.iter() {
                let shadow = state.shadow.get(name);
                match slot {
                    Slot::Value(value) => {
                        let unchanged =
                            matches!(shadow, Some(Shadow::Value(old)) if old == value);
                        if dirty && !unchanged {
                            self.edits.push(Edit::SetField {
                                node: id,
                                field: name.clone(),
                                value: FieldPatch::Value(value.clone()),
                            });
                            state
                                .shadow
                                .insert(name.clone(), Shadow::Value(value.clone()));
                        }
                    }
                    Slot::Link(target) => {
                        if let Some(target) = target {
                            self.links.push((id, name.clone(), *target));
                            node_links.push((name.clone(), *target));
                        }
                        let unchanged =
                            matches!(shadow, Some(Shadow::Link(old)) if old == target);
                        if dirty && !unchanged {
                            self.edits.push(Edit::SetField {
                                node: id,
                                field: name.clone(),
                                value: FieldPatch::Value(
                                    target.map(Value::NodeRef).unwrap_or(Value::Null),
                                ),
                            });
                            state.shadow.insert(name.clone(), Shadow::Link(*target));
                        }
                    }
                    Slot::Child(child) => {
                        let new_id = child.as_ref().map(|c| c.id());
                        let old_id = match shadow {
                            Some(Shadow::Child(old)) => *old,
                            _ => None,
                        };
                        if let Some(child) = child {
                            child_ids.push(child.id());
                        }
                        if new_id == old_id {
                            if let Some(child) = child {
                                pending.push(Pending::Update(child.clone()));
                            }
                            continue;
                        }
                        if let Some(old_id) = old_id {
                            self.removed.push(old_id);
                        }
                        if let Some(child) = child {
                            pending.push(Pending::Create(child.clone(), name.clone()));
                        }
                        self.edits.push(Edit::SetField {
                            node: id,
                            field: name.clone(),
                            value: FieldPatch::Node(new_id),
                        });
                        state.shadow.insert(name.clone(), Shadow::Child(new_id));
                    }
                    Slot::Children(children) => {
                        let new_ids: Vec<NodeId> = children.iter().map(|c| c.id()).collect();
                        child_ids.extend(new_ids.iter().copied());
                        let old_ids = match shadow {
                            Some(Shadow::Children(old)) => old.as_slice(),
                            _ => &[],
                        };
                        if !dirty || new_ids == old_ids {
                            pending.extend(children.iter().cloned().map(Pending::Update));
                            continue;
                        }
                        for child in children {
                            if self.index.is_owned_by(child.id(), id, name)
                                && old_ids.contains(&child.id())
                            {
                                pending.push(Pending::Update(child.clone()));
                            } else {
                                pending.push(Pending::Create(child.clone(), name.clone()));
                            }
                        }
                        self.removed.extend(
                            old_ids
                                .iter()
                                .filter(|old| !new_ids.contains(old))
                                .copied(),
                        );
                        self.edits.push(Edit::ReorderChildren {
                            node: id,
                            field: name.clone(),
                            order: new_ids.clone(),
                        });
                        state.shadow.insert(name.clone(), Shadow::Children(new_ids));
                    }
                    Slot::NamedChildren(map) => {
                        let new_ids: IndexMap<String, NodeId> = map
                            .iter()
                            .map(|(key, c)| (key.clone(), c.id()))
                            .collect();
                        child_ids.extend(new_ids.values().copied());
                        let empty = IndexMap::new();
                        let old_ids = match shadow {
                            Some(Shadow::NamedChildren(old)) => old,
                            _ => &empty,
                        };
                        if !dirty || &new_ids == old_ids {
                            pending.extend(map.values().cloned().map(Pending::Update));
                            continue;
                        }
                        let old_set: HashSet<NodeId> = old_ids.values().copied().collect();
                        for child in map.values() {
                            if old_set.contains(&child.id())
                                && self.index.is_owned_by(child.id(), id, name)
                            {
                                pending.push(Pending::Update(child.clone()));
                            } else {
                                pending.push(Pending::Create(child.clone(), name.clone()));
                            }
                        }
                        let new_set: HashSet<NodeId> = new_ids.values().copied().collect();
                        self.removed
                            .extend(old_set.iter().filter(|old| !new_set.contains(old)));
                        self.edits.push(Edit::SetField {
                            node: id,
                            field: name.clone(),
                            value: FieldPatch::NamedNodes(new_ids.clone()),
                        });
                        state
                            .shadow
                            .insert(name.clone(), Shadow::NamedChildren(new_ids));
                    }
                }
            }
            state.dirty = false;
            state.subtree_dirty = false;
        }
        self.index.set_children(id, child_ids);
        self.index.set_links(id, node_links);

        for item in pending {
            match item {
                Pending::Update(child) => self.update(&child)?,
                Pending::Create(child, field) => {
                    let snapshot = self.create(&child, Some((id, field.clone())))?;
                    self.edits.push(Edit::CreateNode {
                        owner: Some((id, field)),
                        snapshot,
                    });
                }
            }
        }
        Ok(())
    }

    fn create(
        &mut self,
        node: &NodeRef,
        owner: Option<(NodeId, String)>,
    ) -> Result<NodeSnapshot, DiffError> {
        let id = node.id();
        self.visit(id)?;
        self.created.insert(id);

        let captured: Vec<(String, Captured)> = {
            let mut guard = node.lock();
            let state = &mut *guard;
            state.shadow.clear();
            let mut captured = Vec::with_capacity(state.fields.len());
            for (name, slot) in state.fields.iter() {
                let (shadow, field) = match slot {
                    Slot::Value(value) => {
                        (Shadow::Value(value.clone()), Captured::Value(value.clone()))
                    }
                    Slot::Link(target) => (Shadow::Link(*target), Captured::Link(*target)),
                    Slot::Child(child) => (
                        Shadow::Child(child.as_ref().map(|c| c.id())),
                        Captured::Child(child.clone()),
                    ),
                    Slot::Children(children) => (
                        Shadow::Children(children.iter().map(|c| c.id()).collect()),
                        Captured::Children(children.clone()),
                    ),
                    Slot::NamedChildren(map) => (
                        Shadow::NamedChildren(
                            map.iter().map(|(key, c)| (key.clone(), c.id())).collect(),
                        ),
                        Captured::NamedChildren(map.clone()),
                    ),
                };
                state.shadow.insert(name.clone(), shadow);
                captured.push((name.clone(), field));
            }
            state.dirty = false;
            state.subtree_dirty = false;
            captured
        };

        self.index.insert(node, owner);
        let mut child_ids = Vec::new();
        let mut node_links = Vec::new();
        let mut fields = IndexMap::with_capacity(captured.len());
        for (name, field) in captured {
            let owner = || Some((id, name.clone()));
            let snapshot = match field {
                Captured::Value(value) => SnapshotField::Value(value),
                Captured::Link(target) => {
                    if let Some(target) = target {
                        self.links.push((id, name.clone(), target));
                        node_links.push((name.clone(), target));
                    }
                    SnapshotField::Link(target)
                }
                Captured::Child(child) => match child {
                    Some(child) => {
                        child_ids.push(child.id());
                        SnapshotField::Child(Some(Box::new(self.create(&child, owner())?)))
                    }
                    None => SnapshotField::Child(None),
                },
                Captured::Children(children) => {
                    let mut out = Vec::with_capacity(children.len());
                    for child in &children {
                        child_ids.push(child.id());
                        out.push(self.create(child, owner())?);
                    }
                    SnapshotField::Children(out)
                }
                Captured::NamedChildren(map) => {
                    let mut out = IndexMap::with_capacity(map.len());
                    for (key, child) in &map {
                        child_ids.push(child.id());
                        out.insert(key.clone(), self.create(child, owner())?);
                    }
                    SnapshotField::NamedChildren(out)
                }
            };
            fields.insert(name, snapshot);
        }
        self.index.set_children(id, child_ids);
        self.index.set_links(id, node_links);

        Ok(NodeSnapshot {
            id,
            kind: node.kind().to_string(),
            fields,
        })
    }

    fn finish(self) -> Result<Patch, DiffError> {
        let DiffPass {
            index,
            edits,
            removed,
            created,
            links,
            visited,
            ..
        } = self;

        let mut ordered = Vec::with_capacity(edits.len() + removed.len());
        let mut dropped_roots = HashSet::new();
        let mut dropped = Vec::new();
        for id in removed {
            if dropped_roots.insert(id) {
                dropped.extend(index.remove_subtree(id, &created));
                ordered.push(Edit::RemoveNode { node: id });
            }
        }
        ordered.extend(edits);

        // clean nodes this pass skipped may still point at a removed node
        for target in dropped {
            if let Some((node, field)) = index.linked_from(target).into_iter().next() {
                return Err(DiffError::DanglingLink {
                    node,
                    field,
                    target,
                });
            }
            index.forget_target(target);
        }

        for (node, field, target) in links {
            if !index.contains(target) {
                return Err(DiffError::DanglingLink {
                    node,
                    field,
                    target,
                });
            }
        }

        Ok(Patch {
            edits: ordered,
            visited,
        })
    }
}
