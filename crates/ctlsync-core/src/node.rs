use crate::patch::{NodeSnapshot, SnapshotField};
use crate::schema::{FieldShape, Schema, EXTRA_FIELD};
use crate::value::Value;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

pub type NodeId = u64;
pub type NodeRef = Arc<Node>;

/// Asynchronous event handler registered on a node.
pub type EventHandler =
    Arc<dyn Fn(ControlEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

fn next_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Clone)]
pub struct ControlEvent {
    pub target: NodeRef,
    pub name: String,
    pub data: Value,
}

impl fmt::Debug for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlEvent")
            .field("target", &self.target.id())
            .field("name", &self.name)
            .field("data", &self.data)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("{kind} has no field '{field}'")]
    UnknownField { kind: String, field: String },
    #[error("{kind}.{field} is a {expected} field")]
    ShapeMismatch {
        kind: String,
        field: String,
        expected: &'static str,
    },
    #[error("node {node} is already owned by node {parent}")]
    AlreadyAttached { node: NodeId, parent: NodeId },
    #[error("attaching node {node} under node {parent} would create a cycle")]
    Cycle { node: NodeId, parent: NodeId },
    #[error("node {node} appears more than once in {field}")]
    DuplicateChild { node: NodeId, field: String },
    #[error("{kind}.{field} holds a duration of {seconds}s, outside the wire range")]
    DurationOutOfRange {
        kind: String,
        field: String,
        seconds: i64,
    },
}

/// Storage for one field on a live node.
#[derive(Clone)]
pub(crate) enum Slot {
    Value(Value),
    Child(Option<NodeRef>),
    Children(Vec<NodeRef>),
    NamedChildren(IndexMap<String, NodeRef>),
    Link(Option<NodeId>),
}

/// What the client was last sent for one field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Shadow {
    Value(Value),
    Child(Option<NodeId>),
    Children(Vec<NodeId>),
    NamedChildren(IndexMap<String, NodeId>),
    Link(Option<NodeId>),
}

pub(crate) struct NodeState {
    pub(crate) fields: IndexMap<String, Slot>,
    pub(crate) shadow: HashMap<String, Shadow>,
    pub(crate) dirty: bool,
    pub(crate) subtree_dirty: bool,
    parent: Option<(Weak<Node>, String)>,
    handlers: HashMap<String, EventHandler>,
}

/// An identity-bearing, typed record in the UI tree.
pub struct Node {
    id: NodeId,
    schema: Arc<Schema>,
    state: Mutex<NodeState>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.schema.kind())
            .finish()
    }
}

impl Node {
    pub fn new(schema: &Arc<Schema>) -> NodeRef {
        Arc::new(Node {
            id: next_node_id(),
            schema: schema.clone(),
            state: Mutex::new(NodeState {
                fields: IndexMap::new(),
                shadow: HashMap::new(),
                dirty: true,
                subtree_dirty: false,
                parent: None,
                handlers: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &str {
        self.schema.kind()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    fn check_shape(&self, field: &str, expected: FieldShape) -> Result<(), GraphError> {
        match self.schema.shape(field) {
            Some(shape) if shape == expected => Ok(()),
            Some(_) => Err(GraphError::ShapeMismatch {
                kind: self.kind().to_string(),
                field: field.to_string(),
                expected: expected.as_str(),
            }),
            None => Err(GraphError::UnknownField {
                kind: self.kind().to_string(),
                field: field.to_string(),
            }),
        }
    }

    fn check_encodable(&self, field: &str, value: &Value) -> Result<(), GraphError> {
        match value.oversized_duration() {
            Some(span) => Err(GraphError::DurationOutOfRange {
                kind: self.kind().to_string(),
                field: field.to_string(),
                seconds: span.num_seconds(),
            }),
            None => Ok(()),
        }
    }

    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<(), GraphError> {
        self.check_shape(field, FieldShape::Value)?;
        let value = value.into();
        self.check_encodable(field, &value)?;
        self.lock()
            .fields
            .insert(field.to_string(), Slot::Value(value));
        self.mark_dirty();
        Ok(())
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        match self.lock().fields.get(field) {
            Some(Slot::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Writes one key of the `data` escape-hatch map.
    pub fn set_extra(&self, key: &str, value: impl Into<Value>) -> Result<(), GraphError> {
        let value = value.into();
        self.check_encodable(EXTRA_FIELD, &value)?;
        {
            let mut state = self.lock();
            let slot = state
                .fields
                .entry(EXTRA_FIELD.to_string())
                .or_insert_with(|| Slot::Value(Value::map()));
            match slot {
                Slot::Value(Value::Map(map)) => {
                    map.insert(key.to_string(), value);
                }
                other => {
                    let mut map = IndexMap::new();
                    map.insert(key.to_string(), value);
                    *other = Slot::Value(Value::Map(map));
                }
            }
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn extra(&self, key: &str) -> Option<Value> {
        self.get(EXTRA_FIELD)
            .and_then(|data| data.get(key).cloned())
    }

    pub fn set_link(&self, field: &str, target: Option<&Node>) -> Result<(), GraphError> {
        self.check_shape(field, FieldShape::Link)?;
        self.lock()
            .fields
            .insert(field.to_string(), Slot::Link(target.map(Node::id)));
        self.mark_dirty();
        Ok(())
    }

    pub fn link(&self, field: &str) -> Option<NodeId> {
        match self.lock().fields.get(field) {
            Some(Slot::Link(target)) => *target,
            _ => None,
        }
    }

    pub fn set_child(
        self: &Arc<Self>,
        field: &str,
        child: Option<NodeRef>,
    ) -> Result<Option<NodeRef>, GraphError> {
        self.check_shape(field, FieldShape::Child)?;
        if let Some(child) = &child {
            self.check_adopt(field, child)?;
            self.adopt(field, child);
        }
        let previous = {
            let mut state = self.lock();
            match state
                .fields
                .insert(field.to_string(), Slot::Child(child.clone()))
            {
                Some(Slot::Child(previous)) => previous,
                _ => None,
            }
        };
        if let Some(previous) = &previous {
            if child.as_ref().map(|c| c.id) != Some(previous.id) {
                previous.release();
            }
        }
        self.mark_dirty();
        Ok(previous)
    }

    pub fn child(&self, field: &str) -> Option<NodeRef> {
        match self.lock().fields.get(field) {
            Some(Slot::Child(child)) => child.clone(),
            _ => None,
        }
    }

    pub fn children(&self, field: &str) -> Vec<NodeRef> {
        match self.lock().fields.get(field) {
            Some(Slot::Children(children)) => children.clone(),
            _ => Vec::new(),
        }
    }

    pub fn push_child(self: &Arc<Self>, field: &str, child: NodeRef) -> Result<(), GraphError> {
        let len = self.children(field).len();
        self.insert_child(field, len, child)
    }

    pub fn insert_child(
        self: &Arc<Self>,
        field: &str,
        index: usize,
        child: NodeRef,
    ) -> Result<(), GraphError> {
        let mut children = self.children(field);
        let index = index.min(children.len());
        children.insert(index, child);
        self.set_children(field, children)
    }

    pub fn remove_child(&self, field: &str, id: NodeId) -> Result<Option<NodeRef>, GraphError> {
        self.check_shape(field, FieldShape::Children)?;
        let removed = {
            let mut state = self.lock();
            match state.fields.get_mut(field) {
                Some(Slot::Children(children)) => children
                    .iter()
                    .position(|child| child.id == id)
                    .map(|pos| children.remove(pos)),
                _ => None,
            }
        };
        if let Some(removed) = &removed {
            removed.release();
            self.mark_dirty();
        }
        Ok(removed)
    }

    /// Replaces the whole list. Nodes already in the list keep their identity, so
    /// passing the same nodes in another order is a pure reorder.
    pub fn set_children(
        self: &Arc<Self>,
        field: &str,
        children: Vec<NodeRef>,
    ) -> Result<(), GraphError> {
        self.check_shape(field, FieldShape::Children)?;
        let mut ids = Vec::with_capacity(children.len());
        for child in &children {
            if ids.contains(&child.id) {
                return Err(GraphError::DuplicateChild {
                    node: child.id,
                    field: field.to_string(),
                });
            }
            ids.push(child.id);
            self.check_adopt(field, child)?;
        }
        for child in &children {
            self.adopt(field, child);
        }
        let previous = {
            let mut state = self.lock();
            match state
                .fields
                .insert(field.to_string(), Slot::Children(children))
            {
                Some(Slot::Children(previous)) => previous,
                _ => Vec::new(),
            }
        };
        for old in previous {
            if !ids.contains(&old.id) {
                old.release();
            }
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn set_named_child(
        self: &Arc<Self>,
        field: &str,
        key: &str,
        child: Option<NodeRef>,
    ) -> Result<Option<NodeRef>, GraphError> {
        self.check_shape(field, FieldShape::NamedChildren)?;
        if let Some(child) = &child {
            self.check_adopt(field, child)?;
            if self
                .named_children(field)
                .iter()
                .any(|(name, existing)| name != key && existing.id == child.id)
            {
                return Err(GraphError::DuplicateChild {
                    node: child.id,
                    field: field.to_string(),
                });
            }
            self.adopt(field, child);
        }
        let previous = {
            let mut state = self.lock();
            let slot = state
                .fields
                .entry(field.to_string())
                .or_insert_with(|| Slot::NamedChildren(IndexMap::new()));
            match slot {
                Slot::NamedChildren(map) => match &child {
                    Some(child) => map.insert(key.to_string(), child.clone()),
                    None => map.shift_remove(key),
                },
                _ => None,
            }
        };
        if let Some(previous) = &previous {
            if child.as_ref().map(|c| c.id) != Some(previous.id) {
                previous.release();
            }
        }
        self.mark_dirty();
        Ok(previous)
    }

    pub fn named_children(&self, field: &str) -> IndexMap<String, NodeRef> {
        match self.lock().fields.get(field) {
            Some(Slot::NamedChildren(map)) => map.clone(),
            _ => IndexMap::new(),
        }
    }

    pub fn on(&self, event: &str, handler: EventHandler) {
        self.lock().handlers.insert(event.to_string(), handler);
    }

    pub fn off(&self, event: &str) {
        self.lock().handlers.remove(event);
    }

    pub fn handler(&self, event: &str) -> Option<EventHandler> {
        self.lock().handlers.get(event).cloned()
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.lock()
            .parent
            .as_ref()
            .and_then(|(parent, _)| parent.upgrade())
    }

    /// Walks parent links up to the topmost live ancestor.
    pub fn root(self: &Arc<Self>) -> NodeRef {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.lock();
        state.dirty || state.subtree_dirty
    }

    /// Flags this node as changed and every ancestor as holding a changed subtree.
    pub fn mark_dirty(&self) {
        let mut parent = {
            let mut state = self.lock();
            state.dirty = true;
            state.parent.as_ref().and_then(|(p, _)| p.upgrade())
        };
        while let Some(node) = parent {
            parent = {
                let mut state = node.lock();
                state.subtree_dirty = true;
                state.parent.as_ref().and_then(|(p, _)| p.upgrade())
            };
        }
    }

    /// Applies values the client already holds. Shadows move together with the
    /// fields so the next diff does not echo them back.
    pub fn apply_client_props(&self, props: &IndexMap<String, Value>) -> Result<(), GraphError> {
        for field in props.keys() {
            self.check_shape(field, FieldShape::Value)?;
        }
        let mut state = self.lock();
        for (field, value) in props {
            state
                .fields
                .insert(field.clone(), Slot::Value(value.clone()));
            state
                .shadow
                .insert(field.clone(), Shadow::Value(value.clone()));
        }
        Ok(())
    }

    /// Current observable state of the subtree, independent of what was sent.
    pub fn snapshot(&self) -> NodeSnapshot {
        let fields = self.lock().fields.clone();
        let mut out = IndexMap::with_capacity(fields.len());
        for (name, slot) in fields {
            let field = match slot {
                Slot::Value(value) => SnapshotField::Value(value),
                Slot::Link(target) => SnapshotField::Link(target),
                Slot::Child(child) => {
                    SnapshotField::Child(child.map(|c| Box::new(c.snapshot())))
                }
                Slot::Children(children) => {
                    SnapshotField::Children(children.iter().map(|c| c.snapshot()).collect())
                }
                Slot::NamedChildren(map) => SnapshotField::NamedChildren(
                    map.iter()
                        .map(|(key, c)| (key.clone(), c.snapshot()))
                        .collect(),
                ),
            };
            out.insert(name, field);
        }
        NodeSnapshot {
            id: self.id,
            kind: self.kind().to_string(),
            fields: out,
        }
    }

    fn check_adopt(self: &Arc<Self>, field: &str, child: &NodeRef) -> Result<(), GraphError> {
        let mut cursor = Some(self.clone());
        while let Some(node) = cursor {
            if node.id == child.id {
                return Err(GraphError::Cycle {
                    node: child.id,
                    parent: self.id,
                });
            }
            cursor = node.parent();
        }
        let state = child.lock();
        if let Some((parent, parent_field)) = &state.parent {
            if let Some(parent) = parent.upgrade() {
                if parent.id != self.id || parent_field != field {
                    return Err(GraphError::AlreadyAttached {
                        node: child.id,
                        parent: parent.id,
                    });
                }
            }
        }
        Ok(())
    }

    fn adopt(self: &Arc<Self>, field: &str, child: &NodeRef) {
        child.lock().parent = Some((Arc::downgrade(self), field.to_string()));
    }

    fn release(&self) {
        self.lock().parent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn column() -> Arc<Schema> {
        Schema::builder("Column")
            .children("controls")
            .child("header")
            .link("focused")
            .build()
    }

    fn text() -> Arc<Schema> {
        Schema::builder("Text").value("value").build()
    }

    #[test]
    fn ids_are_unique_per_node() {
        let schema = text();
        let a = Node::new(&schema);
        let b = Node::new(&schema);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), "Text");
    }

    #[test]
    fn writing_undeclared_field_fails() {
        let node = Node::new(&text());
        let err = node.set("colour", "red").expect_err("unknown field");
        assert!(matches!(err, GraphError::UnknownField { .. }));
        let err = node.set("data", 1).map(|_| ());
        assert!(err.is_ok());
    }

    #[test]
    fn durations_beyond_wire_range_are_rejected_on_write() {
        let node = Node::new(&text());
        let huge = chrono::TimeDelta::seconds(10_000_000_000_000);
        let err = node.set("value", huge).expect_err("out of range");
        assert!(matches!(err, GraphError::DurationOutOfRange { .. }));
        assert_eq!(node.get("value"), None);

        let nested = Value::List(vec![Value::Int(1), Value::Duration(huge)]);
        assert!(node.set_extra("wait", nested).is_err());
        assert_eq!(node.extra("wait"), None);

        node.set("value", chrono::TimeDelta::seconds(90)).expect("in range");
    }

    #[test]
    fn writing_with_wrong_shape_fails() {
        let col = Node::new(&column());
        let err = col.set("controls", 1).expect_err("shape");
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn child_cannot_have_two_parents() {
        let schema = column();
        let a = Node::new(&schema);
        let b = Node::new(&schema);
        let leaf = Node::new(&text());
        a.push_child("controls", leaf.clone()).expect("attach");
        let err = b.push_child("controls", leaf.clone()).expect_err("second parent");
        assert_eq!(
            err,
            GraphError::AlreadyAttached {
                node: leaf.id(),
                parent: a.id()
            }
        );

        a.remove_child("controls", leaf.id()).expect("detach");
        b.push_child("controls", leaf.clone()).expect("reattach");
        assert_eq!(leaf.parent().map(|p| p.id()), Some(b.id()));
    }

    #[test]
    fn attaching_an_ancestor_is_a_cycle() {
        let schema = column();
        let outer = Node::new(&schema);
        let inner = Node::new(&schema);
        outer.push_child("controls", inner.clone()).expect("attach");
        let err = inner.push_child("controls", outer.clone()).expect_err("cycle");
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn duplicate_entries_in_one_list_are_rejected() {
        let col = Node::new(&column());
        let leaf = Node::new(&text());
        let err = col
            .set_children("controls", vec![leaf.clone(), leaf.clone()])
            .expect_err("duplicate");
        assert!(matches!(err, GraphError::DuplicateChild { .. }));
    }

    #[test]
    fn set_children_releases_dropped_entries() {
        let col = Node::new(&column());
        let a = Node::new(&text());
        let b = Node::new(&text());
        col.set_children("controls", vec![a.clone(), b.clone()])
            .expect("set");
        col.set_children("controls", vec![b.clone()]).expect("shrink");
        assert!(a.parent().is_none());
        assert_eq!(b.parent().map(|p| p.id()), Some(col.id()));
    }

    #[test]
    fn mark_dirty_propagates_to_ancestors() {
        let schema = column();
        let root = Node::new(&schema);
        let mid = Node::new(&schema);
        let leaf = Node::new(&text());
        root.push_child("controls", mid.clone()).expect("attach");
        mid.push_child("controls", leaf.clone()).expect("attach");
        for node in [&root, &mid, &leaf] {
            let mut state = node.lock();
            state.dirty = false;
            state.subtree_dirty = false;
        }

        leaf.set("value", "x").expect("set");
        assert!(leaf.lock().dirty);
        assert!(mid.lock().subtree_dirty);
        assert!(!mid.lock().dirty);
        assert!(root.lock().subtree_dirty);
        assert_eq!(leaf.root().id(), root.id());
    }

    #[test]
    fn extra_slot_accepts_arbitrary_keys() {
        let node = Node::new(&text());
        node.set_extra("row", 3).expect("extra");
        node.set_extra("tag", "x").expect("extra");
        assert_eq!(node.extra("row"), Some(Value::Int(3)));
        assert_eq!(node.extra("tag"), Some(Value::from("x")));
    }

    #[test]
    fn client_props_do_not_mark_dirty() {
        let node = Node::new(&text());
        {
            let mut state = node.lock();
            state.dirty = false;
        }
        let mut props = IndexMap::new();
        props.insert("value".to_string(), Value::from("typed"));
        node.apply_client_props(&props).expect("apply");
        assert_eq!(node.get("value"), Some(Value::from("typed")));
        assert!(!node.is_dirty());
    }

    #[test]
    fn handlers_are_looked_up_by_event_name() {
        let node = Node::new(&text());
        let handler: EventHandler = Arc::new(|_event| async { Ok(()) }.boxed());
        node.on("click", handler);
        assert!(node.handler("click").is_some());
        assert!(node.handler("hover").is_none());
        node.off("click");
        assert!(node.handler("click").is_none());
    }
}
