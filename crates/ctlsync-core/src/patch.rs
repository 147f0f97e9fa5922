use crate::node::NodeId;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;

/// Key of the node id inside an embedded node payload.
pub const ID_KEY: &str = "_i";
/// Key of the control kind inside an embedded node payload.
pub const KIND_KEY: &str = "_c";
/// Graph-patch key addressing the target root.
pub const ROOT_KEY: &str = "";

/// Full, self-contained rendering of a subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: String,
    pub fields: IndexMap<String, SnapshotField>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotField {
    Value(Value),
    Link(Option<NodeId>),
    Child(Option<Box<NodeSnapshot>>),
    Children(Vec<NodeSnapshot>),
    NamedChildren(IndexMap<String, NodeSnapshot>),
}

impl NodeSnapshot {
    /// Embedded payload form: `{"_i": id, "_c": kind, ...fields}`.
    pub fn to_value(&self) -> Value {
        let mut map = IndexMap::with_capacity(self.fields.len() + 2);
        map.insert(ID_KEY.to_string(), Value::Int(self.id as i64));
        map.insert(KIND_KEY.to_string(), Value::Str(self.kind.clone()));
        for (name, field) in &self.fields {
            let value = match field {
                SnapshotField::Value(value) => value.clone(),
                SnapshotField::Link(target) => target.map(Value::NodeRef).unwrap_or(Value::Null),
                SnapshotField::Child(child) => {
                    child.as_ref().map(|c| c.to_value()).unwrap_or(Value::Null)
                }
                SnapshotField::Children(children) => {
                    Value::List(children.iter().map(NodeSnapshot::to_value).collect())
                }
                SnapshotField::NamedChildren(map) => Value::Map(
                    map.iter()
                        .map(|(key, c)| (key.clone(), c.to_value()))
                        .collect(),
                ),
            };
            map.insert(name.clone(), value);
        }
        Value::Map(map)
    }

    /// Number of nodes in the subtree, this one included.
    pub fn node_count(&self) -> usize {
        1 + self
            .fields
            .values()
            .map(|field| match field {
                SnapshotField::Child(Some(child)) => child.node_count(),
                SnapshotField::Children(children) => {
                    children.iter().map(NodeSnapshot::node_count).sum()
                }
                SnapshotField::NamedChildren(map) => {
                    map.values().map(NodeSnapshot::node_count).sum()
                }
                _ => 0,
            })
            .sum::<usize>()
    }
}

/// New value for one field of an existing node.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPatch {
    Value(Value),
    Node(Option<NodeId>),
    NamedNodes(IndexMap<String, NodeId>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    SetField {
        node: NodeId,
        field: String,
        value: FieldPatch,
    },
    CreateNode {
        owner: Option<(NodeId, String)>,
        snapshot: NodeSnapshot,
    },
    RemoveNode {
        node: NodeId,
    },
    ReorderChildren {
        node: NodeId,
        field: String,
        order: Vec<NodeId>,
    },
}

/// Ordered edit list produced by one diff pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub(crate) edits: Vec<Edit>,
    pub(crate) visited: usize,
}

impl Patch {
    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn into_edits(self) -> Vec<Edit> {
        self.edits
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Nodes the pass had to inspect.
    pub fn visited(&self) -> usize {
        self.visited
    }

    pub fn created_ids(&self) -> Vec<NodeId> {
        self.edits
            .iter()
            .filter_map(|edit| match edit {
                Edit::CreateNode { snapshot, .. } => Some(snapshot.id),
                _ => None,
            })
            .collect()
    }

    pub fn removed_ids(&self) -> Vec<NodeId> {
        self.edits
            .iter()
            .filter_map(|edit| match edit {
                Edit::RemoveNode { node } => Some(*node),
                _ => None,
            })
            .collect()
    }

    /// Collapses the edit list into the wire graph form, addressing `root` as `""`.
    pub fn graph(&self, root: NodeId) -> GraphPatch {
        let created: HashMap<NodeId, &NodeSnapshot> = self
            .edits
            .iter()
            .filter_map(|edit| match edit {
                Edit::CreateNode { snapshot, .. } => Some((snapshot.id, snapshot)),
                _ => None,
            })
            .collect();
        let embed = |id: NodeId| -> Value {
            match created.get(&id) {
                Some(snapshot) => snapshot.to_value(),
                None => Value::Int(id as i64),
            }
        };

        let mut graph = GraphPatch::default();
        for edit in &self.edits {
            match edit {
                Edit::SetField { node, field, value } => {
                    let rendered = match value {
                        FieldPatch::Value(value) => value.clone(),
                        FieldPatch::Node(target) => target.map(embed).unwrap_or(Value::Null),
                        FieldPatch::NamedNodes(map) => Value::Map(
                            map.iter()
                                .map(|(key, id)| (key.clone(), embed(*id)))
                                .collect(),
                        ),
                    };
                    graph.entry(*node, root).insert(field.clone(), rendered);
                }
                Edit::ReorderChildren { node, field, order } => {
                    let rendered = Value::List(order.iter().map(|id| embed(*id)).collect());
                    graph.entry(*node, root).insert(field.clone(), rendered);
                }
                Edit::CreateNode { owner: None, snapshot } => {
                    if let Value::Map(map) = snapshot.to_value() {
                        *graph.entry(snapshot.id, root) = map;
                    }
                }
                Edit::CreateNode { owner: Some(_), .. } | Edit::RemoveNode { .. } => {}
            }
        }
        graph
    }
}

/// Wire form of a patch: node key to changed fields. New nodes are embedded
/// in full where referenced; existing nodes appear as integer ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphPatch {
    entries: IndexMap<String, IndexMap<String, Value>>,
}

impl GraphPatch {
    fn entry(&mut self, node: NodeId, root: NodeId) -> &mut IndexMap<String, Value> {
        let key = if node == root {
            ROOT_KEY.to_string()
        } else {
            node.to_string()
        };
        self.entries.entry(key).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &IndexMap<String, IndexMap<String, Value>> {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&IndexMap<String, Value>> {
        self.entries.get(key)
    }

    pub fn to_value(&self) -> Value {
        Value::Map(
            self.entries
                .iter()
                .map(|(key, fields)| (key.clone(), Value::Map(fields.clone())))
                .collect(),
        )
    }

    /// Rebuilds a graph patch from its decoded value form.
    pub fn from_value(value: &Value) -> Option<Self> {
        let outer = value.as_map()?;
        let mut entries = IndexMap::with_capacity(outer.len());
        for (key, fields) in outer {
            entries.insert(key.clone(), fields.as_map()?.clone());
        }
        Some(GraphPatch { entries })
    }
}
