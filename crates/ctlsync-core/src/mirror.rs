use crate::node::NodeId;
use crate::patch::{GraphPatch, ID_KEY, KIND_KEY, ROOT_KEY};
use crate::schema::{FieldShape, Schema};
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("no schema registered for kind '{0}'")]
    UnknownKind(String),
    #[error("patch references unknown node '{0}'")]
    UnknownNode(String),
    #[error("patch addresses the root before it was created")]
    MissingRoot,
    #[error("malformed patch: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
enum MirrorField {
    Value(Value),
    Child(Option<NodeId>),
    Children(Vec<NodeId>),
    NamedChildren(IndexMap<String, NodeId>),
}

#[derive(Debug, Clone)]
struct MirrorNode {
    kind: String,
    fields: IndexMap<String, MirrorField>,
}

/// Client-side replica that applies graph patches the way a renderer would.
#[derive(Debug, Default)]
pub struct ClientMirror {
    schemas: HashMap<String, Arc<Schema>>,
    root: Option<NodeId>,
    nodes: HashMap<NodeId, MirrorNode>,
}

impl ClientMirror {
    pub fn new(schemas: impl IntoIterator<Item = Arc<Schema>>) -> Self {
        Self {
            schemas: schemas
                .into_iter()
                .map(|schema| (schema.kind().to_string(), schema))
                .collect(),
            root: None,
            nodes: HashMap::new(),
        }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn apply(&mut self, patch: &GraphPatch) -> Result<(), MirrorError> {
        for (key, fields) in patch.entries() {
            if fields.contains_key(KIND_KEY) {
                let id = self.build(fields)?;
                if key == ROOT_KEY {
                    self.root = Some(id);
                }
                continue;
            }
            let id = if key == ROOT_KEY {
                self.root.ok_or(MirrorError::MissingRoot)?
            } else {
                key.parse::<NodeId>()
                    .map_err(|_| MirrorError::UnknownNode(key.clone()))?
            };
            for (field, value) in fields {
                self.set_field(id, field, value)?;
            }
        }
        self.collect_garbage();
        Ok(())
    }

    /// Renders the replica in the embedded snapshot form.
    pub fn render(&self) -> Option<Value> {
        self.root.map(|root| self.render_node(root))
    }

    fn shape(&self, id: NodeId, field: &str) -> Result<FieldShape, MirrorError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| MirrorError::UnknownNode(id.to_string()))?;
        let schema = self
            .schemas
            .get(&node.kind)
            .ok_or_else(|| MirrorError::UnknownKind(node.kind.clone()))?;
        Ok(schema.shape(field).unwrap_or(FieldShape::Value))
    }

    fn set_field(&mut self, id: NodeId, field: &str, value: &Value) -> Result<(), MirrorError> {
        let stored = match self.shape(id, field)? {
            FieldShape::Value | FieldShape::Link => MirrorField::Value(value.clone()),
            FieldShape::Child => match value {
                Value::Null => MirrorField::Child(None),
                other => MirrorField::Child(Some(self.resolve(other)?)),
            },
            FieldShape::Children => {
                let items = value
                    .as_list()
                    .ok_or_else(|| MirrorError::Malformed(format!("'{field}' must be a list")))?;
                let mut ids = Vec::with_capacity(items.len());
                for item in items {
                    ids.push(self.resolve(item)?);
                }
                MirrorField::Children(ids)
            }
            FieldShape::NamedChildren => {
                let map = value
                    .as_map()
                    .ok_or_else(|| MirrorError::Malformed(format!("'{field}' must be a map")))?;
                let mut ids = IndexMap::with_capacity(map.len());
                for (key, item) in map {
                    ids.insert(key.clone(), self.resolve(item)?);
                }
                MirrorField::NamedChildren(ids)
            }
        };
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| MirrorError::UnknownNode(id.to_string()))?
            .fields
            .insert(field.to_string(), stored);
        Ok(())
    }

    fn resolve(&mut self, value: &Value) -> Result<NodeId, MirrorError> {
        match value {
            Value::Map(map) => self.build(map),
            other => {
                let id = other
                    .as_u64()
                    .ok_or_else(|| MirrorError::Malformed(format!("bad node reference {other}")))?;
                if self.nodes.contains_key(&id) {
                    Ok(id)
                } else {
                    Err(MirrorError::UnknownNode(id.to_string()))
                }
            }
        }
    }

    fn build(&mut self, map: &IndexMap<String, Value>) -> Result<NodeId, MirrorError> {
        let id = map
            .get(ID_KEY)
            .and_then(Value::as_u64)
            .ok_or_else(|| MirrorError::Malformed("embedded node without id".to_string()))?;
        let kind = map
            .get(KIND_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| MirrorError::Malformed("embedded node without kind".to_string()))?;
        if !self.schemas.contains_key(kind) {
            return Err(MirrorError::UnknownKind(kind.to_string()));
        }
        self.nodes.insert(
            id,
            MirrorNode {
                kind: kind.to_string(),
                fields: IndexMap::new(),
            },
        );
        for (field, value) in map {
            if field == ID_KEY || field == KIND_KEY {
                continue;
            }
            self.set_field(id, field, value)?;
        }
        Ok(id)
    }

    fn render_node(&self, id: NodeId) -> Value {
        let Some(node) = self.nodes.get(&id) else {
            return Value::Null;
        };
        let mut out = IndexMap::with_capacity(node.fields.len() + 2);
        out.insert(ID_KEY.to_string(), Value::Int(id as i64));
        out.insert(KIND_KEY.to_string(), Value::Str(node.kind.clone()));
        for (name, field) in &node.fields {
            let rendered = match field {
                MirrorField::Value(value) => value.clone(),
                MirrorField::Child(child) => child
                    .map(|c| self.render_node(c))
                    .unwrap_or(Value::Null),
                MirrorField::Children(children) => {
                    Value::List(children.iter().map(|c| self.render_node(*c)).collect())
                }
                MirrorField::NamedChildren(map) => Value::Map(
                    map.iter()
                        .map(|(key, c)| (key.clone(), self.render_node(*c)))
                        .collect(),
                ),
            };
            out.insert(name.clone(), rendered);
        }
        Value::Map(out)
    }

    fn collect_garbage(&mut self) {
        let Some(root) = self.root else {
            self.nodes.clear();
            return;
        };
        let mut reachable = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                for field in node.fields.values() {
                    match field {
                        MirrorField::Child(Some(child)) => stack.push(*child),
                        MirrorField::Children(children) => stack.extend(children.iter().copied()),
                        MirrorField::NamedChildren(map) => stack.extend(map.values().copied()),
                        _ => {}
                    }
                }
            }
        }
        self.nodes.retain(|id, _| reachable.contains(id));
    }
}
