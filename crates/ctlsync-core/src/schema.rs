use indexmap::IndexMap;
use std::sync::Arc;

/// Name of the escape-hatch field every schema carries.
pub const EXTRA_FIELD: &str = "data";

/// How a field participates in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldShape {
    /// Primitive or nested map/list value.
    Value,
    /// At most one owned child node.
    Child,
    /// Ordered owned child nodes.
    Children,
    /// String-keyed owned child nodes.
    NamedChildren,
    /// Non-owned cross reference to another node. Never walked as an ownership edge.
    Link,
}

impl FieldShape {
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            FieldShape::Child | FieldShape::Children | FieldShape::NamedChildren
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldShape::Value => "value",
            FieldShape::Child => "child",
            FieldShape::Children => "children",
            FieldShape::NamedChildren => "named_children",
            FieldShape::Link => "link",
        }
    }
}

/// Closed field set of one control kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    kind: String,
    fields: IndexMap<String, FieldShape>,
}

impl Schema {
    pub fn builder(kind: impl Into<String>) -> SchemaBuilder {
        let mut fields = IndexMap::new();
        fields.insert(EXTRA_FIELD.to_string(), FieldShape::Value);
        SchemaBuilder {
            kind: kind.into(),
            fields,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn shape(&self, field: &str) -> Option<FieldShape> {
        self.fields.get(field).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldShape)> {
        self.fields.iter().map(|(name, shape)| (name.as_str(), *shape))
    }
}

pub struct SchemaBuilder {
    kind: String,
    fields: IndexMap<String, FieldShape>,
}

impl SchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, shape: FieldShape) -> Self {
        self.fields.insert(name.into(), shape);
        self
    }

    pub fn value(self, name: impl Into<String>) -> Self {
        self.field(name, FieldShape::Value)
    }

    pub fn child(self, name: impl Into<String>) -> Self {
        self.field(name, FieldShape::Child)
    }

    pub fn children(self, name: impl Into<String>) -> Self {
        self.field(name, FieldShape::Children)
    }

    pub fn named_children(self, name: impl Into<String>) -> Self {
        self.field(name, FieldShape::NamedChildren)
    }

    pub fn link(self, name: impl Into<String>) -> Self {
        self.field(name, FieldShape::Link)
    }

    pub fn build(self) -> Arc<Schema> {
        Arc::new(Schema {
            kind: self.kind,
            fields: self.fields,
        })
    }
}
