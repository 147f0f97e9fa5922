//! Control graph, diff engine and wire protocol shared by the hub and its clients.

pub mod codec;
pub mod diff;
pub mod frame;
pub mod index;
pub mod mirror;
pub mod node;
pub mod patch;
pub mod protocol;
pub mod schema;
pub mod value;

pub use diff::{diff, full_patch, DiffError};
pub use index::ControlIndex;
pub use node::{ControlEvent, EventHandler, GraphError, Node, NodeId, NodeRef};
pub use patch::{Edit, FieldPatch, GraphPatch, NodeSnapshot, Patch};
pub use schema::{FieldShape, Schema};
pub use value::Value;
