use crate::codec::{decode_value, encode_value, CodecError};
use crate::node::NodeId;
use crate::patch::GraphPatch;
use crate::value::Value;
use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;

/// First element of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    RegisterClient,
    PagePatch,
    ControlEvent,
    UpdateControlProps,
    InvokeMethod,
    SessionCrashed,
}

impl Action {
    pub fn code(self) -> u8 {
        match self {
            Action::RegisterClient => 1,
            Action::PagePatch => 2,
            Action::ControlEvent => 3,
            Action::UpdateControlProps => 4,
            Action::InvokeMethod => 5,
            Action::SessionCrashed => 6,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Action::RegisterClient),
            2 => Some(Action::PagePatch),
            3 => Some(Action::ControlEvent),
            4 => Some(Action::UpdateControlProps),
            5 => Some(Action::InvokeMethod),
            6 => Some(Action::SessionCrashed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::RegisterClient => "register_client",
            Action::PagePatch => "page_patch",
            Action::ControlEvent => "control_event",
            Action::UpdateControlProps => "update_control_props",
            Action::InvokeMethod => "invoke_method",
            Action::SessionCrashed => "session_crashed",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("malformed envelope: {0}")]
    Envelope(String),
    #[error("unknown action {0}")]
    UnknownAction(u64),
    #[error("{0} is not accepted in this direction")]
    UnexpectedAction(Action),
    #[error("{action} body is missing '{field}'")]
    MissingField { action: Action, field: &'static str },
    #[error("{action} field '{field}' must be {expected}")]
    InvalidField {
        action: Action,
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterClientRequest {
    pub session_id: Option<String>,
    pub page_name: String,
    pub page: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterClientResponse {
    pub session_id: String,
    pub page_patch: GraphPatch,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PagePatchBody {
    pub id: NodeId,
    pub patch: GraphPatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlEventBody {
    pub target: NodeId,
    pub name: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateControlPropsBody {
    pub id: NodeId,
    pub props: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeMethodRequest {
    pub control_id: NodeId,
    pub call_id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeMethodResponse {
    pub control_id: NodeId,
    pub call_id: String,
    pub result: Value,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionCrashedBody {
    pub message: String,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    RegisterClient(RegisterClientRequest),
    ControlEvent(ControlEventBody),
    UpdateControlProps(UpdateControlPropsBody),
    InvokeMethodResult(InvokeMethodResponse),
}

/// Server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    RegisterClient(RegisterClientResponse),
    PagePatch(PagePatchBody),
    InvokeMethod(InvokeMethodRequest),
    SessionCrashed(SessionCrashedBody),
}

/// Reads the action of an encoded envelope without decoding the body.
pub fn peek_action(payload: &[u8]) -> Result<Action, ProtocolError> {
    match payload {
        // array(2) followed by a small unsigned integer
        [0x82, code, ..] if *code < 0x18 => {
            Action::from_code(u64::from(*code)).ok_or(ProtocolError::UnknownAction(u64::from(*code)))
        }
        _ => Err(ProtocolError::Envelope(
            "expected [action, body] with a small action code".to_string(),
        )),
    }
}

fn encode_envelope(action: Action, body: IndexMap<String, Value>) -> Result<Vec<u8>, ProtocolError> {
    let envelope = Value::List(vec![Value::Int(i64::from(action.code())), Value::Map(body)]);
    Ok(encode_value(&envelope)?)
}

fn decode_envelope(payload: &[u8]) -> Result<(Action, IndexMap<String, Value>), ProtocolError> {
    let value = decode_value(payload)?;
    let mut items = match value {
        Value::List(items) if items.len() == 2 => items,
        other => {
            return Err(ProtocolError::Envelope(format!(
                "expected a two element list, got {}",
                other.kind_name()
            )))
        }
    };
    let body = match items.pop() {
        Some(Value::Map(body)) => body,
        Some(Value::Null) => IndexMap::new(),
        _ => return Err(ProtocolError::Envelope("body must be a map".to_string())),
    };
    let code = items
        .pop()
        .and_then(|code| code.as_u64())
        .ok_or_else(|| ProtocolError::Envelope("action must be an unsigned integer".to_string()))?;
    let action = Action::from_code(code).ok_or(ProtocolError::UnknownAction(code))?;
    Ok((action, body))
}

struct Body {
    action: Action,
    fields: IndexMap<String, Value>,
}

impl Body {
    fn take(&mut self, field: &'static str) -> Option<Value> {
        self.fields.shift_remove(field).filter(|value| !value.is_null())
    }

    fn required(&mut self, field: &'static str) -> Result<Value, ProtocolError> {
        self.take(field).ok_or(ProtocolError::MissingField {
            action: self.action,
            field,
        })
    }

    fn invalid(&self, field: &'static str, expected: &'static str) -> ProtocolError {
        ProtocolError::InvalidField {
            action: self.action,
            field,
            expected,
        }
    }

    fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        match self.required(field)? {
            Value::Str(text) => Ok(text),
            _ => Err(self.invalid(field, "a string")),
        }
    }

    fn opt_string(&mut self, field: &'static str) -> Result<Option<String>, ProtocolError> {
        match self.take(field) {
            None => Ok(None),
            Some(Value::Str(text)) if text.is_empty() => Ok(None),
            Some(Value::Str(text)) => Ok(Some(text)),
            Some(_) => Err(self.invalid(field, "a string")),
        }
    }

    /// Node ids arrive as integers, node references, or decimal strings.
    fn node_id(&mut self, field: &'static str) -> Result<NodeId, ProtocolError> {
        let value = self.required(field)?;
        let parsed = match &value {
            Value::Str(text) => text.trim_start_matches('_').parse::<NodeId>().ok(),
            other => other.as_u64(),
        };
        parsed.ok_or_else(|| self.invalid(field, "a node id"))
    }

    fn map(&mut self, field: &'static str) -> Result<IndexMap<String, Value>, ProtocolError> {
        match self.take(field) {
            None => Ok(IndexMap::new()),
            Some(Value::Map(map)) => Ok(map),
            Some(_) => Err(self.invalid(field, "a map")),
        }
    }

    fn any(&mut self, field: &'static str) -> Value {
        self.take(field).unwrap_or_default()
    }

    fn graph(&mut self, field: &'static str) -> Result<GraphPatch, ProtocolError> {
        match self.take(field) {
            None => Ok(GraphPatch::default()),
            Some(value) => {
                GraphPatch::from_value(&value).ok_or_else(|| self.invalid(field, "a graph patch"))
            }
        }
    }
}

fn fields<const N: usize>(entries: [(&str, Value); N]) -> IndexMap<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn node_id_value(id: NodeId) -> Value {
    Value::Int(id as i64)
}

impl ClientMessage {
    pub fn action(&self) -> Action {
        match self {
            ClientMessage::RegisterClient(_) => Action::RegisterClient,
            ClientMessage::ControlEvent(_) => Action::ControlEvent,
            ClientMessage::UpdateControlProps(_) => Action::UpdateControlProps,
            ClientMessage::InvokeMethodResult(_) => Action::InvokeMethod,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            ClientMessage::RegisterClient(req) => fields([
                ("session_id", Value::from(req.session_id.clone())),
                ("page_name", Value::from(req.page_name.clone())),
                ("page", Value::Map(req.page.clone())),
            ]),
            ClientMessage::ControlEvent(event) => fields([
                ("target", node_id_value(event.target)),
                ("name", Value::from(event.name.clone())),
                ("data", event.data.clone()),
            ]),
            ClientMessage::UpdateControlProps(update) => fields([
                ("id", node_id_value(update.id)),
                ("props", Value::Map(update.props.clone())),
            ]),
            ClientMessage::InvokeMethodResult(resp) => fields([
                ("control_id", node_id_value(resp.control_id)),
                ("call_id", Value::from(resp.call_id.clone())),
                ("result", resp.result.clone()),
                ("error", Value::from(resp.error.clone())),
            ]),
        };
        encode_envelope(self.action(), body)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (action, fields) = decode_envelope(payload)?;
        let mut body = Body { action, fields };
        Ok(match action {
            Action::RegisterClient => ClientMessage::RegisterClient(RegisterClientRequest {
                session_id: body.opt_string("session_id")?,
                page_name: body.opt_string("page_name")?.unwrap_or_default(),
                page: body.map("page")?,
            }),
            Action::ControlEvent => ClientMessage::ControlEvent(ControlEventBody {
                target: body.node_id("target")?,
                name: body.string("name")?,
                data: body.any("data"),
            }),
            Action::UpdateControlProps => {
                ClientMessage::UpdateControlProps(UpdateControlPropsBody {
                    id: body.node_id("id")?,
                    props: body.map("props")?,
                })
            }
            Action::InvokeMethod => ClientMessage::InvokeMethodResult(InvokeMethodResponse {
                control_id: body.node_id("control_id")?,
                call_id: body.string("call_id")?,
                result: body.any("result"),
                error: body.opt_string("error")?,
            }),
            other => return Err(ProtocolError::UnexpectedAction(other)),
        })
    }
}

impl ServerMessage {
    pub fn action(&self) -> Action {
        match self {
            ServerMessage::RegisterClient(_) => Action::RegisterClient,
            ServerMessage::PagePatch(_) => Action::PagePatch,
            ServerMessage::InvokeMethod(_) => Action::InvokeMethod,
            ServerMessage::SessionCrashed(_) => Action::SessionCrashed,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            ServerMessage::RegisterClient(resp) => fields([
                ("session_id", Value::from(resp.session_id.clone())),
                ("page_patch", resp.page_patch.to_value()),
                ("error", Value::from(resp.error.clone())),
            ]),
            ServerMessage::PagePatch(body) => fields([
                ("id", node_id_value(body.id)),
                ("patch", body.patch.to_value()),
            ]),
            ServerMessage::InvokeMethod(req) => fields([
                ("control_id", node_id_value(req.control_id)),
                ("call_id", Value::from(req.call_id.clone())),
                ("name", Value::from(req.name.clone())),
                ("args", req.args.clone()),
            ]),
            ServerMessage::SessionCrashed(body) => {
                fields([("message", Value::from(body.message.clone()))])
            }
        };
        encode_envelope(self.action(), body)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (action, fields) = decode_envelope(payload)?;
        let mut body = Body { action, fields };
        Ok(match action {
            Action::RegisterClient => ServerMessage::RegisterClient(RegisterClientResponse {
                session_id: body.opt_string("session_id")?.unwrap_or_default(),
                page_patch: body.graph("page_patch")?,
                error: body.opt_string("error")?,
            }),
            Action::PagePatch => ServerMessage::PagePatch(PagePatchBody {
                id: body.node_id("id")?,
                patch: body.graph("patch")?,
            }),
            Action::InvokeMethod => ServerMessage::InvokeMethod(InvokeMethodRequest {
                control_id: body.node_id("control_id")?,
                call_id: body.string("call_id")?,
                name: body.string("name")?,
                args: body.any("args"),
            }),
            Action::SessionCrashed => ServerMessage::SessionCrashed(SessionCrashedBody {
                message: body.opt_string("message")?.unwrap_or_default(),
            }),
            other => return Err(ProtocolError::UnexpectedAction(other)),
        })
    }
}
