//! JSON-RPC 2.0 messages exchanged between nodes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::common::Contact;
use crate::messenger::MessengerError;

pub const JSONRPC_VERSION: &str = "2.0";
/// Method of the notification appended to every message, carrying the sender's contact.
pub const IDENTIFY: &str = "IDENTIFY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// JSON-RPC error object.
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
/// A call or a reply to one, correlated by `id`.
pub enum Message {
    Request {
        id: String,
        method: String,
        params: Value,
    },
    Success {
        id: String,
        result: Value,
    },
    Error {
        id: String,
        error: ErrorObject,
    },
}

impl Message {
    /// New request with a random uuid as its id.
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Message::Success {
            id: id.into(),
            result,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>, code: i64) -> Self {
        Message::Error {
            id: id.into(),
            error: ErrorObject {
                code,
                message: message.into(),
                data: None,
            },
        }
    }

    // === Getters ===

    pub fn id(&self) -> &str {
        match self {
            Message::Request { id, .. } => id,
            Message::Success { id, .. } => id,
            Message::Error { id, .. } => id,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request { .. })
    }

    // === Public Methods ===

    pub fn to_json(&self) -> Value {
        match self {
            Message::Request { id, method, params } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "method": method,
                "params": params,
            }),
            Message::Success { id, result } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": result,
            }),
            Message::Error { id, error } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "error": error,
            }),
        }
    }

    /// Classify a JSON value, rejecting notifications and anything that is not JSON-RPC 2.0.
    pub fn from_json(value: Value) -> Result<Self, MessengerError> {
        let Value::Object(mut object) = value else {
            return Err(MessengerError::InvalidMessageType("invalid"));
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(MessengerError::InvalidMessageType("invalid"));
        }

        if let Some(method) = object.get("method") {
            let method = method
                .as_str()
                .ok_or(MessengerError::InvalidMessageType("invalid"))?
                .to_string();

            let Some(id) = take_id(&mut object) else {
                return Err(MessengerError::InvalidMessageType("notification"));
            };

            let params = match object.remove("params") {
                None => Value::Array(vec![]),
                Some(params @ (Value::Array(_) | Value::Object(_))) => params,
                Some(_) => return Err(MessengerError::InvalidMessageType("invalid")),
            };

            return Ok(Message::Request { id, method, params });
        }

        let id = take_id(&mut object).ok_or(MessengerError::InvalidMessageType("invalid"))?;

        if let Some(result) = object.remove("result") {
            return Ok(Message::Success { id, result });
        }

        if let Some(error) = object.remove("error") {
            let error = serde_json::from_value(error)
                .map_err(|_| MessengerError::InvalidMessageType("invalid"))?;

            return Ok(Message::Error { id, error });
        }

        Err(MessengerError::InvalidMessageType("invalid"))
    }
}

fn take_id(object: &mut Map<String, Value>) -> Option<String> {
    match object.remove("id")? {
        Value::String(id) => Some(id),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// The IDENTIFY notification for `sender`.
pub(crate) fn identify(sender: &Contact) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": IDENTIFY,
        "params": sender,
    })
}

/// Extract the sender's contact from an IDENTIFY notification.
pub(crate) fn parse_identify(value: Value) -> Result<Contact, MessengerError> {
    let Value::Object(mut object) = value else {
        return Err(MessengerError::InvalidIdentity("missing notification".into()));
    };

    if object.get("method").and_then(Value::as_str) != Some(IDENTIFY) || object.contains_key("id")
    {
        return Err(MessengerError::InvalidIdentity(
            "expected an IDENTIFY notification".into(),
        ));
    }

    let params = object.remove("params").unwrap_or(Value::Null);

    serde_json::from_value(params).map_err(|error| MessengerError::InvalidIdentity(error.to_string()))
}
