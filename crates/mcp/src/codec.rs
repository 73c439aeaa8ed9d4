//! Newline-delimited JSON codec for protocol messages.
//!
//! One message is one JSON object on one line. `serde_json` never emits raw
//! newlines in compact mode (they are escaped inside strings), so a line is
//! always a complete, self-delimited unit. The codec only checks envelope
//! shape; it knows nothing about method semantics.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    RequestId, ResponsePayload,
};

/// Wire shape shared by all three message kinds.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    // `"result": null` is a valid void result, so presence must survive decoding.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Encode a message as a single newline-terminated line.
pub fn encode(message: &Message) -> Result<String> {
    let envelope = match message {
        Message::Request(req) => Envelope {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(req.id.clone()),
            method: Some(req.method.clone()),
            params: req.params.clone(),
            result: None,
            error: None,
        },
        Message::Notification(note) => Envelope {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(note.method.clone()),
            params: note.params.clone(),
            result: None,
            error: None,
        },
        Message::Response(resp) => {
            let (result, error) = match &resp.payload {
                ResponsePayload::Result(value) => (Some(value.clone()), None),
                ResponsePayload::Error(err) => (None, Some(err.clone())),
            };
            Envelope {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: Some(resp.id.clone()),
                method: None,
                params: None,
                result,
                error,
            }
        }
    };

    let mut line = serde_json::to_string(&envelope)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line (with or without its terminator) into a message.
pub fn decode(line: &str) -> Result<Message> {
    let line = line.trim_end_matches(['\n', '\r']);
    let envelope: Envelope =
        serde_json::from_str(line).map_err(|e| Error::MalformedMessage(e.to_string()))?;

    if envelope.jsonrpc != JSONRPC_VERSION {
        return Err(malformed(format!(
            "unsupported jsonrpc version {:?}",
            envelope.jsonrpc
        )));
    }

    if let Some(params) = &envelope.params {
        if !params.is_object() && !params.is_array() {
            return Err(malformed("params must be an object or array"));
        }
    }

    let Envelope {
        id,
        method,
        params,
        result,
        error,
        ..
    } = envelope;

    match (id, method) {
        (id, Some(method)) => {
            if result.is_some() || error.is_some() {
                return Err(malformed("request carries result or error"));
            }
            Ok(match id {
                Some(id) => Message::Request(JsonRpcRequest { id, method, params }),
                None => Message::Notification(JsonRpcNotification { method, params }),
            })
        }
        (Some(id), None) => {
            if params.is_some() {
                return Err(malformed("response carries params"));
            }
            let payload = match (result, error) {
                (Some(value), None) => ResponsePayload::Result(value),
                (None, Some(err)) => ResponsePayload::Error(err),
                (Some(_), Some(_)) => return Err(malformed("response has both result and error")),
                (None, None) => return Err(malformed("response has neither result nor error")),
            };
            Ok(Message::Response(JsonRpcResponse { id, payload }))
        }
        (None, None) => Err(malformed("missing both id and method")),
    }
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedMessage(reason.into())
}
