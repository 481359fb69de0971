//! Protocol envelopes and the values they carry
//!
//! An envelope is the unit exchanged over the channel:
//! `{ "type": <kind>, "reqId": <id>, "payload": <json> }`. The kind codes are
//! shared between host and plugin-host builds and must never be renumbered.

use crate::error::SerializedError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::error;

/// Sender-assigned correlation id
pub type RequestId = i64;

/// Request id carried by envelopes that do not belong to a call
pub const NO_REQUEST_ID: RequestId = -1;

fn no_request_id() -> RequestId {
    NO_REQUEST_ID
}

/// Message kinds with their stable wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageKind {
    Initialized = 0,
    Ready = 1,
    InitData = 2,
    Terminate = 3,
    RequestJsonArgs = 4,
    RequestJsonArgsWithCancellation = 5,
    RequestMixedArgs = 6,
    RequestMixedArgsWithCancellation = 7,
    Acknowledged = 8,
    Cancel = 9,
    ReplyOkEmpty = 10,
    ReplyOkBuffer = 11,
    ReplyOkJson = 12,
    ReplyErrError = 13,
    ReplyErrEmpty = 14,
}

impl MessageKind {
    /// Whether this kind carries an actor invocation
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestJsonArgs
                | Self::RequestJsonArgsWithCancellation
                | Self::RequestMixedArgs
                | Self::RequestMixedArgsWithCancellation
        )
    }

    /// Whether the sender of this request accepts Cancel envelopes for it
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::RequestJsonArgsWithCancellation | Self::RequestMixedArgsWithCancellation
        )
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let kind = match code {
            0 => Self::Initialized,
            1 => Self::Ready,
            2 => Self::InitData,
            3 => Self::Terminate,
            4 => Self::RequestJsonArgs,
            5 => Self::RequestJsonArgsWithCancellation,
            6 => Self::RequestMixedArgs,
            7 => Self::RequestMixedArgsWithCancellation,
            8 => Self::Acknowledged,
            9 => Self::Cancel,
            10 => Self::ReplyOkEmpty,
            11 => Self::ReplyOkBuffer,
            12 => Self::ReplyOkJson,
            13 => Self::ReplyErrError,
            14 => Self::ReplyErrEmpty,
            other => return Err(format!("unknown message kind {}", other)),
        };
        Ok(kind)
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

/// Identifier of an actor, numeric or named
///
/// Serialized untagged, so `7` and `"MainThreadErrors"` are both valid on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActorId {
    Number(u32),
    Name(String),
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::Number(n) => write!(f, "{}", n),
            ActorId::Name(s) => write!(f, "{}", s),
        }
    }
}

impl From<u32> for ActorId {
    fn from(id: u32) -> Self {
        ActorId::Number(id)
    }
}

impl From<&str> for ActorId {
    fn from(name: &str) -> Self {
        ActorId::Name(name.to_string())
    }
}

impl From<String> for ActorId {
    fn from(name: String) -> Self {
        ActorId::Name(name)
    }
}

/// Request payload, `[actorIdentifier, methodName, argumentList]` on the wire
///
/// The object form `{ "rpcName", "methodName", "args" }` emitted by older
/// plugin hosts is accepted on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireRequest", into = "(ActorId, String, Vec<Value>)")]
pub struct RequestPayload {
    pub actor: ActorId,
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireRequest {
    Positional(ActorId, String, Vec<Value>),
    Named {
        #[serde(rename = "rpcName")]
        rpc_name: ActorId,
        #[serde(rename = "methodName")]
        method_name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl From<WireRequest> for RequestPayload {
    fn from(wire: WireRequest) -> Self {
        let (actor, method, args) = match wire {
            WireRequest::Positional(actor, method, args) => (actor, method, args),
            WireRequest::Named {
                rpc_name,
                method_name,
                args,
            } => (rpc_name, method_name, args),
        };
        Self {
            actor,
            method,
            args,
        }
    }
}

impl From<RequestPayload> for (ActorId, String, Vec<Value>) {
    fn from(payload: RequestPayload) -> Self {
        (payload.actor, payload.method, payload.args)
    }
}

/// Successful result of an actor invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// No value (Reply-OK-Empty)
    Empty,
    /// Binary result (Reply-OK-Buffer)
    Buffer(Vec<u8>),
    /// JSON result (Reply-OK-JSON)
    Json(Value),
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Json(value)
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Empty
    }
}

/// One protocol-level message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "reqId", default = "no_request_id")]
    pub request_id: RequestId,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Envelope with no correlation id and no payload
    pub fn of_kind(kind: MessageKind) -> Self {
        Self {
            kind,
            request_id: NO_REQUEST_ID,
            payload: Value::Null,
        }
    }

    /// Envelope with no correlation id carrying a payload
    pub fn with_payload(kind: MessageKind, payload: Value) -> Self {
        Self {
            kind,
            request_id: NO_REQUEST_ID,
            payload,
        }
    }

    /// Request envelope for an actor invocation
    pub fn request(request_id: RequestId, cancellable: bool, payload: RequestPayload) -> Self {
        let kind = if cancellable {
            MessageKind::RequestJsonArgsWithCancellation
        } else {
            MessageKind::RequestJsonArgs
        };
        let payload = serde_json::to_value(&payload).unwrap_or_else(|e| {
            error!(
                request_id,
                actor = %payload.actor,
                method = %payload.method,
                error = %e,
                "Failed to encode request payload"
            );
            Value::Null
        });
        Self {
            kind,
            request_id,
            payload,
        }
    }

    pub fn acknowledge(request_id: RequestId) -> Self {
        Self {
            kind: MessageKind::Acknowledged,
            request_id,
            payload: Value::Null,
        }
    }

    pub fn cancel(request_id: RequestId) -> Self {
        Self {
            kind: MessageKind::Cancel,
            request_id,
            payload: Value::Null,
        }
    }

    /// Successful reply, kind chosen from the reply shape
    pub fn reply(request_id: RequestId, reply: Reply) -> Self {
        let (kind, payload) = match reply {
            Reply::Empty => (MessageKind::ReplyOkEmpty, Value::Null),
            Reply::Buffer(bytes) => (
                MessageKind::ReplyOkBuffer,
                Value::Array(bytes.into_iter().map(Value::from).collect()),
            ),
            Reply::Json(value) => (MessageKind::ReplyOkJson, value),
        };
        Self {
            kind,
            request_id,
            payload,
        }
    }

    /// Error reply; `None` produces Reply-Error-Empty
    pub fn reply_error(request_id: RequestId, error: Option<SerializedError>) -> Self {
        let payload = error.and_then(|error| match serde_json::to_value(&error) {
            Ok(payload) => Some(payload),
            Err(e) => {
                error!(request_id, error = %e, "Failed to encode error reply, sending it empty");
                None
            }
        });
        match payload {
            Some(payload) => Self {
                kind: MessageKind::ReplyErrError,
                request_id,
                payload,
            },
            None => Self {
                kind: MessageKind::ReplyErrEmpty,
                request_id,
                payload: Value::Null,
            },
        }
    }

    pub fn is_terminate(&self) -> bool {
        self.kind == MessageKind::Terminate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let envelope = Envelope::request(
            1,
            false,
            RequestPayload {
                actor: ActorId::Number(7),
                method: "$ping".to_string(),
                args: vec![],
            },
        );

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({ "type": 4, "reqId": 1, "payload": [7, "$ping", []] })
        );
    }

    #[test]
    fn test_decode_named_actor_request() {
        let envelope: Envelope = serde_json::from_value(json!({
            "type": 5,
            "reqId": 12,
            "payload": ["ExtHostWorkspace", "$initializeWorkspace", [{"id": "w"}]]
        }))
        .unwrap();

        assert_eq!(envelope.kind, MessageKind::RequestJsonArgsWithCancellation);
        assert!(envelope.kind.is_cancellable());
        let payload: RequestPayload = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(payload.actor, ActorId::from("ExtHostWorkspace"));
        assert_eq!(payload.method, "$initializeWorkspace");
        assert_eq!(payload.args, vec![json!({"id": "w"})]);
    }

    #[test]
    fn test_decode_object_form_request() {
        let payload: RequestPayload = serde_json::from_value(json!({
            "rpcName": "MainThreadErrors",
            "methodName": "$onUnexpectedError",
            "args": [{"message": "boom"}]
        }))
        .unwrap();

        assert_eq!(payload.actor, ActorId::from("MainThreadErrors"));
        assert_eq!(payload.method, "$onUnexpectedError");
        assert_eq!(payload.args.len(), 1);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result = serde_json::from_value::<Envelope>(json!({ "type": 42, "reqId": 1 }));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_request_id_defaults() {
        let envelope: Envelope = serde_json::from_value(json!({ "type": 3 })).unwrap();
        assert!(envelope.is_terminate());
        assert_eq!(envelope.request_id, NO_REQUEST_ID);
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn test_reply_kinds() {
        assert_eq!(Envelope::reply(3, Reply::Empty).kind, MessageKind::ReplyOkEmpty);
        assert_eq!(
            Envelope::reply(3, Reply::Json(json!("pong"))).kind,
            MessageKind::ReplyOkJson
        );

        let buffer = Envelope::reply(3, Reply::Buffer(vec![1, 2]));
        assert_eq!(buffer.kind, MessageKind::ReplyOkBuffer);
        assert_eq!(buffer.payload, json!([1, 2]));

        assert_eq!(
            Envelope::reply_error(3, None).kind,
            MessageKind::ReplyErrEmpty
        );
    }

    #[test]
    fn test_error_reply_carries_serialized_error() {
        let error = SerializedError::from_error(&crate::error::RpcError::protocol("bad payload"));
        let envelope = Envelope::reply_error(8, Some(error));

        assert_eq!(envelope.kind, MessageKind::ReplyErrError);
        assert_eq!(envelope.request_id, 8);
        assert_eq!(envelope.payload["$isError"], json!(true));
        assert_eq!(envelope.payload["name"], json!("ProtocolError"));
        assert_eq!(envelope.payload["message"], json!("Protocol error: bad payload"));
    }
}
