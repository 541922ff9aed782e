use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{INTERNAL_ERROR, JSONRPC_VERSION, METHOD_NOT_FOUND};
use crate::error::ProtocolError;

/// Envelope shape a message travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireForm {
    /// `{ "type": "<method>", ...payload..., "timestamp": "<ISO-8601>" }`
    #[default]
    Tagged,
    /// `{ "jsonrpc": "2.0", "method": ..., "params": ..., "id": ... }`
    JsonRpc,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Unknown method: {method}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// Classification of a decoded unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Error,
}

/// One decoded wire unit.
///
/// Discrimination happens once at decode time on the presence of the
/// `method`/`type`, `id`/`request_id`, `result` and `error` fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        method: String,
        id: String,
        params: Value,
        form: WireForm,
    },
    Notification {
        method: String,
        params: Value,
        form: WireForm,
    },
    Response {
        id: String,
        result: Value,
        form: WireForm,
    },
    Error {
        id: Option<String>,
        error: RpcError,
        form: WireForm,
    },
}

impl Message {
    pub fn request(method: &str, id: String, params: Value, form: WireForm) -> Self {
        Self::Request {
            method: method.to_string(),
            id,
            params,
            form,
        }
    }

    pub fn notification(method: &str, params: Value, form: WireForm) -> Self {
        Self::Notification {
            method: method.to_string(),
            params,
            form,
        }
    }

    pub fn response(id: String, result: Value, form: WireForm) -> Self {
        Self::Response { id, result, form }
    }

    pub fn error(id: Option<String>, error: RpcError, form: WireForm) -> Self {
        Self::Error { id, error, form }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request { .. } => MessageKind::Request,
            Self::Notification { .. } => MessageKind::Notification,
            Self::Response { .. } => MessageKind::Response,
            Self::Error { .. } => MessageKind::Error,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Correlation id, if the unit carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::Error { id, .. } => id.as_deref(),
            Self::Notification { .. } => None,
        }
    }

    pub fn form(&self) -> WireForm {
        match self {
            Self::Request { form, .. }
            | Self::Notification { form, .. }
            | Self::Response { form, .. }
            | Self::Error { form, .. } => *form,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Self::Request { params, .. } | Self::Notification { params, .. } => Some(params),
            _ => None,
        }
    }

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(obj) = value else {
            return Err(ProtocolError::Malformed("message is not a JSON object".into()));
        };
        if obj.contains_key("jsonrpc") {
            decode_jsonrpc(obj)
        } else if obj.contains_key("type") {
            decode_tagged(obj)
        } else {
            Err(ProtocolError::Malformed(
                "missing 'jsonrpc' or 'type' field".into(),
            ))
        }
    }

    /// Encode into a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_value())?)
    }

    pub fn to_value(&self) -> Value {
        match self.form() {
            WireForm::JsonRpc => self.to_jsonrpc(),
            WireForm::Tagged => self.to_tagged(),
        }
    }

    fn to_jsonrpc(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request { method, id, params, .. } => {
                obj.insert("method".into(), Value::from(method.as_str()));
                obj.insert("params".into(), params.clone());
                obj.insert("id".into(), Value::from(id.as_str()));
            }
            Self::Notification { method, params, .. } => {
                obj.insert("method".into(), Value::from(method.as_str()));
                obj.insert("params".into(), params.clone());
            }
            Self::Response { id, result, .. } => {
                obj.insert("result".into(), result.clone());
                obj.insert("id".into(), Value::from(id.as_str()));
            }
            Self::Error { id, error, .. } => {
                obj.insert("error".into(), rpc_error_value(error));
                obj.insert("id".into(), id.clone().map(Value::from).unwrap_or(Value::Null));
            }
        }
        Value::Object(obj)
    }

    fn to_tagged(&self) -> Value {
        let mut obj = Map::new();
        match self {
            Self::Request { method, id, params, .. } => {
                spread_params(&mut obj, params);
                obj.insert("type".into(), Value::from(method.as_str()));
                obj.insert("request_id".into(), Value::from(id.as_str()));
            }
            Self::Notification { method, params, .. } => {
                spread_params(&mut obj, params);
                obj.insert("type".into(), Value::from(method.as_str()));
            }
            Self::Response { id, result, .. } => {
                obj.insert("type".into(), Value::from("response"));
                obj.insert("request_id".into(), Value::from(id.as_str()));
                obj.insert("result".into(), result.clone());
            }
            Self::Error { id, error, .. } => {
                obj.insert("type".into(), Value::from("error"));
                if let Some(id) = id {
                    obj.insert("request_id".into(), Value::from(id.as_str()));
                }
                obj.insert("error".into(), rpc_error_value(error));
            }
        }
        obj.insert("timestamp".into(), Value::from(chrono::Utc::now().to_rfc3339()));
        Value::Object(obj)
    }
}

fn rpc_error_value(error: &RpcError) -> Value {
    serde_json::to_value(error).unwrap_or_else(|_| {
        serde_json::json!({ "code": error.code, "message": error.message })
    })
}

/// Tagged payload fields live next to `type`; non-object params go under `payload`.
fn spread_params(obj: &mut Map<String, Value>, params: &Value) {
    match params {
        Value::Object(fields) => {
            for (k, v) in fields {
                obj.insert(k.clone(), v.clone());
            }
        }
        Value::Null => {}
        other => {
            obj.insert("payload".into(), other.clone());
        }
    }
}

/// Accept string or numeric ids; `null` means "no id".
fn take_id(obj: &mut Map<String, Value>, key: &str) -> Result<Option<String>, ProtocolError> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(ProtocolError::Malformed(format!(
            "'{key}' must be a string or number, got {other}"
        ))),
    }
}

fn decode_jsonrpc(mut obj: Map<String, Value>) -> Result<Message, ProtocolError> {
    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        other => {
            return Err(ProtocolError::UnsupportedVersion(
                other.unwrap_or("<non-string>").to_string(),
            ))
        }
    }
    let form = WireForm::JsonRpc;
    let id = take_id(&mut obj, "id")?;

    if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Err(ProtocolError::Malformed("'method' must be a string".into()));
        };
        if method.is_empty() {
            return Err(ProtocolError::Malformed("empty 'method'".into()));
        }
        let params = obj
            .remove("params")
            .unwrap_or_else(|| Value::Object(Map::new()));
        return Ok(match id {
            Some(id) => Message::Request { method, id, params, form },
            None => Message::Notification { method, params, form },
        });
    }

    if let Some(error) = obj.remove("error") {
        let error: RpcError = serde_json::from_value(error)?;
        return Ok(Message::Error { id, error, form });
    }

    if let Some(result) = obj.remove("result") {
        let id = id.ok_or_else(|| ProtocolError::Malformed("response without 'id'".into()))?;
        return Ok(Message::Response { id, result, form });
    }

    Err(ProtocolError::Malformed(
        "JSON-RPC unit has neither 'method', 'result' nor 'error'".into(),
    ))
}

fn decode_tagged(mut obj: Map<String, Value>) -> Result<Message, ProtocolError> {
    let form = WireForm::Tagged;
    let method = match obj.remove("type") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(ProtocolError::Malformed("'type' must be a non-empty string".into())),
    };
    let id = take_id(&mut obj, "request_id")?;
    obj.remove("timestamp");

    match (method.as_str(), id) {
        ("response", Some(id)) => {
            // Flat responses carry their payload beside the envelope keys.
            let result = match obj.remove("result") {
                Some(result) => result,
                None if obj.is_empty() => Value::Null,
                None => Value::Object(obj),
            };
            Ok(Message::Response { id, result, form })
        }
        ("response", None) => Err(ProtocolError::Malformed(
            "tagged response without 'request_id'".into(),
        )),
        ("error", Some(id)) => {
            let error = match obj.remove("error") {
                Some(value @ Value::Object(_)) => serde_json::from_value(value)?,
                _ => RpcError::new(
                    obj.get("code")
                        .and_then(Value::as_i64)
                        .map(|c| c as i32)
                        .unwrap_or(INTERNAL_ERROR),
                    obj.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error"),
                ),
            };
            Ok(Message::Error {
                id: Some(id),
                error,
                form,
            })
        }
        (_, Some(id)) => Ok(Message::Request {
            method,
            id,
            params: Value::Object(obj),
            form,
        }),
        (_, None) => Ok(Message::Notification {
            method,
            params: Value::Object(obj),
            form,
        }),
    }
}

/// Method names consumed by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMethod {
    AgentRegister,
    AgentUnregister,
    RegistrationConfirmed,
    Heartbeat,
    HeartbeatAck,
    Ping,
    Pong,
    TaskRequest,
    TaskResult,
    StatusRequest,
    StatusResponse,
    Error,
}

impl ProtocolMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentRegister => "agent_register",
            Self::AgentUnregister => "agent_unregister",
            Self::RegistrationConfirmed => "registration_confirmed",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::TaskRequest => "task_request",
            Self::TaskResult => "task_result",
            Self::StatusRequest => "status_request",
            Self::StatusResponse => "status_response",
            Self::Error => "error",
        }
    }

    /// Every accepted spelling, canonical name first.
    pub fn names(&self) -> &'static [&'static str] {
        match self {
            Self::AgentRegister => &["agent_register", "agent/register"],
            Self::AgentUnregister => &["agent_unregister", "agent/unregister"],
            Self::Heartbeat => &["heartbeat", "agent/heartbeat"],
            Self::Ping => &["ping", "agent/ping"],
            Self::TaskRequest => &["task_request", "task/execute"],
            Self::StatusRequest => &["status_request", "agent/status"],
            Self::RegistrationConfirmed => &["registration_confirmed"],
            Self::HeartbeatAck => &["heartbeat_ack"],
            Self::Pong => &["pong"],
            Self::TaskResult => &["task_result"],
            Self::StatusResponse => &["status_response"],
            Self::Error => &["error"],
        }
    }

    /// Look up a method by any of its accepted spellings.
    pub fn parse_name(s: &str) -> Option<Self> {
        const ALL: [ProtocolMethod; 12] = [
            ProtocolMethod::AgentRegister,
            ProtocolMethod::AgentUnregister,
            ProtocolMethod::RegistrationConfirmed,
            ProtocolMethod::Heartbeat,
            ProtocolMethod::HeartbeatAck,
            ProtocolMethod::Ping,
            ProtocolMethod::Pong,
            ProtocolMethod::TaskRequest,
            ProtocolMethod::TaskResult,
            ProtocolMethod::StatusRequest,
            ProtocolMethod::StatusResponse,
            ProtocolMethod::Error,
        ];
        ALL.into_iter().find(|m| m.names().contains(&s))
    }
}

impl fmt::Display for ProtocolMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_name(s).ok_or_else(|| format!("unknown method '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_jsonrpc_request() {
        let msg = Message::decode(
            r#"{"jsonrpc":"2.0","method":"agent/ping","params":{},"id":"req-1"}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), MessageKind::Request);
        assert_eq!(msg.method(), Some("agent/ping"));
        assert_eq!(msg.id(), Some("req-1"));
        assert_eq!(msg.form(), WireForm::JsonRpc);
    }

    #[test]
    fn test_classify_jsonrpc_notification() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"a":1}}"#)
            .unwrap();
        assert_eq!(msg.kind(), MessageKind::Notification);
        assert!(msg.id().is_none());
        assert_eq!(msg.params().unwrap()["a"], 1);
    }

    #[test]
    fn test_classify_jsonrpc_response_and_error() {
        let resp = Message::decode(r#"{"jsonrpc":"2.0","result":{"ok":true},"id":"r-2"}"#).unwrap();
        assert_eq!(resp.kind(), MessageKind::Response);
        assert_eq!(resp.id(), Some("r-2"));

        let err = Message::decode(
            r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"nope"},"id":"r-3"}"#,
        )
        .unwrap();
        match err {
            Message::Error { id, error, .. } => {
                assert_eq!(id.as_deref(), Some("r-3"));
                assert_eq!(error.code, METHOD_NOT_FOUND);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_numeric_id_accepted() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","result":null,"id":7}"#).unwrap();
        assert_eq!(msg.id(), Some("7"));
    }

    #[test]
    fn test_tagged_notification_keeps_payload_fields() {
        let msg = Message::decode(
            r#"{"type":"task_request","task_id":"t1","task_type":"search","payload":{"q":"x"},"timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), MessageKind::Notification);
        let params = msg.params().unwrap();
        assert_eq!(params["task_id"], "t1");
        assert_eq!(params["payload"]["q"], "x");
        assert!(params.get("timestamp").is_none());
        assert!(params.get("type").is_none());
    }

    #[test]
    fn test_tagged_request_and_response() {
        let req = Message::decode(r#"{"type":"status_request","request_id":"abc"}"#).unwrap();
        assert_eq!(req.kind(), MessageKind::Request);
        assert_eq!(req.id(), Some("abc"));

        let resp = Message::decode(r#"{"type":"response","request_id":"abc","result":5}"#).unwrap();
        assert_eq!(resp, Message::response("abc".into(), json!(5), WireForm::Tagged));
    }

    #[test]
    fn test_tagged_error_without_request_id_is_notification() {
        let msg = Message::decode(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::Notification);
        assert_eq!(msg.method(), Some("error"));
    }

    #[test]
    fn test_tagged_error_with_flat_fields() {
        let msg = Message::decode(r#"{"type":"error","request_id":"x","message":"boom"}"#).unwrap();
        match msg {
            Message::Error { error, .. } => {
                assert_eq!(error.code, INTERNAL_ERROR);
                assert_eq!(error.message, "boom");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_units_rejected() {
        assert!(matches!(Message::decode("not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(Message::decode("[1,2]"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(Message::decode(r#"{"hello":1}"#), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            Message::decode(r#"{"jsonrpc":"1.0","method":"x"}"#),
            Err(ProtocolError::UnsupportedVersion(_))
        ));
        assert!(Message::decode(r#"{"jsonrpc":"2.0","result":1}"#).is_err());
        assert!(Message::decode(r#"{"type":""}"#).is_err());
    }

    #[test]
    fn test_tagged_encoding_spreads_params_and_stamps_time() {
        let msg = Message::notification(
            "heartbeat",
            json!({"agent_id": "executor_1", "active_tasks": 2}),
            WireForm::Tagged,
        );
        let value = msg.to_value();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["agent_id"], "executor_1");
        assert!(value["timestamp"].as_str().is_some());
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn test_jsonrpc_error_encoding_uses_null_id() {
        let msg = Message::error(None, RpcError::new(-32700, "bad"), WireForm::JsonRpc);
        let value = msg.to_value();
        assert_eq!(value["jsonrpc"], "2.0");
        assert!(value["id"].is_null());
        assert_eq!(value["error"]["code"], -32700);
    }

    #[test]
    fn test_encode_decode_preserves_request() {
        let original = Message::request(
            "agent/ping",
            "id-9".into(),
            json!({"x": 1}),
            WireForm::JsonRpc,
        );
        let decoded = Message::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_protocol_method_aliases() {
        assert_eq!(ProtocolMethod::parse_name("agent/register"), Some(ProtocolMethod::AgentRegister));
        assert_eq!(ProtocolMethod::parse_name("agent_register"), Some(ProtocolMethod::AgentRegister));
        assert_eq!(ProtocolMethod::parse_name("agent/ping"), Some(ProtocolMethod::Ping));
        assert_eq!(ProtocolMethod::parse_name("nope"), None);
        assert_eq!(ProtocolMethod::TaskResult.as_str(), "task_result");
    }

    #[test]
    fn test_protocol_method_parses_through_from_str() {
        let method: ProtocolMethod = "task/execute".parse().unwrap();
        assert_eq!(method, ProtocolMethod::TaskRequest);
        assert_eq!(method.to_string(), "task_request");
        assert_eq!(
            "bogus".parse::<ProtocolMethod>().unwrap_err(),
            "unknown method 'bogus'"
        );
    }

    #[test]
    fn test_flat_tagged_response_keeps_its_fields_as_result() {
        let resp = Message::decode(
            r#"{"type":"response","request_id":"q1","agents":["a","b"],"count":2,"timestamp":"2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(resp.id(), Some("q1"));
        assert_eq!(
            resp,
            Message::response("q1".into(), json!({"agents": ["a", "b"], "count": 2}), WireForm::Tagged)
        );

        let bare = Message::decode(r#"{"type":"response","request_id":"q2"}"#).unwrap();
        assert_eq!(bare, Message::response("q2".into(), Value::Null, WireForm::Tagged));
    }
}
