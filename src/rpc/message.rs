//! JSON-RPC 2.0 message envelopes exchanged with the language server

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version stamped on every outbound message
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error code for an unsupported method
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Request id; the client only issues numbers, servers may use strings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

/// Request envelope: `{id, method, params}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Notification envelope: `{method, params}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Error object carried by a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("Method '{}' not supported by client", method),
            data: None,
        }
    }
}

/// Response envelope: `{id, result | error}`
///
/// `id` is null only when the server could not read the id of the request
/// it is answering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: ResponseError) -> Self {
        Self {
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    /// Converts the envelope into the call outcome. A missing result is `null`.
    pub fn into_result(self) -> Result<Value, ResponseError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// One framed protocol unit
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.to_string(),
            params,
        })
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.to_string(),
            params,
        })
    }

    /// Classifies a decoded JSON value.
    ///
    /// `method` + `id` is a request, `method` alone a notification, anything
    /// else a response.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        match (has_method, has_id) {
            (true, true) => serde_json::from_value(value).map(Message::Request),
            (true, false) => serde_json::from_value(value).map(Message::Notification),
            (false, _) => serde_json::from_value(value).map(Message::Response),
        }
    }

    /// Serializes the message with the `jsonrpc` version member.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut value = match self {
            Message::Request(request) => serde_json::to_value(request)?,
            Message::Response(response) => serde_json::to_value(response)?,
            Message::Notification(notification) => serde_json::to_value(notification)?,
        };

        if let Value::Object(map) = &mut value {
            map.insert(
                "jsonrpc".to_string(),
                Value::String(JSONRPC_VERSION.to_string()),
            );
        }

        Ok(value)
    }

    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }
}
