//! JSON envelope encoding for node requests and responses
//!
//! A request travels as
//! `{"protocol":"1.0","method":"node.execute","id":"<uuid>","params":{..}}`
//! and a response as `{"protocol":"1.0","id":"<uuid>","result":..}` or
//! `{"protocol":"1.0","id":"<uuid>","error":{"code":..,"message":..}}`.
//! Unknown fields are rejected rather than ignored, at the top level and
//! inside `error`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Protocol tag spoken by this orchestrator
pub const PROTOCOL_VERSION: &str = "1.0";

/// Parameter bag carried by a request
pub type Params = Map<String, Value>;

/// Standard error codes carried in [`RpcError::code`]
pub mod codes {
    /// Request bytes were not a valid envelope
    pub const PARSE_ERROR: &str = "parse_error";
    /// Envelope was well formed but not a usable request
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// The node does not implement the method
    pub const METHOD_NOT_FOUND: &str = "method_not_found";
    /// Parameters were rejected by the node
    pub const INVALID_PARAMS: &str = "invalid_params";
    /// The node failed while handling the request
    pub const INTERNAL_ERROR: &str = "internal_error";
    /// The node's business logic reported a failure
    pub const EXECUTION_FAILED: &str = "execution_failed";
}

/// Errors produced while decoding an envelope
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Bytes were not a recognizable envelope
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Protocol tag has a different major version
    #[error("unsupported protocol version '{found}' (expected {expected})")]
    UnsupportedProtocolVersion {
        found: String,
        expected: &'static str,
    },

    /// Envelope has no usable correlation id
    #[error("envelope is missing its correlation id")]
    MissingCorrelationId,
}

/// Request sent from the orchestrator to a node
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub protocol: String,
    pub method: String,
    pub correlation_id: String,
    pub params: Params,
}

impl RpcRequest {
    /// Build a request with a fresh correlation id
    #[must_use]
    pub fn new(method: impl Into<String>, params: Params) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            method: method.into(),
            correlation_id: Uuid::new_v4().to_string(),
            params,
        }
    }
}

/// Error object returned by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    /// Create an error with an arbitrary code
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

/// Exactly one of a result or an error
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

/// Response sent from a node back to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub protocol: String,
    pub correlation_id: String,
    pub outcome: Outcome,
}

impl RpcResponse {
    /// Successful response to the request with `correlation_id`
    #[must_use]
    pub fn success(correlation_id: impl Into<String>, result: Value) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            correlation_id: correlation_id.into(),
            outcome: Outcome::Result(result),
        }
    }

    /// Error response to the request with `correlation_id`
    #[must_use]
    pub fn failure(correlation_id: impl Into<String>, error: RpcError) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            correlation_id: correlation_id.into(),
            outcome: Outcome::Error(error),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireRequest {
    protocol: Option<String>,
    method: Option<String>,
    id: Option<String>,
    #[serde(default)]
    params: Option<Params>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireResponse {
    protocol: Option<String>,
    id: Option<String>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireError {
    code: WireCode,
    message: String,
}

/// Nodes written against older protocol revisions send numeric codes
#[derive(Deserialize)]
#[serde(untagged)]
enum WireCode {
    Text(String),
    Number(i64),
}

impl From<WireError> for RpcError {
    fn from(wire: WireError) -> Self {
        let code = match wire.code {
            WireCode::Text(code) => code,
            WireCode::Number(code) => code.to_string(),
        };
        Self {
            code,
            message: wire.message,
        }
    }
}

/// Distinguish `"result": null` from an absent `result`
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Whether a protocol tag can be spoken by this orchestrator
///
/// Tags are compatible when their major version matches.
#[must_use]
pub fn is_compatible(tag: &str) -> bool {
    fn major(tag: &str) -> Option<u32> {
        tag.split('.').next()?.trim().parse().ok()
    }
    matches!((major(tag), major(PROTOCOL_VERSION)), (Some(a), Some(b)) if a == b)
}

/// Encode a request into its wire bytes
#[must_use]
pub fn encode(request: &RpcRequest) -> Vec<u8> {
    let mut envelope = Map::new();
    envelope.insert("protocol".into(), Value::String(request.protocol.clone()));
    envelope.insert("method".into(), Value::String(request.method.clone()));
    envelope.insert("id".into(), Value::String(request.correlation_id.clone()));
    envelope.insert("params".into(), Value::Object(request.params.clone()));
    Value::Object(envelope).to_string().into_bytes()
}

/// Decode a response from its wire bytes
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are not a well-formed response
/// envelope, carry an incompatible protocol tag, or lack a correlation id
pub fn decode(bytes: &[u8]) -> Result<RpcResponse, CodecError> {
    let wire: WireResponse = serde_json::from_slice(bytes)
        .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;

    let protocol = check_protocol(wire.protocol)?;
    let correlation_id = require_id(wire.id)?;

    let outcome = match (wire.result, wire.error) {
        (Some(result), None) => Outcome::Result(result),
        (None, Some(error)) => Outcome::Error(error.into()),
        (Some(_), Some(_)) => {
            return Err(CodecError::MalformedEnvelope(
                "response carries both result and error".to_string(),
            ));
        }
        (None, None) => {
            return Err(CodecError::MalformedEnvelope(
                "response carries neither result nor error".to_string(),
            ));
        }
    };

    Ok(RpcResponse {
        protocol,
        correlation_id,
        outcome,
    })
}

/// Encode a response into its wire bytes (node side)
#[must_use]
pub fn encode_response(response: &RpcResponse) -> Vec<u8> {
    let mut envelope = Map::new();
    envelope.insert("protocol".into(), Value::String(response.protocol.clone()));
    envelope.insert("id".into(), Value::String(response.correlation_id.clone()));
    match &response.outcome {
        Outcome::Result(result) => {
            envelope.insert("result".into(), result.clone());
        }
        Outcome::Error(error) => {
            let mut object = Map::new();
            object.insert("code".into(), Value::String(error.code.clone()));
            object.insert("message".into(), Value::String(error.message.clone()));
            envelope.insert("error".into(), Value::Object(object));
        }
    }
    Value::Object(envelope).to_string().into_bytes()
}

/// Decode a request from its wire bytes (node side)
///
/// # Errors
///
/// Returns [`CodecError`] under the same rules as [`decode`], plus
/// `MalformedEnvelope` when the method is missing or empty
pub fn decode_request(bytes: &[u8]) -> Result<RpcRequest, CodecError> {
    let wire: WireRequest = serde_json::from_slice(bytes)
        .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;

    let protocol = check_protocol(wire.protocol)?;
    let correlation_id = require_id(wire.id)?;
    let method = wire
        .method
        .filter(|m| !m.is_empty())
        .ok_or_else(|| CodecError::MalformedEnvelope("request has no method".to_string()))?;

    Ok(RpcRequest {
        protocol,
        method,
        correlation_id,
        params: wire.params.unwrap_or_default(),
    })
}

fn check_protocol(tag: Option<String>) -> Result<String, CodecError> {
    let tag = tag
        .ok_or_else(|| CodecError::MalformedEnvelope("envelope has no protocol tag".to_string()))?;
    if is_compatible(&tag) {
        Ok(tag)
    } else {
        Err(CodecError::UnsupportedProtocolVersion {
            found: tag,
            expected: PROTOCOL_VERSION,
        })
    }
}

fn require_id(id: Option<String>) -> Result<String, CodecError> {
    id.filter(|id| !id.is_empty())
        .ok_or(CodecError::MissingCorrelationId)
}
