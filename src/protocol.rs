//! JSON wire format
//!
//! Requests are [`MiningRequest`] objects. Responses are an externally tagged
//! union: `{"Ok": {...}}` or `{"Err": "..."}`.

use crate::{Error, MiningRequest, MiningResult, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Mined event
    Ok(MiningResult),
    /// Human-readable failure
    Err(String),
}

impl Response {
    /// Error frame for `err`
    pub fn from_error(err: &Error) -> Self {
        Response::Err(err.to_string())
    }
}

impl From<Result<MiningResult>> for Response {
    fn from(result: Result<MiningResult>) -> Self {
        match result {
            Ok(result) => Response::Ok(result),
            Err(err) => Response::from_error(&err),
        }
    }
}

/// Decode a request frame; any failure is an invalid request
pub fn decode_request(text: &str) -> Result<MiningRequest> {
    serde_json::from_str(text).map_err(|e| Error::invalid_request(e.to_string()))
}

/// Encode a response frame.
///
/// Falls back to an internal error frame if the response cannot be
/// serialized.
pub fn encode_response(response: &Response) -> String {
    match serde_json::to_string(response) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode response: {}", e);
            let fallback = Response::from_error(&Error::internal("failed to encode response"));
            serde_json::to_string(&fallback)
                .unwrap_or_else(|_| r#"{"Err":"Internal error"}"#.to_string())
        }
    }
}

/// Decode a response frame
pub fn decode_response(text: &str) -> Result<Response> {
    Ok(serde_json::from_str(text)?)
}
