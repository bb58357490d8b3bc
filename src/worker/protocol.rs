//! Worker wire protocol.
//!
//! Every message is one JSON object per line.
//!
//! | Direction       | Shape                                             |
//! |-----------------|---------------------------------------------------|
//! | broker → worker | `{"id", "method", "params"}`                      |
//! | worker → broker | `{"id", "result"}` or `{"id", "error": {..}}`     |
//!
//! | Method            | Params                      | Result             |
//! |-------------------|-----------------------------|--------------------|
//! | `sdk/load`        | [`LoadRequest`]             | [`SandboxedSdk`]   |
//! | `sdk/unload`      | [`UnloadParams`]            | *(ignored)*        |
//! | `surface/request` | [`SurfaceRequestParams`]    | [`SurfacePackage`] |
//! | `data/sync`       | [`ClientDataUpdate`]        | *(ignored)*        |
//!
//! [`LoadRequest`]: crate::models::sdk::LoadRequest
//! [`ClientDataUpdate`]: crate::models::sdk::ClientDataUpdate
//! [`SandboxedSdk`]: crate::models::sdk::SandboxedSdk
//! [`SurfacePackage`]: crate::models::sdk::SurfacePackage

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::sdk::SurfaceParams;
use crate::sandbox::WorkerError;
use crate::{AppError, Result};

/// Load an sdk.
pub const METHOD_LOAD: &str = "sdk/load";

/// Unload an sdk.
pub const METHOD_UNLOAD: &str = "sdk/unload";

/// Request a surface package from a loaded sdk.
pub const METHOD_SURFACE: &str = "surface/request";

/// Push client data to the worker.
pub const METHOD_SYNC: &str = "data/sync";

#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    id: &'a str,
    method: &'a str,
    params: &'a Value,
}

/// Response line from the worker.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    /// Id of the request answered.
    pub id: String,
    /// Success payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure payload; wins over `result` when both are present.
    #[serde(default)]
    pub error: Option<WorkerError>,
}

impl ResponseEnvelope {
    /// Success value or worker error. A response with neither is `null`.
    ///
    /// # Errors
    ///
    /// Returns the worker's error payload when present.
    pub fn into_outcome(self) -> std::result::Result<Value, WorkerError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Params of `sdk/unload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnloadParams {
    /// Sdk to unload.
    pub sdk_name: String,
}

/// Params of `surface/request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurfaceRequestParams {
    /// Sdk asked for the surface.
    pub sdk_name: String,
    /// Surface parameters.
    pub surface: SurfaceParams,
}

/// Serialize one request line, without the trailing newline.
///
/// # Errors
///
/// Returns `AppError::Protocol` if serialization fails.
pub fn encode_request(id: &str, method: &str, params: &Value) -> Result<String> {
    serde_json::to_string(&RequestEnvelope { id, method, params })
        .map_err(|e| AppError::Protocol(format!("failed to serialise request: {e}")))
}

/// Parse one inbound line.
///
/// Blank lines yield `Ok(None)`.
///
/// # Errors
///
/// Returns `AppError::Protocol("malformed response: ..")` for anything that
/// is not a response envelope.
pub fn parse_response_line(line: &str) -> Result<Option<ResponseEnvelope>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| AppError::Protocol(format!("malformed response: {e}")))
}
