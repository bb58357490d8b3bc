//! Sdk load, storage, and surface-package value types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque key/value parameters passed through to the sdk.
pub type Bundle = serde_json::Map<String, serde_json::Value>;

/// Provider details resolved for an sdk the caller depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SdkProviderInfo {
    /// Sdk library name.
    pub sdk_name: String,
    /// Package that declares the sdk library.
    pub declaring_package: String,
    /// Entry point class the worker instantiates.
    pub provider_class: String,
}

/// Credential-encrypted and device-encrypted data directories for one sdk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StorageDirs {
    /// Credential-encrypted directory.
    pub ce: PathBuf,
    /// Device-encrypted directory.
    pub de: PathBuf,
}

/// Payload of a remote load call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct LoadRequest {
    /// Package name of the calling application.
    pub caller_package: String,
    /// Resolved provider for the sdk.
    pub provider: SdkProviderInfo,
    /// Data directories prepared for the sdk.
    pub storage: StorageDirs,
    /// Caller-supplied load parameters.
    #[serde(default)]
    pub params: Bundle,
}

/// Caller-visible handle to a loaded sdk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SandboxedSdk {
    /// Sdk library name.
    pub sdk_name: String,
    /// Identifier of the interface the sdk exposes to the caller.
    pub interface_id: String,
}

/// Parameters of a surface-package request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SurfaceParams {
    /// Token of the window hosting the surface.
    pub host_token: String,
    /// Display the surface is rendered on.
    pub display_id: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Extra parameters for the sdk.
    #[serde(default)]
    pub params: Bundle,
}

/// Client-side data pushed into the caller's worker.
///
/// Keys listed in `keys` but absent from `data` are removed on the worker
/// side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ClientDataUpdate {
    /// Keys this update covers.
    pub keys: Vec<String>,
    /// Current values of the covered keys.
    #[serde(default)]
    pub data: Bundle,
}

/// Renderable surface handle produced by a loaded sdk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SurfacePackage {
    /// Worker-assigned surface identifier.
    pub surface_package_id: i32,
    /// Extra values returned by the sdk.
    #[serde(default)]
    pub params: Bundle,
}
