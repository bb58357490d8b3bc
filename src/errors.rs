//! Error types shared across the broker.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared broker result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Broker error enumeration covering configuration, transport, and every
/// failure a caller can observe on a load, unload, or surface request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Malformed message on the worker wire protocol.
    Protocol(String),
    /// Claimed package does not belong to the claimed uid.
    CallerMismatch(String),
    /// Overlapping load, duplicate load, or unload while a load is pending.
    SessionConflict(String),
    /// Requested sdk is not a valid dependency of the caller.
    SdkNotFound(String),
    /// Worker process is absent or died.
    ProcessUnavailable(String),
    /// The sandbox kill switch is engaged.
    SandboxDisabled(String),
    /// Surface requested from an sdk that is not loaded.
    SurfacePackageNotLoaded(String),
    /// Transport failure talking to the worker that is not attributable to death.
    RemoteInvocation(String),
    /// Error raised by the sdk itself during initialization.
    SdkDefined(String),
    /// Unexpected failure anywhere in the pipeline.
    Internal(String),
}

/// Error codes surfaced to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Identity verification failed.
    CallerMismatch,
    /// Already loaded or already loading.
    SessionConflict,
    /// Sdk is not a dependency of the caller.
    SdkNotFound,
    /// Worker process unavailable.
    ProcessUnavailable,
    /// Sandbox disabled by kill switch.
    SandboxDisabled,
    /// Surface requested for an sdk that is not loaded.
    SurfacePackageNotLoaded,
    /// Sdk-defined initialization error.
    SdkDefinedError,
    /// Anything else.
    InternalError,
}

impl AppError {
    /// Caller-visible code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CallerMismatch(_) => ErrorCode::CallerMismatch,
            Self::SessionConflict(_) => ErrorCode::SessionConflict,
            Self::SdkNotFound(_) => ErrorCode::SdkNotFound,
            Self::ProcessUnavailable(_) => ErrorCode::ProcessUnavailable,
            Self::SandboxDisabled(_) => ErrorCode::SandboxDisabled,
            Self::SurfacePackageNotLoaded(_) => ErrorCode::SurfacePackageNotLoaded,
            Self::SdkDefined(_) => ErrorCode::SdkDefinedError,
            Self::Config(_)
            | Self::Io(_)
            | Self::Protocol(_)
            | Self::RemoteInvocation(_)
            | Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::CallerMismatch(msg) => write!(f, "caller mismatch: {msg}"),
            Self::SessionConflict(msg) => write!(f, "session conflict: {msg}"),
            Self::SdkNotFound(msg) => write!(f, "sdk not found: {msg}"),
            Self::ProcessUnavailable(msg) => write!(f, "process unavailable: {msg}"),
            Self::SandboxDisabled(msg) => write!(f, "sandbox disabled: {msg}"),
            Self::SurfacePackageNotLoaded(msg) => write!(f, "surface package not loaded: {msg}"),
            Self::RemoteInvocation(msg) => write!(f, "remote invocation: {msg}"),
            Self::SdkDefined(msg) => write!(f, "sdk defined: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
