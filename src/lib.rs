#![forbid(unsafe_code)]

//! Load-session state machine and per-caller worker connection broker for
//! sandboxed sdks.
//!
//! [`SandboxLifecycleCoordinator`] is the entry point. It accepts load,
//! unload, and surface requests on behalf of verified callers, multiplexes
//! them onto one worker process per caller, and cleans up when either the
//! caller or the worker dies.

pub mod callback;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod packages;
pub mod sandbox;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use config::BrokerConfig;
pub use errors::{AppError, ErrorCode, Result};
pub use sandbox::coordinator::SandboxLifecycleCoordinator;
