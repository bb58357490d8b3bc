//! Worker processes reached over NDJSON stdio.
//!
//! One worker process runs per caller. The broker talks to it through
//! [`client::WorkerClient`]: requests go out as single JSON lines on the
//! worker's stdin, responses come back on its stdout.
//!
//! Submodules:
//! - `codec`: NDJSON framing for worker stdio.
//! - `protocol`: request/response envelopes and method names.
//! - `client`: request correlation plus the reader and writer tasks.
//! - `spawner`: process launch with environment isolation and exit monitoring.
//! - `supervisor`: [`ChildProcessSupervisor`], the
//!   [`ProcessSupervisor`](crate::sandbox::ProcessSupervisor) implementation.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod spawner;
pub mod supervisor;

pub use supervisor::ChildProcessSupervisor;
