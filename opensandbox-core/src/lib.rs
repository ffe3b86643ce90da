//! Core orchestration primitives shared by the control plane and worker
//! processes: metadata, checkpoints, worker registry, the wire protocol,
//! the idle-timeout router, the sandbox runtime, PTY sessions, heartbeats,
//! lifecycle orchestration, and the HTTP/gRPC surfaces built on top.

pub mod api;
pub mod cdn;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod grpc;
pub mod heartbeat;
pub mod lifecycle;
pub mod metadata;
pub mod metrics;
pub mod proto;
pub mod proxy;
pub mod pty;
pub mod pty_bridge;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod token;
pub mod util;

pub use error::OpenSandboxError;
pub use runtime::{CreateSandboxParams, ExecResult, SandboxRuntime, SandboxStats};
