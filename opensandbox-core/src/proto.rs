//! Generated gRPC types and service traits for the CP↔worker control
//! channel. Compiled from `proto/opensandbox.proto` by
//! `build.rs` via `tonic-build`.

tonic::include_proto!("opensandbox.v1");
