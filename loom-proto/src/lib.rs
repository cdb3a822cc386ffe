//! Generated protobuf/gRPC types for the bridge wire protocol (`loom.v1`).
//!
//! This crate carries no logic of its own: it is the shared contract between
//! an agent's [`loom_core`](https://docs.rs/loom-core) transport layer and the
//! bridge broker (out of tree). Regenerated from `proto/*.proto` by `build.rs`.

#![allow(clippy::all)]

tonic::include_proto!("loom.v1");
