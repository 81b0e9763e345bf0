//! Generated gRPC bindings for the trustplane wire surface.
//!
//! The .proto sources live under `proto/trustplane/v1` and are compiled by
//! `build.rs` with `tonic-prost-build`.

#[allow(clippy::all)]
pub mod v1 {
    tonic::include_proto!("trustplane.v1");
}
