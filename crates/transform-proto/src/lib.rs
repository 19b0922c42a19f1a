//! Generated prost types and tonic service stubs for the `gst_transformer.v1`
//! API. Kept as its own crate so the engine and server crates never need to
//! depend on `tonic-build` directly, mirroring how `re_grpc_proto` separates
//! generated gRPC bindings from the daemon that serves them.

tonic::include_proto!("gst_transformer.v1");
