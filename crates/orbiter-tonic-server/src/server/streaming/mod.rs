//! Forwarding of engine batches onto gRPC response streams.

pub mod coordinator;
