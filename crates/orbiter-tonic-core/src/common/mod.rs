//! Shared protocol types for the orbiter gRPC services.
//!
//! ## Submodules
//!
//! - [`error`] - Service error type and its mapping to `tonic::Status`.
//! - [`wire`] - Encoding of engine outcomes and batches into protobuf
//!   messages.
//! - [`proto`] - Generated messages, clients and servers.

pub mod error;
pub use error::{Error, Result};
pub mod wire;
pub mod proto {
    tonic::include_proto!("orbiter");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("orbiter_descriptor");
}
