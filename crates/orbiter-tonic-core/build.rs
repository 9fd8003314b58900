/// Builds the gRPC client and server code for `orbiter.proto`.
///
/// Generated modules land in `OUT_DIR` together with a file descriptor set
/// (`orbiter_descriptor.bin`) that the server hands to `tonic-reflection`.
///
/// # Panics
///
/// Panics if code generation fails.
///
/// # Output
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("orbiter");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("orbiter_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/orbiter.proto"], &["proto"])
        .unwrap();
}
