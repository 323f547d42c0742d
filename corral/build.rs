use std::io::Result;
use std::path::PathBuf;

fn main() -> Result<()> {
    // `Cargo.toml` lives at the workspace root, but `build.rs` and
    // `wire.proto` live alongside the rest of the crate's sources in
    // `corral/`, so `CARGO_MANIFEST_DIR` (the Cargo.toml directory) needs
    // one more path segment to reach the proto file.
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let src_dir = manifest_dir.join("corral");
    let proto_path = src_dir.join("wire.proto");

    println!("cargo:rerun-if-changed={}", proto_path.display());

    prost_build::Config::new()
        .compile_protos(&[proto_path], &[&src_dir])?;

    Ok(())
}
