use std::error::Error;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("inference.bin");

    tonic_build::configure()
        .build_server(false)
        .file_descriptor_set_path(&descriptor_path)
        .compile_protos(&["proto/grpc_service.proto"], &["proto"])?;
    Ok(())
}
