use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let protoc = protoc_bin_vendored::protoc_bin_path()?;
  std::env::set_var("PROTOC", protoc);

  let proto_root = PathBuf::from("../../proto");
  let includes = [
    proto_root.clone(),
    protoc_bin_vendored::include_path()?,
  ];

  tonic_build::configure()
    .build_server(true)
    .build_client(true)
    .compile_protos(&[proto_root.join("csi.proto")], &includes)?;

  println!("cargo:rerun-if-changed=../../proto/csi.proto");
  Ok(())
}
