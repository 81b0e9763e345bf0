fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the vendored protoc binary when the system doesn't have
    // one on PATH (e.g. minimal containers without protobuf-compiler).
    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }

    // Generate tonic client/server bindings for the trustplane-owned protos.
    // Output lands in OUT_DIR and is pulled in by `src/proto.rs`.
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        // The ControlPlane service has an RPC named `Connect`, which collides
        // with the transport convenience constructor tonic would otherwise
        // generate as `ControlPlaneClient::connect(dst)`. Nothing in this
        // crate uses that constructor (clients are built via `Client::new`),
        // so disable it to avoid the name clash.
        .build_transport(false)
        .compile_protos(&["proto/trustplane/v1/trustplane.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/trustplane/v1/trustplane.proto");
    Ok(())
}
