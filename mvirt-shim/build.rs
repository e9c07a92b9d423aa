fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Without the transport client: its `connect` constructor clashes with
    // the `Connect` RPC.
    tonic_build::configure()
        .build_transport(false)
        .compile_protos(&["proto/shim.proto"], &["proto"])?;
    Ok(())
}
