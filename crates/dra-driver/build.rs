fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/dra_controller.proto"], &["proto"])?;

    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile_protos(
            &["proto/dra_node.proto", "proto/plugin_registration.proto"],
            &["proto"],
        )?;
    Ok(())
}
