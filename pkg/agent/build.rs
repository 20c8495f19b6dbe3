fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(false)
        .compile_protos(
            &[
                "proto/runtime/v1/api.proto",
                "proto/runtime/v1alpha2/api.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
