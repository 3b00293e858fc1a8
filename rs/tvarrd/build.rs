fn main() {
    println!("cargo:rerun-if-changed=proto/fleet.proto");

    // tvarrd is a fleet worker: it calls the coordinator, it never serves the
    // Fleet service, so only the client stub is generated.
    tonic_build::configure()
        .build_client(true)
        .build_server(false)
        .compile(&["proto/fleet.proto"], &["proto"])
        .expect("failed to compile proto files");
}
