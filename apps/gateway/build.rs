fn main() {
    println!("cargo:rerun-if-changed=proto/botgate.proto");
    #[cfg(feature = "grpc")]
    tonic_build::compile_protos("proto/botgate.proto").expect("compile botgate.proto");
}
