fn main() {
    prost_build::compile_protos(&["proto/rc.proto"], &["proto/"]).expect("failed to compile rc.proto");
}
