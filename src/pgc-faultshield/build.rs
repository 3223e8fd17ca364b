fn main() {
    cc::Build::new()
        .file("src/shim.c")
        .compile("pgc_faultshield_shim");
    println!("cargo:rerun-if-changed=src/shim.c");
}
