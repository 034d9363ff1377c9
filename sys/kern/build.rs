use std::env;

fn main() {
    println!("cargo:rerun-if-changed=link.ld");

    // The linker script only applies to the real kernel image; hosted
    // builds (tests) link like any other program.
    let target = env::var("TARGET").unwrap_or_default();
    if target.starts_with("riscv32") {
        let dir = env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{dir}/link.ld");
    }
}
