use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    // Put memory.x on the linker search path for the Cortex-M target.
    let target = env::var("TARGET").unwrap_or_default();
    if target.starts_with("thumbv") {
        let out = PathBuf::from(env::var("OUT_DIR").unwrap());
        fs::copy("memory.x", out.join("memory.x")).unwrap();
        println!("cargo:rustc-link-search={}", out.display());
        println!("cargo:rerun-if-changed=memory.x");
    }
    println!("cargo:rerun-if-changed=src/");
}
