//! Build script for the Corvid kernel
//!
//! Передаёт линкеру скрипт раскладки образа только при сборке под голое железо.
//! Passes the image layout script to the linker only for the bare-metal target.

use std::env;

fn main() {
    let target = env::var("TARGET").unwrap_or_default();

    println!("cargo:rerun-if-changed=src/arch/riscv64/linker.ld");

    if target.starts_with("riscv64") && target.contains("none") {
        let dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| String::from("."));
        println!("cargo:rustc-link-arg-bins=-T{}/src/arch/riscv64/linker.ld", dir);
        println!("cargo:rustc-link-arg-bins=--gc-sections");
    }
}
