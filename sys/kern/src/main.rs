//! The kernel image. Everything real lives in the library crate; this
//! target exists so there is an ELF for the boot loader, entered at the
//! architecture layer's `_start`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate tarn_kern;

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel doesn't run hosted; build it for a riscv32 target.
}
