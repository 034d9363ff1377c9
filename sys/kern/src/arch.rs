//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names. The real kernel target is 32-bit RISC-V; every other target
//! gets the `hosted` stub so the portable subsystems can run under the
//! standard test harness.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv32")] {
        #[macro_use]
        pub mod rv32;
        pub use rv32::*;
    } else {
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    }
}
