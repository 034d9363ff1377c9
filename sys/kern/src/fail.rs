//! Kernel failure handling.
//!
//! A panic is a kernel bug, tier three of the error model: no recovery, no
//! exception message, just diagnostics and a dead machine. The panicking
//! CPU forcibly takes the big kernel lock so its output isn't interleaved
//! with anything else, records the failure reason in a buffer debuggers
//! can find by symbol, prints it to the console, and publishes the halted
//! lock state so the other CPUs park themselves.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`, cleared at boot and set on the way
//!   down.
//! - `KERNEL_EPITAPH` is a NUL-padded UTF-8 buffer holding as much of the
//!   panic message as fits.

use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::mp;

#[no_mangle]
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

const EPITAPH_LEN: usize = 128;

#[no_mangle]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = core::mem::take(&mut self.dest).split_at_mut(n);
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

/// Records the failure and halts every CPU. Never returns.
pub fn die(msg: core::fmt::Arguments<'_>) -> ! {
    let recursed = KERNEL_HAS_FAILED.swap(true, Ordering::SeqCst);
    if recursed {
        // Panicked while panicking. Nothing useful left to record; just
        // stop making it worse.
        mp::halt();
    }

    // Take the lock by force: whoever held it isn't getting anything done
    // anymore, and the console is ours now.
    mp::force_lock();

    // Safety: the flag above guarantees a single writer, ever.
    let buf = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) };
    let mut writer = Eulogist { dest: buf };
    let _ = write!(writer, "{msg}");

    klog!("KERNEL PANIC: {}", msg);
    mp::halt();
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(format_args!("{info}"))
}
