//! Hosted stand-in for the architecture layer.
//!
//! This compiles on any target that isn't the real kernel target and exists
//! so the portable subsystems -- the frame allocator, the page-table code,
//! IPC, scheduling bookkeeping -- can run under the standard test harness.
//! Physical memory is simulated by a large static array addressed at the
//! same base the real machine uses, so code that walks page tables through
//! the physical window runs here unmodified.
//!
//! Nothing here ever switches a context or takes a trap; tests drive the
//! state machines directly instead.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{PageAttrs, PAGE_SIZE};

use crate::task::TaskEntry;
use crate::{Paddr, Vaddr};

macro_rules! klog {
    ($s:expr) => { println!(concat!("[kernel] ", $s)) };
    ($s:expr, $($tt:tt)*) => { println!(concat!("[kernel] ", $s), $($tt)*) };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Where the simulated physical memory window starts. Matches the real
/// machine so physical addresses look plausible in test failures.
pub const RAM_BASE: Paddr = 0x8000_0000;

/// How much simulated physical memory exists. Tests carve disjoint regions
/// out of this with `alloc_phys_region` and never give them back, so this
/// is sized for the whole suite. It sits in BSS; the host only faults in
/// the pages actually touched.
const RAM_BYTES: usize = 512 * 1024 * 1024;

#[repr(align(4096))]
struct FakeRam(UnsafeCell<[u8; RAM_BYTES]>);

// Safety: tests get non-overlapping regions from `alloc_phys_region`, so
// concurrent test threads never alias each other's slice of the array.
unsafe impl Sync for FakeRam {}

static RAM: FakeRam = FakeRam(UnsafeCell::new([0; RAM_BYTES]));

static NEXT_REGION: AtomicUsize = AtomicUsize::new(0);

/// Hands out a fresh page-aligned region of simulated physical memory.
/// Regions are never reused, which keeps concurrently running tests from
/// stepping on each other.
pub fn alloc_phys_region(bytes: usize) -> Paddr {
    let bytes = bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let off = NEXT_REGION.fetch_add(bytes, Ordering::SeqCst);
    assert!(
        off + bytes <= RAM_BYTES,
        "simulated RAM exhausted; raise RAM_BYTES"
    );
    RAM_BASE + off as u32
}

/// Translates a physical address into a kernel-dereferenceable pointer.
pub fn paddr_to_vaddr(paddr: Paddr) -> *mut u8 {
    assert!(
        paddr >= RAM_BASE && ((paddr - RAM_BASE) as usize) < RAM_BYTES,
        "paddr {paddr:#x} outside simulated RAM"
    );
    // Safety: in-bounds offset within the static array.
    unsafe { (RAM.0.get() as *mut u8).add((paddr - RAM_BASE) as usize) }
}

pub fn cpu_id() -> usize {
    0
}

/// Local TLB invalidation. There is no TLB here.
pub fn fence_tlb_local() {}

/// Rings a peer CPU's software interrupt. No peer ever comes online in a
/// hosted build, so this is unreachable in practice.
pub fn send_soft_irq(_hart: usize) {}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// Prepares the initial kernel-stack image for a new task. The hosted
/// harness never runs a task, so the only meaningful part is returning a
/// plausible initial stack pointer.
pub fn init_task_context(kstack_top: Paddr, _entry: &TaskEntry) -> u32 {
    kstack_top
}

/// Stackful context switch. Hosted tests drive the scheduler's bookkeeping
/// only; control just falls through to the caller, which test code treats
/// as "the task was eventually resumed".
pub unsafe fn switch_context(_prev_sp: *mut u32, _next_sp: u32) {}

/// Installs `root` as the active page table. Nothing to do without an MMU.
pub fn activate_vm(_root: Paddr) {}

/// Publishes the kernel stack top used by the trap entry path.
pub fn set_kernel_sp(_sp_top: Vaddr) {}

/// Regions the kernel template page table must map. The hosted kernel
/// image doesn't live in the simulated RAM, so there are none.
pub fn kernel_image_regions() -> heapless::Vec<(Paddr, usize, PageAttrs), 8> {
    heapless::Vec::new()
}

pub fn irq_enable(_irq: usize) {}

pub fn irq_disable(_irq: usize) {}

/// Idle-loop body: release the lock, wait, take it back. There are no
/// interrupts to wait for here.
pub fn idle() {
    core::hint::spin_loop();
}

/// Per-CPU hardware bring-up (timers, interrupt enables). Nothing to do.
pub fn init_percpu() {}

/// Program counter of the interrupted user context, for page-fault
/// reporting. There is no user context here.
pub fn user_trap_pc() -> u32 {
    0
}

pub fn console_write_byte(b: u8) {
    use std::io::Write;
    let _ = std::io::stdout().write_all(&[b]);
}

/// Non-blocking console read, drained by the receive interrupt on the real
/// machine. Tests inject console bytes directly instead.
pub fn console_read_byte() -> Option<u8> {
    None
}

pub fn shutdown() -> ! {
    panic!("shutdown requested");
}
