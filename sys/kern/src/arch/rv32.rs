//! Architecture support for 32-bit RISC-V (Sv32, S-mode kernel).
//!
//! # Boot
//!
//! Every hart enters `_start` in M-mode. Hart 0 clears `.bss` and brings
//! up the UART; the others spin until it is done. Each hart then delegates
//! traps to S-mode, opens up physical memory in the PMP, points `mtvec` at
//! the tiny M-mode timer trampoline, and `mret`s into the S-mode setup
//! path, which takes the big kernel lock and enters the portable boot code.
//!
//! # Traps
//!
//! `stvec` points at `_trap_entry`, which saves the interrupted context
//! into a trap frame at the top of the current task's kernel stack,
//! switches to that stack, and calls [`rv32_handle_trap`]. Because the
//! kernel never enables interrupts outside the idle loop's `wfi` window and
//! user copies are translation-checked rather than fault-recovered, the
//! only traps taken from S-mode are interrupts landing in that window.
//!
//! # Timer
//!
//! The machine timer can only be programmed from M-mode, so `mtvec` keeps
//! a trampoline that bumps `mtimecmp` and injects a supervisor software
//! interrupt. The S-mode handler then derives elapsed ticks from `mtime`.
//! IPIs arrive through the same interrupt, raised by peers via the ACLINT
//! SSWI doorbell; the pending-reason word distinguishes the two.

use core::arch::{asm, global_asm};
use core::mem::offset_of;

use abi::PageAttrs;

use riscv::register::{mepc, satp, scause, sepc, sstatus, stval, stvec};

use crate::config::{KERNEL_STACK_SIZE, NUM_CPUS_MAX, UART0_IRQ, VIRTIO_BLK_PADDR, VIRTIO_NET_PADDR};
use crate::interrupt;
use crate::mp::{self, IpiReason};
use crate::startup::{self, BootInfo, MemRegion};
use crate::syscalls::{self, SyscallArgs};
use crate::task::{self, TaskEntry};
use crate::vm;
use crate::{Paddr, Vaddr};

macro_rules! klog {
    ($s:expr) => {
        $crate::arch::rv32::console_write_fmt(format_args!(concat!($s, "\n")))
    };
    ($s:expr, $($tt:tt)*) => {
        $crate::arch::rv32::console_write_fmt(format_args!(concat!($s, "\n"), $($tt)*))
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

// Memory map of the QEMU virt machine.
const UART0_PADDR: Paddr = 0x1000_0000;
const CLINT_PADDR: Paddr = 0x0200_0000;
const CLINT_SIZE: usize = 0x1_0000;
const CLINT_MTIME: Paddr = CLINT_PADDR + 0xbff8;
const CLINT_MTIMECMP_BASE: Paddr = CLINT_PADDR + 0x4000;
const ACLINT_SSWI_PADDR: Paddr = 0x02f0_0000;
const PLIC_PADDR: Paddr = 0x0c00_0000;
const PLIC_SIZE: usize = 0x21_0000;
const SIFIVE_TEST_PADDR: Paddr = 0x10_0000;

/// Machine-timer counts per kernel tick (the timebase runs at 10 MHz and
/// `TICK_HZ` is 1000).
const MTIME_PER_TICK: u32 = 10_000;

// scause values we care about (high bit set = interrupt).
const SCAUSE_S_SOFT_INTR: u32 = 0x8000_0001;
const SCAUSE_S_EXT_INTR: u32 = 0x8000_0009;
const SCAUSE_INST_MISALIGN: u32 = 0;
const SCAUSE_INST_ACCESS_FAULT: u32 = 1;
const SCAUSE_ILLEGAL_INST: u32 = 2;
const SCAUSE_BREAKPOINT: u32 = 3;
const SCAUSE_LOAD_ACCESS_FAULT: u32 = 5;
const SCAUSE_AMO_MISALIGN: u32 = 6;
const SCAUSE_STORE_ACCESS_FAULT: u32 = 7;
const SCAUSE_ENV_CALL: u32 = 8;
const SCAUSE_INST_PAGE_FAULT: u32 = 12;
const SCAUSE_LOAD_PAGE_FAULT: u32 = 13;
const SCAUSE_STORE_PAGE_FAULT: u32 = 15;

const SSTATUS_SPP: u32 = 1 << 8;
const SSTATUS_SPIE: u32 = 1 << 5;
const SIP_SSIP: u32 = 1 << 1;

/// Pattern written at the bottom word of every kernel stack; `stack_check`
/// panics if it ever changes.
const STACK_CANARY: u32 = 0xdead_ca71;

/// Boot stacks are roomier than task kernel stacks: early boot builds the
/// whole kernel-state value on one before moving it into place.
const BOOT_STACK_SIZE: usize = 2 * KERNEL_STACK_SIZE;

/// Per-hart architecture state. `tp` and `sscratch` both point at this
/// hart's entry in kernel mode; `mscratch` points at it permanently for
/// the M-mode timer trampoline.
///
/// The first few fields are at fixed offsets consumed by the assembly
/// below via `offset_of!`-derived constants.
#[repr(C)]
pub struct HartLocal {
    /// Trap-entry scratch slot.
    scratch: u32,
    /// Kernel stack top of the running task; trap frames are built just
    /// below this.
    sp_top: u32,
    /// This hart's id.
    id: u32,
    /// M-mode trampoline scratch (t1-t4).
    mscratch: [u32; 4],
    /// Physical address of this hart's `mtimecmp` register.
    mtimecmp: u32,
    /// `mtime` delta between timer interrupts.
    interval: u32,
    /// `mtime` value at the last tick accounting, for elapsed-tick math.
    last_mtime: u32,
    /// Currently live trap frame, for fault reporting; null outside traps.
    trap_frame: *mut TrapFrame,
}

const HART_SCRATCH: usize = offset_of!(HartLocal, scratch);
const HART_SP_TOP: usize = offset_of!(HartLocal, sp_top);
const HART_MSCRATCH: usize = offset_of!(HartLocal, mscratch);
const HART_MTIMECMP: usize = offset_of!(HartLocal, mtimecmp);
const HART_INTERVAL: usize = offset_of!(HartLocal, interval);

static mut HARTS: [HartLocal; NUM_CPUS_MAX] = [const {
    HartLocal {
        scratch: 0,
        sp_top: 0,
        id: 0,
        mscratch: [0; 4],
        mtimecmp: 0,
        interval: 0,
        last_mtime: 0,
        trap_frame: core::ptr::null_mut(),
    }
}; NUM_CPUS_MAX];

fn hart_local() -> *mut HartLocal {
    let tp: u32;
    // Safety: reading a register.
    unsafe {
        asm!("mv {}, tp", out(reg) tp, options(nomem, nostack, preserves_flags));
    }
    tp as *mut HartLocal
}

pub fn cpu_id() -> usize {
    // Safety: tp points at this hart's HartLocal for the whole kernel.
    unsafe { (*hart_local()).id as usize }
}

/// Physical memory is identity-mapped in the kernel half of every address
/// space, so the "window" is the address itself.
pub fn paddr_to_vaddr(paddr: Paddr) -> *mut u8 {
    paddr as *mut u8
}

/// Saved context of an interrupted task, built by `_trap_entry` at the top
/// of the kernel stack.
///
/// NOTE: field order is what the assembly stores; keep them in sync.
#[repr(C)]
pub struct TrapFrame {
    pub ra: u32,
    pub sp: u32,
    pub gp: u32,
    pub tp: u32,
    pub t0: u32,
    pub t1: u32,
    pub t2: u32,
    pub s0: u32,
    pub s1: u32,
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
    pub a3: u32,
    pub a4: u32,
    pub a5: u32,
    pub a6: u32,
    pub a7: u32,
    pub s2: u32,
    pub s3: u32,
    pub s4: u32,
    pub s5: u32,
    pub s6: u32,
    pub s7: u32,
    pub s8: u32,
    pub s9: u32,
    pub s10: u32,
    pub s11: u32,
    pub t3: u32,
    pub t4: u32,
    pub t5: u32,
    pub t6: u32,
    pub pc: u32,
    pub sstatus: u32,
}

/// Trap-frame size as the assembly knows it: the 33 saved words, padded to
/// keep the kernel stack 16-byte aligned.
const TRAP_FRAME_SIZE: usize = 36 * 4;
const _: () = assert!(core::mem::size_of::<TrapFrame>() <= TRAP_FRAME_SIZE);

impl SyscallArgs for TrapFrame {
    fn sysnum(&self) -> u32 {
        self.a5
    }
    fn arg0(&self) -> u32 {
        self.a0
    }
    fn arg1(&self) -> u32 {
        self.a1
    }
    fn arg2(&self) -> u32 {
        self.a2
    }
    fn arg3(&self) -> u32 {
        self.a3
    }
    fn arg4(&self) -> u32 {
        self.a4
    }
}

global_asm!(
    r#"
    .section .text.boot
    .globl _start
_start:
    // Pick this hart's boot stack: they are stacked downward from
    // __boot_stack_top, one KERNEL_STACK_SIZE each.
    csrr a0, mhartid
    la sp, __boot_stack_top
    li t0, {stack_size}
    mul t1, a0, t0
    sub sp, sp, t1
    j rv32_boot
    "#,
    stack_size = const BOOT_STACK_SIZE,
);

global_asm!(
    r#"
    .section .text
    .align 4
    .globl _trap_entry
_trap_entry:
    // tp <-> sscratch: tp now points at this hart's HartLocal, sscratch
    // holds the interrupted tp until we file it in the frame.
    csrrw tp, sscratch, tp
    sw t6, {scratch}(tp)

    // Build the trap frame just below the running task's kernel stack
    // top. Kernel stacks are empty whenever a trap can legally arrive
    // (user mode, or the idle wfi window), so this never lands on live
    // frames.
    lw t6, {sp_top}(tp)
    addi t6, t6, -{frame_size}

    sw ra,  0*4(t6)
    sw sp,  1*4(t6)
    sw gp,  2*4(t6)
    sw t0,  4*4(t6)
    sw t1,  5*4(t6)
    sw t2,  6*4(t6)
    sw s0,  7*4(t6)
    sw s1,  8*4(t6)
    sw a0,  9*4(t6)
    sw a1, 10*4(t6)
    sw a2, 11*4(t6)
    sw a3, 12*4(t6)
    sw a4, 13*4(t6)
    sw a5, 14*4(t6)
    sw a6, 15*4(t6)
    sw a7, 16*4(t6)
    sw s2, 17*4(t6)
    sw s3, 18*4(t6)
    sw s4, 19*4(t6)
    sw s5, 20*4(t6)
    sw s6, 21*4(t6)
    sw s7, 22*4(t6)
    sw s8, 23*4(t6)
    sw s9, 24*4(t6)
    sw s10, 25*4(t6)
    sw s11, 26*4(t6)
    sw t3, 27*4(t6)
    sw t4, 28*4(t6)
    sw t5, 29*4(t6)

    // The interrupted tp (parked in sscratch) and t6 (parked in the
    // scratch slot), then re-arm sscratch for the next trap.
    csrr t0, sscratch
    sw t0,  3*4(t6)
    csrw sscratch, tp
    lw t0, {scratch}(tp)
    sw t0, 30*4(t6)

    csrr t0, sepc
    sw t0, 31*4(t6)
    csrr t0, sstatus
    sw t0, 32*4(t6)

    // Run the handler on the kernel stack, frame lowest.
    mv sp, t6
    mv a0, t6
    call rv32_handle_trap

    // We return here only when the interrupted task is next resumed; sp
    // still addresses its frame.
    lw t0, 32*4(sp)
    csrw sstatus, t0
    lw t0, 31*4(sp)
    csrw sepc, t0

    lw ra,  0*4(sp)
    lw gp,  2*4(sp)
    lw tp,  3*4(sp)
    lw t0,  4*4(sp)
    lw t1,  5*4(sp)
    lw t2,  6*4(sp)
    lw s0,  7*4(sp)
    lw s1,  8*4(sp)
    lw a0,  9*4(sp)
    lw a1, 10*4(sp)
    lw a2, 11*4(sp)
    lw a3, 12*4(sp)
    lw a4, 13*4(sp)
    lw a5, 14*4(sp)
    lw a6, 15*4(sp)
    lw a7, 16*4(sp)
    lw s2, 17*4(sp)
    lw s3, 18*4(sp)
    lw s4, 19*4(sp)
    lw s5, 20*4(sp)
    lw s6, 21*4(sp)
    lw s7, 22*4(sp)
    lw s8, 23*4(sp)
    lw s9, 24*4(sp)
    lw s10, 25*4(sp)
    lw s11, 26*4(sp)
    lw t3, 27*4(sp)
    lw t4, 28*4(sp)
    lw t5, 29*4(sp)
    lw t6, 30*4(sp)
    lw sp,  1*4(sp)
    sret
    "#,
    scratch = const HART_SCRATCH,
    sp_top = const HART_SP_TOP,
    frame_size = const TRAP_FRAME_SIZE,
);

global_asm!(
    r#"
    // M-mode timer trampoline: advance mtimecmp by one interval and
    // convert the machine-timer interrupt into a supervisor software
    // interrupt; all real work happens in S-mode.
    .section .text
    .align 4
    .globl _mtimer_entry
_mtimer_entry:
    csrrw t0, mscratch, t0
    sw t1, {mscratch}+0(t0)
    sw t2, {mscratch}+4(t0)
    sw t3, {mscratch}+8(t0)
    sw t4, {mscratch}+12(t0)

    // mtimecmp += interval, 64-bit, writing the high half to all-ones
    // first so no spurious interrupt fires mid-update.
    lw t1, {mtimecmp}(t0)
    lw t2, {interval}(t0)
    lw t3, 0(t1)
    add t3, t3, t2
    sltu t2, t3, t2
    lw t4, 4(t1)
    add t4, t4, t2
    li t2, -1
    sw t2, 4(t1)
    sw t3, 0(t1)
    sw t4, 4(t1)

    // Raise SSIP for the S-mode handler.
    li t2, 2
    csrs mip, t2

    lw t4, {mscratch}+12(t0)
    lw t3, {mscratch}+8(t0)
    lw t2, {mscratch}+4(t0)
    lw t1, {mscratch}+0(t0)
    csrrw t0, mscratch, t0
    mret
    "#,
    mscratch = const HART_MSCRATCH,
    mtimecmp = const HART_MTIMECMP,
    interval = const HART_INTERVAL,
);

global_asm!(
    r#"
    // Stackful context switch: park ra and the callee-saved registers on
    // the outgoing stack, save its sp, adopt the incoming one, unpark.
    // A fresh task's "unpark" lands in one of the entry trampolines.
    .section .text
    .globl rv32_switch_context
rv32_switch_context:
    addi sp, sp, -13*4
    sw ra,  0*4(sp)
    sw s0,  1*4(sp)
    sw s1,  2*4(sp)
    sw s2,  3*4(sp)
    sw s3,  4*4(sp)
    sw s4,  5*4(sp)
    sw s5,  6*4(sp)
    sw s6,  7*4(sp)
    sw s7,  8*4(sp)
    sw s8,  9*4(sp)
    sw s9, 10*4(sp)
    sw s10, 11*4(sp)
    sw s11, 12*4(sp)
    sw sp, 0(a0)
    mv sp, a1
    lw ra,  0*4(sp)
    lw s0,  1*4(sp)
    lw s1,  2*4(sp)
    lw s2,  3*4(sp)
    lw s3,  4*4(sp)
    lw s4,  5*4(sp)
    lw s5,  6*4(sp)
    lw s6,  7*4(sp)
    lw s7,  8*4(sp)
    lw s8,  9*4(sp)
    lw s9, 10*4(sp)
    lw s10, 11*4(sp)
    lw s11, 12*4(sp)
    addi sp, sp, 13*4
    ret

    // First dispatch of a user task: the word above the switch frame is
    // the user entry point.
    .globl _user_entry_trampoline
_user_entry_trampoline:
    lw a0, 0(sp)
    addi sp, sp, 16
    j rv32_user_entry

    // First dispatch of a kernel task: argument, then function.
    .globl _kernel_entry_trampoline
_kernel_entry_trampoline:
    lw a0, 0(sp)
    lw t0, 4(sp)
    addi sp, sp, 16
    jr t0
    "#
);

extern "C" {
    fn rv32_switch_context(prev_sp: *mut u32, next_sp: u32);
    fn _trap_entry();
    fn _mtimer_entry();
    fn _user_entry_trampoline();
    fn _kernel_entry_trampoline();

    // Linker-script symbols.
    static __bss: u8;
    static __bss_end: u8;
    static __text: u8;
    static __text_end: u8;
    static __data: u8;
    static __data_end: u8;
    static __free_ram_start: u8;
    static __free_ram_end: u8;
    static __boot_elf: u8;
}

/// Stackful switch; see `task::switch` for the calling discipline.
pub unsafe fn switch_context(prev_sp: *mut u32, next_sp: u32) {
    // Safety: both stacks were prepared by `init_task_context` or earlier
    // switches, per this function's contract.
    unsafe { rv32_switch_context(prev_sp, next_sp) }
}

/// Installs the incoming task's address space.
pub fn activate_vm(root: Paddr) {
    // Order the preceding page-table writes before the switch, and flush
    // anything cached for the old space after it.
    fence_tlb_local();
    unsafe {
        satp::set(satp::Mode::Sv32, 0, (root >> 12) as usize);
    }
    fence_tlb_local();
}

/// Publishes the incoming task's kernel stack top for trap entry.
pub fn set_kernel_sp(sp_top: Vaddr) {
    // Safety: only this hart writes its own slot.
    unsafe {
        (*hart_local()).sp_top = sp_top;
    }
}

pub fn fence_tlb_local() {
    // Safety: sfence.vma has no memory-safety implications.
    unsafe {
        asm!("sfence.vma zero, zero", options(nostack, preserves_flags));
    }
}

pub fn wait_for_interrupt() {
    // Safety: wfi just waits; resuming is always sound here.
    unsafe {
        riscv::asm::wfi();
    }
}

fn mmio_write32(paddr: Paddr, value: u32) {
    // Safety: device registers mapped by the kernel template; callers pass
    // addresses from the fixed machine map above.
    unsafe {
        core::ptr::write_volatile(paddr as *mut u32, value);
    }
}

fn mmio_read32(paddr: Paddr) -> u32 {
    // Safety: as `mmio_write32`.
    unsafe { core::ptr::read_volatile(paddr as *const u32) }
}

/// Rings a peer hart's supervisor software interrupt via the ACLINT SSWI.
pub fn send_soft_irq(hart: usize) {
    mmio_write32(ACLINT_SSWI_PADDR + 4 * hart as u32, 1);
}

/// Prepares a fresh kernel stack: canary at the bottom, entry arguments at
/// the top, and a switch frame that resumes into the right trampoline.
/// Returns the initial saved stack pointer.
pub fn init_task_context(kstack_top: Paddr, entry: &TaskEntry) -> u32 {
    uassert!(kstack_top as usize % KERNEL_STACK_SIZE == 0);

    // Stack canary at the very bottom of the stack.
    let bottom = kstack_top - KERNEL_STACK_SIZE as u32;
    // Safety: the stack was allocated, aligned, exclusively for this task.
    unsafe {
        core::ptr::write(bottom as *mut u32, STACK_CANARY);
    }

    let mut sp = kstack_top as *mut u32;
    let mut push = |v: u32| {
        // Safety: bounded pushes into the task's own fresh stack.
        unsafe {
            sp = sp.sub(1);
            core::ptr::write(sp, v);
        }
    };

    // Keep sp 16-byte aligned: the trampolines pop a fixed 16 bytes.
    let ra = match *entry {
        TaskEntry::User { ip } => {
            push(0);
            push(0);
            push(0);
            push(ip);
            _user_entry_trampoline as usize as u32
        }
        TaskEntry::Kernel { func, arg } => {
            push(0);
            push(0);
            push(func as usize as u32);
            push(arg as u32);
            _kernel_entry_trampoline as usize as u32
        }
    };

    // The switch frame: s11..s0 zeroed, then ra.
    for _ in 0..12 {
        push(0);
    }
    push(ra);

    sp as u32
}

/// First entry to user mode for a freshly created task.
#[no_mangle]
extern "C" fn rv32_user_entry(ip: u32) -> ! {
    // The switch that brought us here was made under the big kernel lock;
    // let it go before leaving the kernel.
    mp::unlock();

    // Safety: sepc is consumed by the sret below.
    unsafe {
        sepc::write(ip as usize);
    }

    // Safety: flipping SPP/SPIE so sret lands in user mode with
    // interrupts on, then scrubbing every register so nothing kernel
    // leaks. sret never returns here.
    unsafe {
        asm!(
            "csrc sstatus, {spp}",
            "csrs sstatus, {spie}",
            spp = in(reg) SSTATUS_SPP,
            spie = in(reg) SSTATUS_SPIE,
        );
        asm!(
            "mv x1, zero",
            "mv x3, zero",
            "mv x4, zero",
            "mv x5, zero",
            "mv x6, zero",
            "mv x7, zero",
            "mv x8, zero",
            "mv x9, zero",
            "mv x10, zero",
            "mv x11, zero",
            "mv x12, zero",
            "mv x13, zero",
            "mv x14, zero",
            "mv x15, zero",
            "mv x16, zero",
            "mv x17, zero",
            "mv x18, zero",
            "mv x19, zero",
            "mv x20, zero",
            "mv x21, zero",
            "mv x22, zero",
            "mv x23, zero",
            "mv x24, zero",
            "mv x25, zero",
            "mv x26, zero",
            "mv x27, zero",
            "mv x28, zero",
            "mv x29, zero",
            "mv x30, zero",
            "mv x31, zero",
            "sret",
            options(noreturn),
        );
    }
}

/// Verifies the canary of the kernel stack we are executing on. Called at
/// trap entry and exit; a dead canary means a kernel stack overflowed into
/// the guardless page below it.
pub fn stack_check() {
    let sp: u32;
    // Safety: reading a register.
    unsafe {
        asm!("mv {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    let bottom = sp & !(KERNEL_STACK_SIZE as u32 - 1);
    // Safety: every kernel stack (boot stacks included) carries the canary
    // at its aligned bottom.
    if unsafe { core::ptr::read(bottom as *const u32) } != STACK_CANARY {
        panic!("kernel stack overflow (sp={:#x})", sp);
    }
}

fn stack_reset_current_canary() {
    let sp: u32;
    // Safety: reading a register.
    unsafe {
        asm!("mv {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    let bottom = sp & !(KERNEL_STACK_SIZE as u32 - 1);
    // Safety: the bottom word of this hart's own stack.
    unsafe {
        core::ptr::write(bottom as *mut u32, STACK_CANARY);
    }
}

/// Program counter of the current trap, for page-fault reporting from the
/// user-copy path.
pub fn user_trap_pc() -> u32 {
    // Safety: per-hart field, written by the trap handler on this hart.
    let frame = unsafe { (*hart_local()).trap_frame };
    if frame.is_null() {
        0
    } else {
        // Safety: non-null means the frame is live on this stack.
        unsafe { (*frame).pc }
    }
}

//
// Console UART (16550).
//

const UART_RBR: Paddr = UART0_PADDR;
const UART_THR: Paddr = UART0_PADDR;
const UART_IER: Paddr = UART0_PADDR + 1;
const UART_FCR: Paddr = UART0_PADDR + 2;
const UART_LCR: Paddr = UART0_PADDR + 3;
const UART_LSR: Paddr = UART0_PADDR + 5;

const UART_LSR_RX_READY: u8 = 1 << 0;
const UART_LSR_TX_EMPTY: u8 = 1 << 5;

fn uart_read8(paddr: Paddr) -> u8 {
    // Safety: fixed device register.
    unsafe { core::ptr::read_volatile(paddr as *const u8) }
}

fn uart_write8(paddr: Paddr, v: u8) {
    // Safety: fixed device register.
    unsafe {
        core::ptr::write_volatile(paddr as *mut u8, v);
    }
}

fn uart_init() {
    uart_write8(UART_LCR, 0x03); // 8n1
    uart_write8(UART_FCR, 0x01); // enable FIFOs
    uart_write8(UART_IER, 0x01); // receive interrupt
}

pub fn console_write_byte(b: u8) {
    if b == b'\n' {
        console_write_byte(b'\r');
    }
    while uart_read8(UART_LSR) & UART_LSR_TX_EMPTY == 0 {
        core::hint::spin_loop();
    }
    uart_write8(UART_THR, b);
}

/// Non-blocking console read, drained by the receive-interrupt handler.
pub fn console_read_byte() -> Option<u8> {
    if uart_read8(UART_LSR) & UART_LSR_RX_READY != 0 {
        Some(uart_read8(UART_RBR))
    } else {
        None
    }
}

struct Console;

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            console_write_byte(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn console_write_fmt(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;
    let _ = Console.write_fmt(args);
}

//
// PLIC.
//

fn plic_context(hart: usize) -> u32 {
    // S-mode context of each hart on the virt machine.
    (1 + 2 * hart) as u32
}

pub fn irq_enable(irq: usize) {
    mmio_write32(PLIC_PADDR + 4 * irq as u32, 1); // priority
    for hart in 0..NUM_CPUS_MAX {
        let enable = PLIC_PADDR + 0x2000 + 0x80 * plic_context(hart) + 4 * (irq as u32 / 32);
        mmio_write32(enable, mmio_read32(enable) | (1 << (irq % 32)));
    }
}

pub fn irq_disable(irq: usize) {
    for hart in 0..NUM_CPUS_MAX {
        let enable = PLIC_PADDR + 0x2000 + 0x80 * plic_context(hart) + 4 * (irq as u32 / 32);
        mmio_write32(enable, mmio_read32(enable) & !(1 << (irq % 32)));
    }
}

fn plic_init_percpu() {
    // Accept every priority.
    let threshold = PLIC_PADDR + 0x20_0000 + 0x1000 * plic_context(cpu_id());
    mmio_write32(threshold, 0);
}

fn plic_claim() -> u32 {
    mmio_read32(PLIC_PADDR + 0x20_0000 + 0x1000 * plic_context(cpu_id()) + 4)
}

fn plic_complete(irq: u32) {
    mmio_write32(PLIC_PADDR + 0x20_0000 + 0x1000 * plic_context(cpu_id()) + 4, irq);
}

//
// Trap handling.
//

/// The Rust side of `_trap_entry`, running on the current task's kernel
/// stack. Acquiring and releasing the big kernel lock per cause is this
/// function's whole job; everything else is dispatch.
#[no_mangle]
extern "C" fn rv32_handle_trap(frame: &mut TrapFrame) {
    stack_check();

    // Publish the frame for fault reporting, remembering any outer frame
    // (traps can nest once, out of the idle wfi window).
    let hart = hart_local();
    // Safety: per-hart field on this hart.
    let outer = unsafe { (*hart).trap_frame };
    unsafe {
        (*hart).trap_frame = frame;
    }

    let scause = scause::read().bits() as u32;
    let cpus = &mp::CPUS;

    match scause {
        SCAUSE_ENV_CALL => {
            mp::lock();
            // Safety: lock held.
            unsafe {
                startup::with_kernel(|k| {
                    frame.a0 = syscalls::dispatch(k, cpus, frame) as u32;
                });
            }
            // Resume past the ecall instruction.
            frame.pc += 4;
            mp::unlock();
        }

        SCAUSE_S_SOFT_INTR => {
            // Clear the pending bit before processing so a doorbell rung
            // while we work isn't lost.
            // Safety: CSR write.
            unsafe {
                asm!("csrc sip, {}", in(reg) SIP_SSIP);
            }
            mp::lock();
            // Safety: lock held.
            unsafe {
                startup::with_kernel(|k| handle_soft_interrupt(k, cpus));
            }
            mp::unlock();
        }

        SCAUSE_S_EXT_INTR => {
            mp::lock();
            let irq = plic_claim();
            // Safety: lock held.
            unsafe {
                startup::with_kernel(|k| {
                    if irq == UART0_IRQ as u32 {
                        while let Some(ch) = console_read_byte() {
                            interrupt::handle_serial_input(k, ch);
                        }
                    } else if irq != 0 {
                        interrupt::handle_interrupt(k, irq as usize);
                    }
                });
            }
            plic_complete(irq);
            mp::unlock();
        }

        SCAUSE_INST_PAGE_FAULT | SCAUSE_LOAD_PAGE_FAULT | SCAUSE_STORE_PAGE_FAULT => {
            handle_page_fault_trap(frame, scause, cpus);
        }

        SCAUSE_INST_MISALIGN
        | SCAUSE_INST_ACCESS_FAULT
        | SCAUSE_ILLEGAL_INST
        | SCAUSE_BREAKPOINT
        | SCAUSE_LOAD_ACCESS_FAULT
        | SCAUSE_AMO_MISALIGN
        | SCAUSE_STORE_ACCESS_FAULT => {
            if frame.sstatus & SSTATUS_SPP != 0 {
                panic!(
                    "exception in kernel: scause={}, stval={:#x}, pc={:#x}",
                    scause,
                    stval::read(),
                    frame.pc
                );
            }
            klog!(
                "invalid exception: scause={}, stval={:#x}",
                scause,
                stval::read()
            );
            mp::lock();
            // Safety: lock held. `exit` never returns; the lock travels
            // with the CPU to the next task.
            unsafe {
                startup::with_kernel(|k| {
                    task::exit(k, cpus, abi::ExceptionReason::IllegalException)
                });
            }
        }

        _ => panic!(
            "unknown trap: scause={:#x}, stval={:#x}, pc={:#x}",
            scause,
            stval::read(),
            frame.pc
        ),
    }

    // Safety: per-hart field on this hart.
    unsafe {
        (*hart_local()).trap_frame = outer;
    }
    stack_check();
}

/// Software interrupts carry both IPIs and (via the M-mode trampoline)
/// timer ticks; drain both.
fn handle_soft_interrupt(k: &mut startup::Kernel, cpus: &mp::Cpus) {
    loop {
        let pending = mp::take_pending_ipis(cpus);
        if pending.is_empty() {
            break;
        }
        if pending.contains(IpiReason::TLB_FLUSH) {
            fence_tlb_local();
        }
        if pending.contains(IpiReason::RESCHEDULE) {
            task::switch(k, cpus);
        }
    }

    // Safety: per-hart fields on this hart.
    let hart = hart_local();
    let now = mmio_read32(CLINT_MTIME);
    let ticks = unsafe {
        let elapsed = now.wrapping_sub((*hart).last_mtime) / MTIME_PER_TICK;
        if elapsed > 0 {
            (*hart).last_mtime = now;
        }
        elapsed
    };
    if ticks > 0 {
        interrupt::handle_timer_interrupt(k, cpus, ticks);
    }
}

fn handle_page_fault_trap(frame: &mut TrapFrame, scause: u32, cpus: &mp::Cpus) {
    if frame.sstatus & SSTATUS_SPP != 0 {
        // User copies are translation-checked, never faulting; a kernel
        // page fault is therefore always a kernel bug.
        panic!(
            "page fault in kernel: vaddr={:#x}, pc={:#x}, scause={}",
            stval::read(),
            frame.pc,
            scause
        );
    }

    let vaddr = stval::read() as u32;
    let mut fault = match scause {
        SCAUSE_INST_PAGE_FAULT => abi::PageFault::EXEC,
        SCAUSE_LOAD_PAGE_FAULT => abi::PageFault::READ,
        _ => abi::PageFault::WRITE,
    } | abi::PageFault::USER;

    mp::lock();
    // Safety: lock held.
    unsafe {
        startup::with_kernel(|k| {
            // A fault on a present page is a permission violation, which
            // the pager may want to treat differently.
            let root = match cpus.get(cpu_id()).current() {
                mp::Current::Task(tid) => k.tasks.task(tid).map(|t| t.vm.root).ok(),
                mp::Current::Idle => None,
            };
            if let Some(root) = root {
                if vm::is_mapped(root, vaddr) {
                    fault |= abi::PageFault::PRESENT;
                }
            }

            if let Err(reason) = vm::handle_page_fault(k, cpus, vaddr, frame.pc, fault) {
                task::exit(k, cpus, reason);
            }
        });
    }
    mp::unlock();
}

//
// Boot.
//

use core::sync::atomic::{AtomicBool, Ordering};

static HART0_READY: AtomicBool = AtomicBool::new(false);

/// M-mode entry, straight from `_start`. Note: until the kernel lock is
/// taken in `rv32_setup`, this must touch nothing but its own hart's
/// state (hart 0's one-time init runs before the others are released).
#[no_mangle]
extern "C" fn rv32_boot(hartid: usize) -> ! {
    if hartid == 0 {
        // Safety: one hart, once, before anything reads statics.
        unsafe {
            let bss = core::ptr::addr_of!(__bss) as *mut u8;
            let len = core::ptr::addr_of!(__bss_end) as usize - bss as usize;
            core::ptr::write_bytes(bss, 0, len);
        }
        uart_init();
    } else {
        while !HART0_READY.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
    }

    uassert!(hartid < NUM_CPUS_MAX);

    // Hand everything to S-mode and open up physical memory.
    // Safety: M-mode CSR setup, values per the privileged spec.
    unsafe {
        asm!(
            "csrw medeleg, {m}",
            "csrw mideleg, {m}",
            m = in(reg) 0xffffu32,
        );
        asm!(
            "csrw pmpaddr0, {addr}",
            "csrw pmpcfg0, {cfg}",
            addr = in(reg) 0xffff_ffffu32,
            cfg = in(reg) 0xfu32,
        );
    }

    // Safety: one writer per slot, before interrupts exist.
    let hart = unsafe { &mut *core::ptr::addr_of_mut!(HARTS[hartid]) };
    hart.id = hartid as u32;
    hart.mtimecmp = CLINT_MTIMECMP_BASE + 8 * hartid as u32;
    hart.interval = MTIME_PER_TICK;
    // Traps before the first dispatch would be kernel bugs; make the
    // bogus stack pointer recognizable.
    hart.sp_top = 0xdead_beef;

    // sscratch/mscratch/tp all point at this hart's record from here on.
    // Safety: CSR writes.
    unsafe {
        let p = hart as *mut HartLocal as usize;
        asm!(
            "csrw sscratch, {p}",
            "csrw mscratch, {p}",
            "mv tp, {p}",
            p = in(reg) p,
        );
    }

    // Park the machine timer far away until init_percpu arms it.
    // Safety: this hart's own mtimecmp registers.
    unsafe {
        core::ptr::write_volatile((hart.mtimecmp + 4) as *mut u32, 0xffff_ffff);
        core::ptr::write_volatile(hart.mtimecmp as *mut u32, 0xffff_ffff);
    }

    // Vector S-mode traps at the kernel entry and M-mode traps at the
    // timer trampoline, then enable the machine timer interrupt.
    // Safety: handler addresses are the asm entries above.
    unsafe {
        stvec::write(_trap_entry as usize, stvec::TrapMode::Direct);
        asm!("csrw mtvec, {}", in(reg) _mtimer_entry as usize);
        riscv::register::mie::set_mtimer();
        riscv::register::mstatus::set_mie();
        riscv::register::mstatus::set_mpp(riscv::register::mstatus::MPP::Supervisor);
    }

    let target = if hartid == 0 {
        rv32_setup as usize
    } else {
        rv32_setup_mp as usize
    };
    // Safety: mepc is consumed by the mret below.
    unsafe {
        mepc::write(target);
    }

    // Safety: mret into S-mode at the setup path; never returns.
    unsafe {
        asm!("mret", options(noreturn));
    }
}

/// S-mode setup for hart 0: build the boot info and enter the portable
/// kernel. Holds the big kernel lock from here on.
#[no_mangle]
extern "C" fn rv32_setup() -> ! {
    mp::lock();
    plic_init_percpu();
    stack_reset_current_canary();

    // Safety: linker symbol; we only take its address.
    let boot_elf = unsafe { core::ptr::addr_of!(__boot_elf) as u32 };
    let mut bootinfo = BootInfo {
        boot_elf,
        free_ram: heapless::Vec::new(),
        mmio: heapless::Vec::new(),
    };

    // Safety: linker symbols delimit the image.
    let (free_start, free_end) = unsafe {
        (
            core::ptr::addr_of!(__free_ram_start) as u32,
            core::ptr::addr_of!(__free_ram_end) as u32,
        )
    };
    let _ = bootinfo.free_ram.push(MemRegion {
        paddr: free_start,
        size: (free_end - free_start) as usize,
    });

    // Device windows delegated to user drivers.
    let _ = bootinfo.mmio.push(MemRegion {
        paddr: VIRTIO_BLK_PADDR,
        size: abi::PAGE_SIZE,
    });
    let _ = bootinfo.mmio.push(MemRegion {
        paddr: VIRTIO_NET_PADDR,
        size: abi::PAGE_SIZE,
    });

    startup::kernel_main(&bootinfo)
}

/// S-mode setup for the secondary harts.
#[no_mangle]
extern "C" fn rv32_setup_mp() -> ! {
    mp::lock();
    plic_init_percpu();
    stack_reset_current_canary();
    startup::kernel_mp_main()
}

/// Mappings every address space must carry: the kernel image, the
/// physical-memory window, and the devices the kernel itself drives.
pub fn kernel_image_regions() -> heapless::Vec<(Paddr, usize, PageAttrs), 8> {
    let rw = PageAttrs::READABLE | PageAttrs::WRITABLE;
    let mut v = heapless::Vec::new();

    // Safety: linker symbols delimit the image.
    unsafe {
        let text = core::ptr::addr_of!(__text) as u32;
        let text_end = core::ptr::addr_of!(__text_end) as u32;
        let data = core::ptr::addr_of!(__data) as u32;
        let data_end = core::ptr::addr_of!(__data_end) as u32;
        let free_start = core::ptr::addr_of!(__free_ram_start) as u32;
        let free_end = core::ptr::addr_of!(__free_ram_end) as u32;

        let _ = v.push((text, (text_end - text) as usize, rw | PageAttrs::EXECUTABLE));
        let _ = v.push((data, (data_end - data) as usize, rw));
        let _ = v.push((free_start, (free_end - free_start) as usize, rw));
    }

    let _ = v.push((UART0_PADDR, abi::PAGE_SIZE, rw));
    let _ = v.push((PLIC_PADDR, PLIC_SIZE, rw));
    let _ = v.push((CLINT_PADDR, CLINT_SIZE, rw));
    let _ = v.push((ACLINT_SSWI_PADDR, abi::PAGE_SIZE, rw));
    v
}

/// Per-CPU hardware bring-up, after the portable per-CPU init: mark the
/// CPU online, arm its timer, and (on hart 0) release the others and take
/// the console interrupt.
pub fn init_percpu() {
    let cpu = cpu_id();

    // Accept external, timer, and software interrupts in S-mode. The
    // sstatus global enable stays off; interrupts only fire in user mode
    // and the idle window.
    // Safety: CSR configuration.
    unsafe {
        riscv::register::sie::set_sext();
        riscv::register::sie::set_stimer();
        riscv::register::sie::set_ssoft();
    }

    mp::CPUS.get(cpu).online.store(true, Ordering::SeqCst);

    // Arm the machine timer one interval out.
    // Safety: this hart's own fields and mtimecmp.
    unsafe {
        let hart = hart_local();
        let now = mmio_read32(CLINT_MTIME);
        (*hart).last_mtime = now;
        core::ptr::write_volatile(((*hart).mtimecmp + 4) as *mut u32, 0);
        core::ptr::write_volatile((*hart).mtimecmp as *mut u32, now + (*hart).interval);
    }

    if cpu == 0 {
        irq_enable(UART0_IRQ);
        HART0_READY.store(true, Ordering::SeqCst);
    }
}

/// Idle-loop body: release the lock, sleep until something happens, take
/// the lock back.
pub fn idle() {
    mp::unlock();

    // Safety: opening the one window where this CPU takes interrupts.
    unsafe {
        sstatus::set_sie();
        riscv::asm::wfi();
    }
    // Safety: closing it again.
    unsafe {
        sstatus::clear_sie();
    }

    mp::lock();
}

/// Powers the machine off through the test device; QEMU exits.
pub fn shutdown() -> ! {
    // Back to bare physical addressing so the test device is reachable
    // regardless of the current address space.
    // Safety: the kernel runs identity-mapped, so execution continues.
    unsafe {
        satp::set(satp::Mode::Bare, 0, 0);
    }
    fence_tlb_local();

    mmio_write32(SIFIVE_TEST_PADDR, 0x5555);
    panic!("failed to shutdown");
}
