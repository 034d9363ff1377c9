//! Tarn kernel.
//!
//! A small preemptive multiprocessor microkernel for 32-bit RISC-V. The
//! kernel keeps the minimum machinery user-space services need to build an
//! operating system on top: task lifecycle, Sv32 virtual memory, synchronous
//! message-passing IPC with notifications, interrupt routing, timers, and
//! the syscall surface tying them together. Drivers, filesystems, and
//! demand-paging policy all live in user tasks; the only device the kernel
//! touches is the console UART.
//!
//! # Design principles
//!
//! 1. One coarse lock. Everything in the kernel runs under the big kernel
//!    lock; there is no fine-grained locking to get wrong.
//! 2. Fixed shapes. Task slots, queues, and zones are all statically
//!    bounded; the kernel never allocates from a heap.
//! 3. A strong preference for safe code; `unsafe` is confined to the
//!    architecture layer, the physical-memory window, and the documented
//!    aliasing rule around the kernel singleton.
//! 4. Simple, checkable algorithms over clever ones -- linear scans over
//!    sixteen task slots beat any data structure worth debugging.
//!
//! Everything outside `arch` is portable; on non-RISC-V targets a hosted
//! stub architecture stands in so the subsystems run under the standard
//! test harness.

#![cfg_attr(target_os = "none", no_std)]

/// A physical address.
pub type Paddr = u32;

/// A kernel virtual address.
pub type Vaddr = u32;

#[macro_use]
pub mod arch;

pub mod config;
pub mod err;
pub mod fail;
pub mod hinavm;
pub mod interrupt;
pub mod ipc;
pub mod mp;
pub mod pm;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod umem;
pub mod util;
pub mod vm;
