//! Build-time configuration.
//!
//! Everything the kernel needs to know about the machine and its own limits
//! lives here, so that a port to a differently-shaped board is a matter of
//! editing constants rather than chasing literals.

/// Maximum number of CPUs (harts) the kernel will bring up.
pub const NUM_CPUS_MAX: usize = 4;

/// Size of each task's kernel stack. Must be a power of two: stacks are
/// allocated aligned to their size so the canary slot can be found by
/// masking the stack pointer.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Timer tick rate. A tick is the unit of every timeout and quantum below.
pub const TICK_HZ: u32 = 1000;

/// CPU time a task may consume before preemption, in ticks (20 ms).
pub const TASK_QUANTUM: u32 = 20 * (TICK_HZ / 1000);

/// Number of external interrupt lines the kernel will route.
pub const IRQ_MAX: usize = 32;

/// Bottom of the kernel half of every address space. User mappings live in
/// `[PAGE_SIZE, KERNEL_BASE)`; page zero is deliberately never mappable.
pub const KERNEL_BASE: u32 = 0x8000_0000;

/// Physical memory size (matches the emulator's `-m` option).
pub const RAM_SIZE: usize = 128 * 1024 * 1024;

/// Bytes buffered between the UART receive interrupt and `serial_read`.
pub const CONSOLE_RX_BUF: usize = 128;

/// MMIO windows handed to user drivers through the boot memory map.
pub const VIRTIO_BLK_PADDR: u32 = 0x1000_1000;
pub const VIRTIO_NET_PADDR: u32 = 0x1000_2000;

/// Interrupt line of the console UART, handled by the kernel itself.
pub const UART0_IRQ: usize = 10;
