//! Multiprocessor support: per-CPU variables, the big kernel lock, and
//! inter-processor interrupts.
//!
//! The kernel is serialized by a single coarse lock. Every trap handler
//! acquires it on entry and releases it on exit; context switches happen
//! with the lock held and do not move its ownership off the switching CPU.
//! Exactly two places let go of the lock mid-operation: the idle loop
//! (around `wfi`) and the IPI fan-out below (while waiting for the peers to
//! acknowledge, since they need the lock to do so).

use core::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicU32, Ordering};

use abi::Tid;

use crate::arch;
use crate::config::NUM_CPUS_MAX;

bitflags::bitflags! {
    /// Reasons recorded in a CPU's pending-IPI word.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct IpiReason: u32 {
        /// A page table changed; invalidate your TLB.
        const TLB_FLUSH = 1 << 0;
        /// Re-run the scheduler at the next opportunity.
        const RESCHEDULE = 1 << 1;
    }
}

/// What a CPU is running right now.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Current {
    /// The CPU's own idle task.
    Idle,
    Task(Tid),
}

/// Per-CPU kernel state.
///
/// The fields here are the only kernel data touched without the big lock:
/// `online` and `ipi_pending` from peer CPUs during IPI fan-out, and
/// `current` from `task_destroy`'s is-it-running-elsewhere scan. All three
/// are atomics for exactly that reason. Architecture-private per-CPU state
/// (kernel stack top, timer bookkeeping) lives in the arch layer.
pub struct CpuVar {
    /// Set once the CPU has finished booting; IPIs are only sent to online
    /// CPUs.
    pub online: AtomicBool,
    /// Pending [`IpiReason`] bits, OR-ed in by senders, drained by the
    /// owning CPU's software-interrupt handler.
    pub ipi_pending: AtomicU32,
    /// Task id currently running on this CPU; 0 means the idle task.
    current: AtomicI32,
}

impl CpuVar {
    pub const fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
            ipi_pending: AtomicU32::new(0),
            current: AtomicI32::new(0),
        }
    }

    pub fn current(&self) -> Current {
        match self.current.load(Ordering::Relaxed) {
            0 => Current::Idle,
            raw => Current::Task(Tid::new(raw).unwrap()),
        }
    }

    pub fn set_current(&self, c: Current) {
        let raw = match c {
            Current::Idle => 0,
            Current::Task(tid) => tid.as_i32(),
        };
        self.current.store(raw, Ordering::Relaxed);
    }

    /// Checks whether this CPU is running `tid` right now. Used by task
    /// destruction, which must wait for the victim to stop running
    /// elsewhere before tearing it down.
    pub fn runs(&self, tid: Tid) -> bool {
        self.online.load(Ordering::SeqCst)
            && self.current.load(Ordering::SeqCst) == tid.as_i32()
    }
}

/// The per-CPU variable array, indexed by hart id.
pub struct Cpus {
    vars: [CpuVar; NUM_CPUS_MAX],
}

impl Cpus {
    pub const fn new() -> Self {
        Self {
            vars: [const { CpuVar::new() }; NUM_CPUS_MAX],
        }
    }

    pub fn get(&self, cpu: usize) -> &CpuVar {
        &self.vars[cpu]
    }

    /// Iterates over the online CPUs other than `me`.
    pub fn peers_of(&self, me: usize) -> impl Iterator<Item = (usize, &CpuVar)> {
        self.vars
            .iter()
            .enumerate()
            .filter(move |(i, cv)| *i != me && cv.online.load(Ordering::SeqCst))
    }

    /// Checks whether any CPU is currently running `tid`.
    pub fn running_somewhere(&self, tid: Tid) -> bool {
        self.vars.iter().any(|cv| cv.runs(tid))
    }
}

/// The real per-CPU array. Tests build their own `Cpus` instead so they
/// never share scheduler state.
pub static CPUS: Cpus = Cpus::new();

// Big kernel lock states.
const BKL_UNLOCKED: u32 = 0;
const BKL_LOCKED: u32 = 1;
/// Set by a panicking CPU; makes every other CPU park in `lock` forever so
/// the panic output isn't interleaved with further kernel activity.
const BKL_HALTED: u32 = 2;

struct BigLock {
    state: AtomicU32,
    /// CPU that last acquired the lock, for the release assertion.
    owner: AtomicI32,
}

static BIG_LOCK: BigLock = BigLock {
    state: AtomicU32::new(BKL_UNLOCKED),
    owner: AtomicI32::new(-1),
};

/// Acquires the big kernel lock.
pub fn lock() {
    loop {
        if BIG_LOCK.state.load(Ordering::SeqCst) == BKL_HALTED {
            // Another CPU is down with a panic. Don't fight it for the
            // lock; park so it can finish writing its diagnostics.
            park_forever();
        }
        if BIG_LOCK
            .state
            .compare_exchange(
                BKL_UNLOCKED,
                BKL_LOCKED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            break;
        }
        core::hint::spin_loop();
    }

    BIG_LOCK.owner.store(arch::cpu_id() as i32, Ordering::SeqCst);

    // Keep memory accesses made under the lock from being hoisted above the
    // acquisition by the CPU or the compiler.
    fence(Ordering::SeqCst);
}

/// Releases the big kernel lock.
///
/// The owning CPU is always re-read from the hardware: a task that blocked
/// under the lock may be resumed, still under the lock, on a different CPU
/// than the one that acquired it.
pub fn unlock() {
    uassert!(BIG_LOCK.owner.load(Ordering::SeqCst) == arch::cpu_id() as i32);

    // Make every write done under the lock visible before the release.
    fence(Ordering::SeqCst);

    // CAS rather than a plain store so a concurrent transition to Halted is
    // never overwritten.
    let _ = BIG_LOCK.state.compare_exchange(
        BKL_LOCKED,
        BKL_UNLOCKED,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
}

/// Steals the big kernel lock unconditionally. Only the panic path uses
/// this, to get the console to itself regardless of who held the lock.
pub fn force_lock() {
    BIG_LOCK.state.store(BKL_LOCKED, Ordering::SeqCst);
    BIG_LOCK.owner.store(arch::cpu_id() as i32, Ordering::SeqCst);
    fence(Ordering::SeqCst);
}

/// Publishes the halted state and parks this CPU for good.
pub fn halt() -> ! {
    BIG_LOCK.state.store(BKL_HALTED, Ordering::SeqCst);
    fence(Ordering::SeqCst);

    klog!("kernel halted (CPU #{})", arch::cpu_id());
    park_forever();
}

fn park_forever() -> ! {
    loop {
        arch::wait_for_interrupt();
    }
}

/// Sends an IPI to every online peer and waits for each to process it.
///
/// The wait is the one deliberate hole in the lock discipline: the peers
/// need the big lock to handle their interrupt, so we release it while
/// spinning on their pending words and take it back afterwards. The caller
/// must expect that any kernel state may have changed across this call.
pub fn send_ipi(cpus: &Cpus, reasons: IpiReason) {
    let me = arch::cpu_id();
    for (hart, cv) in cpus.peers_of(me) {
        // Record why before ringing the doorbell; the OR is atomic so
        // several senders can stack reasons.
        cv.ipi_pending.fetch_or(reasons.bits(), Ordering::SeqCst);
        fence(Ordering::SeqCst);
        arch::send_soft_irq(hart);
    }

    for (_, cv) in cpus.peers_of(me) {
        unlock();
        while cv.ipi_pending.load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
        lock();
    }
}

/// Drains and returns this CPU's pending IPI word. Called from the
/// software-interrupt handler.
pub fn take_pending_ipis(cpus: &Cpus) -> IpiReason {
    let bits = cpus.get(arch::cpu_id()).ipi_pending.swap(0, Ordering::SeqCst);
    IpiReason::from_bits_truncate(bits)
}
