//! Kernel ABI definitions, shared between the kernel and user programs.
//!
//! Everything in this crate is part of the stable contract with user space:
//! syscall numbers, error codes, flag words, and the `Message` record that
//! crosses the user/kernel boundary. Values here must not change without
//! rebuilding the world.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of task slots in the kernel's task table. Task ids run from 1 to
/// this value, inclusive; id 0 is reserved (see [`Tid`]).
pub const NUM_TASKS_MAX: usize = 16;

/// Maximum length of a task name, in bytes.
pub const TASK_NAME_LEN: usize = 16;

/// Size of one page of physical or virtual memory.
pub const PAGE_SIZE: usize = 4096;

/// Bits of page offset within an address; `paddr >> PFN_SHIFT` is the page
/// frame number reported by `pm_alloc`.
pub const PFN_SHIFT: u32 = 12;

/// Maximum number of instructions in a bytecode-task program.
pub const HINAVM_INSTS_MAX: usize = 128;

/// Names a task slot.
///
/// A `Tid` is a small positive integer, `1..=NUM_TASKS_MAX`. Two sentinel
/// values share the same integer space and appear in well-defined positions
/// only: `0` means "any sender" when used as a receive filter, and `-1` is
/// the source id of messages composed by the kernel itself. Neither sentinel
/// ever names a real task slot.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Tid(i32);

impl Tid {
    /// Source id of messages composed by the kernel.
    pub const FROM_KERNEL: i32 = -1;

    /// Receive-filter value accepting any sender.
    pub const ANY: i32 = 0;

    /// The bootstrap task (the user-space virtual memory server) always has
    /// id 1 and can never be destroyed.
    pub const VM_SERVER: Tid = Tid(1);

    /// Checks a raw id from user space and produces a `Tid` if it could name
    /// a task slot. This validates the *range* only; whether the slot is in
    /// use is the kernel's business.
    pub fn new(raw: i32) -> Option<Self> {
        if (1..=NUM_TASKS_MAX as i32).contains(&raw) {
            Some(Tid(raw))
        } else {
            None
        }
    }

    /// Fabricates a `Tid` from a task-table index.
    pub fn from_index(index: usize) -> Self {
        Tid(index as i32 + 1)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Index of this task in the task table.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

/// Stable error codes, returned to user space as negative integers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Error {
    NoMemory = -1,
    NoResources = -2,
    AlreadyExists = -3,
    AlreadyUsed = -4,
    AlreadyDone = -5,
    StillUsed = -6,
    NotFound = -7,
    NotAllowed = -8,
    NotSupported = -9,
    Unexpected = -10,
    InvalidArg = -11,
    InvalidTask = -12,
    InvalidSyscall = -13,
    InvalidPaddr = -14,
    InvalidUaddr = -15,
    TooManyTasks = -16,
    TooLarge = -17,
    TooSmall = -18,
    WouldBlock = -19,
    TryAgain = -20,
    Aborted = -21,
    Empty = -22,
    NotEmpty = -23,
    DeadLock = -24,
    NotAFile = -25,
    NotADir = -26,
    Eof = -27,
}

impl Error {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Short name for diagnostics, in the style of the boot console.
    pub fn as_str(self) -> &'static str {
        match self {
            Error::NoMemory => "no memory",
            Error::NoResources => "no resources",
            Error::AlreadyExists => "already exists",
            Error::AlreadyUsed => "already used",
            Error::AlreadyDone => "already done",
            Error::StillUsed => "still used",
            Error::NotFound => "not found",
            Error::NotAllowed => "not allowed",
            Error::NotSupported => "not supported",
            Error::Unexpected => "unexpected",
            Error::InvalidArg => "invalid arg",
            Error::InvalidTask => "invalid task",
            Error::InvalidSyscall => "invalid syscall",
            Error::InvalidPaddr => "invalid paddr",
            Error::InvalidUaddr => "invalid uaddr",
            Error::TooManyTasks => "too many tasks",
            Error::TooLarge => "too large",
            Error::TooSmall => "too small",
            Error::WouldBlock => "would block",
            Error::TryAgain => "try again",
            Error::Aborted => "aborted",
            Error::Empty => "empty",
            Error::NotEmpty => "not empty",
            Error::DeadLock => "dead lock",
            Error::NotAFile => "not a file",
            Error::NotADir => "not a dir",
            Error::Eof => "end of file",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Ipc = 1,
    Notify = 2,
    SerialWrite = 3,
    SerialRead = 4,
    TaskCreate = 5,
    TaskDestroy = 6,
    TaskExit = 7,
    TaskSelf = 8,
    PmAlloc = 9,
    VmMap = 10,
    VmUnmap = 11,
    IrqListen = 12,
    IrqUnlisten = 13,
    Time = 14,
    Uptime = 15,
    HinaVm = 16,
    Shutdown = 17,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        match x {
            1 => Ok(Self::Ipc),
            2 => Ok(Self::Notify),
            3 => Ok(Self::SerialWrite),
            4 => Ok(Self::SerialRead),
            5 => Ok(Self::TaskCreate),
            6 => Ok(Self::TaskDestroy),
            7 => Ok(Self::TaskExit),
            8 => Ok(Self::TaskSelf),
            9 => Ok(Self::PmAlloc),
            10 => Ok(Self::VmMap),
            11 => Ok(Self::VmUnmap),
            12 => Ok(Self::IrqListen),
            13 => Ok(Self::IrqUnlisten),
            14 => Ok(Self::Time),
            15 => Ok(Self::Uptime),
            16 => Ok(Self::HinaVm),
            17 => Ok(Self::Shutdown),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Mode bits of the `ipc` syscall. The low 16 bits of the flags word are
    /// reserved so that these compose with per-message values if a service
    /// ever wants to pack them together.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct IpcFlags: u32 {
        const SEND = 1 << 16;
        const RECV = 1 << 17;
        const NOBLOCK = 1 << 18;
        /// The message pointer is a kernel address. Rejected if set from user
        /// space.
        const KERNEL = 1 << 19;
        const CALL = Self::SEND.bits() | Self::RECV.bits();
    }
}

/// Base of the per-source-task async notification bits.
pub const NOTIFY_ASYNC_BASE: u32 = 3;

bitflags::bitflags! {
    /// Per-task notification bits. Notifications are not queued: repeated
    /// deliveries OR into the same bit.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct Notifications: u32 {
        const TIMER = 1 << 0;
        const IRQ = 1 << 1;
        const ABORTED = 1 << 2;
        // Bits NOTIFY_ASYNC_BASE.. are the per-source async bits, one per
        // task slot; see `Notifications::async_from`.
        const _ = !0;
    }
}

impl Notifications {
    /// The async-message bit dedicated to sender `tid`.
    pub fn async_from(tid: Tid) -> Self {
        Self::from_bits_retain(1 << (NOTIFY_ASYNC_BASE + tid.as_i32() as u32))
    }
}

// Every task slot needs its own async bit above the fixed bits.
const _: () = assert!(NOTIFY_ASYNC_BASE as usize + NUM_TASKS_MAX < 32);

bitflags::bitflags! {
    /// Page attributes for `vm_map`. User-space requests always have `USER`
    /// forced on by the kernel.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageAttrs: u32 {
        const READABLE = 1 << 1;
        const WRITABLE = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const USER = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Allocation flags for `pm_alloc`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PmFlags: u32 {
        /// Zero the frames before returning them.
        const ZEROED = 1 << 0;
        /// Align the returned address to the rounded-up allocation size.
        const ALIGNED = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Cause bits of a page fault, as reported to the pager.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFault: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// The fault was taken in (or on behalf of) user mode.
        const USER = 1 << 3;
        /// The page was mapped; the access violated its permissions.
        const PRESENT = 1 << 4;
    }
}

/// Why a task was terminated, as reported to its pager in an
/// [`ExceptionPayload`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ExceptionReason {
    /// The task called `task_exit`.
    GraceExit = 1,
    /// The task touched an address outside the mappable user range.
    InvalidUaddr = 2,
    /// The task's pager answered a page fault with something other than a
    /// page-fault reply.
    InvalidPagerReply = 3,
    /// The task raised a CPU exception the kernel does not forward.
    IllegalException = 4,
}

impl core::convert::TryFrom<u32> for ExceptionReason {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        match x {
            1 => Ok(Self::GraceExit),
            2 => Ok(Self::InvalidUaddr),
            3 => Ok(Self::InvalidPagerReply),
            4 => Ok(Self::IllegalException),
            _ => Err(()),
        }
    }
}

/// Size of the fixed message record.
pub const MESSAGE_SIZE: usize = 256;

/// Bytes of payload in a message, after the type and source words.
pub const MESSAGE_DATA_SIZE: usize = MESSAGE_SIZE - 8;

/// Message types reserved for the kernel. User services must not send
/// messages with these types, and must reject inbound messages carrying one
/// of them unless `src` is `Tid::FROM_KERNEL`.
pub const NOTIFY_MSG: i32 = 1;
pub const PAGE_FAULT_MSG: i32 = 2;
pub const PAGE_FAULT_REPLY_MSG: i32 = 3;
pub const EXCEPTION_MSG: i32 = 4;

/// The IPC message record.
///
/// Messages are fixed-size and copied whole across the user/kernel boundary;
/// the payload is raw bytes that sender and receiver interpret by agreement
/// on `ty`. The kernel's own payloads have typed views below.
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Message {
    /// Message type. Negative values conventionally carry an error code.
    pub ty: i32,
    /// Sending task, or `Tid::FROM_KERNEL`. Filled in by the kernel; a value
    /// supplied by the sender is ignored.
    pub src: i32,
    pub data: [u8; MESSAGE_DATA_SIZE],
}

const _: () = assert!(core::mem::size_of::<Message>() == MESSAGE_SIZE);
const _: () = assert!(MESSAGE_SIZE <= 2048);

impl Default for Message {
    fn default() -> Self {
        Message {
            ty: 0,
            src: 0,
            data: [0; MESSAGE_DATA_SIZE],
        }
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("ty", &self.ty)
            .field("src", &self.src)
            .finish_non_exhaustive()
    }
}

/// Payload of a `NOTIFY_MSG`.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NotifyPayload {
    pub notifications: u32,
}

/// Payload of a `PAGE_FAULT_MSG` upcall to a pager.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PageFaultPayload {
    /// The faulting task.
    pub task: i32,
    /// The faulting user address.
    pub uaddr: u32,
    /// Program counter at the time of the fault.
    pub ip: u32,
    /// Cause bits (`PageFault`).
    pub fault: u32,
}

/// Payload of an `EXCEPTION_MSG` sent to a task's pager when the task dies.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExceptionPayload {
    /// The terminated task.
    pub task: i32,
    /// `ExceptionReason` value.
    pub reason: u32,
}

impl Message {
    fn kernel_message(ty: i32, payload: &[u8]) -> Self {
        let mut m = Message {
            ty,
            src: Tid::FROM_KERNEL,
            ..Message::default()
        };
        m.data[..payload.len()].copy_from_slice(payload);
        m
    }

    /// Composes the notification message delivered by an open receive.
    pub fn notify(notifications: u32) -> Self {
        Self::kernel_message(NOTIFY_MSG, NotifyPayload { notifications }.as_bytes())
    }

    /// Composes the page-fault upcall for `task`'s pager.
    pub fn page_fault(task: Tid, uaddr: u32, ip: u32, fault: PageFault) -> Self {
        Self::kernel_message(
            PAGE_FAULT_MSG,
            PageFaultPayload {
                task: task.as_i32(),
                uaddr,
                ip,
                fault: fault.bits(),
            }
            .as_bytes(),
        )
    }

    /// Composes the exception message for a dying task's pager.
    pub fn exception(task: Tid, reason: ExceptionReason) -> Self {
        Self::kernel_message(
            EXCEPTION_MSG,
            ExceptionPayload {
                task: task.as_i32(),
                reason: reason as u32,
            }
            .as_bytes(),
        )
    }

    /// Reads the payload as type `P`. The caller is responsible for having
    /// checked `ty` first; the bytes themselves always suffice because every
    /// payload type is smaller than the data area.
    pub fn payload<P: FromBytes>(&self) -> P {
        let (p, _) = P::read_from_prefix(&self.data)
            .unwrap_or_else(|_| panic!("payload larger than message data"));
        p
    }
}
