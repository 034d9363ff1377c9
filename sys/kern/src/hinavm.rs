//! The bytecode task runtime.
//!
//! The `hinavm` syscall creates a task that runs not user code but a small
//! register virtual machine, interpreted by the kernel on the task's own
//! kernel stack. The machine has sixteen 32-bit registers, sixteen jump
//! labels, and direct load/store access to the task's embedded message
//! slot, which is how programs build and inspect IPC messages. IPC
//! instructions go through the ordinary engine with the kernel flag, so a
//! bytecode task blocks and wakes exactly like any other task.
//!
//! Instruction words are packed as:
//!
//! ```text
//!   31      24 23  20 19  16 15  12 11           0
//!  +----------+------+------+------+--------------+
//!  |  opcode  |  a   |  b   |  c   |              |
//!  +----------+------+------+------+--------------+
//!                    |<------ imm20 (signed) ----->|
//! ```
//!
//! `a`, `b`, `c` are register numbers; jump targets name a label in the
//! `b` nibble; loads and stores use `a` and the signed 20-bit offset.

use abi::{
    Error, ExceptionReason, IpcFlags, Message, PmFlags, Tid, HINAVM_INSTS_MAX,
    MESSAGE_SIZE, PAGE_SIZE,
};
use zerocopy::IntoBytes;

use crate::arch;
use crate::err::UserError;
use crate::ipc::{self, MsgRef, RecvFilter};
use crate::mp::{self, Cpus, Current};
use crate::pm::PhysMemory;
use crate::startup::{self, Kernel};
use crate::task;
use crate::util::align_up;
use crate::Paddr;

pub const NUM_REGS: usize = 16;
pub const NUM_LABELS: usize = 16;

const OP_NOP: u8 = 0;
const OP_MOVI: u8 = 1;
const OP_MOV: u8 = 2;
const OP_ADD: u8 = 3;
const OP_SUB: u8 = 4;
const OP_MUL: u8 = 5;
const OP_DIV: u8 = 6;
const OP_MOD: u8 = 7;
const OP_SHR: u8 = 8;
const OP_SHL: u8 = 9;
const OP_AND: u8 = 10;
const OP_OR: u8 = 11;
const OP_XOR: u8 = 12;
const OP_EQ: u8 = 13;
const OP_NE: u8 = 14;
const OP_LT: u8 = 15;
const OP_LE: u8 = 16;
const OP_LABEL: u8 = 17;
const OP_JMP: u8 = 18;
const OP_JMP_IF: u8 = 19;
const OP_LDM8: u8 = 20;
const OP_LDM16: u8 = 21;
const OP_LDM32: u8 = 22;
const OP_STM8: u8 = 23;
const OP_STM16: u8 = 24;
const OP_STM32: u8 = 25;
const OP_PRINT: u8 = 26;
const OP_PRINT_HEX: u8 = 27;
const OP_SEND: u8 = 28;
const OP_REPLY: u8 = 29;
const OP_RECV: u8 = 30;
const OP_EXIT: u8 = 31;

/// A staged program, living in a kernel page owned by its task.
#[repr(C)]
pub struct Program {
    pub num_insts: u32,
    pub insts: [u32; HINAVM_INSTS_MAX],
}

/// Copies a validated instruction buffer into a fresh kernel page. The
/// caller transfers ownership of the page to the new task once it exists.
pub(crate) fn stage_program(
    pm: &mut PhysMemory,
    insts: &[u32],
) -> Result<(Paddr, usize), Error> {
    uassert!(insts.len() <= HINAVM_INSTS_MAX);

    let size = align_up(core::mem::size_of::<Program>(), PAGE_SIZE);
    let paddr = pm.alloc(size, None, PmFlags::ZEROED)?;

    // Safety: the page was just allocated for exactly this purpose.
    unsafe {
        let p = arch::paddr_to_vaddr(paddr) as *mut Program;
        (*p).num_insts = insts.len() as u32;
        (&mut (*p).insts)[..insts.len()].copy_from_slice(insts);
    }
    Ok((paddr, size))
}

fn opcode(w: u32) -> u8 {
    (w >> 24) as u8
}

fn reg_a(w: u32) -> usize {
    ((w >> 20) & 0xf) as usize
}

fn reg_b(w: u32) -> usize {
    ((w >> 16) & 0xf) as usize
}

fn reg_c(w: u32) -> usize {
    ((w >> 12) & 0xf) as usize
}

fn label_of(w: u32) -> usize {
    reg_b(w)
}

fn imm20(w: u32) -> i32 {
    ((w & 0xf_ffff) << 12) as i32 >> 12
}

/// Interpreter state. Everything needed to resume a program lives here (or
/// in the task's message slot), never on the interpreter's call stack.
pub struct VmState {
    pc: u32,
    regs: [i32; NUM_REGS],
    labels: [u32; NUM_LABELS],
}

impl VmState {
    pub fn new(prog: &Program) -> Self {
        // Labels resolve to the instruction after their definition; an
        // undefined label points past the end and stops the program.
        let mut labels = [u32::MAX; NUM_LABELS];
        for i in 0..prog.num_insts as usize {
            let w = prog.insts[i];
            if opcode(w) == OP_LABEL {
                labels[label_of(w)] = i as u32 + 1;
            }
        }

        Self {
            pc: 0,
            regs: [0; NUM_REGS],
            labels,
        }
    }

    pub fn reg(&self, i: usize) -> i32 {
        self.regs[i]
    }
}

fn ipc_result(st: &mut VmState, w: u32, r: Result<(), UserError>) -> Result<(), ExceptionReason> {
    st.regs[reg_a(w)] = match r {
        Ok(()) => 0,
        Err(UserError::Recoverable(e)) => e.code(),
        Err(UserError::Fatal(reason)) => return Err(reason),
    };
    Ok(())
}

/// Executes one instruction. `Err` means the task is done, with the reason
/// its pager should hear. IPC instructions may block inside.
pub(crate) fn step(
    k: &mut Kernel,
    cpus: &Cpus,
    me: Tid,
    prog: &Program,
    st: &mut VmState,
) -> Result<(), ExceptionReason> {
    if st.pc >= prog.num_insts {
        klog!("#{}: invalid pc: {} (max={})", me.as_i32(), st.pc, prog.num_insts);
        return Err(ExceptionReason::IllegalException);
    }

    let w = prog.insts[st.pc as usize];
    let mut next_pc = st.pc + 1;

    match opcode(w) {
        OP_NOP | OP_LABEL => {}
        OP_MOVI => st.regs[reg_a(w)] = imm20(w),
        OP_MOV => st.regs[reg_a(w)] = st.regs[reg_b(w)],

        op @ (OP_ADD..=OP_LE) => {
            let lhs = st.regs[reg_b(w)];
            let rhs = st.regs[reg_c(w)];
            st.regs[reg_a(w)] = match op {
                OP_ADD => lhs.wrapping_add(rhs),
                OP_SUB => lhs.wrapping_sub(rhs),
                OP_MUL => lhs.wrapping_mul(rhs),
                OP_DIV => lhs.checked_div(rhs).ok_or_else(|| {
                    klog!("#{}: division error at pc={}", me.as_i32(), st.pc);
                    ExceptionReason::IllegalException
                })?,
                OP_MOD => lhs.checked_rem(rhs).ok_or_else(|| {
                    klog!("#{}: division error at pc={}", me.as_i32(), st.pc);
                    ExceptionReason::IllegalException
                })?,
                OP_SHR => ((lhs as u32) >> (rhs as u32 & 31)) as i32,
                OP_SHL => ((lhs as u32) << (rhs as u32 & 31)) as i32,
                OP_AND => lhs & rhs,
                OP_OR => lhs | rhs,
                OP_XOR => lhs ^ rhs,
                OP_EQ => (lhs == rhs) as i32,
                OP_NE => (lhs != rhs) as i32,
                OP_LT => (lhs < rhs) as i32,
                OP_LE => (lhs <= rhs) as i32,
                _ => unreachable!(),
            };
        }

        OP_JMP => next_pc = st.labels[label_of(w)],
        OP_JMP_IF => {
            if st.regs[reg_a(w)] != 0 {
                next_pc = st.labels[label_of(w)];
            }
        }

        op @ (OP_LDM8..=OP_STM32) => {
            let size = match op {
                OP_LDM8 | OP_STM8 => 1,
                OP_LDM16 | OP_STM16 => 2,
                _ => 4,
            };
            let off = imm20(w);
            if off < 0 || off as usize + size > MESSAGE_SIZE {
                klog!("#{}: message access out of bounds at pc={}", me.as_i32(), st.pc);
                return Err(ExceptionReason::IllegalException);
            }
            let off = off as usize;

            let m = k.tasks.get_mut(me).m.as_mut_bytes();
            match op {
                OP_LDM8 => st.regs[reg_a(w)] = m[off] as i32,
                OP_LDM16 => {
                    st.regs[reg_a(w)] =
                        u16::from_le_bytes([m[off], m[off + 1]]) as i32
                }
                OP_LDM32 => {
                    st.regs[reg_a(w)] = i32::from_le_bytes([
                        m[off],
                        m[off + 1],
                        m[off + 2],
                        m[off + 3],
                    ])
                }
                OP_STM8 => m[off] = st.regs[reg_a(w)] as u8,
                OP_STM16 => {
                    m[off..off + 2]
                        .copy_from_slice(&(st.regs[reg_a(w)] as u16).to_le_bytes())
                }
                OP_STM32 => {
                    m[off..off + 4].copy_from_slice(&st.regs[reg_a(w)].to_le_bytes())
                }
                _ => unreachable!(),
            }
        }

        OP_PRINT => klog!("#{}: pc={}: {}", me.as_i32(), st.pc, st.regs[reg_a(w)]),
        OP_PRINT_HEX => {
            klog!("#{}: pc={}: {:#x}", me.as_i32(), st.pc, st.regs[reg_a(w)] as u32)
        }

        op @ (OP_SEND | OP_REPLY) => {
            let dst = match Tid::new(st.regs[reg_b(w)]) {
                Some(t) if k.tasks.task(t).is_ok() => t,
                _ => {
                    klog!(
                        "#{}: SEND to invalid task {} at pc={}",
                        me.as_i32(),
                        st.regs[reg_b(w)],
                        st.pc
                    );
                    return Err(ExceptionReason::IllegalException);
                }
            };

            let mut flags = IpcFlags::SEND | IpcFlags::KERNEL;
            if op == OP_REPLY {
                // Replies must never park a server behind a slow client.
                flags |= IpcFlags::NOBLOCK;
            }

            let mut tmp = k.tasks.get(me).m;
            let r = ipc::ipc(k, cpus, Some(dst), RecvFilter::Any, MsgRef::Kernel(&mut tmp), flags);
            ipc_result(st, w, r)?;
        }

        OP_RECV => {
            let filter = match st.regs[reg_b(w)] {
                0 => RecvFilter::Any,
                raw => match Tid::new(raw) {
                    Some(t) => RecvFilter::From(t),
                    None => {
                        klog!("#{}: RECV from invalid task {} at pc={}", me.as_i32(), raw, st.pc);
                        return Err(ExceptionReason::IllegalException);
                    }
                },
            };

            let mut tmp = Message::default();
            let r = ipc::ipc(
                k,
                cpus,
                None,
                filter,
                MsgRef::Kernel(&mut tmp),
                IpcFlags::RECV | IpcFlags::KERNEL,
            );
            if r.is_ok() {
                k.tasks.get_mut(me).m = tmp;
            }
            ipc_result(st, w, r)?;
        }

        OP_EXIT => return Err(ExceptionReason::GraceExit),

        _ => {
            klog!("#{}: illegal instruction at pc={}", me.as_i32(), st.pc);
            return Err(ExceptionReason::IllegalException);
        }
    }

    st.pc = next_pc;
    Ok(())
}

/// Kernel-mode entry point of a bytecode task. `arg` is the kernel address
/// of its staged [`Program`]. The first dispatch arrives here through the
/// kernel-task trampoline, holding the big kernel lock like any other
/// in-kernel execution.
pub extern "C" fn task_entry(arg: usize) -> ! {
    // Safety: `arg` was produced by `stage_program` for this very task and
    // the page lives until the task is destroyed.
    let prog = unsafe { &*(arg as *const Program) };

    let cpus = &mp::CPUS;
    let me = match cpus.get(arch::cpu_id()).current() {
        Current::Task(tid) => tid,
        Current::Idle => panic!("bytecode program on the idle task"),
    };

    let mut st = VmState::new(prog);
    loop {
        // Safety: the big kernel lock is held here (trampoline or resumed
        // switch), which is `with_kernel`'s requirement.
        let r = unsafe { startup::with_kernel(|k| step(k, cpus, me, prog, &mut st)) };
        if let Err(reason) = r {
            // Safety: as above.
            unsafe { startup::with_kernel(|k| task::exit(k, cpus, reason)) }
        }
    }
}
