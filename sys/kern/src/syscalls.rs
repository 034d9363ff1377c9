//! Architecture-independent syscall implementation.
//!
//! The architecture trap path hands us the saved argument registers behind
//! the [`SyscallArgs`] trait and writes our `i32` result back into the
//! caller's return register. Every syscall validates its arguments and
//! copies user data into bounded kernel buffers *before* changing any
//! state, so a refused call has no side effects.
//!
//! Errors come in two flavors (see `err`): recoverable ones become negative
//! return codes, and fatal ones terminate the caller through the exception
//! path without returning at all.

use core::convert::TryFrom;

use abi::{
    Error, ExceptionReason, IpcFlags, Notifications, PageAttrs, PmFlags, Sysnum, Tid,
    HINAVM_INSTS_MAX, NUM_TASKS_MAX, PAGE_SIZE, PFN_SHIFT,
};
use zerocopy::IntoBytes;

use crate::arch;
use crate::config::TICK_HZ;
use crate::err::UserError;
use crate::ipc::{self, MsgRef, RecvFilter};
use crate::mp::{Cpus, Current};
use crate::startup::Kernel;
use crate::task;
use crate::umem::{self, UAddr};
use crate::util::is_aligned;
use crate::vm;

/// Read access to the syscall argument registers of a trapped task.
/// Arguments ride in a0-a4 and the syscall number in a5; the result goes
/// back out through a0.
pub trait SyscallArgs {
    fn sysnum(&self) -> u32;
    fn arg0(&self) -> u32;
    fn arg1(&self) -> u32;
    fn arg2(&self) -> u32;
    fn arg3(&self) -> u32;
    fn arg4(&self) -> u32;
}

/// Syscall entry: decode, dispatch, and flatten the result into the ABI's
/// value-or-negative-code convention.
pub fn dispatch(k: &mut Kernel, cpus: &Cpus, frame: &impl SyscallArgs) -> i32 {
    let caller = match cpus.get(arch::cpu_id()).current() {
        Current::Task(tid) => tid,
        Current::Idle => panic!("syscall from the idle task"),
    };

    let r = match Sysnum::try_from(frame.sysnum()) {
        Ok(Sysnum::Ipc) => sys_ipc(
            k,
            cpus,
            frame.arg0() as i32,
            frame.arg1() as i32,
            UAddr(frame.arg2()),
            frame.arg3(),
        ),
        Ok(Sysnum::Notify) => sys_notify(k, frame.arg0() as i32, frame.arg1()),
        Ok(Sysnum::SerialWrite) => sys_serial_write(
            k,
            cpus,
            caller,
            UAddr(frame.arg0()),
            frame.arg1() as usize,
        ),
        Ok(Sysnum::SerialRead) => sys_serial_read(
            k,
            cpus,
            caller,
            UAddr(frame.arg0()),
            frame.arg1() as i32,
        ),
        Ok(Sysnum::TaskCreate) => sys_task_create(
            k,
            cpus,
            caller,
            UAddr(frame.arg0()),
            frame.arg1(),
            frame.arg2() as i32,
        ),
        Ok(Sysnum::TaskDestroy) => sys_task_destroy(k, cpus, caller, frame.arg0() as i32),
        Ok(Sysnum::TaskExit) => task::exit(k, cpus, ExceptionReason::GraceExit),
        Ok(Sysnum::TaskSelf) => Ok(caller.as_i32()),
        Ok(Sysnum::PmAlloc) => sys_pm_alloc(
            k,
            caller,
            frame.arg0() as i32,
            frame.arg1() as usize,
            frame.arg2(),
        ),
        Ok(Sysnum::VmMap) => sys_vm_map(
            k,
            cpus,
            frame.arg0() as i32,
            frame.arg1(),
            frame.arg2(),
            frame.arg3(),
        ),
        Ok(Sysnum::VmUnmap) => sys_vm_unmap(k, cpus, frame.arg0() as i32, frame.arg1()),
        Ok(Sysnum::IrqListen) => {
            sys_irq_result(k.irqs.listen(caller, frame.arg0() as usize))
        }
        Ok(Sysnum::IrqUnlisten) => {
            sys_irq_result(k.irqs.unlisten(caller, frame.arg0() as usize))
        }
        Ok(Sysnum::Time) => sys_time(k, caller, frame.arg0() as i32),
        Ok(Sysnum::Uptime) => Ok((k.uptime_ticks * 1000 / u64::from(TICK_HZ)) as i32),
        Ok(Sysnum::HinaVm) => sys_hinavm(
            k,
            cpus,
            caller,
            UAddr(frame.arg0()),
            UAddr(frame.arg1()),
            frame.arg2() as usize,
            frame.arg3() as i32,
        ),
        Ok(Sysnum::Shutdown) => {
            klog!("shutdown requested by #{}", caller.as_i32());
            arch::shutdown()
        }
        Err(()) => Err(Error::InvalidSyscall.into()),
    };

    match r {
        Ok(value) => value,
        Err(UserError::Recoverable(e)) => e.code(),
        // Fatal errors never come back: the task dies and the CPU moves on
        // to somebody else.
        Err(UserError::Fatal(reason)) => task::exit(k, cpus, reason),
    }
}

fn sys_irq_result(r: Result<(), Error>) -> Result<i32, UserError> {
    r.map(|()| 0).map_err(UserError::from)
}

fn lookup(k: &Kernel, raw: i32) -> Result<Tid, UserError> {
    let tid = Tid::new(raw).ok_or(Error::InvalidTask)?;
    k.tasks.task(tid)?;
    Ok(tid)
}

fn sys_ipc(
    k: &mut Kernel,
    cpus: &Cpus,
    dst_raw: i32,
    src_raw: i32,
    m: UAddr,
    flags_raw: u32,
) -> Result<i32, UserError> {
    let flags = IpcFlags::from_bits(flags_raw).ok_or(Error::InvalidArg)?;
    if flags.contains(IpcFlags::KERNEL) {
        // Only the kernel composes kernel-origin messages.
        return Err(Error::InvalidArg.into());
    }

    if !(-1..=NUM_TASKS_MAX as i32).contains(&src_raw) {
        return Err(Error::InvalidArg.into());
    }

    let filter = if flags.contains(IpcFlags::RECV) {
        match src_raw {
            0 => RecvFilter::Any,
            // A receive that denies every sender could never finish.
            -1 => return Err(Error::InvalidArg.into()),
            n => RecvFilter::From(Tid::new(n).ok_or(Error::InvalidArg)?),
        }
    } else {
        RecvFilter::Any
    };

    let dst = if flags.contains(IpcFlags::SEND) {
        Some(lookup(k, dst_raw)?)
    } else {
        None
    };

    ipc::ipc(k, cpus, dst, filter, MsgRef::User(m), flags)?;
    Ok(0)
}

fn sys_notify(k: &mut Kernel, dst_raw: i32, bits: u32) -> Result<i32, UserError> {
    let dst = lookup(k, dst_raw)?;
    ipc::notify(&mut k.tasks, dst, Notifications::from_bits_retain(bits));
    Ok(0)
}

fn sys_serial_write(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    buf: UAddr,
    len: usize,
) -> Result<i32, UserError> {
    // Writing the serial port takes time; bound one call's worth.
    let written = len.min(4096);

    let mut kbuf = [0u8; 512];
    let mut off = 0;
    while off < written {
        let n = (written - off).min(kbuf.len());
        umem::copy_from_user(k, cpus, caller, &mut kbuf[..n], UAddr(buf.0 + off as u32))?;
        for &b in &kbuf[..n] {
            arch::console_write_byte(b);
        }
        off += n;
    }

    Ok(written as i32)
}

fn sys_serial_read(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    buf: UAddr,
    max: i32,
) -> Result<i32, UserError> {
    if max < 0 {
        return Err(Error::InvalidArg.into());
    }

    // Hand over whatever has accumulated, without blocking; zero bytes is
    // a valid answer.
    let mut tmp = [0u8; crate::config::CONSOLE_RX_BUF];
    let want = (max as usize).min(tmp.len());
    let mut n = 0;
    while n < want {
        match k.console_rx.pop_front() {
            Some(b) => {
                tmp[n] = b;
                n += 1;
            }
            None => break,
        }
    }

    umem::copy_to_user(k, cpus, caller, buf, &tmp[..n])?;
    Ok(n as i32)
}

fn sys_task_create(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    name: UAddr,
    ip: u32,
    pager_raw: i32,
) -> Result<i32, UserError> {
    let name = umem::strcpy_from_user(k, cpus, caller, name)?;

    let pager = Tid::new(pager_raw).ok_or(Error::InvalidArg)?;
    k.tasks.task(pager).map_err(|_| Error::InvalidArg)?;

    let tid = task::create(k, &name, ip, Some(pager))?;
    Ok(tid.as_i32())
}

fn sys_task_destroy(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    tid_raw: i32,
) -> Result<i32, UserError> {
    let tid = lookup(k, tid_raw)?;
    if tid == caller {
        // A task takes itself down with `task_exit`, not this.
        return Err(Error::InvalidTask.into());
    }

    task::destroy(k, cpus, tid)?;
    Ok(0)
}

fn sys_pm_alloc(
    k: &mut Kernel,
    caller: Tid,
    tid_raw: i32,
    size: usize,
    flags_raw: u32,
) -> Result<i32, UserError> {
    let flags = PmFlags::from_bits(flags_raw).ok_or(Error::InvalidArg)?;

    let tid = lookup(k, tid_raw)?;
    if tid != caller && k.tasks.task(tid)?.pager != Some(caller) {
        // Memory may only be given to yourself or to a task you page for.
        return Err(Error::InvalidTask.into());
    }

    // User frames are always scrubbed, whatever the caller asked for.
    let paddr = k.pm.alloc(size, Some(tid), flags | PmFlags::ZEROED)?;
    Ok((paddr >> PFN_SHIFT) as i32)
}

fn sys_vm_map(
    k: &mut Kernel,
    cpus: &Cpus,
    tid_raw: i32,
    uaddr: u32,
    paddr: u32,
    attrs_raw: u32,
) -> Result<i32, UserError> {
    let tid = lookup(k, tid_raw)?;

    let attrs = PageAttrs::from_bits(attrs_raw).ok_or(Error::InvalidArg)?;
    if attrs.contains(PageAttrs::USER) {
        return Err(Error::InvalidArg.into());
    }

    if !is_aligned(uaddr as usize, PAGE_SIZE) || !is_aligned(paddr as usize, PAGE_SIZE) {
        return Err(Error::InvalidArg.into());
    }
    if !umem::is_mappable(uaddr) {
        return Err(Error::InvalidUaddr.into());
    }

    // Mappings made from user space are always user-accessible.
    vm::map(k, cpus, tid, uaddr, paddr, attrs | PageAttrs::USER)?;
    Ok(0)
}

fn sys_vm_unmap(
    k: &mut Kernel,
    cpus: &Cpus,
    tid_raw: i32,
    uaddr: u32,
) -> Result<i32, UserError> {
    let tid = lookup(k, tid_raw)?;

    if !is_aligned(uaddr as usize, PAGE_SIZE) {
        return Err(Error::InvalidArg.into());
    }
    if !umem::is_mappable(uaddr) {
        return Err(Error::InvalidUaddr.into());
    }

    vm::unmap(k, cpus, tid, uaddr)?;
    Ok(0)
}

fn sys_time(k: &mut Kernel, caller: Tid, timeout_ms: i32) -> Result<i32, UserError> {
    if timeout_ms < 0 {
        return Err(Error::InvalidArg.into());
    }

    // Zero cancels; anything else re-arms the countdown.
    k.tasks.get_mut(caller).timeout =
        (timeout_ms as u32).saturating_mul(TICK_HZ / 1000);
    Ok(0)
}

fn sys_hinavm(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    name: UAddr,
    insts: UAddr,
    num_insts: usize,
    pager_raw: i32,
) -> Result<i32, UserError> {
    let name = umem::strcpy_from_user(k, cpus, caller, name)?;

    let pager = Tid::new(pager_raw).ok_or(Error::InvalidArg)?;
    k.tasks.task(pager).map_err(|_| Error::InvalidArg)?;

    if num_insts > HINAVM_INSTS_MAX {
        klog!("too many instructions: {} (max={})", num_insts, HINAVM_INSTS_MAX);
        return Err(Error::InvalidArg.into());
    }

    let mut buf = [0u32; HINAVM_INSTS_MAX];
    umem::copy_from_user(k, cpus, caller, buf[..num_insts].as_mut_bytes(), insts)?;

    let tid = task::create_hinavm(k, &name, &buf[..num_insts], pager)?;
    Ok(tid.as_i32())
}
