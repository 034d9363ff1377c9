//! Support for safely interacting with untrusted user memory.
//!
//! A user address is an allegation, not a capability: it names a spot in
//! the calling task's address space that may or may not be mapped, and must
//! never be dereferenced directly. The only operations that touch the
//! memory behind one are the copy routines here, which translate page by
//! page through the caller's page table (under the big kernel lock, so the
//! translation cannot rot) and run the page-fault protocol on a miss, then
//! retry -- the moral equivalent of restarting a faulted copy instruction.
//!
//! Because of this, no kernel-mode access ever takes a real page fault; the
//! trap handler treats any such fault as a kernel bug.

use abi::{Error, PageFault, Tid, PAGE_SIZE, TASK_NAME_LEN};
use kerncore::UserRange;

use crate::arch;
use crate::config::KERNEL_BASE;
use crate::err::UserError;
use crate::mp::Cpus;
use crate::startup::Kernel;
use crate::vm;
use crate::Paddr;

/// An address in user space. Distinct from kernel pointers by type so it
/// can't be dereferenced by accident; see the module docs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct UAddr(pub u32);

/// The user-mappable window: everything except the null page and the
/// kernel half.
pub fn mappable_range() -> UserRange {
    UserRange::new(PAGE_SIZE as u32, KERNEL_BASE)
}

pub fn is_mappable(vaddr: u32) -> bool {
    mappable_range().contains(vaddr)
}

/// Translates one user address for the given kind of access, asking the
/// caller's pager to fill holes. Loops because the pager's reply is taken
/// on faith; if it replied without mapping, the retry faults again, exactly
/// as a restarted instruction would.
fn resolve(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    uaddr: u32,
    need: u32,
    access: PageFault,
) -> Result<Paddr, UserError> {
    loop {
        let root = k.tasks.task(caller)?.vm.root;
        if let Some(pa) = vm::translate(root, uaddr, need) {
            return Ok(pa);
        }

        let mut fault = access | PageFault::USER;
        if vm::is_mapped(root, uaddr) {
            // Mapped but lacking the needed permission.
            fault |= PageFault::PRESENT;
        }
        vm::handle_page_fault(k, cpus, uaddr, arch::user_trap_pc(), fault)
            .map_err(UserError::Fatal)?;
    }
}

/// Copies `dst.len()` bytes from user address `src` into kernel memory.
pub fn copy_from_user(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    dst: &mut [u8],
    src: UAddr,
) -> Result<(), UserError> {
    if !mappable_range().contains_span(src.0, dst.len()) {
        return Err(Error::InvalidUaddr.into());
    }

    let mut off = 0;
    while off < dst.len() {
        let ua = src.0 + off as u32;
        let in_page = PAGE_SIZE - (ua as usize % PAGE_SIZE);
        let chunk = in_page.min(dst.len() - off);

        let pa = resolve(k, cpus, caller, ua, vm::NEED_USER_READ, PageFault::READ)?;
        // Safety: `resolve` proved the page is mapped readable for the
        // caller, and the chunk stays inside that page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                arch::paddr_to_vaddr(pa),
                dst[off..].as_mut_ptr(),
                chunk,
            );
        }
        off += chunk;
    }
    Ok(())
}

/// Copies `src` out to user address `dst`.
pub fn copy_to_user(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    dst: UAddr,
    src: &[u8],
) -> Result<(), UserError> {
    if !mappable_range().contains_span(dst.0, src.len()) {
        return Err(Error::InvalidUaddr.into());
    }

    let mut off = 0;
    while off < src.len() {
        let ua = dst.0 + off as u32;
        let in_page = PAGE_SIZE - (ua as usize % PAGE_SIZE);
        let chunk = in_page.min(src.len() - off);

        let pa = resolve(k, cpus, caller, ua, vm::NEED_USER_WRITE, PageFault::WRITE)?;
        // Safety: `resolve` proved the page is mapped writable for the
        // caller, and the chunk stays inside that page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src[off..].as_ptr(),
                arch::paddr_to_vaddr(pa),
                chunk,
            );
        }
        off += chunk;
    }
    Ok(())
}

/// Copies a task-name-sized string in; it must be NUL-terminated within
/// `TASK_NAME_LEN` bytes and hold well-formed UTF-8.
pub fn strcpy_from_user(
    k: &mut Kernel,
    cpus: &Cpus,
    caller: Tid,
    src: UAddr,
) -> Result<heapless::String<TASK_NAME_LEN>, UserError> {
    let mut buf = [0u8; TASK_NAME_LEN];
    copy_from_user(k, cpus, caller, &mut buf, src)?;

    let len = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::InvalidArg)?;
    let s = core::str::from_utf8(&buf[..len]).map_err(|_| Error::InvalidArg)?;

    let mut name = heapless::String::new();
    let _ = name.push_str(s);
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp::Current;
    use crate::startup::test_kernel;
    use crate::task::create_for_test;
    use abi::{PageAttrs, PmFlags};

    fn map_rw(k: &mut Kernel, cpus: &Cpus, t: Tid, uaddr: u32) -> Paddr {
        let p = k.pm.alloc(PAGE_SIZE, Some(t), PmFlags::ZEROED).unwrap();
        vm::map(
            k,
            cpus,
            t,
            uaddr,
            p,
            PageAttrs::READABLE | PageAttrs::WRITABLE | PageAttrs::USER,
        )
        .unwrap();
        p
    }

    #[test]
    fn round_trip_through_user_memory() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let t = create_for_test(&mut k, "alpha", None);
        cpus.get(0).set_current(Current::Task(t));

        let p = map_rw(&mut k, &cpus, t, 0x2000_0000);

        copy_to_user(&mut k, &cpus, t, UAddr(0x2000_0010), b"paging works").unwrap();
        // The bytes landed in the backing frame...
        let raw = unsafe {
            core::slice::from_raw_parts(arch::paddr_to_vaddr(p + 0x10), 12)
        };
        assert_eq!(raw, b"paging works");

        // ...and read back through the user window.
        let mut buf = [0u8; 12];
        copy_from_user(&mut k, &cpus, t, &mut buf, UAddr(0x2000_0010)).unwrap();
        assert_eq!(&buf, b"paging works");
    }

    #[test]
    fn copies_span_page_boundaries() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let t = create_for_test(&mut k, "alpha", None);
        cpus.get(0).set_current(Current::Task(t));

        map_rw(&mut k, &cpus, t, 0x2000_0000);
        map_rw(&mut k, &cpus, t, 0x2000_1000);

        let data: [u8; 64] = core::array::from_fn(|i| i as u8);
        let base = UAddr(0x2000_1000 - 32);
        copy_to_user(&mut k, &cpus, t, base, &data).unwrap();

        let mut back = [0u8; 64];
        copy_from_user(&mut k, &cpus, t, &mut back, base).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_pointers_are_recoverable_errors() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let t = create_for_test(&mut k, "alpha", None);
        cpus.get(0).set_current(Current::Task(t));

        let mut buf = [0u8; 8];
        // Null page.
        assert_eq!(
            copy_from_user(&mut k, &cpus, t, &mut buf, UAddr(0x10)),
            Err(UserError::Recoverable(Error::InvalidUaddr))
        );
        // Kernel half.
        assert_eq!(
            copy_to_user(&mut k, &cpus, t, UAddr(KERNEL_BASE), &buf),
            Err(UserError::Recoverable(Error::InvalidUaddr))
        );
        // Span leaking across the boundary.
        assert_eq!(
            copy_from_user(&mut k, &cpus, t, &mut buf, UAddr(KERNEL_BASE - 4)),
            Err(UserError::Recoverable(Error::InvalidUaddr))
        );
    }

    #[test]
    fn strcpy_requires_nul_and_utf8() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let t = create_for_test(&mut k, "alpha", None);
        cpus.get(0).set_current(Current::Task(t));

        map_rw(&mut k, &cpus, t, 0x2000_0000);

        copy_to_user(&mut k, &cpus, t, UAddr(0x2000_0000), b"console\0").unwrap();
        let name = strcpy_from_user(&mut k, &cpus, t, UAddr(0x2000_0000)).unwrap();
        assert_eq!(name.as_str(), "console");

        // 16 bytes with no terminator.
        copy_to_user(&mut k, &cpus, t, UAddr(0x2000_0100), b"aaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(
            strcpy_from_user(&mut k, &cpus, t, UAddr(0x2000_0100)),
            Err(UserError::Recoverable(Error::InvalidArg))
        );
    }
}
