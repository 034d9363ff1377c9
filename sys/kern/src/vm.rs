//! Virtual memory: Sv32 two-level page tables.
//!
//! Every address space's top-level table begins life as a copy of the
//! kernel template, so kernel mappings are shared by all tasks and user
//! mappings are private. The kernel template also maps some device windows
//! that happen to sit in the *user* half of the address space (the UART and
//! interrupt controllers live below `KERNEL_BASE` physically); a task that
//! maps user pages into one of those second-level tables gets its own
//! private copy of it first, so user mappings never leak into a shared
//! table.
//!
//! All of this code reaches page tables through the kernel's physical
//! window, so it runs unchanged against the hosted test arch.

use abi::{Error, ExceptionReason, IpcFlags, Message, PageAttrs, PageFault, Tid, PAGE_SIZE};

use crate::arch;
use crate::ipc::{self, MsgRef, RecvFilter};
use crate::mp::{self, Cpus, Current, IpiReason};
use crate::pm::{PhysMemory, ZoneKind};
use crate::startup::Kernel;
use crate::umem;
use crate::util::is_aligned;
use crate::{Paddr, Vaddr};

const PTE_V: u32 = 1 << 0;
const PTE_R: u32 = 1 << 1;
const PTE_W: u32 = 1 << 2;
const PTE_X: u32 = 1 << 3;
const PTE_U: u32 = 1 << 4;

/// Entries per table; each level of Sv32 resolves 10 bits.
const PTES_PER_TABLE: usize = 1024;

/// First-level entries that can carry user mappings. Everything from
/// `KERNEL_BASE` up belongs to the shared kernel half.
const USER_L1_ENTRIES: usize = (crate::config::KERNEL_BASE >> 22) as usize;

/// A task's page-table root.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddrSpace {
    pub root: Paddr,
}

fn pte_flags(attrs: PageAttrs) -> u32 {
    let mut f = 0;
    if attrs.contains(PageAttrs::READABLE) {
        f |= PTE_R;
    }
    if attrs.contains(PageAttrs::WRITABLE) {
        f |= PTE_W;
    }
    if attrs.contains(PageAttrs::EXECUTABLE) {
        f |= PTE_X;
    }
    if attrs.contains(PageAttrs::USER) {
        f |= PTE_U;
    }
    f
}

fn pte_paddr(pte: u32) -> Paddr {
    (pte >> 10) << 12
}

fn make_pte(paddr: Paddr, flags: u32) -> u32 {
    uassert!(is_aligned(paddr as usize, PAGE_SIZE));
    ((paddr >> 12) << 10) | flags
}

/// Borrows a page table through the physical window.
///
/// Safety: `paddr` must be a live page-table page, and the caller must hold
/// the big kernel lock, which serializes every page-table access.
unsafe fn table<'a>(paddr: Paddr) -> &'a mut [u32; PTES_PER_TABLE] {
    unsafe { &mut *(arch::paddr_to_vaddr(paddr) as *mut [u32; PTES_PER_TABLE]) }
}

fn l1_index(vaddr: Vaddr) -> usize {
    (vaddr >> 22) as usize
}

fn l2_index(vaddr: Vaddr) -> usize {
    ((vaddr >> 12) & 0x3ff) as usize
}

/// Finds the leaf entry for `vaddr`, allocating (and, for table pages
/// shared with the kernel template, privatizing) the second level as
/// needed. Returns a pointer valid until the table page is freed.
fn walk_alloc(
    pm: &mut PhysMemory,
    template: Paddr,
    root: Paddr,
    vaddr: Vaddr,
) -> Result<*mut u32, Error> {
    uassert!(is_aligned(vaddr as usize, PAGE_SIZE));

    // Safety: roots are live table pages; see `table`.
    let l1 = unsafe { table(root) };
    let idx = l1_index(vaddr);

    if l1[idx] & PTE_V == 0 {
        let pt = pm.alloc(PAGE_SIZE, None, abi::PmFlags::ZEROED)?;
        l1[idx] = make_pte(pt, PTE_V);
    } else if root != template {
        // Safety: the template root is a live table page.
        let tl1 = unsafe { table(template) };
        if l1[idx] == tl1[idx] {
            // This second level is shared with the kernel template. Give
            // the task its own copy before letting a user mapping in.
            let pt = pm.alloc(PAGE_SIZE, None, abi::PmFlags::ZEROED)?;
            // Safety: both are live table pages, distinct by construction.
            unsafe {
                *table(pt) = *table(pte_paddr(l1[idx]));
            }
            l1[idx] = make_pte(pt, PTE_V);
        }
    }

    // Safety: the entry we just ensured valid points at a table page.
    let l2 = unsafe { table(pte_paddr(l1[idx])) };
    Ok(&mut l2[l2_index(vaddr)])
}

/// Finds the leaf entry for `vaddr` without allocating anything.
fn walk_lookup(root: Paddr, vaddr: Vaddr) -> Option<*mut u32> {
    // Safety: see `table`.
    let l1 = unsafe { table(root) };
    let pte1 = l1[l1_index(vaddr)];
    if pte1 & PTE_V == 0 {
        return None;
    }
    // Safety: valid first-level entries point at table pages.
    let l2 = unsafe { table(pte_paddr(pte1)) };
    Some(&mut l2[l2_index(vaddr)])
}

/// Checks whether `vaddr` has a valid leaf mapping in `root`.
pub fn is_mapped(root: Paddr, vaddr: Vaddr) -> bool {
    let vaddr = (vaddr as usize & !(PAGE_SIZE - 1)) as Vaddr;
    match walk_lookup(root, vaddr) {
        // Safety: pointer produced by walk_lookup under the same lock.
        Some(pte) => (unsafe { *pte } & PTE_V) != 0,
        None => false,
    }
}

/// Translates `vaddr` through `root`, requiring the given permission bits
/// on top of validity. Returns the physical address of the byte.
pub(crate) fn translate(root: Paddr, vaddr: Vaddr, need: u32) -> Option<Paddr> {
    let page = (vaddr as usize & !(PAGE_SIZE - 1)) as Vaddr;
    let pte = walk_lookup(root, page)?;
    // Safety: pointer produced by walk_lookup under the same lock.
    let pte = unsafe { *pte };
    if pte & (PTE_V | need) != (PTE_V | need) {
        return None;
    }
    Some(pte_paddr(pte) + (vaddr - page))
}

/// Permission bit aliases for `translate` callers.
pub(crate) const NEED_USER_READ: u32 = PTE_U | PTE_R;
pub(crate) const NEED_USER_WRITE: u32 = PTE_U | PTE_W;

/// Installs a leaf mapping, with no policy checks and no shootdown. The
/// building blocks for `map`, the boot ELF loader, and the kernel template
/// itself (which passes `template == root`).
pub(crate) fn map_at(
    pm: &mut PhysMemory,
    template: Paddr,
    root: Paddr,
    vaddr: Vaddr,
    paddr: Paddr,
    attrs: PageAttrs,
) -> Result<(), Error> {
    uassert!(is_aligned(paddr as usize, PAGE_SIZE));

    let pte = walk_alloc(pm, template, root, vaddr)?;
    // Safety: pointer produced by walk_alloc under the same lock.
    unsafe {
        if *pte & PTE_V != 0 {
            return Err(Error::AlreadyExists);
        }
        *pte = make_pte(paddr, pte_flags(attrs) | PTE_V);
    }
    Ok(())
}

/// Removes the leaf mapping at `vaddr` and drops the mapped frame's
/// reference. Returns the physical address that was mapped.
pub(crate) fn unmap_at(pm: &mut PhysMemory, root: Paddr, vaddr: Vaddr) -> Result<Paddr, Error> {
    let pte = walk_lookup(root, vaddr).ok_or(Error::NotFound)?;
    // Safety: pointer produced by walk_lookup under the same lock.
    unsafe {
        if *pte & PTE_V == 0 {
            return Err(Error::NotFound);
        }
        let paddr = pte_paddr(*pte);
        *pte = 0;
        pm.free(paddr, PAGE_SIZE);
        Ok(paddr)
    }
}

/// Maps a run of pages; used for the kernel template and the boot ELF.
pub(crate) fn map_pages(
    pm: &mut PhysMemory,
    template: Paddr,
    root: Paddr,
    vaddr: Vaddr,
    paddr: Paddr,
    size: usize,
    attrs: PageAttrs,
) -> Result<(), Error> {
    for offset in (0..size).step_by(PAGE_SIZE) {
        map_at(
            pm,
            template,
            root,
            vaddr + offset as u32,
            paddr + offset as u32,
            attrs,
        )?;
    }
    Ok(())
}

/// Builds the kernel template page table: the mappings every address space
/// shares. The architecture layer reports what needs to be in it.
pub fn init_kernel_template(pm: &mut PhysMemory) -> Result<Paddr, Error> {
    let root = pm.alloc(PAGE_SIZE, None, abi::PmFlags::ZEROED)?;
    for (base, size, attrs) in arch::kernel_image_regions() {
        map_pages(pm, root, root, base, base, size, attrs)?;
    }
    Ok(root)
}

/// Creates a task's address space: a fresh root holding a copy of the
/// kernel template's first level.
pub fn init(pm: &mut PhysMemory, template: Paddr) -> Result<AddrSpace, Error> {
    let root = pm.alloc(PAGE_SIZE, None, abi::PmFlags::ZEROED)?;
    // Safety: both pages are live table pages under the lock.
    unsafe {
        *table(root) = *table(template);
    }
    Ok(AddrSpace { root })
}

/// Tears an address space down: frees every user-flagged leaf, every
/// second-level table private to this task, and the root. Second-level
/// tables inherited unchanged from the kernel template are shared and must
/// survive.
pub fn destroy(pm: &mut PhysMemory, template: Paddr, space: AddrSpace) {
    // Safety: live table pages under the lock, throughout.
    let l1 = unsafe { table(space.root) };
    let tl1 = unsafe { table(template) };

    for i in 0..USER_L1_ENTRIES {
        let pte1 = l1[i];
        if pte1 & PTE_V == 0 || pte1 == tl1[i] {
            continue;
        }

        let l2_paddr = pte_paddr(pte1);
        let l2 = unsafe { table(l2_paddr) };
        for pte2 in l2.iter() {
            if *pte2 & (PTE_V | PTE_U) == (PTE_V | PTE_U) {
                pm.free(pte_paddr(*pte2), PAGE_SIZE);
            }
        }
        pm.free(l2_paddr, PAGE_SIZE);
    }

    pm.free(space.root, PAGE_SIZE);
}

/// After any change to a live page table: flush the local TLB, then make
/// every peer CPU do the same and wait for them (synchronous shootdown).
fn shootdown(cpus: &Cpus) {
    arch::fence_tlb_local();
    mp::send_ipi(cpus, IpiReason::TLB_FLUSH);
}

/// The `vm_map` operation: policy checks, then the page-table edit.
///
/// A RAM frame may be mapped by its owner or its owner's pager; an MMIO
/// frame may be mapped only while nobody else has it, and the first mapper
/// becomes its owner.
pub fn map(
    k: &mut Kernel,
    cpus: &Cpus,
    tid: Tid,
    uaddr: Vaddr,
    paddr: Paddr,
    attrs: PageAttrs,
) -> Result<(), Error> {
    let (frame, kind) = match k.pm.info(paddr) {
        Some(x) => x,
        None => {
            klog!("vm_map: no page for paddr {:#x}", paddr);
            return Err(Error::InvalidPaddr);
        }
    };

    match kind {
        ZoneKind::Free => {
            if frame.ref_count == 0 {
                klog!("vm_map: paddr {:#x} is not allocated", paddr);
                return Err(Error::InvalidPaddr);
            }
            let permitted = match frame.owner {
                Some(owner) if owner == tid => true,
                Some(owner) => k.tasks.task(owner)?.pager == Some(tid),
                None => false,
            };
            if !permitted {
                klog!("vm_map: paddr {:#x} is not owned by #{}", paddr, tid.as_i32());
                return Err(Error::InvalidPaddr);
            }
        }
        ZoneKind::Mmio => {
            if frame.ref_count > 0 {
                // Two driver tasks must never share a device window.
                klog!("vm_map: device paddr {:#x} is already mapped", paddr);
                return Err(Error::InvalidPaddr);
            }
        }
    }

    let root = k.tasks.task(tid)?.vm.root;
    map_at(&mut k.pm, k.kvm.root, root, uaddr, paddr, attrs)?;

    let adopt = (kind == ZoneKind::Mmio).then_some(tid);
    k.pm.retain_mapping(paddr, adopt);

    shootdown(cpus);
    Ok(())
}

/// The `vm_unmap` operation.
pub fn unmap(
    k: &mut Kernel,
    cpus: &Cpus,
    tid: Tid,
    uaddr: Vaddr,
) -> Result<(), Error> {
    if !umem::is_mappable(uaddr) {
        return Err(Error::InvalidArg);
    }

    let root = k.tasks.task(tid)?.vm.root;
    unmap_at(&mut k.pm, root, uaddr)?;

    shootdown(cpus);
    Ok(())
}

/// The page-fault protocol: ask the faulting task's pager to repair the
/// mapping, blocking until it replies.
///
/// Returns `Ok` when the pager answered with a page-fault reply; the caller
/// then simply resumes (or retries) the faulted access. An `Err` carries
/// the reason the task must die instead.
pub fn handle_page_fault(
    k: &mut Kernel,
    cpus: &Cpus,
    vaddr: Vaddr,
    ip: u32,
    fault: PageFault,
) -> Result<(), ExceptionReason> {
    if !fault.contains(PageFault::USER) {
        panic!(
            "page fault in kernel: vaddr={:#x}, ip={:#x}, reason={:#x}",
            vaddr,
            ip,
            fault.bits()
        );
    }

    let current = match cpus.get(arch::cpu_id()).current() {
        Current::Task(tid) => tid,
        Current::Idle => panic!("page fault in the idle task: vaddr={vaddr:#x}"),
    };

    // Null page and kernel addresses can never be mapped; faulting on one
    // is fatal for the task, not a pager matter.
    if !umem::is_mappable(vaddr) {
        klog!(
            "#{}: page fault at unmappable vaddr: vaddr={:#x}, ip={:#x}",
            current.as_i32(),
            vaddr,
            ip
        );
        return Err(ExceptionReason::InvalidUaddr);
    }

    // The bootstrap task has no pager; a fault there is a kernel-level
    // failure, since nobody can page for it.
    let pager = match k.tasks.task(current).ok().and_then(|t| t.pager) {
        Some(p) => p,
        None => panic!(
            "#{}: unexpected page fault: vaddr={vaddr:#x}, ip={ip:#x}",
            current.as_i32()
        ),
    };

    let mut m = Message::page_fault(current, vaddr, ip, fault);
    let sent = ipc::ipc(
        k,
        cpus,
        Some(pager),
        RecvFilter::From(pager),
        MsgRef::Kernel(&mut m),
        IpcFlags::CALL | IpcFlags::KERNEL,
    );

    if sent.is_err() || m.ty != abi::PAGE_FAULT_REPLY_MSG {
        return Err(ExceptionReason::InvalidPagerReply);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::test_kernel;
    use abi::PmFlags;

    fn attrs_rw() -> PageAttrs {
        PageAttrs::READABLE | PageAttrs::WRITABLE | PageAttrs::USER
    }

    #[test]
    fn map_then_unmap_restores_refcount() {
        let mut k = test_kernel();
        let t = crate::task::create_for_test(&mut k, "alpha", None);

        let p = k.pm.alloc(PAGE_SIZE, Some(t), PmFlags::ZEROED).unwrap();
        assert_eq!(k.pm.info(p).unwrap().0.ref_count, 1);

        let cpus = Cpus::new();
        map(&mut k, &cpus, t, 0x1000_0000, p, attrs_rw()).unwrap();
        assert_eq!(k.pm.info(p).unwrap().0.ref_count, 2);
        assert!(is_mapped(k.tasks.task(t).unwrap().vm.root, 0x1000_0000));

        unmap(&mut k, &cpus, t, 0x1000_0000).unwrap();
        assert_eq!(k.pm.info(p).unwrap().0.ref_count, 1);
        assert!(!is_mapped(k.tasks.task(t).unwrap().vm.root, 0x1000_0000));
    }

    #[test]
    fn double_map_is_rejected() {
        let mut k = test_kernel();
        let t = crate::task::create_for_test(&mut k, "alpha", None);
        let cpus = Cpus::new();

        let p = k.pm.alloc(PAGE_SIZE, Some(t), PmFlags::ZEROED).unwrap();
        let q = k.pm.alloc(PAGE_SIZE, Some(t), PmFlags::ZEROED).unwrap();
        map(&mut k, &cpus, t, 0x2000_0000, p, attrs_rw()).unwrap();
        assert_eq!(
            map(&mut k, &cpus, t, 0x2000_0000, q, attrs_rw()),
            Err(Error::AlreadyExists)
        );
    }

    #[test]
    fn unallocated_or_foreign_frames_are_rejected() {
        let mut k = test_kernel();
        let alpha = crate::task::create_for_test(&mut k, "alpha", None);
        let beta = crate::task::create_for_test(&mut k, "beta", None);
        let cpus = Cpus::new();

        // Never-allocated frame: find one by allocating and freeing.
        let free = k.pm.alloc(PAGE_SIZE, None, PmFlags::ZEROED).unwrap();
        k.pm.free(free, PAGE_SIZE);
        assert_eq!(
            map(&mut k, &cpus, alpha, 0x2000_0000, free, attrs_rw()),
            Err(Error::InvalidPaddr)
        );

        // A frame owned by beta: alpha is neither owner nor beta's pager.
        let p = k.pm.alloc(PAGE_SIZE, Some(beta), PmFlags::ZEROED).unwrap();
        assert_eq!(
            map(&mut k, &cpus, alpha, 0x2000_0000, p, attrs_rw()),
            Err(Error::InvalidPaddr)
        );
    }

    #[test]
    fn pager_may_map_into_its_client() {
        let mut k = test_kernel();
        let pager = crate::task::create_for_test(&mut k, "pager", None);
        let client = crate::task::create_for_test(&mut k, "client", Some(pager));
        let cpus = Cpus::new();

        // Frame owned by the client, mapped into the *pager*'s space: the
        // owner's pager is allowed.
        let p = k.pm.alloc(PAGE_SIZE, Some(client), PmFlags::ZEROED).unwrap();
        map(&mut k, &cpus, pager, 0x2000_0000, p, attrs_rw()).unwrap();
        assert_eq!(k.pm.info(p).unwrap().0.ref_count, 2);
        let _ = client;
    }

    #[test]
    fn mmio_single_mapper_rule() {
        let mut k = test_kernel();
        let a = crate::task::create_for_test(&mut k, "drv-a", None);
        let b = crate::task::create_for_test(&mut k, "drv-b", None);
        let cpus = Cpus::new();
        k.pm.add_mmio(0x1000_1000, PAGE_SIZE).unwrap();

        map(&mut k, &cpus, a, 0x3000_0000, 0x1000_1000, attrs_rw()).unwrap();
        // First mapper became the owner.
        let (f, kind) = k.pm.info(0x1000_1000).unwrap();
        assert_eq!(kind, crate::pm::ZoneKind::Mmio);
        assert_eq!(f.owner, Some(a));
        assert_eq!(f.ref_count, 1);

        assert_eq!(
            map(&mut k, &cpus, b, 0x3000_0000, 0x1000_1000, attrs_rw()),
            Err(Error::InvalidPaddr)
        );

        // After unmap, another task may claim it.
        unmap(&mut k, &cpus, a, 0x3000_0000).unwrap();
        map(&mut k, &cpus, b, 0x3000_0000, 0x1000_1000, attrs_rw()).unwrap();
        assert_eq!(k.pm.info(0x1000_1000).unwrap().0.owner, Some(b));
    }

    #[test]
    fn unmap_of_missing_mapping_fails() {
        let mut k = test_kernel();
        let t = crate::task::create_for_test(&mut k, "alpha", None);
        let cpus = Cpus::new();

        assert_eq!(
            unmap(&mut k, &cpus, t, 0x2000_0000),
            Err(Error::NotFound)
        );
        // Kernel-half addresses are not even considered.
        assert_eq!(
            unmap(&mut k, &cpus, t, 0x8000_0000),
            Err(Error::InvalidArg)
        );
    }

    #[test]
    fn destroy_frees_user_frames_and_tables() {
        let mut k = test_kernel();
        let t = crate::task::create_for_test(&mut k, "alpha", None);
        let cpus = Cpus::new();

        let p = k.pm.alloc(PAGE_SIZE, Some(t), PmFlags::ZEROED).unwrap();
        map(&mut k, &cpus, t, 0x2000_0000, p, attrs_rw()).unwrap();
        assert_eq!(k.pm.info(p).unwrap().0.ref_count, 2);

        let space = k.tasks.task(t).unwrap().vm;
        let template = k.kvm.root;
        destroy(&mut k.pm, template, space);

        // The mapping reference is gone; the allocation reference remains
        // until the owner's pages are released.
        assert_eq!(k.pm.info(p).unwrap().0.ref_count, 1);
    }

    #[test]
    fn fault_on_unmappable_address_is_fatal() {
        let mut k = test_kernel();
        let cpus = Cpus::new();
        let pager = crate::task::create_for_test(&mut k, "pager", None);
        let t = crate::task::create_for_test(&mut k, "task", Some(pager));
        cpus.get(0).set_current(Current::Task(t));

        // Null page and kernel half both kill the task rather than
        // bothering the pager.
        for bad in [0x0u32, 0x10, 0x8000_0000, 0xffff_f000] {
            assert_eq!(
                handle_page_fault(
                    &mut k,
                    &cpus,
                    bad,
                    0x100_0000,
                    PageFault::READ | PageFault::USER,
                ),
                Err(ExceptionReason::InvalidUaddr)
            );
        }
    }

    #[test]
    fn translate_honors_permissions() {
        let mut k = test_kernel();
        let t = crate::task::create_for_test(&mut k, "alpha", None);
        let cpus = Cpus::new();

        let p = k.pm.alloc(PAGE_SIZE, Some(t), PmFlags::ZEROED).unwrap();
        let ro = PageAttrs::READABLE | PageAttrs::USER;
        map(&mut k, &cpus, t, 0x2000_0000, p, ro).unwrap();

        let root = k.tasks.task(t).unwrap().vm.root;
        assert_eq!(translate(root, 0x2000_0044, NEED_USER_READ), Some(p + 0x44));
        assert_eq!(translate(root, 0x2000_0044, NEED_USER_WRITE), None);
        assert_eq!(translate(root, 0x2800_0000, NEED_USER_READ), None);
    }
}
