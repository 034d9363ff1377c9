//! Physical memory manager.
//!
//! Physical memory is described by *zones*: contiguous runs of page frames,
//! each either free RAM available to the allocator or an MMIO window that
//! can only ever be mapped, never allocated. Every frame has a record
//! holding a reference count and an owning task; the records for a zone are
//! stored in physical memory themselves, at the head of the region for RAM
//! zones and in a separately allocated header for MMIO zones.
//!
//! Reference counting rules:
//!
//! - `pm.alloc` takes the frame from 0 to 1 and records the owner.
//! - every `vm::map` of the frame adds 1, every `vm::unmap` removes 1.
//! - a frame at 0 is free and owned by nobody.
//!
//! Freeing a frame that is already free is a kernel bug and asserts.

use abi::{Error, PmFlags, Tid, PAGE_SIZE};

use crate::arch;
use crate::util::{align_down, align_up, is_aligned};
use crate::Paddr;

/// How many zones the boot memory map may describe.
pub const NUM_ZONES_MAX: usize = 8;

/// One page frame's bookkeeping record. Lives in physical memory, inside
/// its zone's header.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Frame {
    /// 0 = free. Otherwise: one for the allocation itself (RAM frames),
    /// plus one per page-table mapping.
    ref_count: u32,
    /// Owning task id, or 0 for none/kernel. A weak reference; the task
    /// manager clears it when the owner dies.
    owner: i32,
}

impl kerncore::FrameRecord for Frame {
    fn in_use(&self) -> bool {
        self.ref_count != 0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ZoneKind {
    /// Ordinary RAM, available to `alloc`.
    Free,
    /// A device window. Never allocated; mapped by at most one task.
    Mmio,
}

struct Zone {
    kind: ZoneKind,
    /// Physical address of the first managed frame.
    base: Paddr,
    num_pages: usize,
    /// Physical address of the `Frame` array describing this zone.
    frames_at: Paddr,
}

impl Zone {
    fn contains(&self, paddr: Paddr) -> bool {
        self.base <= paddr && paddr < self.base + (self.num_pages * PAGE_SIZE) as u32
    }

    fn index_of(&self, paddr: Paddr) -> usize {
        ((paddr - self.base) as usize) / PAGE_SIZE
    }

    fn frames(&self) -> &[Frame] {
        // Safety: the header region was carved out exclusively for this
        // zone at registration and is only reached through it.
        unsafe {
            core::slice::from_raw_parts(
                arch::paddr_to_vaddr(self.frames_at) as *const Frame,
                self.num_pages,
            )
        }
    }

    fn frames_mut(&mut self) -> &mut [Frame] {
        // Safety: as above, plus `&mut self` pins down exclusivity.
        unsafe {
            core::slice::from_raw_parts_mut(
                arch::paddr_to_vaddr(self.frames_at) as *mut Frame,
                self.num_pages,
            )
        }
    }
}

pub struct PhysMemory {
    zones: heapless::Vec<Zone, NUM_ZONES_MAX>,
}

impl PhysMemory {
    pub fn new() -> Self {
        Self {
            zones: heapless::Vec::new(),
        }
    }

    /// Registers a region of free RAM from the boot memory map. The frame
    /// records are placed at the head of the region itself, so the number
    /// of managed pages is slightly less than `size / PAGE_SIZE`.
    pub fn add_free_ram(&mut self, base: Paddr, size: usize) {
        uassert!(is_aligned(base as usize, PAGE_SIZE));

        let num_pages =
            align_down(size, PAGE_SIZE) / (PAGE_SIZE + core::mem::size_of::<Frame>());
        let header = align_up(num_pages * core::mem::size_of::<Frame>(), PAGE_SIZE);

        let mut zone = Zone {
            kind: ZoneKind::Free,
            base: base + header as u32,
            num_pages,
            frames_at: base,
        };
        zone.frames_mut().fill(Frame {
            ref_count: 0,
            owner: 0,
        });

        if self.zones.push(zone).is_err() {
            panic!("pm: too many zones");
        }
    }

    /// Registers an MMIO window. Its frame records are allocated out of the
    /// RAM zones, so those must be registered first.
    pub fn add_mmio(&mut self, base: Paddr, size: usize) -> Result<(), Error> {
        uassert!(is_aligned(size, PAGE_SIZE));

        let num_pages = size / PAGE_SIZE;
        let frames_at =
            self.alloc(num_pages * core::mem::size_of::<Frame>(), None, PmFlags::empty())?;

        let mut zone = Zone {
            kind: ZoneKind::Mmio,
            base,
            num_pages,
            frames_at,
        };
        zone.frames_mut().fill(Frame {
            ref_count: 0,
            owner: 0,
        });

        if self.zones.push(zone).is_err() {
            panic!("pm: too many zones");
        }
        Ok(())
    }

    /// Allocates `size` bytes (rounded up to whole pages) of physically
    /// contiguous memory, owned by `owner` (or the kernel, for `None`).
    pub fn alloc(
        &mut self,
        size: usize,
        owner: Option<Tid>,
        flags: PmFlags,
    ) -> Result<Paddr, Error> {
        if size == 0 {
            return Err(Error::InvalidArg);
        }

        let aligned_size = align_up(size, PAGE_SIZE);
        let count = aligned_size / PAGE_SIZE;
        let align = flags
            .contains(PmFlags::ALIGNED)
            .then_some(aligned_size as u32);

        for zone in self.zones.iter_mut() {
            if zone.kind != ZoneKind::Free {
                // MMIO windows are only ever mapped, never handed out here.
                continue;
            }

            let start = match kerncore::find_free_run(
                zone.frames(),
                zone.base,
                PAGE_SIZE as u32,
                count,
                align,
            ) {
                Some(start) => start,
                None => continue,
            };

            let owner_raw = owner.map_or(0, Tid::as_i32);
            for frame in &mut zone.frames_mut()[start..start + count] {
                *frame = Frame {
                    ref_count: 1,
                    owner: owner_raw,
                };
            }

            let paddr = zone.base + (start * PAGE_SIZE) as u32;
            if flags.contains(PmFlags::ZEROED) {
                // Safety: the frames were just taken out of the free pool,
                // so nothing else refers to them yet.
                unsafe {
                    core::ptr::write_bytes(arch::paddr_to_vaddr(paddr), 0, aligned_size);
                }
            }
            return Ok(paddr);
        }

        klog!("pm: run out of memory ({} bytes)", size);
        Err(Error::NoMemory)
    }

    /// Releases one reference on each frame in `[paddr, paddr + size)`.
    pub fn free(&mut self, paddr: Paddr, size: usize) {
        uassert!(is_aligned(size, PAGE_SIZE));

        for offset in (0..size).step_by(PAGE_SIZE) {
            let frame = self
                .frame_at(paddr + offset as u32)
                .expect("pm: free of unmanaged paddr")
                .0;
            release(frame);
        }
    }

    /// Records `owner` as the owner of an already-allocated frame. Used for
    /// the narrow case where a frame had to be allocated before the task
    /// that will own it existed.
    pub fn set_owner(&mut self, paddr: Paddr, owner: Tid) {
        let frame = self.frame_at(paddr).expect("pm: unmanaged paddr").0;
        uassert!(frame.owner == 0);
        uassert!(frame.ref_count == 1);
        frame.owner = owner.as_i32();
    }

    /// Releases the allocation reference of every frame still owned by
    /// `tid`, and forgets the owner. Runs as part of task destruction,
    /// after the task's mappings are gone.
    pub fn free_all_owned(&mut self, tid: Tid) {
        for zone in self.zones.iter_mut() {
            for frame in zone.frames_mut() {
                if frame.owner == tid.as_i32() {
                    if frame.ref_count > 0 {
                        release(frame);
                    }
                    // Even a frame that stays referenced (co-mapped by some
                    // other task) must stop naming a dead owner.
                    frame.owner = 0;
                }
            }
        }
    }

    /// Adds a mapping reference to the frame at `paddr`. The permission
    /// decision was made by the caller (`vm::map`).
    pub(crate) fn retain_mapping(&mut self, paddr: Paddr, new_owner: Option<Tid>) {
        let frame = self.frame_at(paddr).expect("pm: unmanaged paddr").0;
        frame.ref_count += 1;
        if let Some(tid) = new_owner {
            frame.owner = tid.as_i32();
        }
    }

    /// Looks up the frame record and zone kind for `paddr`, read-only.
    pub fn info(&self, paddr: Paddr) -> Option<(FrameInfo, ZoneKind)> {
        for zone in self.zones.iter() {
            if zone.contains(paddr) {
                let f = zone.frames()[zone.index_of(paddr)];
                return Some((
                    FrameInfo {
                        ref_count: f.ref_count,
                        owner: Tid::new(f.owner),
                    },
                    zone.kind,
                ));
            }
        }
        None
    }

    fn frame_at(&mut self, paddr: Paddr) -> Option<(&mut Frame, ZoneKind)> {
        for zone in self.zones.iter_mut() {
            if zone.contains(paddr) {
                let kind = zone.kind;
                let idx = zone.index_of(paddr);
                return Some((&mut zone.frames_mut()[idx], kind));
            }
        }
        None
    }
}

fn release(frame: &mut Frame) {
    // Double-free detection: freeing past zero is always a kernel bug.
    uassert!(frame.ref_count > 0);
    frame.ref_count -= 1;
    if frame.ref_count == 0 {
        frame.owner = 0;
    }
}

/// Read-only view of a frame record, for permission checks and tests.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameInfo {
    pub ref_count: u32,
    pub owner: Option<Tid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_pm(pages: usize) -> PhysMemory {
        let mut pm = PhysMemory::new();
        // One extra page absorbs the in-zone frame header.
        let bytes = (pages + 1) * PAGE_SIZE;
        pm.add_free_ram(arch::alloc_phys_region(bytes), bytes);
        pm
    }

    fn tid(n: i32) -> Tid {
        Tid::new(n).unwrap()
    }

    #[test]
    fn alloc_tracks_owner_and_refcount() {
        let mut pm = fresh_pm(8);
        let p = pm.alloc(2 * PAGE_SIZE, Some(tid(3)), PmFlags::empty()).unwrap();

        for off in [0, PAGE_SIZE] {
            let (f, kind) = pm.info(p + off as u32).unwrap();
            assert_eq!(kind, ZoneKind::Free);
            assert_eq!(f.ref_count, 1);
            assert_eq!(f.owner, Some(tid(3)));
        }
    }

    #[test]
    fn contiguous_allocations_ascend() {
        let mut pm = fresh_pm(8);
        let a = pm.alloc(PAGE_SIZE, None, PmFlags::empty()).unwrap();
        let b = pm.alloc(PAGE_SIZE, None, PmFlags::empty()).unwrap();
        assert!(b > a);
    }

    #[test]
    fn zeroed_alloc_is_zero() {
        let mut pm = fresh_pm(4);
        // Dirty a page, free it, then demand a zeroed one.
        let p = pm.alloc(PAGE_SIZE, None, PmFlags::empty()).unwrap();
        unsafe {
            core::ptr::write_bytes(arch::paddr_to_vaddr(p), 0xa5, PAGE_SIZE);
        }
        pm.free(p, PAGE_SIZE);

        let q = pm.alloc(PAGE_SIZE, None, PmFlags::ZEROED).unwrap();
        assert_eq!(q, p);
        let bytes =
            unsafe { core::slice::from_raw_parts(arch::paddr_to_vaddr(q), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn aligned_alloc_is_aligned() {
        let mut pm = fresh_pm(16);
        // Disturb the start of the zone so the aligned run can't begin at
        // an arbitrary offset.
        let _pad = pm.alloc(PAGE_SIZE, None, PmFlags::empty()).unwrap();
        let p = pm.alloc(4 * PAGE_SIZE, None, PmFlags::ALIGNED).unwrap();
        assert_eq!(p as usize % (4 * PAGE_SIZE), 0);
    }

    #[test]
    fn free_then_realloc_succeeds() {
        let mut pm = fresh_pm(4);
        let a = pm.alloc(2 * PAGE_SIZE, None, PmFlags::empty()).unwrap();
        let _b = pm.alloc(2 * PAGE_SIZE, None, PmFlags::empty()).unwrap();
        // Zone is now full.
        assert_eq!(
            pm.alloc(PAGE_SIZE, None, PmFlags::empty()),
            Err(Error::NoMemory)
        );
        pm.free(a, 2 * PAGE_SIZE);
        let c = pm.alloc(2 * PAGE_SIZE, None, PmFlags::empty()).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn zero_sized_alloc_is_rejected() {
        let mut pm = fresh_pm(2);
        assert_eq!(pm.alloc(0, None, PmFlags::empty()), Err(Error::InvalidArg));
    }

    #[test]
    fn free_all_owned_releases_only_that_task() {
        let mut pm = fresh_pm(8);
        let a = pm.alloc(PAGE_SIZE, Some(tid(2)), PmFlags::empty()).unwrap();
        let b = pm.alloc(PAGE_SIZE, Some(tid(3)), PmFlags::empty()).unwrap();

        pm.free_all_owned(tid(2));
        assert_eq!(pm.info(a).unwrap().0.ref_count, 0);
        assert_eq!(pm.info(b).unwrap().0.ref_count, 1);
        assert_eq!(pm.info(b).unwrap().0.owner, Some(tid(3)));
    }

    #[test]
    fn free_all_owned_keeps_comapped_frames_alive() {
        let mut pm = fresh_pm(8);
        let a = pm.alloc(PAGE_SIZE, Some(tid(2)), PmFlags::empty()).unwrap();
        // Another task maps the frame (vm::map would do this).
        pm.retain_mapping(a, None);

        pm.free_all_owned(tid(2));
        let (f, _) = pm.info(a).unwrap();
        assert_eq!(f.ref_count, 1);
        // The dead owner is forgotten even though the frame lives on.
        assert_eq!(f.owner, None);
    }

    #[test]
    fn set_owner_adopts_an_orphan_frame() {
        let mut pm = fresh_pm(4);
        let p = pm.alloc(PAGE_SIZE, None, PmFlags::empty()).unwrap();
        pm.set_owner(p, tid(5));
        assert_eq!(pm.info(p).unwrap().0.owner, Some(tid(5)));
    }

    #[test]
    fn mmio_zone_is_never_allocated_from() {
        let mut pm = fresh_pm(4);
        pm.add_mmio(0x1000_1000, PAGE_SIZE).unwrap();

        // Exhaust RAM; the MMIO zone must not satisfy the request.
        while pm.alloc(PAGE_SIZE, None, PmFlags::empty()).is_ok() {}
        assert_eq!(
            pm.alloc(PAGE_SIZE, None, PmFlags::empty()),
            Err(Error::NoMemory)
        );
        let (f, kind) = pm.info(0x1000_1000).unwrap();
        assert_eq!(kind, ZoneKind::Mmio);
        assert_eq!(f.ref_count, 0);
    }

    #[test]
    #[should_panic]
    fn double_free_asserts() {
        let mut pm = fresh_pm(2);
        let p = pm.alloc(PAGE_SIZE, None, PmFlags::empty()).unwrap();
        pm.free(p, PAGE_SIZE);
        pm.free(p, PAGE_SIZE);
    }
}
