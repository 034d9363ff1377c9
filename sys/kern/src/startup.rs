//! Kernel startup and the kernel-state singleton.
//!
//! # The singleton and the lock
//!
//! All mutable kernel state lives in one `Kernel` value behind
//! [`with_kernel`]. Access is serialized by the big kernel lock, not by the
//! type system: `with_kernel` re-derives a `&mut Kernel` from a raw pointer
//! each time, and the safety argument is that (a) the caller holds the
//! lock, and (b) a reference frozen in a *suspended* task's kernel stack is
//! inert until that task runs again -- which again requires the lock. This
//! is the price of stackful context switches; keep every access inside a
//! `with_kernel` region entered from a trap or boot path.
//!
//! # Boot order
//!
//! CPU 0 runs first: zones from the boot memory map, the kernel page-table
//! template, its idle task, then the bootstrap task from the embedded ELF
//! image. The other CPUs wait (in the arch layer) until CPU 0 is done,
//! then bring up just their idle task and timer. Every CPU ends up in the
//! idle loop.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use abi::{PageAttrs, Tid, PAGE_SIZE};
use heapless::Deque;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::arch;
use crate::config::CONSOLE_RX_BUF;
use crate::interrupt::IrqTable;
use crate::mp::{self, Cpus};
use crate::pm::PhysMemory;
use crate::task::{self, TaskTable};
use crate::util::align_up;
use crate::vm::{self, AddrSpace};
use crate::Paddr;

/// Everything the kernel mutates after boot, gathered in one place so the
/// lock discipline has a single subject.
pub struct Kernel {
    pub tasks: TaskTable,
    pub pm: PhysMemory,
    /// The kernel page-table template every address space starts from.
    pub kvm: AddrSpace,
    pub irqs: IrqTable,
    /// Ticks since boot; `TICK_HZ` of them per second.
    pub uptime_ticks: u64,
    /// Console input waiting for `serial_read`.
    pub console_rx: Deque<u8, CONSOLE_RX_BUF>,
}

/// One contiguous range in the boot memory map.
#[derive(Copy, Clone, Debug)]
pub struct MemRegion {
    pub paddr: Paddr,
    pub size: usize,
}

/// Boot information handed from the architecture layer to `kernel_main`.
pub struct BootInfo {
    /// Physical address of the embedded bootstrap ELF image.
    pub boot_elf: Paddr,
    pub free_ram: heapless::Vec<MemRegion, 4>,
    pub mmio: heapless::Vec<MemRegion, 4>,
}

#[repr(transparent)]
struct KernelCell(UnsafeCell<MaybeUninit<Kernel>>);

// Safety: all access goes through `with_kernel`, whose contract requires
// the big kernel lock.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(MaybeUninit::uninit()));

/// Runs `f` against the kernel state.
///
/// # Safety
///
/// The caller must hold the big kernel lock, and the kernel must have been
/// initialized by `kernel_main`. See the module docs for why the aliasing
/// here is sound.
pub unsafe fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    // Safety: per the function contract.
    let k = unsafe { (*KERNEL.0.get()).assume_init_mut() };
    f(k)
}

/// Boot entry for CPU 0, called by the architecture layer with the big
/// kernel lock held.
pub fn kernel_main(bootinfo: &BootInfo) -> ! {
    klog!("booting Tarn...");

    let mut pm = PhysMemory::new();
    for r in bootinfo.free_ram.iter() {
        klog!(
            "free memory: {:#x} - {:#x} ({} MiB)",
            r.paddr,
            r.paddr + r.size as u32,
            r.size / 1024 / 1024
        );
        pm.add_free_ram(r.paddr, r.size);
    }
    for r in bootinfo.mmio.iter() {
        klog!(
            "MMIO memory: {:#x} - {:#x} ({} KiB)",
            r.paddr,
            r.paddr + r.size as u32,
            r.size / 1024
        );
        pm.add_mmio(r.paddr, r.size)
            .expect("failed to register an MMIO zone");
    }

    let kvm_root =
        vm::init_kernel_template(&mut pm).expect("failed to build the kernel page table");

    // Safety: nothing reads the singleton before this write; the other
    // CPUs are still parked in the arch layer.
    unsafe {
        (*KERNEL.0.get()).write(Kernel {
            tasks: TaskTable::new(),
            pm,
            kvm: AddrSpace { root: kvm_root },
            irqs: IrqTable::new(),
            uptime_ticks: 0,
            console_rx: Deque::new(),
        });
    }

    let cpus = &mp::CPUS;
    // Safety: we hold the lock (taken by the arch boot path) and just
    // initialized the singleton.
    unsafe {
        with_kernel(|k| {
            task::init_percpu(k, cpus, arch::cpu_id());
            create_first_task(k, cpus, bootinfo);
        });
    }

    arch::init_percpu();
    klog!("CPU #{} is ready", arch::cpu_id());

    idle_loop(cpus)
}

/// Boot entry for the secondary CPUs, with the big kernel lock held.
pub fn kernel_mp_main() -> ! {
    let cpus = &mp::CPUS;
    // Safety: lock held; CPU 0 initialized the singleton before releasing
    // the secondaries.
    unsafe {
        with_kernel(|k| task::init_percpu(k, cpus, arch::cpu_id()));
    }

    arch::init_percpu();
    klog!("CPU #{} is ready", arch::cpu_id());

    idle_loop(cpus)
}

/// The idle task: reschedule whenever something is runnable, otherwise
/// sleep until an interrupt. The lock is held everywhere in this loop
/// *except* inside `arch::idle`, which releases it around `wfi`.
fn idle_loop(cpus: &Cpus) -> ! {
    loop {
        // Safety: the idle loop owns the lock outside of arch::idle.
        unsafe {
            with_kernel(|k| task::switch(k, cpus));
        }
        arch::idle();
    }
}

/// Trampoline target for idle-task contexts. A booting CPU *becomes* its
/// idle task, so this only runs if a fresh idle context is ever dispatched
/// before the boot path's first switch overwrites it.
pub extern "C" fn idle_entry(_arg: usize) -> ! {
    idle_loop(&mp::CPUS)
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_R: u32 = 1 << 2;

#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Elf32Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

fn read_image<T: FromBytes + KnownLayout + Immutable>(image: Paddr, offset: u32) -> T {
    // Safety: the boot image is a kernel-readable blob; reads are bounded
    // by the struct size and the header fields the image itself supplied.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            arch::paddr_to_vaddr(image + offset),
            core::mem::size_of::<T>(),
        )
    };
    T::read_from_bytes(bytes).unwrap_or_else(|_| panic!("bootelf: truncated image"))
}

/// Creates the bootstrap task (task #1, the user-space VM server) from the
/// ELF image the boot layer embedded, copying each `PT_LOAD` segment into
/// frames owned by the task and mapping them with the segment's
/// permissions.
pub(crate) fn create_first_task(k: &mut Kernel, cpus: &Cpus, bootinfo: &BootInfo) {
    let ehdr: Elf32Ehdr = read_image(bootinfo.boot_elf, 0);
    if ehdr.e_ident[..4] != ELF_MAGIC {
        panic!("bootelf: invalid ELF magic");
    }

    let tid = task::create(k, "vm", ehdr.e_entry, None)
        .expect("failed to create the bootstrap task");
    uassert!(tid == Tid::VM_SERVER);

    for i in 0..ehdr.e_phnum {
        let phdr: Elf32Phdr = read_image(
            bootinfo.boot_elf,
            ehdr.e_phoff + u32::from(i) * u32::from(ehdr.e_phentsize),
        );
        if phdr.p_type != PT_LOAD {
            continue;
        }
        uassert!(phdr.p_memsz >= phdr.p_filesz);

        klog!(
            "bootelf: {:#x} - {:#x} {}{}{} ({} KiB)",
            phdr.p_vaddr,
            phdr.p_vaddr + phdr.p_memsz,
            if phdr.p_flags & PF_R != 0 { 'r' } else { '-' },
            if phdr.p_flags & PF_W != 0 { 'w' } else { '-' },
            if phdr.p_flags & PF_X != 0 { 'x' } else { '-' },
            phdr.p_memsz / 1024
        );

        let paddr = k
            .pm
            .alloc(phdr.p_memsz as usize, Some(tid), abi::PmFlags::ZEROED)
            .expect("bootelf: out of memory");

        // Safety: fresh frames on one side, the boot image on the other.
        unsafe {
            core::ptr::copy_nonoverlapping(
                arch::paddr_to_vaddr(bootinfo.boot_elf + phdr.p_offset),
                arch::paddr_to_vaddr(paddr),
                phdr.p_filesz as usize,
            );
        }

        let mut attrs = PageAttrs::USER;
        if phdr.p_flags & PF_R != 0 {
            attrs |= PageAttrs::READABLE;
        }
        if phdr.p_flags & PF_W != 0 {
            attrs |= PageAttrs::WRITABLE;
        }
        if phdr.p_flags & PF_X != 0 {
            attrs |= PageAttrs::EXECUTABLE;
        }

        let memsz = align_up(phdr.p_memsz as usize, PAGE_SIZE);
        for offset in (0..memsz).step_by(PAGE_SIZE) {
            let offset = offset as u32;
            vm::map(k, cpus, tid, phdr.p_vaddr + offset, paddr + offset, attrs)
                .unwrap_or_else(|e| {
                    panic!(
                        "bootelf: failed to map {:#x} ({})",
                        phdr.p_vaddr + offset,
                        e
                    )
                });
        }
    }
}

/// A fresh, self-contained kernel over simulated physical memory, for the
/// host test suites. Each call gets its own zone, so tests can run in
/// parallel.
#[cfg(test)]
pub(crate) fn test_kernel() -> Kernel {
    let pages = 1024;
    let bytes = (pages + 1) * PAGE_SIZE;
    let mut pm = PhysMemory::new();
    pm.add_free_ram(arch::alloc_phys_region(bytes), bytes);

    let kvm_root = vm::init_kernel_template(&mut pm).unwrap();

    Kernel {
        tasks: TaskTable::new(),
        pm,
        kvm: AddrSpace { root: kvm_root },
        irqs: IrqTable::new(),
        uptime_ticks: 0,
        console_rx: Deque::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::PmFlags;

    /// Builds a minimal ELF image with one PT_LOAD segment and plants it
    /// in simulated physical memory.
    fn fake_boot_image(entry: u32, seg_vaddr: u32, payload: &[u8]) -> Paddr {
        let image = arch::alloc_phys_region(2 * PAGE_SIZE);

        let mut bytes = vec![0u8; 2 * PAGE_SIZE];
        // ELF header.
        bytes[..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = 1; // 32-bit
        bytes[5] = 1; // little endian
        let phoff = 52u32;
        bytes[24..28].copy_from_slice(&entry.to_le_bytes());
        bytes[28..32].copy_from_slice(&phoff.to_le_bytes());
        bytes[42..44].copy_from_slice(&32u16.to_le_bytes()); // phentsize
        bytes[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum

        // One PT_LOAD phdr: file offset 0x1000, rw-, memsz padded.
        let p = phoff as usize;
        bytes[p..p + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        bytes[p + 4..p + 8].copy_from_slice(&0x1000u32.to_le_bytes()); // offset
        bytes[p + 8..p + 12].copy_from_slice(&seg_vaddr.to_le_bytes());
        bytes[p + 16..p + 20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes[p + 20..p + 24].copy_from_slice(&0x2000u32.to_le_bytes()); // memsz
        bytes[p + 24..p + 28].copy_from_slice(&(PF_R | PF_W).to_le_bytes());

        bytes[0x1000..0x1000 + payload.len()].copy_from_slice(payload);

        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                arch::paddr_to_vaddr(image),
                bytes.len(),
            );
        }
        image
    }

    #[test]
    fn bootstrap_task_is_loaded_from_elf() {
        let mut k = test_kernel();
        let cpus = Cpus::new();

        let image = fake_boot_image(0x0100_0000, 0x0100_0000, b"vm server text");
        let bootinfo = BootInfo {
            boot_elf: image,
            free_ram: heapless::Vec::new(),
            mmio: heapless::Vec::new(),
        };

        create_first_task(&mut k, &cpus, &bootinfo);

        // Task #1 exists and is runnable.
        let t = k.tasks.task(Tid::VM_SERVER).unwrap();
        assert_eq!(t.state(), task::TaskState::Runnable);
        assert_eq!(t.name(), "vm");

        // Both pages of the segment are mapped and the payload landed.
        let root = t.vm.root;
        assert!(vm::is_mapped(root, 0x0100_0000));
        assert!(vm::is_mapped(root, 0x0100_1000));
        let pa = vm::translate(root, 0x0100_0000, 0).unwrap();
        let data =
            unsafe { core::slice::from_raw_parts(arch::paddr_to_vaddr(pa), 14) };
        assert_eq!(data, b"vm server text");
    }

    #[test]
    #[should_panic(expected = "invalid ELF magic")]
    fn garbage_boot_image_is_refused() {
        let mut k = test_kernel();
        let cpus = Cpus::new();

        let image = arch::alloc_phys_region(PAGE_SIZE);
        // Leave it zeroed: no magic.
        let bootinfo = BootInfo {
            boot_elf: image,
            free_ram: heapless::Vec::new(),
            mmio: heapless::Vec::new(),
        };
        create_first_task(&mut k, &cpus, &bootinfo);
    }

    #[test]
    fn test_kernel_is_self_contained() {
        let mut a = test_kernel();
        let mut b = test_kernel();

        // Allocations in one kernel are invisible to the other.
        let pa = a.pm.alloc(PAGE_SIZE, None, PmFlags::ZEROED).unwrap();
        assert!(b.pm.info(pa).is_none());
        let pb = b.pm.alloc(PAGE_SIZE, None, PmFlags::ZEROED).unwrap();
        assert_ne!(pa, pb);
    }
}
