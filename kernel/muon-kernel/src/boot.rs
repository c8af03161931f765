//! Kernel bring-up.
//!
//! The boot loader leaves the firmware memory information in low memory
//! (the E801 size pair and the E820 map at the addresses below), loads
//! the kernel at its high-half link address, and enters [`start`] with
//! paging already mapping the low RAM window. From there the kernel
//! builds its own tables: serial → GDT/TSS → IDT/PIC/PIT → PFA → VMM →
//! heap → devices → filesystem → scheduler → interrupts on.

use muon_core::addr::PhysAddr;
use muon_core::{kinfo, kwarn};
use muon_mm::pfa::BitmapAllocator;
use muon_mm::vmm::{PHYS_BASE, Vmm};
use muon_mm::{MemoryRegion, PAGE_SIZE};
use planck_noalloc::vec::ArrayVec;

use crate::arch::x86::{gdt, idt, instructions, interrupts, pic, pit};
use crate::drivers::block::RamDisk;
use crate::{drivers, fs, mm, proc};

/// Where the boot loader stores the E801 memory-size pair.
const MEM_SIZE_LOC: usize = 0x7E00;
/// Where the boot loader stores the E820 entry count.
const MEM_MAP_ENTRY_COUNT_LOC: usize = 0x7E08;
/// Where the boot loader stores the E820 entries themselves.
const MEM_MAP_LOC: usize = 0x7E10;

/// Most E820 entries the boot loader hands over.
const MAX_E820_ENTRIES: usize = 32;

/// RAM disk geometry for the root filesystem.
const RAMDISK_BLOCKS: u32 = 1024;

/// The E801 result: KiB between 1 and 16 MiB, then 64 KiB units above
/// 16 MiB.
#[repr(C)]
struct E801MemSize {
    mem_low: u16,
    mem_high: u16,
}

/// One E820 map entry as the loader stores it.
#[repr(C)]
struct E820Entry {
    base_low: u32,
    base_high: u32,
    length_low: u32,
    length_high: u32,
    entry_type: u32,
    acpi: u32,
}

/// E820 type 1: usable RAM.
const E820_USABLE: u32 = 1;

unsafe extern "C" {
    /// First byte past the kernel image (linker-provided), at its virtual
    /// (high-half) address.
    static kernel_end: u8;
    /// First byte of the kernel image.
    static kernel_start: u8;
}

fn virt_to_phys(virt: usize) -> u32 {
    virt as u32 - PHYS_BASE
}

/// Total installed RAM per the E801 report: the low 1 MiB plus both
/// ranges.
fn total_memory() -> u32 {
    // SAFETY: The boot loader stored the E801 pair at this address, and
    // the low 1 MiB is identity-mapped.
    let memsize = unsafe { &*(MEM_SIZE_LOC as *const E801MemSize) };
    let mut total = 1024 * 1024u32;
    total += u32::from(memsize.mem_low) * 1024;
    total += u32::from(memsize.mem_high) * 64 * 1024;
    total
}

/// Collects usable regions from the E820 map.
fn memory_regions() -> ArrayVec<MemoryRegion, MAX_E820_ENTRIES> {
    let mut regions = ArrayVec::new();
    // SAFETY: The boot loader stored the count and entries at these
    // addresses in identity-mapped low memory.
    let count = unsafe { *(MEM_MAP_ENTRY_COUNT_LOC as *const u32) } as usize;
    for i in 0..count.min(MAX_E820_ENTRIES) {
        // SAFETY: As above; entries are consecutive.
        let entry = unsafe { &*((MEM_MAP_LOC as *const E820Entry).add(i)) };
        if entry.base_high != 0 {
            // Above 4 GiB: unreachable without PAE.
            continue;
        }
        if regions
            .try_push(MemoryRegion {
                base: entry.base_low,
                size: entry.length_low,
                usable: entry.entry_type == E820_USABLE,
            })
            .is_err()
        {
            kwarn!("boot: dropping E820 entries beyond {}", MAX_E820_ENTRIES);
            break;
        }
    }
    regions
}

/// Builds the frame allocator with its bitmap placed just above the
/// kernel image, then re-reserves the low megabyte, the kernel, and the
/// bitmap itself.
unsafe fn init_pfa(total: u32, regions: &[MemoryRegion]) -> BitmapAllocator {
    // SAFETY: The linker provides both symbols; taking their addresses is
    // safe.
    let kernel_start_virt = unsafe { core::ptr::addr_of!(kernel_start) as usize };
    let kernel_end_virt = unsafe { core::ptr::addr_of!(kernel_end) as usize };

    // Bitmap storage sits word-aligned immediately above the image.
    let bitmap_virt = (kernel_end_virt + 3) & !3;
    let total_frames = total as usize / PAGE_SIZE;
    let bitmap_bytes = total_frames.div_ceil(32) * 4;

    // SAFETY: The region above the kernel image is mapped and unused; the
    // regions slice describes RAM faithfully.
    let mut pfa = unsafe {
        BitmapAllocator::new(total, regions, bitmap_virt as *mut u32)
            .expect("no usable physical memory")
    };

    pfa.reserve_region(PhysAddr::new(0), 0x10_0000, true);
    pfa.reserve_region(
        PhysAddr::new(virt_to_phys(kernel_start_virt)),
        (kernel_end_virt - kernel_start_virt) as u32,
        true,
    );
    pfa.reserve_region(
        PhysAddr::new(virt_to_phys(bitmap_virt)),
        bitmap_bytes as u32,
        true,
    );

    kinfo!(
        "pfa: {} frames, {} used after reservations",
        pfa.total_frames(),
        pfa.used_frames()
    );
    pfa
}

/// Formats and mounts the root filesystem on a fresh RAM disk.
fn init_root_fs() {
    use alloc::sync::Arc;
    use muon_fs::hfs::{Hfs, HfsType};
    use muon_fs::FileSystemType;

    let disk = Arc::new(RamDisk::new(RAMDISK_BLOCKS, 512));
    drivers::block::register_device("ramdisk0", disk);

    let dev = drivers::block::get_by_name("ramdisk0").expect("ramdisk0 just registered");
    Hfs::format(&*dev).expect("failed to format root filesystem");

    let fs = HfsType.mount(dev).expect("failed to mount root filesystem");
    fs::vfs::init();
    fs::vfs::with_vfs(|vfs| vfs.mount("/", fs));
}

/// Kernel entry point, called by the boot stub with interrupts disabled.
///
/// # Safety
///
/// Must be entered exactly once, with the boot loader's guarantees in
/// place: high-half kernel mapping, identity-mapped low RAM, firmware
/// memory information at the fixed addresses above.
pub unsafe fn start() -> ! {
    // SAFETY: Single-threaded boot; each init runs exactly once in
    // dependency order.
    unsafe {
        crate::drivers::serial::init();
        kinfo!("muon: booting");

        gdt::init();
        idt::init();
        pic::init();
        pit::init(pit::TICK_HZ);

        let total = total_memory();
        let regions = memory_regions();
        kinfo!("boot: {} MiB RAM, {} E820 entries", total / (1024 * 1024), regions.len());

        mm::install_pfa(init_pfa(total, regions.as_slice()));

        // The boot paging maps all RAM at PHYS_BASE, so the window covers
        // every frame the PFA can return.
        let vmm = mm::with_pfa(|pfa| Vmm::new(PHYS_BASE as usize, pfa))
            .expect("failed to create kernel address space");
        mm::install_vmm(vmm);
        mm::with_vmm_and_pfa(|vmm, pfa| vmm.init_kernel_mappings(total, pfa))
            .expect("failed to build kernel mappings");
        mm::with_vmm(|vmm| {
            let kernel_dir = vmm.kernel_dir();
            vmm.switch_pagedir(kernel_dir);
        });
    }

    // The VMM owns vector 14 and the arch callbacks from here on.
    muon_mm::vmm::register_tlb_flush(|virt| instructions::invlpg(virt));
    muon_mm::vmm::register_dir_load(|dir| instructions::write_cr3(dir));
    interrupts::register_handler(interrupts::PAGE_FAULT_VECTOR, mm::page_fault_handler);

    mm::init_heap().expect("failed to map the kernel heap");

    init_root_fs();

    proc::init();
    interrupts::register_handler(interrupts::TIMER_VECTOR, proc::timer_handler);

    kinfo!("muon: up, enabling interrupts");
    instructions::sti();

    // The init thread's idle loop: everything else happens from
    // interrupts or spawned processes.
    loop {
        instructions::halt();
    }
}
