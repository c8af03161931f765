//! Virtual memory manager: two-level x86 page tables.
//!
//! The VMM owns the kernel page directory and tracks the current one. All
//! page structures are edited through the physical window (`window + phys`),
//! so any directory can be modified without transient mappings. On the
//! kernel target the window is the high-half mapping of all RAM at
//! [`PHYS_BASE`]; host tests pass the base address of an arena instead.
//!
//! # TLB and CR3 decoupling
//!
//! `invlpg` and CR3 loads are dispatched through function pointers
//! registered at boot ([`register_tlb_flush`], [`register_dir_load`]).
//! Before registration both are no-ops, which is safe during early boot
//! (no stale entries) and is what host tests run on.

use core::sync::atomic::{AtomicPtr, Ordering};

use muon_core::addr::{PhysAddr, VirtAddr};

use crate::page::{self, Entry, KERNEL_PDE_START, PageFlags};
use crate::{FrameAllocator, FrameDeallocator, PAGE_SIZE, VmmError};

/// Virtual base of the kernel half; all physical memory is windowed here.
pub const PHYS_BASE: u32 = 0xC000_0000;

/// End of the identity-mapped low region (1 MiB).
pub const IDENTITY_MAP_END: u32 = 0x0010_0000;

// ---------------------------------------------------------------------------
// Registered architecture callbacks
// ---------------------------------------------------------------------------

fn nop_flush(_virt: VirtAddr) {}

fn nop_dir_load(_dir: PhysAddr) {}

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());
static DIR_LOAD_FN: AtomicPtr<()> = AtomicPtr::new(nop_dir_load as fn(PhysAddr) as *mut ());

/// Registers the architecture `invlpg` wrapper.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the architecture CR3 load wrapper.
pub fn register_dir_load(f: fn(PhysAddr)) {
    DIR_LOAD_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn flush_tlb(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(VirtAddr)` pointers are stored.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

#[inline]
fn load_dir(dir: PhysAddr) {
    let ptr = DIR_LOAD_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(PhysAddr)` pointers are stored.
    let f: fn(PhysAddr) = unsafe { core::mem::transmute(ptr) };
    f(dir);
}

// ---------------------------------------------------------------------------
// Vmm
// ---------------------------------------------------------------------------

/// The virtual memory manager.
pub struct Vmm {
    /// Offset added to a physical address to reach it in the current
    /// virtual space (PHYS_BASE on target, arena base in host tests).
    window: usize,
    /// The kernel page directory, shared into every address space.
    kernel_dir: PhysAddr,
    /// The directory currently loaded (or about to be loaded) in CR3.
    current_dir: PhysAddr,
}

impl Vmm {
    /// Creates the VMM and its kernel page directory.
    ///
    /// # Safety
    ///
    /// `window + p` must be a readable/writable address for every physical
    /// address `p` the frame allocator can return, for the lifetime of the
    /// VMM.
    pub unsafe fn new(
        window: usize,
        alloc: &mut impl FrameAllocator,
    ) -> Result<Self, VmmError> {
        let kernel_dir = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        let vmm = Self {
            window,
            kernel_dir,
            current_dir: kernel_dir,
        };
        vmm.zero_frame(kernel_dir);
        Ok(vmm)
    }

    /// Returns the kernel page directory.
    #[must_use]
    pub fn kernel_dir(&self) -> PhysAddr {
        self.kernel_dir
    }

    /// Returns the current page directory.
    #[must_use]
    pub fn current_dir(&self) -> PhysAddr {
        self.current_dir
    }

    /// Returns a pointer to a physical address through the window.
    #[must_use]
    pub fn frame_ptr(&self, phys: PhysAddr) -> *mut u8 {
        (self.window + phys.as_u32() as usize) as *mut u8
    }

    fn zero_frame(&self, frame: PhysAddr) {
        // SAFETY: The window covers every allocatable frame (constructor
        // contract) and the frame is exclusively ours to initialise.
        unsafe { core::ptr::write_bytes(self.frame_ptr(frame), 0, PAGE_SIZE) };
    }

    /// Views a directory/table frame as its 1024 entries.
    ///
    /// # Safety
    ///
    /// `frame` must be a page-structure frame owned by this VMM, and the
    /// caller must not hold another reference to the same frame.
    #[allow(clippy::mut_from_ref)]
    unsafe fn entries_mut(&self, frame: PhysAddr) -> &mut [Entry; page::ENTRIES] {
        // SAFETY: Caller contract; Entry is a transparent u32.
        unsafe { &mut *self.frame_ptr(frame).cast::<[Entry; page::ENTRIES]>() }
    }

    /// Establishes the kernel-half mappings in the kernel directory:
    /// the identity-mapped low 1 MiB and the physical window at
    /// [`PHYS_BASE`] covering `total_memory` bytes (capped at the 1 GiB the
    /// kernel half can hold).
    pub fn init_kernel_mappings(
        &self,
        total_memory: u32,
        alloc: &mut impl FrameAllocator,
    ) -> Result<(), VmmError> {
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;

        let mut addr = 0u32;
        while addr < IDENTITY_MAP_END {
            self.map(self.kernel_dir, VirtAddr::new(addr), PhysAddr::new(addr), flags, alloc)?;
            addr += PAGE_SIZE as u32;
        }

        let window_span = u64::from(total_memory).min(u64::from(u32::MAX - PHYS_BASE) + 1);
        let mut phys = 0u64;
        while phys < window_span {
            self.map(
                self.kernel_dir,
                VirtAddr::new(PHYS_BASE + phys as u32),
                PhysAddr::new(phys as u32),
                flags,
                alloc,
            )?;
            phys += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Allocates a fresh address space.
    ///
    /// The user half starts empty; the kernel half (PDE indices ≥ 768) is
    /// copied by reference from the kernel directory, so kernel mappings
    /// are shared across all live address spaces.
    pub fn create_address_space(
        &self,
        alloc: &mut impl FrameAllocator,
    ) -> Result<PhysAddr, VmmError> {
        let dir = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        self.zero_frame(dir);

        // SAFETY: `dir` was just allocated; the kernel directory is only
        // read. Distinct frames, so the references do not alias.
        let entries = unsafe { self.entries_mut(dir) };
        let kernel = unsafe { self.entries_mut(self.kernel_dir) };
        entries[KERNEL_PDE_START..].copy_from_slice(&kernel[KERNEL_PDE_START..]);
        Ok(dir)
    }

    /// Ensures the page table covering `virt` exists in `dir` and returns
    /// its frame. A newly created table's PDE carries `PRESENT` plus the
    /// `{WRITABLE, USER}` subset of `flags`; an existing PDE is left
    /// untouched.
    fn ensure_table(
        &self,
        dir: PhysAddr,
        virt: VirtAddr,
        flags: PageFlags,
        alloc: &mut impl FrameAllocator,
    ) -> Result<PhysAddr, VmmError> {
        let di = page::dir_index(virt);
        // SAFETY: `dir` is a directory frame owned by this VMM.
        let entries = unsafe { self.entries_mut(dir) };
        if entries[di].is_present() {
            return Ok(entries[di].frame());
        }

        let table = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        self.zero_frame(table);
        entries[di] = Entry::new(table, page::pde_flags_for(flags));
        Ok(table)
    }

    /// Maps `virt → phys` in `dir`, creating the page table on demand.
    ///
    /// Idempotent for fresh mappings; replacing an existing mapping issues
    /// a TLB flush for `virt`.
    pub fn map(
        &self,
        dir: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
        alloc: &mut impl FrameAllocator,
    ) -> Result<(), VmmError> {
        let table = self.ensure_table(dir, virt, flags, alloc)?;
        // SAFETY: `table` is a page-table frame of `dir`.
        let entries = unsafe { self.entries_mut(table) };
        let ti = page::table_index(virt);
        let was_present = entries[ti].is_present();
        entries[ti] = Entry::new(phys, flags | PageFlags::PRESENT);
        if was_present {
            flush_tlb(virt);
        }
        Ok(())
    }

    /// Walks the two levels and returns the physical address backing
    /// `virt`, or `None` if either level is absent.
    #[must_use]
    pub fn translate(&self, dir: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: `dir` is a directory frame owned by this VMM; read-only.
        let entries = unsafe { self.entries_mut(dir) };
        let pde = entries[page::dir_index(virt)];
        if !pde.is_present() {
            return None;
        }
        // SAFETY: A present PDE references a page-table frame.
        let table = unsafe { self.entries_mut(pde.frame()) };
        let pte = table[page::table_index(virt)];
        if !pte.is_present() {
            return None;
        }
        Some(pte.frame() + (virt.as_u32() & (PAGE_SIZE as u32 - 1)))
    }

    /// Allocates and maps fresh zeroed frames over `[virt, virt + size)`,
    /// rounded outward to page boundaries.
    ///
    /// Pages that are already mapped are left untouched. On allocation
    /// failure mid-region everything mapped so far is freed again and the
    /// error is returned (strong exception safety).
    pub fn alloc_region(
        &self,
        dir: PhysAddr,
        virt: VirtAddr,
        size: u32,
        flags: PageFlags,
        alloc: &mut (impl FrameAllocator + FrameDeallocator),
    ) -> Result<(), VmmError> {
        if size == 0 {
            return Ok(());
        }
        let start = virt.page_align_down();
        let end = (virt + (size - 1)).page_align_down() + PAGE_SIZE as u32;

        let mut va = start;
        while va != end {
            let result = self.ensure_table(dir, va, flags, alloc).and_then(|table| {
                // SAFETY: `table` is a page-table frame of `dir`.
                let entries = unsafe { self.entries_mut(table) };
                let ti = page::table_index(va);
                if entries[ti].is_present() {
                    return Ok(());
                }
                let frame = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
                self.zero_frame(frame);
                entries[ti] = Entry::new(frame, flags | PageFlags::PRESENT);
                Ok(())
            });

            if let Err(e) = result {
                // Roll back through the failing page, not just the mapped
                // prefix: ensure_table may have created a fresh (still
                // empty) page table for `va` itself. The first pass skips
                // `va`'s absent PTE and the second pass then reclaims that
                // empty table.
                self.free_region(dir, start, (va - start) + PAGE_SIZE as u32, alloc);
                return Err(e);
            }
            va = va + PAGE_SIZE as u32;
        }
        Ok(())
    }

    /// Unmaps `[virt, virt + size)` (rounded outward), returning the
    /// backing frames to `dealloc` and flushing each unmapped page.
    /// Page tables that end up empty are freed and their PDEs cleared.
    pub fn free_region(
        &self,
        dir: PhysAddr,
        virt: VirtAddr,
        size: u32,
        dealloc: &mut impl FrameDeallocator,
    ) {
        if size == 0 {
            return;
        }
        let start = virt.page_align_down();
        let end = (virt + (size - 1)).page_align_down() + PAGE_SIZE as u32;

        let mut va = start;
        while va != end {
            // SAFETY: `dir` is a directory frame owned by this VMM.
            let entries = unsafe { self.entries_mut(dir) };
            let pde = entries[page::dir_index(va)];
            if pde.is_present() {
                // SAFETY: Present PDE references a page-table frame.
                let table = unsafe { self.entries_mut(pde.frame()) };
                let ti = page::table_index(va);
                if table[ti].is_present() {
                    dealloc.deallocate_frame(table[ti].frame());
                    table[ti] = Entry::EMPTY;
                    flush_tlb(va);
                }
            }
            va = va + PAGE_SIZE as u32;
        }

        // Second pass: release page tables that are now fully empty.
        let first_di = page::dir_index(start);
        let last_di = page::dir_index(VirtAddr::new(end.as_u32().wrapping_sub(PAGE_SIZE as u32)));
        for di in first_di..=last_di {
            // SAFETY: As above.
            let entries = unsafe { self.entries_mut(dir) };
            let pde = entries[di];
            if !pde.is_present() {
                continue;
            }
            // SAFETY: As above.
            let table = unsafe { self.entries_mut(pde.frame()) };
            if table.iter().all(|e| !e.is_present()) {
                dealloc.deallocate_frame(pde.frame());
                entries[di] = Entry::EMPTY;
            }
        }
    }

    /// Deep-copies a single page table: a fresh table frame plus a fresh
    /// frame (with the 4 KiB payload copied) for every present entry.
    fn clone_table(
        &self,
        src_table: PhysAddr,
        alloc: &mut (impl FrameAllocator + FrameDeallocator),
    ) -> Result<PhysAddr, VmmError> {
        let new_table = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        self.zero_frame(new_table);

        for i in 0..page::ENTRIES {
            // SAFETY: `src_table` is a page-table frame; read-only here.
            let src_entry = unsafe { self.entries_mut(src_table) }[i];
            if !src_entry.is_present() {
                continue;
            }

            let Some(new_frame) = alloc.allocate_frame() else {
                // Roll back: free the frames copied so far and the table.
                // SAFETY: `new_table` was allocated and filled above.
                let new_entries = unsafe { self.entries_mut(new_table) };
                for entry in new_entries.iter().take(i) {
                    if entry.is_present() {
                        alloc.deallocate_frame(entry.frame());
                    }
                }
                alloc.deallocate_frame(new_table);
                return Err(VmmError::OutOfMemory);
            };

            // SAFETY: Both frames are window-accessible; source is a
            // mapped payload frame, destination was just allocated.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.frame_ptr(src_entry.frame()),
                    self.frame_ptr(new_frame),
                    PAGE_SIZE,
                );
            }
            // SAFETY: Exclusive access to the frame being built.
            (unsafe { self.entries_mut(new_table) })[i] = Entry::new(new_frame, src_entry.flags());
        }
        Ok(new_table)
    }

    /// Clones the current directory for fork.
    ///
    /// Kernel-half entries (index ≥ 768) and user-half entries whose PDE
    /// frame matches the kernel directory's at the same index are shared by
    /// reference; everything else is deep-copied. On any allocation failure
    /// every frame the clone acquired is released again.
    pub fn clone_pagedir(
        &self,
        alloc: &mut (impl FrameAllocator + FrameDeallocator),
    ) -> Result<PhysAddr, VmmError> {
        let src_dir = self.current_dir;
        let new_dir = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        self.zero_frame(new_dir);

        for i in 0..page::ENTRIES {
            // SAFETY: Directory frames owned by this VMM; src read-only.
            let src_entry = unsafe { self.entries_mut(src_dir) }[i];
            if !src_entry.is_present() {
                continue;
            }

            let shared = if i >= KERNEL_PDE_START {
                true
            } else {
                // SAFETY: As above.
                let kernel_entry = unsafe { self.entries_mut(self.kernel_dir) }[i];
                kernel_entry.is_present() && kernel_entry.frame() == src_entry.frame()
            };

            if shared {
                // SAFETY: `new_dir` is exclusively ours until returned.
                (unsafe { self.entries_mut(new_dir) })[i] = src_entry;
                continue;
            }

            match self.clone_table(src_entry.frame(), alloc) {
                Ok(table) => {
                    // SAFETY: As above.
                    (unsafe { self.entries_mut(new_dir) })[i] =
                        Entry::new(table, src_entry.flags());
                }
                Err(e) => {
                    self.destroy_address_space(new_dir, alloc);
                    return Err(e);
                }
            }
        }
        Ok(new_dir)
    }

    /// Frees a user address space: every deep-owned user-half page table
    /// and the frames it maps, then the directory frame itself.
    ///
    /// Kernel-half entries and user-half entries shared with the kernel
    /// directory are skipped: those tables belong to the kernel.
    pub fn destroy_address_space(&self, dir: PhysAddr, dealloc: &mut impl FrameDeallocator) {
        for i in 0..KERNEL_PDE_START {
            // SAFETY: Directory frames owned by this VMM.
            let entry = unsafe { self.entries_mut(dir) }[i];
            if !entry.is_present() {
                continue;
            }
            let kernel_entry = unsafe { self.entries_mut(self.kernel_dir) }[i];
            if kernel_entry.is_present() && kernel_entry.frame() == entry.frame() {
                continue;
            }

            // SAFETY: Deep-owned page table of `dir`.
            let table = unsafe { self.entries_mut(entry.frame()) };
            for pte in table.iter() {
                if pte.is_present() {
                    dealloc.deallocate_frame(pte.frame());
                }
            }
            dealloc.deallocate_frame(entry.frame());
        }
        dealloc.deallocate_frame(dir);
    }

    /// Makes `dir` the current directory and loads it into CR3 through the
    /// registered callback.
    pub fn switch_pagedir(&mut self, dir: PhysAddr) {
        self.current_dir = dir;
        load_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfa::{BitmapAllocator, RESERVED_LOW_FRAMES};
    use crate::MemoryRegion;
    use std::alloc::Layout;

    /// Fake physical memory: an aligned host allocation whose base acts as
    /// the physical window, plus a bitmap allocator over it.
    struct TestArena {
        mem: *mut u8,
        layout: Layout,
        pfa: BitmapAllocator,
    }

    impl TestArena {
        /// `frames` total frames of fake RAM (must exceed the reserved low
        /// 256 to be useful).
        fn new(frames: usize) -> Self {
            let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
            let mem = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!mem.is_null());
            let words = frames.div_ceil(32);
            let storage = Box::leak(vec![0u32; words].into_boxed_slice()).as_mut_ptr();
            let regions = [MemoryRegion {
                base: 0,
                size: (frames * PAGE_SIZE) as u32,
                usable: true,
            }];
            let pfa = unsafe {
                BitmapAllocator::new((frames * PAGE_SIZE) as u32, &regions, storage).unwrap()
            };
            Self { mem, layout, pfa }
        }

        fn window(&self) -> usize {
            self.mem as usize
        }

        fn vmm(&mut self) -> Vmm {
            unsafe { Vmm::new(self.window(), &mut self.pfa).unwrap() }
        }

        /// Reads a byte of fake physical memory.
        fn read(&self, phys: PhysAddr) -> u8 {
            unsafe { *self.mem.add(phys.as_u32() as usize) }
        }

        /// Writes a byte of fake physical memory.
        fn write(&self, phys: PhysAddr, value: u8) {
            unsafe { *self.mem.add(phys.as_u32() as usize) = value };
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.mem, self.layout) };
        }
    }

    const USER_VA: VirtAddr = VirtAddr::new(0x0804_8000);
    const USER_RW: PageFlags = PageFlags::WRITABLE.union(PageFlags::USER);

    #[test]
    fn map_then_translate() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.kernel_dir();

        let frame = arena.pfa.alloc().unwrap();
        vmm.map(dir, USER_VA, frame, USER_RW, &mut arena.pfa).unwrap();

        assert_eq!(vmm.translate(dir, USER_VA), Some(frame));
        // Offsets within the page carry through.
        assert_eq!(vmm.translate(dir, USER_VA + 0x123), Some(frame + 0x123));
    }

    #[test]
    fn translate_unmapped_is_none() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.kernel_dir();

        // Absent PDE.
        assert_eq!(vmm.translate(dir, USER_VA), None);

        // Present PDE, absent PTE.
        let frame = arena.pfa.alloc().unwrap();
        vmm.map(dir, USER_VA, frame, USER_RW, &mut arena.pfa).unwrap();
        assert_eq!(vmm.translate(dir, USER_VA + 0x1000), None);
    }

    #[test]
    fn map_reuses_page_table() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.kernel_dir();

        let f1 = arena.pfa.alloc().unwrap();
        let f2 = arena.pfa.alloc().unwrap();
        let used_before = arena.pfa.used_frames();
        vmm.map(dir, USER_VA, f1, USER_RW, &mut arena.pfa).unwrap();
        let after_first = arena.pfa.used_frames();
        vmm.map(dir, USER_VA + 0x1000, f2, USER_RW, &mut arena.pfa).unwrap();

        // First map allocates the page table, second reuses it.
        assert_eq!(after_first, used_before + 1);
        assert_eq!(arena.pfa.used_frames(), after_first);
    }

    #[test]
    fn remap_replaces_mapping() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.kernel_dir();

        let f1 = arena.pfa.alloc().unwrap();
        let f2 = arena.pfa.alloc().unwrap();
        vmm.map(dir, USER_VA, f1, USER_RW, &mut arena.pfa).unwrap();
        vmm.map(dir, USER_VA, f2, USER_RW, &mut arena.pfa).unwrap();
        assert_eq!(vmm.translate(dir, USER_VA), Some(f2));
    }

    #[test]
    fn alloc_region_maps_distinct_zeroed_frames() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();

        let size = 5 * PAGE_SIZE as u32;
        vmm.alloc_region(dir, USER_VA, size, USER_RW, &mut arena.pfa).unwrap();

        let mut frames = std::collections::HashSet::new();
        for k in 0..5u32 {
            let phys = vmm
                .translate(dir, USER_VA + k * PAGE_SIZE as u32)
                .expect("page must be mapped");
            assert!(frames.insert(phys.as_u32()), "frames must be distinct");
            assert_eq!(arena.read(phys), 0, "fresh pages must be zeroed");
        }
    }

    #[test]
    fn alloc_region_rolls_back_on_exhaustion() {
        // Just enough frames for the directory plus a couple of pages; the
        // 16-page region cannot be satisfied.
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 6);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();
        let used_before = arena.pfa.used_frames();

        let err = vmm.alloc_region(
            dir,
            USER_VA,
            16 * PAGE_SIZE as u32,
            USER_RW,
            &mut arena.pfa,
        );
        assert_eq!(err, Err(VmmError::OutOfMemory));

        // Every prefix page is unmapped again and every frame returned.
        for k in 0..16u32 {
            assert_eq!(vmm.translate(dir, USER_VA + k * PAGE_SIZE as u32), None);
        }
        assert_eq!(arena.pfa.used_frames(), used_before);
        assert_eq!(arena.pfa.popcount(), used_before);
    }

    #[test]
    fn alloc_region_rollback_across_table_boundary() {
        // The frame budget runs out exactly on the first page past the
        // 4 MiB mark: the page table for the new region already exists but
        // the payload frame allocation fails. The rollback must reclaim
        // that freshly created, still-empty table too.
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 6);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();
        let used_before = arena.pfa.used_frames();

        // Two pages below the boundary, two above. The budget covers the
        // first table, both low pages, and the second table; the payload
        // frame for 0x0040_0000 is one frame too many.
        let virt = VirtAddr::new(0x003F_E000);
        let err = vmm.alloc_region(dir, virt, 4 * PAGE_SIZE as u32, USER_RW, &mut arena.pfa);
        assert_eq!(err, Err(VmmError::OutOfMemory));

        for k in 0..4u32 {
            assert_eq!(vmm.translate(dir, virt + k * PAGE_SIZE as u32), None);
        }
        assert_eq!(arena.pfa.used_frames(), used_before, "both page tables reclaimed");
        assert_eq!(arena.pfa.popcount(), used_before);
    }

    #[test]
    fn free_region_returns_frames_and_tables() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();
        let used_before = arena.pfa.used_frames();

        let size = 8 * PAGE_SIZE as u32;
        vmm.alloc_region(dir, USER_VA, size, USER_RW, &mut arena.pfa).unwrap();
        vmm.free_region(dir, USER_VA, size, &mut arena.pfa);

        for k in 0..8u32 {
            assert_eq!(vmm.translate(dir, USER_VA + k * PAGE_SIZE as u32), None);
        }
        // Pages and the now-empty page table are all free again.
        assert_eq!(arena.pfa.used_frames(), used_before);
    }

    #[test]
    fn free_region_spanning_tables() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();
        let used_before = arena.pfa.used_frames();

        // Straddle a 4 MiB page-table boundary.
        let virt = VirtAddr::new(0x007F_E000);
        let size = 4 * PAGE_SIZE as u32;
        vmm.alloc_region(dir, virt, size, USER_RW, &mut arena.pfa).unwrap();
        vmm.free_region(dir, virt, size, &mut arena.pfa);

        assert_eq!(arena.pfa.used_frames(), used_before);
    }

    #[test]
    fn address_space_shares_kernel_half() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();

        // A kernel-half mapping established before the address space is
        // created is visible through it.
        let kva = VirtAddr::new(0xC050_0000);
        let frame = arena.pfa.alloc().unwrap();
        vmm.map(vmm.kernel_dir(), kva, frame, PageFlags::WRITABLE, &mut arena.pfa)
            .unwrap();

        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();
        assert_eq!(vmm.translate(dir, kva), Some(frame));
    }

    #[test]
    fn clone_deep_copies_user_half() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 128);
        let mut vmm = arena.vmm();

        let dir_a = vmm.create_address_space(&mut arena.pfa).unwrap();
        vmm.alloc_region(dir_a, USER_VA, PAGE_SIZE as u32, USER_RW, &mut arena.pfa)
            .unwrap();
        let phys_a = vmm.translate(dir_a, USER_VA).unwrap();
        arena.write(phys_a, 0xAB);

        vmm.switch_pagedir(dir_a);
        let dir_b = vmm.clone_pagedir(&mut arena.pfa).unwrap();

        let phys_b = vmm.translate(dir_b, USER_VA).unwrap();
        assert_ne!(phys_a, phys_b, "user page must be deep-copied");
        assert_eq!(arena.read(phys_b), 0xAB, "payload must be copied");

        // Mutating the child must not change the parent.
        arena.write(phys_b, 0xCD);
        assert_eq!(arena.read(phys_a), 0xAB);
    }

    #[test]
    fn clone_shares_kernel_half_tables() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 128);
        let mut vmm = arena.vmm();

        let kva = VirtAddr::new(0xC070_0000);
        let kframe = arena.pfa.alloc().unwrap();
        vmm.map(vmm.kernel_dir(), kva, kframe, PageFlags::WRITABLE, &mut arena.pfa)
            .unwrap();

        let dir_a = vmm.create_address_space(&mut arena.pfa).unwrap();
        vmm.switch_pagedir(dir_a);
        let dir_b = vmm.clone_pagedir(&mut arena.pfa).unwrap();

        // Same physical frame through both: the kernel half is shared, not
        // copied.
        assert_eq!(vmm.translate(dir_b, kva), Some(kframe));
    }

    #[test]
    fn clone_rolls_back_on_exhaustion() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 16);
        let mut vmm = arena.vmm();

        let dir_a = vmm.create_address_space(&mut arena.pfa).unwrap();
        vmm.alloc_region(dir_a, USER_VA, 4 * PAGE_SIZE as u32, USER_RW, &mut arena.pfa)
            .unwrap();
        vmm.switch_pagedir(dir_a);

        // Drain the allocator, then give back too few frames for the clone
        // (it needs a directory, a table, and four payload frames).
        let mut drained = Vec::new();
        while let Some(f) = arena.pfa.alloc() {
            drained.push(f);
        }
        for f in drained.iter().take(3) {
            arena.pfa.free(*f);
        }
        let used_before = arena.pfa.used_frames();

        assert_eq!(vmm.clone_pagedir(&mut arena.pfa), Err(VmmError::OutOfMemory));
        assert_eq!(arena.pfa.used_frames(), used_before, "clone must roll back fully");
    }

    #[test]
    fn destroy_address_space_frees_everything() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let used_before = arena.pfa.used_frames();

        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();
        vmm.alloc_region(dir, USER_VA, 6 * PAGE_SIZE as u32, USER_RW, &mut arena.pfa)
            .unwrap();
        vmm.destroy_address_space(dir, &mut arena.pfa);

        assert_eq!(arena.pfa.used_frames(), used_before);
        assert_eq!(arena.pfa.popcount(), used_before);
    }
}
