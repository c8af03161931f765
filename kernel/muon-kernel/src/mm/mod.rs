//! Memory-management singletons and the global heap allocator.
//!
//! The PFA, VMM, and buddy heap instances live here behind
//! `SpinLock<Option<…>>` globals with `with_*` accessors. The buddy heap
//! doubles as the `#[global_allocator]` on the kernel target; every heap
//! entry point masks interrupts, which is what makes freeing from the
//! timer-tick reap path safe.

extern crate alloc;

use core::alloc::{GlobalAlloc, Layout};

use muon_core::addr::VirtAddr;
use muon_core::sync::SpinLock;
use muon_mm::heap::Heap;
use muon_mm::page::PageFlags;
use muon_mm::pfa::BitmapAllocator;
use muon_mm::vmm::Vmm;
use muon_mm::VmmError;

/// Virtual base of the kernel heap region.
pub const KERNEL_HEAP_BASE: u32 = 0xE000_0000;

/// Kernel heap size: 1 MiB, the largest single buddy block.
pub const KERNEL_HEAP_SIZE: u32 = 1 << 20;

static PFA: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);
static VMM: SpinLock<Option<Vmm>> = SpinLock::new(None);
static HEAP: SpinLock<Option<Heap>> = SpinLock::new(None);

/// Installs the frame allocator built by the boot code.
///
/// # Panics
///
/// Panics if called twice.
pub fn install_pfa(pfa: BitmapAllocator) {
    let mut slot = PFA.lock();
    assert!(slot.is_none(), "PFA already initialized");
    *slot = Some(pfa);
}

/// Installs the VMM built by the boot code.
///
/// # Panics
///
/// Panics if called twice.
pub fn install_vmm(vmm: Vmm) {
    let mut slot = VMM.lock();
    assert!(slot.is_none(), "VMM already initialized");
    *slot = Some(vmm);
}

/// Runs a closure with the global frame allocator.
///
/// # Panics
///
/// Panics if the PFA has not been installed.
pub fn with_pfa<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> R {
    let mut pfa = PFA.lock();
    f(pfa.as_mut().expect("PFA not initialized"))
}

/// Runs a closure with the global VMM.
///
/// # Panics
///
/// Panics if the VMM has not been installed.
pub fn with_vmm<R>(f: impl FnOnce(&mut Vmm) -> R) -> R {
    let mut vmm = VMM.lock();
    f(vmm.as_mut().expect("VMM not initialized"))
}

/// Runs a closure with both the VMM and the frame allocator, which most
/// address-space operations need together.
pub fn with_vmm_and_pfa<R>(f: impl FnOnce(&mut Vmm, &mut BitmapAllocator) -> R) -> R {
    let mut vmm = VMM.lock();
    let mut pfa = PFA.lock();
    f(
        vmm.as_mut().expect("VMM not initialized"),
        pfa.as_mut().expect("PFA not initialized"),
    )
}

/// Maps the kernel heap region and seeds the buddy allocator over it.
///
/// # Panics
///
/// Panics if called twice.
pub fn init_heap() -> Result<(), VmmError> {
    with_vmm_and_pfa(|vmm, pfa| {
        vmm.alloc_region(
            vmm.kernel_dir(),
            VirtAddr::new(KERNEL_HEAP_BASE),
            KERNEL_HEAP_SIZE,
            PageFlags::PRESENT | PageFlags::WRITABLE,
            pfa,
        )
    })?;

    // SAFETY: The region was just mapped writable and nothing else uses
    // it.
    let heap = unsafe { Heap::new(KERNEL_HEAP_BASE as usize, KERNEL_HEAP_SIZE as usize) };
    let mut slot = HEAP.lock();
    assert!(slot.is_none(), "heap already initialized");
    *slot = Some(heap);
    muon_core::kinfo!(
        "kernel heap at {:#010x}, {} KiB",
        KERNEL_HEAP_BASE,
        KERNEL_HEAP_SIZE / 1024
    );
    Ok(())
}

#[cfg(target_arch = "x86")]
fn heap_critical<R>(f: impl FnOnce() -> R) -> R {
    crate::arch::x86::instructions::without_interrupts(f)
}

#[cfg(not(target_arch = "x86"))]
fn heap_critical<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// The kernel's `GlobalAlloc`, backed by the buddy heap.
///
/// Buddy payloads are 8-aligned; stricter alignments are satisfied by
/// over-allocating and stashing the raw pointer one word below the
/// aligned payload so `dealloc` can recover it.
pub struct KernelAllocator;

const PTR_SIZE: usize = core::mem::size_of::<usize>();

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        heap_critical(|| {
            let mut heap = HEAP.lock();
            let Some(heap) = heap.as_mut() else {
                return core::ptr::null_mut();
            };

            if layout.align() <= 8 {
                return heap.alloc(layout.size().max(1));
            }

            let raw = heap.alloc(layout.size() + layout.align() + PTR_SIZE);
            if raw.is_null() {
                return raw;
            }
            let payload =
                (raw as usize + PTR_SIZE + layout.align() - 1) & !(layout.align() - 1);
            // SAFETY: `payload - PTR_SIZE` is inside the over-allocated
            // block.
            unsafe { ((payload - PTR_SIZE) as *mut usize).write(raw as usize) };
            payload as *mut u8
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        heap_critical(|| {
            let mut heap = HEAP.lock();
            let Some(heap) = heap.as_mut() else {
                return;
            };

            if layout.align() <= 8 {
                heap.free(ptr);
            } else {
                // SAFETY: `alloc` stored the raw block pointer in the
                // word below the aligned payload.
                let raw = unsafe { ((ptr as usize - PTR_SIZE) as *const usize).read() };
                heap.free(raw as *mut u8);
            }
        });
    }
}

#[cfg_attr(target_os = "none", global_allocator)]
static ALLOCATOR: KernelAllocator = KernelAllocator;

/// The page-fault handler, registered on vector 14.
///
/// Any fault is fatal: the faulting address is recorded from CR2 and the
/// CPU halts. Demand paging does not exist in this kernel.
#[cfg(target_arch = "x86")]
pub fn page_fault_handler(ctx: &mut muon_core::arch::x86::TrapFrame) {
    let cr2 = crate::arch::x86::instructions::read_cr2();
    muon_core::kfatal!(
        "page fault at {:#010x} (err {:#x}, eip {:#010x})",
        cr2,
        ctx.err_code,
        ctx.eip
    );
    crate::arch::x86::interrupts::fatal_halt();
}
