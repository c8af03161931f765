//! GDT and TSS: flat segments for rings 0 and 3 plus a single task state
//! segment whose `esp0` is rewritten on every context switch.
//!
//! Descriptor encoding is plain bit-twiddling and unit-tested on the
//! host; only loading (`lgdt`, segment reloads, `ltr`) is target-only.

use core::cell::UnsafeCell;

/// A single 8-byte GDT descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct GdtEntry(u64);

impl GdtEntry {
    /// The mandatory null descriptor.
    pub const NULL: GdtEntry = GdtEntry(0);

    /// Encodes a descriptor from base, limit, access byte, and flags
    /// nibble.
    #[must_use]
    pub const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        let mut value = 0u64;
        value |= (limit & 0xFFFF) as u64;
        value |= ((base & 0xFFFF) as u64) << 16;
        value |= (((base >> 16) & 0xFF) as u64) << 32;
        value |= (access as u64) << 40;
        value |= (((limit >> 16) & 0xF) as u64) << 48;
        value |= ((flags & 0xF) as u64) << 52;
        value |= (((base >> 24) & 0xFF) as u64) << 56;
        GdtEntry(value)
    }

    /// Flat 4 GiB kernel code segment.
    #[must_use]
    pub const fn kernel_code() -> Self {
        Self::new(0, 0xF_FFFF, 0x9A, 0xC)
    }

    /// Flat 4 GiB kernel data segment.
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::new(0, 0xF_FFFF, 0x92, 0xC)
    }

    /// Flat 4 GiB user code segment (DPL 3).
    #[must_use]
    pub const fn user_code() -> Self {
        Self::new(0, 0xF_FFFF, 0xFA, 0xC)
    }

    /// Flat 4 GiB user data segment (DPL 3).
    #[must_use]
    pub const fn user_data() -> Self {
        Self::new(0, 0xF_FFFF, 0xF2, 0xC)
    }

    /// A 32-bit available TSS descriptor.
    #[must_use]
    pub const fn tss(base: u32, limit: u32) -> Self {
        Self::new(base, limit, 0x89, 0x0)
    }

    /// Raw descriptor bits.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// The 32-bit task state segment. Only `ss0`/`esp0` are consulted: the
/// CPU reads them on every ring 3 → ring 0 transition to find the kernel
/// stack.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    pub prev_task_link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldt_selector: u32,
    pub debug_trap: u16,
    pub iomap_base: u16,
}

impl TaskStateSegment {
    /// An all-zero TSS.
    #[must_use]
    pub const fn new() -> Self {
        // SAFETY: All-zero is a valid TSS bit pattern.
        unsafe { core::mem::zeroed() }
    }
}

impl Default for TaskStateSegment {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrapper making the mutable TSS placeable in a `static`.
///
/// `esp0` is only written through [`set_esp0`] with interrupts disabled
/// during context switches; the CPU reads the TSS from memory on ring
/// transitions and does not race with that write.
#[repr(transparent)]
struct SyncTss(UnsafeCell<TaskStateSegment>);

// SAFETY: Mutation is confined to interrupts-disabled switch paths.
unsafe impl Sync for SyncTss {}

static TSS: SyncTss = SyncTss(UnsafeCell::new(TaskStateSegment::new()));

/// Number of GDT entries: null, kernel code/data, user code/data, TSS.
#[cfg(target_arch = "x86")]
const GDT_ENTRIES: usize = 6;

#[cfg(target_arch = "x86")]
struct SyncGdt(UnsafeCell<[GdtEntry; GDT_ENTRIES]>);

// SAFETY: Written once during single-threaded boot, read-only afterwards.
#[cfg(target_arch = "x86")]
unsafe impl Sync for SyncGdt {}

#[cfg(target_arch = "x86")]
static GDT: SyncGdt = SyncGdt(UnsafeCell::new([GdtEntry::NULL; GDT_ENTRIES]));

/// Updates `esp0` in the TSS (the ring 3 → ring 0 stack pointer).
///
/// Takes effect immediately; no TR reload is needed because the CPU reads
/// the TSS from memory on every privilege transition.
pub fn set_esp0(esp0: u32) {
    // SAFETY: See `SyncTss`: single writer, interrupts disabled.
    unsafe { (*TSS.0.get()).esp0 = esp0 };
}

/// Builds the GDT, loads it, reloads the segment registers, and loads the
/// task register.
///
/// # Safety
///
/// Must be called exactly once during early boot, before interrupts are
/// enabled.
#[cfg(target_arch = "x86")]
pub unsafe fn init() {
    use muon_core::arch::x86::KERNEL_DATA_SELECTOR;

    // SAFETY: Single-threaded boot; nothing reads the tables yet.
    unsafe {
        let tss = TSS.0.get();
        (*tss).ss0 = KERNEL_DATA_SELECTOR;
        (*tss).iomap_base = core::mem::size_of::<TaskStateSegment>() as u16;

        let limit = core::mem::size_of::<TaskStateSegment>() as u32 - 1;
        *GDT.0.get() = [
            GdtEntry::NULL,
            GdtEntry::kernel_code(),
            GdtEntry::kernel_data(),
            GdtEntry::user_code(),
            GdtEntry::user_data(),
            GdtEntry::tss(tss as u32, limit),
        ];
    }

    #[repr(C, packed)]
    struct GdtPointer {
        limit: u16,
        base: u32,
    }
    let pointer = GdtPointer {
        limit: (GDT_ENTRIES * 8 - 1) as u16,
        base: GDT.0.get() as u32,
    };

    // SAFETY: The pointer references the fully built static GDT. The far
    // jump reloads CS with the kernel code selector; the data segment
    // reloads and the TSS load match the table layout above.
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            "mov ax, 0x10",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "push 0x08",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            ptr = in(reg) &pointer,
            out("eax") _,
        );
        tss_flush(muon_core::arch::x86::TSS_SELECTOR);
    }

    muon_core::kdebug!("GDT and TSS loaded");
}

/// Loads the task register.
///
/// # Safety
///
/// `selector` must index a valid TSS descriptor in the loaded GDT.
#[cfg(target_arch = "x86")]
pub unsafe fn tss_flush(selector: u16) {
    // SAFETY: Caller contract.
    unsafe { core::arch::asm!("ltr {0:x}", in(reg) selector, options(nomem, nostack)) };
}
