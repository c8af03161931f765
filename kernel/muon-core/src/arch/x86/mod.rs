//! x86 (32-bit protected mode) data structures.

mod trap;

pub use trap::TrapFrame;

/// Kernel code segment selector (GDT entry 1, ring 0).
pub const KERNEL_CODE_SELECTOR: u32 = 0x08;
/// Kernel data segment selector (GDT entry 2, ring 0).
pub const KERNEL_DATA_SELECTOR: u32 = 0x10;
/// User code segment selector (GDT entry 3, RPL 3).
pub const USER_CODE_SELECTOR: u32 = 0x18 | 3;
/// User data segment selector (GDT entry 4, RPL 3).
pub const USER_DATA_SELECTOR: u32 = 0x20 | 3;
/// TSS selector (GDT entry 5).
pub const TSS_SELECTOR: u16 = 0x28;

/// EFLAGS value for a fresh thread: IF set plus the always-one bit 1.
pub const EFLAGS_IF: u32 = 0x202;
