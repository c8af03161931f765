//! The Muon kernel proper: architecture glue, drivers, and the subsystem
//! singletons.
//!
//! The algorithmic cores live in the sibling crates (`muon-mm`,
//! `muon-fs`, `muon-sched`, `muon-elf`); this crate owns the global
//! instances, the x86 plumbing (GDT/TSS, IDT, PIC/PIT, interrupt entry,
//! context switch), the serial log sink, the RAM-disk block device, the
//! VFS mount table, and the process loader. Everything
//! architecture-specific is confined to [`arch`] and compiled only for
//! `target_arch = "x86"`, which keeps the rest of the crate (and its
//! tests) building on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
#[cfg(target_arch = "x86")]
pub mod boot;
pub mod drivers;
pub mod fs;
pub mod mm;
pub mod proc;

#[cfg(all(target_os = "none", not(test)))]
mod panic {
    use muon_core::kfatal;

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
        kfatal!("kernel panic: {}", info);
        loop {
            crate::arch::x86::instructions::halt();
        }
    }
}
