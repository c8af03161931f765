//! x86 (32-bit protected mode) support.
//!
//! Descriptor-table encodings and the interrupt dispatch table are plain
//! data and build everywhere (their unit tests run on the host); the
//! privileged instruction wrappers, the interrupt entry stubs, and the
//! device plumbing only exist for `target_arch = "x86"`.

#[cfg(target_arch = "x86")]
pub mod entry;
pub mod gdt;
pub mod idt;
pub mod interrupts;
#[cfg(target_arch = "x86")]
pub mod instructions;
#[cfg(target_arch = "x86")]
pub mod pic;
#[cfg(target_arch = "x86")]
pub mod pit;
#[cfg(target_arch = "x86")]
pub mod port;
