//! The interrupt trap frame.
//!
//! Field order matches the interrupt entry path exactly: the stubs push the
//! error code (or a zero placeholder) and vector number, then `pushad`,
//! then the data segment; the hardware frame sits above. The context-switch
//! primitive restores a frame by pointing `esp` at it and unwinding in the
//! reverse order, so any change here must be mirrored in the entry and
//! switch assembly.

use core::fmt;

/// Saved CPU state pushed on every interrupt.
///
/// `useresp` and `ss` are only pushed by the hardware on a privilege-level
/// change (ring 3 → ring 0); for interrupts taken in ring 0 those two slots
/// are not part of the hardware frame and must not be read.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    /// Saved data segment selector.
    pub ds: u32,
    /// `pushad` block, in memory order.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// `esp` as saved by `pushad`; ignored by `popad` on restore.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    /// Return-value register for system calls and fork.
    pub eax: u32,
    /// Interrupt vector number, pushed by the stub.
    pub int_no: u32,
    /// Hardware error code, or 0 for vectors without one.
    pub err_code: u32,
    /// Hardware frame: saved instruction pointer.
    pub eip: u32,
    /// Hardware frame: saved code segment.
    pub cs: u32,
    /// Hardware frame: saved flags.
    pub eflags: u32,
    /// Hardware frame: saved user stack pointer (ring transition only).
    pub useresp: u32,
    /// Hardware frame: saved stack segment (ring transition only).
    pub ss: u32,
}

impl TrapFrame {
    /// Size of the frame in bytes.
    pub const SIZE: usize = core::mem::size_of::<TrapFrame>();

    /// Returns `true` if the frame was captured in user mode (CS RPL = 3).
    #[must_use]
    pub const fn from_user_mode(&self) -> bool {
        self.cs & 3 == 3
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TrapFrame (vector {}, err {:#x})", self.int_no, self.err_code)?;
        writeln!(
            f,
            "  eip={:#010x} cs={:#06x} eflags={:#010x}",
            self.eip, self.cs, self.eflags
        )?;
        writeln!(
            f,
            "  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
            self.eax, self.ebx, self.ecx, self.edx
        )?;
        writeln!(
            f,
            "  esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
            self.esi, self.edi, self.ebp, self.esp
        )?;
        write!(
            f,
            "  ds={:#06x} useresp={:#010x} ss={:#06x}",
            self.ds, self.useresp, self.ss
        )
    }
}
