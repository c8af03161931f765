//! Interrupt handler dispatch.
//!
//! A fixed table of function pointers indexed by vector. Registration is
//! a plain atomic store; the common assembly stub calls
//! [`dispatch_trap`] with the saved-register block, which invokes the
//! registered handler and acknowledges the PIC for hardware IRQs. The
//! timer handler must never call back into registration.

use core::sync::atomic::{AtomicPtr, Ordering};

use muon_core::arch::x86::TrapFrame;
use muon_core::kwarn;

/// Handler signature: receives the saved CPU state, which it may mutate
/// (the system-call return value, for instance, goes into `eax`).
pub type InterruptHandler = fn(&mut TrapFrame);

/// Timer interrupt vector (PIC IRQ 0 after remap).
pub const TIMER_VECTOR: u8 = 32;

/// Keyboard interrupt vector (PIC IRQ 1 after remap).
pub const KEYBOARD_VECTOR: u8 = 33;

/// Page-fault exception vector.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// System-call vector.
pub const SYSCALL_VECTOR: u8 = 0x80;

const NUM_VECTORS: usize = 256;

static HANDLERS: [AtomicPtr<()>; NUM_VECTORS] = {
    const INIT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
    [INIT; NUM_VECTORS]
};

/// Installs `handler` for `vector`, replacing any previous one.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    HANDLERS[vector as usize].store(handler as *mut (), Ordering::Release);
}

/// Removes the handler for `vector`.
pub fn unregister_handler(vector: u8) {
    HANDLERS[vector as usize].store(core::ptr::null_mut(), Ordering::Release);
}

/// Returns the registered handler for `vector`, if any.
#[must_use]
pub fn handler_for(vector: u8) -> Option<InterruptHandler> {
    let ptr = HANDLERS[vector as usize].load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: Only valid `InterruptHandler` pointers are stored.
        Some(unsafe { core::mem::transmute::<*mut (), InterruptHandler>(ptr) })
    }
}

/// Common dispatcher, called from the interrupt entry stubs.
///
/// Looks up the handler for the saved vector number and invokes it, then
/// sends the PIC end-of-interrupt for remapped hardware IRQs (32..=47).
/// Unhandled CPU exceptions are fatal.
pub extern "C" fn dispatch_trap(ctx: &mut TrapFrame) {
    let vector = ctx.int_no as u8;

    match handler_for(vector) {
        Some(handler) => handler(ctx),
        None if vector < 32 => {
            muon_core::kfatal!(
                "unhandled CPU exception {} (err {:#x}) at eip {:#010x}",
                vector,
                ctx.err_code,
                ctx.eip
            );
            fatal_halt();
        }
        None => kwarn!("spurious interrupt on vector {}", vector),
    }

    #[cfg(target_arch = "x86")]
    if (32..=47).contains(&vector) {
        super::pic::send_eoi(vector);
    }
}

/// Stops the CPU after an unrecoverable fault.
pub fn fatal_halt() -> ! {
    #[cfg(target_arch = "x86")]
    loop {
        super::instructions::cli();
        super::instructions::halt();
    }
    #[cfg(not(target_arch = "x86"))]
    panic!("fatal fault");
}
