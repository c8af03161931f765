//! 8253/8254 programmable interval timer.
//!
//! Channel 0 drives IRQ 0, the scheduler tick.

use super::port::outb;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// The PIT input clock in Hz.
const PIT_BASE_HZ: u32 = 1_193_182;

/// Scheduler tick rate.
pub const TICK_HZ: u32 = 100;

/// Programs channel 0 as a rate generator at `hz` ticks per second.
///
/// # Safety
///
/// Must run during boot with interrupts disabled.
pub unsafe fn init(hz: u32) {
    let divisor = (PIT_BASE_HZ / hz).clamp(1, u32::from(u16::MAX)) as u16;
    // SAFETY: Channel 0, lobyte/hibyte access, mode 3 (square wave).
    unsafe {
        outb(PIT_COMMAND, 0x36);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
    muon_core::kdebug!("PIT running at {} Hz", hz);
}
