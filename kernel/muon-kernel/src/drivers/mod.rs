//! In-tree drivers: the serial log sink and the RAM-disk block device.

pub mod block;
#[cfg(target_arch = "x86")]
pub mod serial;
