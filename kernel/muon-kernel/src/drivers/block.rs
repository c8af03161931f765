//! RAM-disk block device and the block-device registry.
//!
//! The RAM disk backs the filesystem during bring-up and in tests; the
//! registry maps device names to handles so the filesystem layer can
//! find its device without compile-time wiring.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use muon_core::kinfo;
use muon_core::sync::SpinLock;
use muon_driver_api::{BlockDevice, IoError};

/// An in-memory block device.
pub struct RamDisk {
    data: SpinLock<Vec<u8>>,
    block_size: usize,
    block_count: u32,
}

impl RamDisk {
    /// Allocates a zeroed RAM disk of `block_count` blocks.
    #[must_use]
    pub fn new(block_count: u32, block_size: usize) -> Self {
        Self {
            data: SpinLock::new(vec![0u8; block_count as usize * block_size]),
            block_size,
            block_count,
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<(), IoError> {
        if block >= self.block_count {
            return Err(IoError::OutOfRange);
        }
        if buf.len() < self.block_size {
            return Err(IoError::InvalidBuffer);
        }
        let data = self.data.lock();
        let offset = block as usize * self.block_size;
        buf[..self.block_size].copy_from_slice(&data[offset..offset + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block: u32, buf: &[u8]) -> Result<(), IoError> {
        if block >= self.block_count {
            return Err(IoError::OutOfRange);
        }
        if buf.len() < self.block_size {
            return Err(IoError::InvalidBuffer);
        }
        let mut data = self.data.lock();
        let offset = block as usize * self.block_size;
        data[offset..offset + self.block_size].copy_from_slice(&buf[..self.block_size]);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }
}

// ---------------------------------------------------------------------------
// Device registry
// ---------------------------------------------------------------------------

static DEVICES: SpinLock<BTreeMap<String, Arc<dyn BlockDevice>>> =
    SpinLock::new(BTreeMap::new());

/// Registers a block device under `name`, replacing any previous one.
pub fn register_device(name: &str, dev: Arc<dyn BlockDevice>) {
    kinfo!(
        "block: registered '{}' ({} blocks of {} bytes)",
        name,
        dev.block_count(),
        dev.block_size()
    );
    DEVICES.lock().insert(name.to_string(), dev);
}

/// Looks up a block device by name.
#[must_use]
pub fn get_by_name(name: &str) -> Option<Arc<dyn BlockDevice>> {
    DEVICES.lock().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let disk = RamDisk::new(8, 512);

        let pattern = [0xABu8; 512];
        disk.write_block(3, &pattern).unwrap();

        let mut buf = [0u8; 512];
        disk.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, pattern);

        // Other blocks stay zeroed.
        disk.read_block(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_rejected() {
        let disk = RamDisk::new(4, 512);
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_block(4, &mut buf).err(), Some(IoError::OutOfRange));
        assert_eq!(disk.write_block(9, &buf).err(), Some(IoError::OutOfRange));
    }

    #[test]
    fn short_buffer_rejected() {
        let disk = RamDisk::new(4, 512);
        let mut small = [0u8; 256];
        assert_eq!(disk.read_block(0, &mut small).err(), Some(IoError::InvalidBuffer));
        assert_eq!(disk.write_block(0, &small).err(), Some(IoError::InvalidBuffer));
    }

    #[test]
    fn geometry_accessors() {
        let disk = RamDisk::new(16, 4096);
        assert_eq!(disk.block_count(), 16);
        assert_eq!(disk.block_size(), 4096);
    }

    #[test]
    fn read_blocks_default_impl() {
        let disk = RamDisk::new(4, 512);
        disk.write_block(1, &[1u8; 512]).unwrap();
        disk.write_block(2, &[2u8; 512]).unwrap();

        let mut buf = [0u8; 1024];
        disk.read_blocks(1, 2, &mut buf).unwrap();
        assert!(buf[..512].iter().all(|&b| b == 1));
        assert!(buf[512..].iter().all(|&b| b == 2));
    }

    #[test]
    fn registry_roundtrip() {
        let disk: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(4, 512));
        register_device("ramdisk-test", disk);

        let found = get_by_name("ramdisk-test").expect("registered device");
        assert_eq!(found.block_count(), 4);
        assert!(get_by_name("missing").is_none());
    }
}
