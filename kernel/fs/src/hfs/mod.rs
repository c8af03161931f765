//! The Muon hierarchical filesystem.
//!
//! Superblock + block/inode bitmaps + inode table + data blocks, with ten
//! direct pointers and one lazily allocated single-indirect block per
//! inode. Inode 0 is the root directory, created at format time with its
//! first data block preallocated.
//!
//! The bitmaps are cached in memory but the disk stays authoritative:
//! every top-level mutating operation (`create`, `mkdir`, `write`)
//! re-reads both bitmaps first, so an external `format` of a mounted
//! device cannot cause conflicting allocations. Bitmap allocations write
//! through immediately and roll the in-memory bit back if the disk write
//! fails.
//!
//! Directory entry removal zeroes the slot but never compacts the
//! directory or shrinks its size; `add_entry` reuses the first zero slot,
//! so tombstones are bounded by the directory's high-water mark.

pub mod layout;

extern crate alloc;

use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::sync::SpinLock;
use muon_core::{kdebug, kerr};
use muon_driver_api::BlockDevice;

use crate::path;
use crate::vfs::{
    DirEntryInfo, FileSystem, FileSystemType, FsError, OpenFlags, Vnode, VnodeKind,
};
use layout::{
    BLOCK_SIZE, DIR_ENTRIES_PER_BLOCK, DirEntry, HFS_MAGIC, INDIRECT_PER_BLOCK, INODE_SIZE,
    INODES_PER_BLOCK, Inode, N_DIRECT, NAME_MAX, Superblock, indirect_slot, set_indirect_slot,
};

/// The root directory's inode number.
pub const ROOT_INODE: u32 = 0;

/// Filesystem usage counters, as reported by [`Hfs::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    /// Free blocks in the data region.
    pub free_data_blocks: u32,
    /// Total blocks in the data region.
    pub total_data_blocks: u32,
    /// Free inodes (inode 0 excluded).
    pub free_inodes: u32,
    /// Allocatable inodes (inode 0 excluded).
    pub total_inodes: u32,
}

/// Metadata for a single node, as reported by [`Hfs::stat_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Inode number.
    pub inode: u32,
    /// `true` for directories.
    pub is_directory: bool,
    /// Size in bytes.
    pub size: u32,
}

/// One block worth of bitmap bits, cached in memory.
struct Bitmap {
    bytes: [u8; BLOCK_SIZE],
}

impl Bitmap {
    fn new() -> Self {
        Self { bytes: [0; BLOCK_SIZE] }
    }

    fn get(&self, bit: u32) -> bool {
        self.bytes[bit as usize / 8] & (1 << (bit % 8)) != 0
    }

    fn set(&mut self, bit: u32) {
        self.bytes[bit as usize / 8] |= 1 << (bit % 8);
    }

    fn clear(&mut self, bit: u32) {
        self.bytes[bit as usize / 8] &= !(1 << (bit % 8));
    }

    /// First clear bit in `[start, max)`.
    fn find_free_from(&self, start: u32, max: u32) -> Option<u32> {
        (start..max.min((BLOCK_SIZE * 8) as u32)).find(|&bit| !self.get(bit))
    }

    fn load(&mut self, block: &[u8; BLOCK_SIZE]) {
        self.bytes.copy_from_slice(block);
    }
}

/// A mounted HFS instance.
pub struct Hfs {
    inner: SpinLock<HfsInner>,
}

struct HfsInner {
    dev: Arc<dyn BlockDevice>,
    sb: Superblock,
    block_bitmap: Bitmap,
    inode_bitmap: Bitmap,
}

impl HfsInner {
    // -- block device helpers ------------------------------------------------

    fn read_block(&self, block: u32) -> Result<[u8; BLOCK_SIZE], FsError> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.dev.read_block(block, &mut buf).map_err(|_| FsError::Io)?;
        Ok(buf)
    }

    fn write_block(&self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), FsError> {
        self.dev.write_block(block, buf).map_err(|_| FsError::Io)
    }

    // -- bitmap management ---------------------------------------------------

    /// Re-reads both bitmaps from disk. External tools may have changed
    /// the device while we are mounted; the disk copy is authoritative.
    /// Read failures leave the cached copy in place.
    fn sync_bitmaps(&mut self) {
        if let Ok(buf) = self.read_block(self.sb.block_bitmap_blk) {
            self.block_bitmap.load(&buf);
        }
        if let Ok(buf) = self.read_block(self.sb.inode_bitmap_blk) {
            self.inode_bitmap.load(&buf);
        }
    }

    fn write_block_bitmap(&self) -> Result<(), FsError> {
        self.write_block(self.sb.block_bitmap_blk, &self.block_bitmap.bytes)
    }

    fn write_inode_bitmap(&self) -> Result<(), FsError> {
        self.write_block(self.sb.inode_bitmap_blk, &self.inode_bitmap.bytes)
    }

    /// Allocates a data block, retrying once with a fresh bitmap from
    /// disk. The new state is written through before the block number is
    /// returned.
    fn alloc_block(&mut self) -> Result<u32, FsError> {
        let mut block = self
            .block_bitmap
            .find_free_from(self.sb.data_blocks_start, self.sb.blocks_count);
        if block.is_none() {
            if let Ok(buf) = self.read_block(self.sb.block_bitmap_blk) {
                self.block_bitmap.load(&buf);
                block = self
                    .block_bitmap
                    .find_free_from(self.sb.data_blocks_start, self.sb.blocks_count);
            }
        }
        let Some(block) = block else {
            kerr!("hfs: no free blocks available");
            return Err(FsError::NoSpace);
        };

        self.block_bitmap.set(block);
        if self.write_block_bitmap().is_err() {
            self.block_bitmap.clear(block);
            return Err(FsError::Io);
        }
        Ok(block)
    }

    /// Frees a data block; out-of-range numbers are ignored. Write-back
    /// failures are tolerated: the resync on the next mutation repairs
    /// the cache.
    fn free_block(&mut self, block: u32) {
        if block < self.sb.data_blocks_start || block >= self.sb.blocks_count {
            return;
        }
        self.block_bitmap.clear(block);
        let _ = self.write_block_bitmap();
    }

    fn alloc_inode(&mut self) -> Result<u32, FsError> {
        let mut ino = self.inode_bitmap.find_free_from(1, self.sb.inodes_count);
        if ino.is_none() {
            if let Ok(buf) = self.read_block(self.sb.inode_bitmap_blk) {
                self.inode_bitmap.load(&buf);
                ino = self.inode_bitmap.find_free_from(1, self.sb.inodes_count);
            }
        }
        let Some(ino) = ino else {
            kerr!("hfs: no free inodes available");
            return Err(FsError::NoSpace);
        };

        self.inode_bitmap.set(ino);
        if self.write_inode_bitmap().is_err() {
            self.inode_bitmap.clear(ino);
            return Err(FsError::Io);
        }
        Ok(ino)
    }

    /// Frees an inode. The root inode and out-of-range numbers are
    /// ignored.
    fn free_inode(&mut self, ino: u32) {
        if ino == ROOT_INODE || ino >= self.sb.inodes_count {
            return;
        }
        self.inode_bitmap.clear(ino);
        let _ = self.write_inode_bitmap();
    }

    // -- inode table ---------------------------------------------------------

    fn read_inode(&self, ino: u32) -> Result<Inode, FsError> {
        if ino >= self.sb.inodes_count {
            return Err(FsError::NotFound);
        }
        let block = self.sb.inode_table_start + ino / INODES_PER_BLOCK as u32;
        let buf = self.read_block(block)?;
        Ok(Inode::decode_at(&buf, ino as usize % INODES_PER_BLOCK))
    }

    fn write_inode(&self, ino: u32, inode: &Inode) -> Result<(), FsError> {
        if ino >= self.sb.inodes_count {
            return Err(FsError::NotFound);
        }
        let block = self.sb.inode_table_start + ino / INODES_PER_BLOCK as u32;
        let mut buf = self.read_block(block)?;
        inode.encode_at(&mut buf, ino as usize % INODES_PER_BLOCK);
        self.write_block(block, &buf)
    }

    // -- block addressing ----------------------------------------------------

    /// Returns the block backing byte `offset` of `inode`, or `None` for
    /// a hole.
    fn block_for_offset(&self, inode: &Inode, offset: u32) -> Result<Option<u32>, FsError> {
        let mut index = (offset as usize) / BLOCK_SIZE;
        if index < N_DIRECT {
            let block = inode.direct[index];
            return Ok((block != 0).then_some(u32::from(block)));
        }

        index -= N_DIRECT;
        if inode.single_indirect == 0 || index >= INDIRECT_PER_BLOCK {
            return Ok(None);
        }
        let buf = self.read_block(u32::from(inode.single_indirect))?;
        let block = indirect_slot(&buf, index);
        Ok((block != 0).then_some(u32::from(block)))
    }

    /// Allocates a zeroed block backing byte `offset`, installing it in
    /// the direct slot or the (lazily created) indirect block and
    /// updating `inode` in memory. The caller rewrites the inode.
    fn alloc_block_for_offset(&mut self, inode: &mut Inode, offset: u32) -> Result<u32, FsError> {
        let index = (offset as usize) / BLOCK_SIZE;
        if index >= N_DIRECT + INDIRECT_PER_BLOCK {
            return Err(FsError::TooLarge);
        }

        let new_block = self.alloc_block()?;
        let zero = [0u8; BLOCK_SIZE];
        if self.write_block(new_block, &zero).is_err() {
            self.free_block(new_block);
            return Err(FsError::Io);
        }

        if index < N_DIRECT {
            inode.direct[index] = new_block as u16;
            return Ok(new_block);
        }

        let index = index - N_DIRECT;
        if inode.single_indirect == 0 {
            let indirect = match self.alloc_block() {
                Ok(b) => b,
                Err(e) => {
                    self.free_block(new_block);
                    return Err(e);
                }
            };
            if self.write_block(indirect, &zero).is_err() {
                self.free_block(indirect);
                self.free_block(new_block);
                return Err(FsError::Io);
            }
            inode.single_indirect = indirect as u16;
        }

        let indirect = u32::from(inode.single_indirect);
        let mut buf = match self.read_block(indirect) {
            Ok(b) => b,
            Err(e) => {
                self.free_block(new_block);
                return Err(e);
            }
        };
        set_indirect_slot(&mut buf, index, new_block as u16);
        if self.write_block(indirect, &buf).is_err() {
            self.free_block(new_block);
            return Err(FsError::Io);
        }
        Ok(new_block)
    }

    /// Number of (possibly sparse) blocks a directory spans.
    fn dir_block_count(inode: &Inode) -> u32 {
        (inode.size as usize).div_ceil(BLOCK_SIZE) as u32
    }

    // -- directory operations ------------------------------------------------

    /// Scans the directory for `name`, returning its inode number.
    fn find_dir_entry(&self, dir: &Inode, name: &str) -> Result<Option<u32>, FsError> {
        if !dir.is_directory {
            return Err(FsError::NotADirectory);
        }
        for i in 0..Self::dir_block_count(dir) {
            let Some(block) = self.block_for_offset(dir, i * BLOCK_SIZE as u32)? else {
                continue;
            };
            let Ok(buf) = self.read_block(block) else {
                continue;
            };
            for slot in 0..DIR_ENTRIES_PER_BLOCK {
                let entry = DirEntry::decode_at(&buf, slot);
                if entry.inode != 0 && entry.name_matches(name) {
                    return Ok(Some(entry.inode));
                }
            }
        }
        Ok(None)
    }

    /// Inserts `name → ino` into the directory, reusing the first free
    /// slot or appending a new block. Updates `dir.size` in memory; the
    /// caller rewrites the directory inode.
    fn add_dir_entry(&mut self, dir: &mut Inode, name: &str, ino: u32) -> Result<(), FsError> {
        if !dir.is_directory {
            return Err(FsError::NotADirectory);
        }

        let num_blocks = Self::dir_block_count(dir).max(1);
        for i in 0..num_blocks {
            let offset = i * BLOCK_SIZE as u32;
            let block = match self.block_for_offset(dir, offset)? {
                Some(b) => b,
                None => self.alloc_block_for_offset(dir, offset)?,
            };
            let Ok(mut buf) = self.read_block(block) else {
                continue;
            };
            for slot in 0..DIR_ENTRIES_PER_BLOCK {
                if DirEntry::decode_at(&buf, slot).inode != 0 {
                    continue;
                }
                DirEntry::new(name, ino).encode_at(&mut buf, slot);
                self.write_block(block, &buf)?;
                let end = offset + ((slot + 1) * layout::DIR_ENTRY_SIZE) as u32;
                if dir.size < end {
                    dir.size = end;
                }
                return Ok(());
            }
        }

        // Every existing block is full: append a fresh one.
        let offset = num_blocks * BLOCK_SIZE as u32;
        let block = self.alloc_block_for_offset(dir, offset)?;
        let mut buf = [0u8; BLOCK_SIZE];
        DirEntry::new(name, ino).encode_at(&mut buf, 0);
        self.write_block(block, &buf)?;
        dir.size = offset + layout::DIR_ENTRY_SIZE as u32;
        Ok(())
    }

    /// Zeroes the matching slot. The directory size is intentionally not
    /// compacted, keeping iteration order stable.
    fn remove_dir_entry(&mut self, dir: &Inode, name: &str) -> Result<(), FsError> {
        if !dir.is_directory {
            return Err(FsError::NotADirectory);
        }
        for i in 0..Self::dir_block_count(dir) {
            let Some(block) = self.block_for_offset(dir, i * BLOCK_SIZE as u32)? else {
                continue;
            };
            let Ok(mut buf) = self.read_block(block) else {
                continue;
            };
            for slot in 0..DIR_ENTRIES_PER_BLOCK {
                let entry = DirEntry::decode_at(&buf, slot);
                if entry.inode != 0 && entry.name_matches(name) {
                    DirEntry::empty().encode_at(&mut buf, slot);
                    self.write_block(block, &buf)?;
                    return Ok(());
                }
            }
        }
        Err(FsError::NotFound)
    }

    // -- path resolution -----------------------------------------------------

    /// Walks an absolute path from the root, skipping empty components.
    fn resolve(&self, full_path: &str) -> Result<u32, FsError> {
        if full_path.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        if full_path == "/" {
            return Ok(ROOT_INODE);
        }

        let mut current = ROOT_INODE;
        for token in path::components(full_path) {
            let inode = self.read_inode(current)?;
            if !inode.is_directory {
                return Err(FsError::NotADirectory);
            }
            current = self
                .find_dir_entry(&inode, token)?
                .ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    // -- node lifecycle ------------------------------------------------------

    /// Shared implementation of `create` and `mkdir`.
    fn create_node(&mut self, full_path: &str, is_directory: bool) -> Result<(), FsError> {
        self.sync_bitmaps();

        let (parent_path, name) = path::split_parent(full_path);
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FsError::InvalidArgument);
        }

        let parent_ino = self.resolve(parent_path)?;
        let mut parent = self.read_inode(parent_ino)?;
        if !parent.is_directory {
            return Err(FsError::NotADirectory);
        }
        if self.find_dir_entry(&parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let ino = self.alloc_inode()?;
        let node = Inode { is_directory, ..Inode::default() };
        if let Err(e) = self.write_inode(ino, &node) {
            self.free_inode(ino);
            return Err(e);
        }
        if let Err(e) = self.add_dir_entry(&mut parent, name, ino) {
            self.free_inode(ino);
            return Err(e);
        }
        self.write_inode(parent_ino, &parent)?;
        kdebug!("hfs: created {} (inode {})", full_path, ino);
        Ok(())
    }

    /// Frees every data block of an inode: the direct pointers, the
    /// blocks listed in the indirect block, and the indirect block
    /// itself.
    fn free_inode_blocks(&mut self, inode: &mut Inode) {
        for i in 0..N_DIRECT {
            if inode.direct[i] != 0 {
                self.free_block(u32::from(inode.direct[i]));
                inode.direct[i] = 0;
            }
        }
        if inode.single_indirect != 0 {
            if let Ok(buf) = self.read_block(u32::from(inode.single_indirect)) {
                for i in 0..INDIRECT_PER_BLOCK {
                    let block = indirect_slot(&buf, i);
                    if block != 0 {
                        self.free_block(u32::from(block));
                    }
                }
            }
            self.free_block(u32::from(inode.single_indirect));
            inode.single_indirect = 0;
        }
    }

    /// Recursively frees `ino` and, for directories, everything below it.
    /// Parent directory entries are the caller's concern.
    fn remove_tree(&mut self, ino: u32) -> Result<(), FsError> {
        let mut inode = self.read_inode(ino)?;

        if inode.is_directory {
            for i in 0..Self::dir_block_count(&inode) {
                let Some(block) = self.block_for_offset(&inode, i * BLOCK_SIZE as u32)? else {
                    continue;
                };
                let Ok(buf) = self.read_block(block) else {
                    continue;
                };
                for slot in 0..DIR_ENTRIES_PER_BLOCK {
                    let entry = DirEntry::decode_at(&buf, slot);
                    if entry.inode != 0 {
                        let _ = self.remove_tree(entry.inode);
                    }
                }
            }
        }

        self.free_inode_blocks(&mut inode);
        self.free_inode(ino);
        Ok(())
    }

    fn remove(&mut self, full_path: &str) -> Result<(), FsError> {
        let ino = self.resolve(full_path)?;
        if ino == ROOT_INODE {
            return Err(FsError::RootProtected);
        }

        self.remove_tree(ino)?;

        let (parent_path, name) = path::split_parent(full_path);
        if let Ok(parent_ino) = self.resolve(parent_path) {
            if let Ok(parent) = self.read_inode(parent_ino) {
                let _ = self.remove_dir_entry(&parent, name);
            }
        }
        kdebug!("hfs: removed {} (inode {})", full_path, ino);
        Ok(())
    }

    // -- file I/O ------------------------------------------------------------

    fn read(&self, ino: u32, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        let inode = self.read_inode(ino)?;
        if offset >= inode.size {
            return Ok(0);
        }

        let len = buf.len().min((inode.size - offset) as usize);
        let mut done = 0usize;
        while done < len {
            let current = offset + done as u32;
            let block_off = current as usize % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - block_off).min(len - done);

            match self.block_for_offset(&inode, current) {
                // Hole: reads return zero bytes.
                Ok(None) => buf[done..done + chunk].fill(0),
                Ok(Some(block)) => match self.read_block(block) {
                    Ok(data) => {
                        buf[done..done + chunk].copy_from_slice(&data[block_off..block_off + chunk]);
                    }
                    Err(e) => return if done > 0 { Ok(done) } else { Err(e) },
                },
                Err(e) => return if done > 0 { Ok(done) } else { Err(e) },
            }
            done += chunk;
        }
        Ok(len)
    }

    fn write(&mut self, ino: u32, offset: u32, data: &[u8]) -> Result<usize, FsError> {
        self.sync_bitmaps();
        let mut inode = self.read_inode(ino)?;

        let mut done = 0usize;
        let mut failure: Option<FsError> = None;

        while done < data.len() {
            let current = offset + done as u32;
            let block_off = current as usize % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - block_off).min(data.len() - done);

            let block = match self.block_for_offset(&inode, current) {
                Ok(Some(b)) => b,
                Ok(None) => match self.alloc_block_for_offset(&mut inode, current) {
                    Ok(b) => {
                        // Persist the new pointer before touching data.
                        if let Err(e) = self.write_inode(ino, &inode) {
                            failure = Some(e);
                            break;
                        }
                        b
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                },
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            // Partial spans read-modify-write; whole blocks overwrite.
            let mut buf = if block_off != 0 || chunk != BLOCK_SIZE {
                match self.read_block(block) {
                    Ok(b) => b,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            } else {
                [0u8; BLOCK_SIZE]
            };
            buf[block_off..block_off + chunk].copy_from_slice(&data[done..done + chunk]);
            if let Err(e) = self.write_block(block, &buf) {
                failure = Some(e);
                break;
            }
            done += chunk;
        }

        // The written prefix advances the size even when the write came up
        // short; partially populated indirect slots stay allocated. Once
        // data has been transferred the short count wins over any later
        // metadata write failure.
        if done > 0 && offset + done as u32 > inode.size {
            inode.size = offset + done as u32;
        }
        let _ = self.write_inode(ino, &inode);

        match failure {
            Some(e) if done == 0 => Err(e),
            _ => Ok(done),
        }
    }

    fn readdir(&self, ino: u32, index: u32) -> Result<Option<DirEntryInfo>, FsError> {
        let inode = self.read_inode(ino)?;
        if !inode.is_directory {
            return Err(FsError::NotADirectory);
        }

        let mut live = 0u32;
        for i in 0..Self::dir_block_count(&inode) {
            let Some(block) = self.block_for_offset(&inode, i * BLOCK_SIZE as u32)? else {
                continue;
            };
            let Ok(buf) = self.read_block(block) else {
                continue;
            };
            for slot in 0..DIR_ENTRIES_PER_BLOCK {
                let entry = DirEntry::decode_at(&buf, slot);
                if entry.inode == 0 {
                    continue;
                }
                if live == index {
                    return Ok(Some(DirEntryInfo {
                        name: entry.name_str().to_string(),
                        inode: entry.inode,
                    }));
                }
                live += 1;
            }
        }
        Ok(None)
    }

    fn stat(&self) -> FsStats {
        let mut free_data_blocks = 0;
        for block in self.sb.data_blocks_start..self.sb.blocks_count {
            if !self.block_bitmap.get(block) {
                free_data_blocks += 1;
            }
        }
        let mut free_inodes = 0;
        for ino in 1..self.sb.inodes_count {
            if !self.inode_bitmap.get(ino) {
                free_inodes += 1;
            }
        }
        FsStats {
            free_data_blocks,
            total_data_blocks: self.sb.blocks_count - self.sb.data_blocks_start,
            free_inodes,
            total_inodes: self.sb.inodes_count - 1,
        }
    }
}

impl Hfs {
    /// Writes a fresh filesystem onto `dev`.
    ///
    /// The inode count is `blocks / 4` clamped to `[64, 4096]`. All
    /// metadata blocks and the root directory's first data block are
    /// marked used; the root inode is written as an empty directory whose
    /// first direct pointer references that block.
    ///
    /// A mounted instance of the same device keeps working because every
    /// mutating operation revalidates the bitmaps from disk first.
    pub fn format(dev: &dyn BlockDevice) -> Result<(), FsError> {
        if dev.block_size() != BLOCK_SIZE {
            kerr!(
                "hfs: block size mismatch: expected {}, got {}",
                BLOCK_SIZE,
                dev.block_size()
            );
            return Err(FsError::InvalidArgument);
        }

        // One bitmap block tracks BLOCK_SIZE * 8 blocks.
        let num_blocks = dev.block_count().min((BLOCK_SIZE * 8) as u32);
        let num_inodes = (num_blocks / 4).clamp(64, 4096);
        let inode_blocks = (num_inodes as usize * INODE_SIZE).div_ceil(BLOCK_SIZE) as u32;

        let sb = Superblock {
            magic: HFS_MAGIC,
            blocks_count: num_blocks,
            inodes_count: num_inodes,
            block_bitmap_blk: 1,
            inode_bitmap_blk: 2,
            inode_table_start: 3,
            data_blocks_start: 3 + inode_blocks,
        };

        let mut buf = [0u8; BLOCK_SIZE];
        sb.encode(&mut buf);
        dev.write_block(0, &buf).map_err(|_| FsError::Io)?;

        // Block bitmap: metadata blocks plus the root's first data block.
        let root_data_block = sb.data_blocks_start;
        let mut bitmap = Bitmap::new();
        for block in 0..sb.data_blocks_start {
            bitmap.set(block);
        }
        bitmap.set(root_data_block);
        dev.write_block(sb.block_bitmap_blk, &bitmap.bytes).map_err(|_| FsError::Io)?;

        // Inode bitmap: only the root.
        let mut inode_bitmap = Bitmap::new();
        inode_bitmap.set(ROOT_INODE);
        dev.write_block(sb.inode_bitmap_blk, &inode_bitmap.bytes).map_err(|_| FsError::Io)?;

        // Clear the inode table and the root's data block.
        let zero = [0u8; BLOCK_SIZE];
        for i in 0..inode_blocks {
            dev.write_block(sb.inode_table_start + i, &zero).map_err(|_| FsError::Io)?;
        }
        dev.write_block(root_data_block, &zero).map_err(|_| FsError::Io)?;

        // Root inode: an empty directory with its first block in place.
        let mut root = Inode { is_directory: true, ..Inode::default() };
        root.direct[0] = root_data_block as u16;
        let mut table_block = [0u8; BLOCK_SIZE];
        root.encode_at(&mut table_block, 0);
        dev.write_block(sb.inode_table_start, &table_block).map_err(|_| FsError::Io)?;

        kdebug!(
            "hfs: formatted {} blocks, {} inodes, data@{}",
            num_blocks,
            num_inodes,
            sb.data_blocks_start
        );
        Ok(())
    }

    /// Mounts a previously formatted device.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Arc<Hfs>, FsError> {
        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_block(0, &mut buf).map_err(|_| FsError::Io)?;
        let sb = Superblock::decode(&buf);
        if sb.magic != HFS_MAGIC {
            kerr!("hfs: invalid magic {:#010x}", sb.magic);
            return Err(FsError::BadMagic);
        }

        let mut inner = HfsInner {
            dev,
            sb,
            block_bitmap: Bitmap::new(),
            inode_bitmap: Bitmap::new(),
        };
        let blocks = inner.read_block(sb.block_bitmap_blk)?;
        inner.block_bitmap.load(&blocks);
        let inodes = inner.read_block(sb.inode_bitmap_blk)?;
        inner.inode_bitmap.load(&inodes);

        kdebug!("hfs: mounted ({} blocks, {} inodes)", sb.blocks_count, sb.inodes_count);
        Ok(Arc::new(Hfs { inner: SpinLock::new(inner) }))
    }

    /// Reports free/total data blocks and inodes.
    #[must_use]
    pub fn stat(&self) -> FsStats {
        self.inner.lock().stat()
    }

    /// Reports a single node's metadata.
    pub fn stat_file(&self, full_path: &str) -> Result<FileStat, FsError> {
        let inner = self.inner.lock();
        let ino = inner.resolve(full_path)?;
        let inode = inner.read_inode(ino)?;
        Ok(FileStat {
            inode: ino,
            is_directory: inode.is_directory,
            size: inode.size,
        })
    }

    /// Lists a directory's live entries.
    pub fn list(&self, full_path: &str) -> Result<Vec<DirEntryInfo>, FsError> {
        let inner = self.inner.lock();
        let ino = inner.resolve(full_path)?;
        let mut entries = Vec::new();
        let mut index = 0;
        while let Some(entry) = inner.readdir(ino, index)? {
            entries.push(entry);
            index += 1;
        }
        Ok(entries)
    }
}

impl FileSystem for Hfs {
    fn name(&self) -> &'static str {
        "hfs"
    }

    fn open(&self, full_path: &str, flags: OpenFlags) -> Result<Vnode, FsError> {
        let inner = self.inner.lock();
        let ino = inner.resolve(full_path)?;
        let inode = inner.read_inode(ino)?;

        let name = if full_path == "/" { "/" } else { path::file_name(full_path) };
        Ok(Vnode {
            name: name.to_string(),
            kind: if inode.is_directory { VnodeKind::Directory } else { VnodeKind::File },
            flags,
            inode: ino,
        })
    }

    fn read(&self, vnode: &Vnode, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        self.inner.lock().read(vnode.inode, offset, buf)
    }

    fn write(&self, vnode: &Vnode, offset: u32, data: &[u8]) -> Result<usize, FsError> {
        self.inner.lock().write(vnode.inode, offset, data)
    }

    fn create(&self, full_path: &str) -> Result<(), FsError> {
        self.inner.lock().create_node(full_path, false)
    }

    fn mkdir(&self, full_path: &str) -> Result<(), FsError> {
        self.inner.lock().create_node(full_path, true)
    }

    fn remove(&self, full_path: &str) -> Result<(), FsError> {
        self.inner.lock().remove(full_path)
    }

    fn readdir(&self, vnode: &Vnode, index: u32) -> Result<Option<DirEntryInfo>, FsError> {
        self.inner.lock().readdir(vnode.inode, index)
    }
}

/// The registrable filesystem type for HFS.
pub struct HfsType;

impl FileSystemType for HfsType {
    fn name(&self) -> &'static str {
        "hfs"
    }

    fn mount(&self, dev: Arc<dyn BlockDevice>) -> Result<Arc<dyn FileSystem>, FsError> {
        let fs: Arc<dyn FileSystem> = Hfs::mount(dev)?;
        Ok(fs)
    }
}
