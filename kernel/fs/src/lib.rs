//! Filesystem layer for the Muon kernel.
//!
//! [`vfs`] holds the filesystem-facing traits and the vnode type; [`hfs`]
//! is the on-disk filesystem (superblock, block/inode bitmaps, inode
//! table, direct + single-indirect file blocks); [`path`] has the shared
//! path utilities. Everything here is host-testable against an in-memory
//! block device.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod hfs;
pub mod path;
pub mod vfs;

pub use vfs::{DirEntryInfo, FileSystem, FileSystemType, FsError, OpenFlags, Vnode, VnodeKind};
