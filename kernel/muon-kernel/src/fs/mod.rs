//! Filesystem glue: the mount table and open-file handles.

pub mod vfs;

pub use vfs::{OpenFile, get_mounted, vfs_open};
