//! VFS-facing traits and the vnode type.
//!
//! A [`Vnode`] is the handle to an open file or directory. It carries the
//! owning filesystem's inode number as opaque per-node data and never owns
//! the filesystem itself, so the ownership graph stays acyclic. The mount
//! table lives in the kernel crate; this module only defines the seams.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use muon_driver_api::BlockDevice;

/// Errors surfaced by filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The path does not resolve to an existing node.
    NotFound,
    /// Create/mkdir target already exists.
    AlreadyExists,
    /// A path component that must be a directory is not one.
    NotADirectory,
    /// The operation does not apply to a directory.
    IsADirectory,
    /// Malformed path or argument (empty name, relative path, …).
    InvalidArgument,
    /// No free data blocks or inodes remain.
    NoSpace,
    /// The file would exceed the direct + single-indirect capacity.
    TooLarge,
    /// The device contents are not a recognised filesystem.
    BadMagic,
    /// The underlying block device failed.
    Io,
    /// The root directory cannot be removed.
    RootProtected,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no such file or directory"),
            Self::AlreadyExists => f.write_str("file exists"),
            Self::NotADirectory => f.write_str("not a directory"),
            Self::IsADirectory => f.write_str("is a directory"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::NoSpace => f.write_str("no space left on device"),
            Self::TooLarge => f.write_str("file too large"),
            Self::BadMagic => f.write_str("bad filesystem magic"),
            Self::Io => f.write_str("I/O error"),
            Self::RootProtected => f.write_str("cannot remove root directory"),
        }
    }
}

bitflags::bitflags! {
    /// Flags for opening a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ  = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
    }
}

/// The kind of node a vnode refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// The VFS-visible handle to an open inode.
#[derive(Debug, Clone)]
pub struct Vnode {
    /// Final path component the node was opened under.
    pub name: String,
    /// File or directory.
    pub kind: VnodeKind,
    /// Flags the node was opened with.
    pub flags: OpenFlags,
    /// Opaque per-node data: the owning filesystem's inode number.
    pub inode: u32,
}

/// A directory entry as reported by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    /// Entry name.
    pub name: String,
    /// Inode number of the entry.
    pub inode: u32,
}

/// The per-filesystem operations vector.
pub trait FileSystem: Send + Sync {
    /// Short filesystem name (e.g. `"hfs"`).
    fn name(&self) -> &'static str;

    /// Resolves `path` and constructs a vnode for it.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Vnode, FsError>;

    /// Releases a vnode. The default implementation just drops it.
    fn close(&self, vnode: Vnode) -> Result<(), FsError> {
        drop(vnode);
        Ok(())
    }

    /// Reads up to `buf.len()` bytes from byte offset `offset`.
    ///
    /// Returns the number of bytes read; 0 at or past end of file.
    fn read(&self, vnode: &Vnode, offset: u32, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes `data` at byte offset `offset`, extending the file as
    /// needed.
    ///
    /// On allocation exhaustion the successfully written prefix length is
    /// returned; an error only if nothing was written.
    fn write(&self, vnode: &Vnode, offset: u32, data: &[u8]) -> Result<usize, FsError>;

    /// Creates an empty regular file at `path`.
    fn create(&self, path: &str) -> Result<(), FsError>;

    /// Creates an empty directory at `path`.
    fn mkdir(&self, path: &str) -> Result<(), FsError>;

    /// Removes `path`; directories are removed recursively.
    fn remove(&self, path: &str) -> Result<(), FsError>;

    /// Returns the `index`-th live entry of a directory, or `None` past
    /// the end.
    fn readdir(&self, vnode: &Vnode, index: u32) -> Result<Option<DirEntryInfo>, FsError>;
}

/// A mountable filesystem type, registered with the kernel mount table.
pub trait FileSystemType: Send + Sync {
    /// Type name (e.g. `"hfs"`).
    fn name(&self) -> &'static str;

    /// Mounts an instance from a block device.
    fn mount(&self, dev: Arc<dyn BlockDevice>) -> Result<Arc<dyn FileSystem>, FsError>;

    /// Unmounts an instance previously returned by
    /// [`mount`](Self::mount).
    fn unmount(&self, fs: Arc<dyn FileSystem>) -> Result<(), FsError> {
        drop(fs);
        Ok(())
    }
}
