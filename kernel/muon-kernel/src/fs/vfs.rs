//! VFS mount table and path resolution.
//!
//! Filesystems register under a mount path; resolution picks the
//! longest-matching mount point and hands the remainder (as an absolute
//! path) to that filesystem. [`OpenFile`] couples a vnode with its owning
//! filesystem and a cursor, which is what the ELF loader consumes.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use muon_core::kinfo;
use muon_core::sync::SpinLock;
use muon_fs::{FileSystem, FsError, OpenFlags, Vnode};

static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// The mount table.
pub struct Vfs {
    mounts: BTreeMap<String, Arc<dyn FileSystem>>,
}

impl Vfs {
    fn new() -> Self {
        Self { mounts: BTreeMap::new() }
    }

    /// Mounts a filesystem at `path`.
    pub fn mount(&mut self, path: &str, fs: Arc<dyn FileSystem>) {
        kinfo!("vfs: mounted {} at {}", fs.name(), path);
        self.mounts.insert(path.to_string(), fs);
    }

    /// Unmounts whatever is at `path`.
    pub fn unmount(&mut self, path: &str) -> Result<(), FsError> {
        self.mounts.remove(path).map(|_| ()).ok_or(FsError::NotFound)
    }

    /// Resolves an absolute path to `(filesystem, path-within-it)`.
    pub fn resolve(&self, abs_path: &str) -> Result<(Arc<dyn FileSystem>, String), FsError> {
        if !muon_fs::path::is_absolute(abs_path) {
            return Err(FsError::InvalidArgument);
        }
        let mount = longest_prefix_match(abs_path, self.mounts.keys().map(String::as_str))
            .ok_or(FsError::NotFound)?;
        let fs = self.mounts.get(mount).ok_or(FsError::NotFound)?;

        let mut remainder = String::from("/");
        remainder.push_str(strip_mount_prefix(abs_path, mount));
        Ok((fs.clone(), remainder))
    }

    /// Returns the filesystem mounted exactly at `mount_point`.
    #[must_use]
    pub fn get_mounted(&self, mount_point: &str) -> Option<Arc<dyn FileSystem>> {
        self.mounts.get(mount_point).cloned()
    }
}

/// Find the longest mount point that is a path prefix of `path`.
///
/// `/dev` matches `/dev/null` but not `/device`; the root mount matches
/// everything.
fn longest_prefix_match<'a>(
    path: &str,
    mount_points: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    let mut best: Option<&str> = None;
    for mp in mount_points {
        let matches = mp == "/"
            || path == mp
            || (path.starts_with(mp) && path.as_bytes().get(mp.len()) == Some(&b'/'));
        if matches && best.is_none_or(|b| mp.len() > b.len()) {
            best = Some(mp);
        }
    }
    best
}

/// Strip the mount prefix from a path, returning the remainder without a
/// leading slash.
fn strip_mount_prefix<'a>(path: &'a str, mount: &str) -> &'a str {
    if mount == "/" {
        path.strip_prefix('/').unwrap_or(path)
    } else if path.len() == mount.len() {
        ""
    } else {
        &path[mount.len() + 1..]
    }
}

/// Initialises the empty mount table.
///
/// # Panics
///
/// Panics if called twice.
pub fn init() {
    let mut vfs = VFS.lock();
    assert!(vfs.is_none(), "VFS already initialized");
    *vfs = Some(Vfs::new());
}

/// Runs a closure against the mount table.
///
/// # Panics
///
/// Panics if the VFS has not been initialised.
pub fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut vfs = VFS.lock();
    f(vfs.as_mut().expect("VFS not initialized"))
}

/// An open file: the owning filesystem, the vnode, and a cursor.
pub struct OpenFile {
    fs: Arc<dyn FileSystem>,
    vnode: Vnode,
    /// Byte offset of the next read/write; callers may reposition it.
    pub offset: u32,
}

impl OpenFile {
    /// The vnode this handle wraps.
    #[must_use]
    pub fn vnode(&self) -> &Vnode {
        &self.vnode
    }

    /// Reads at the cursor, advancing it by the bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let n = self.fs.read(&self.vnode, self.offset, buf)?;
        self.offset += n as u32;
        Ok(n)
    }

    /// Writes at the cursor, advancing it by the bytes written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, FsError> {
        let n = self.fs.write(&self.vnode, self.offset, data)?;
        self.offset += n as u32;
        Ok(n)
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        let _ = self.fs.close(self.vnode.clone());
    }
}

/// Opens `path` through the mount table.
pub fn vfs_open(path: &str, flags: OpenFlags) -> Result<OpenFile, FsError> {
    let (fs, remainder) = with_vfs(|vfs| vfs.resolve(path))?;
    let vnode = fs.open(&remainder, flags)?;
    Ok(OpenFile { fs, vnode, offset: 0 })
}

/// Returns the filesystem mounted exactly at `mount_point`.
#[must_use]
pub fn get_mounted(mount_point: &str) -> Option<Arc<dyn FileSystem>> {
    with_vfs(|vfs| vfs.get_mounted(mount_point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::RamDisk;
    use muon_fs::hfs::Hfs;

    fn fresh_hfs(blocks: u32) -> Arc<dyn FileSystem> {
        let dev = Arc::new(RamDisk::new(blocks, 512));
        Hfs::format(&*dev).unwrap();
        Hfs::mount(dev).unwrap()
    }

    #[test]
    fn longest_prefix_rules() {
        let mounts = ["/", "/data", "/data/sub"];
        let find = |p| longest_prefix_match(p, mounts.iter().copied());

        assert_eq!(find("/data/sub/file"), Some("/data/sub"));
        assert_eq!(find("/data/file"), Some("/data"));
        assert_eq!(find("/database"), Some("/"), "no partial-component match");
        assert_eq!(find("/other"), Some("/"));
        assert_eq!(find("/data"), Some("/data"));
    }

    #[test]
    fn strip_prefix_rules() {
        assert_eq!(strip_mount_prefix("/a/b", "/"), "a/b");
        assert_eq!(strip_mount_prefix("/data/f", "/data"), "f");
        assert_eq!(strip_mount_prefix("/data", "/data"), "");
    }

    #[test]
    fn mount_resolve_and_io() {
        // The mount table is a process-wide global shared by every test
        // in this binary, so all table states are exercised in one test.
        init();

        let root = fresh_hfs(256);
        let data = fresh_hfs(128);
        with_vfs(|vfs| {
            vfs.mount("/", root);
            vfs.mount("/data", data);
        });

        // Resolution picks the right filesystem and rebases the path.
        let (_, rest) = with_vfs(|vfs| vfs.resolve("/data/notes")).unwrap();
        assert_eq!(rest, "/notes");
        let (_, rest) = with_vfs(|vfs| vfs.resolve("/datafile")).unwrap();
        assert_eq!(rest, "/datafile");

        // Files land on the filesystem their mount owns.
        with_vfs(|vfs| vfs.resolve("/data/f").unwrap().0.create("/f")).unwrap();
        let mut file = vfs_open("/data/f", OpenFlags::READ | OpenFlags::WRITE).unwrap();
        assert_eq!(file.write(b"hello").unwrap(), 5);

        // The cursor advanced; rewind and read back.
        file.offset = 0;
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        // The same name does not exist on the root filesystem.
        assert_eq!(vfs_open("/f", OpenFlags::READ).err(), Some(FsError::NotFound));

        // get_mounted is exact-match only.
        assert!(get_mounted("/data").is_some());
        assert!(get_mounted("/data/sub").is_none());

        // Relative paths are rejected.
        assert_eq!(
            vfs_open("no-slash", OpenFlags::READ).err(),
            Some(FsError::InvalidArgument)
        );

        // Unmount forgets the filesystem.
        with_vfs(|vfs| vfs.unmount("/data")).unwrap();
        assert_eq!(vfs_open("/data/f", OpenFlags::READ).err(), Some(FsError::NotFound));
        assert_eq!(
            with_vfs(|vfs| vfs.unmount("/data")).err(),
            Some(FsError::NotFound)
        );
    }
}
