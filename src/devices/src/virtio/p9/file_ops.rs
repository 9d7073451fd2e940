//! The capability table the protocol engine calls into.

use std::{
    ffi::CStr,
    io::{self, IoSlice, IoSliceMut},
};

use super::{
    attr::Credentials,
    handle::{DirEntry, OpenHandle},
    path::LogicalPath,
    util::enosys,
};
use crate::virtio::bindings::{stat64, statfs64};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Filesystem operations on pre-resolved logical paths and open handles.
///
/// The trait is object safe so a backend can be shared as `Arc<dyn FileOperations>`.
/// Every method defaults to `ENOSYS`, letting implementations provide only what they support.
#[allow(unused_variables)]
pub trait FileOperations: Send + Sync {
    /// Prepares the backend after mount. Called once before any other operation.
    fn init(&self) -> io::Result<()> {
        Ok(())
    }

    /// Stats `path` without following a final symlink.
    fn lstat(&self, path: &LogicalPath) -> io::Result<stat64> {
        Err(enosys())
    }

    /// Stats an open handle.
    fn fstat(&self, handle: &OpenHandle) -> io::Result<stat64> {
        Err(enosys())
    }

    /// Returns the target of the symlink at `path`.
    fn readlink(&self, path: &LogicalPath) -> io::Result<Vec<u8>> {
        Err(enosys())
    }

    /// Opens an existing non-directory object. `O_CREAT` and `O_EXCL` are ignored.
    fn open(&self, path: &LogicalPath, flags: i32) -> io::Result<OpenHandle> {
        Err(enosys())
    }

    /// Opens a directory stream.
    fn opendir(&self, path: &LogicalPath) -> io::Result<OpenHandle> {
        Err(enosys())
    }

    fn close(&self, handle: OpenHandle) -> io::Result<()> {
        Err(enosys())
    }

    fn closedir(&self, handle: OpenHandle) -> io::Result<()> {
        Err(enosys())
    }

    fn rewinddir(&self, handle: &mut OpenHandle) -> io::Result<()> {
        Err(enosys())
    }

    fn telldir(&self, handle: &mut OpenHandle) -> io::Result<i64> {
        Err(enosys())
    }

    /// Returns the next directory entry, `None` at the end of the stream.
    fn readdir(&self, handle: &mut OpenHandle) -> io::Result<Option<DirEntry>> {
        Err(enosys())
    }

    fn seekdir(&self, handle: &mut OpenHandle, offset: i64) -> io::Result<()> {
        Err(enosys())
    }

    /// Reads into `bufs` starting at `offset`.
    fn preadv(
        &self,
        handle: &OpenHandle,
        bufs: &mut [IoSliceMut<'_>],
        offset: i64,
    ) -> io::Result<usize> {
        Err(enosys())
    }

    /// Writes `bufs` starting at `offset`.
    fn pwritev(&self, handle: &OpenHandle, bufs: &[IoSlice<'_>], offset: i64) -> io::Result<usize> {
        Err(enosys())
    }

    fn chmod(&self, path: &LogicalPath, mode: libc::mode_t) -> io::Result<()> {
        Err(enosys())
    }

    /// Creates a device node, fifo, socket or regular file named `name` in `dir`.
    fn mknod(&self, dir: &LogicalPath, name: &CStr, creds: &Credentials) -> io::Result<()> {
        Err(enosys())
    }

    fn mkdir(&self, dir: &LogicalPath, name: &CStr, creds: &Credentials) -> io::Result<()> {
        Err(enosys())
    }

    /// Creates and opens a regular file named `name` in `dir`. Fails if it already exists.
    fn create(
        &self,
        dir: &LogicalPath,
        name: &CStr,
        flags: i32,
        creds: &Credentials,
    ) -> io::Result<OpenHandle> {
        Err(enosys())
    }

    /// Creates a symlink named `name` in `dir` pointing at `target`.
    fn symlink(
        &self,
        target: &CStr,
        dir: &LogicalPath,
        name: &CStr,
        creds: &Credentials,
    ) -> io::Result<()> {
        Err(enosys())
    }

    /// Creates a hard link to `old` named `name` in `dir`.
    fn link(&self, old: &LogicalPath, dir: &LogicalPath, name: &CStr) -> io::Result<()> {
        Err(enosys())
    }

    fn truncate(&self, path: &LogicalPath, size: u64) -> io::Result<()> {
        Err(enosys())
    }

    fn rename(&self, old: &LogicalPath, new: &LogicalPath) -> io::Result<()> {
        Err(enosys())
    }

    /// Changes ownership. Only `uid` and `gid` of `creds` are considered.
    fn chown(&self, path: &LogicalPath, creds: &Credentials) -> io::Result<()> {
        Err(enosys())
    }

    /// Sets access and modification times, as `utimensat(2)` does.
    fn utimensat(&self, path: &LogicalPath, times: &[libc::timespec; 2]) -> io::Result<()> {
        Err(enosys())
    }

    /// Removes the file or empty directory at `path`.
    fn remove(&self, path: &LogicalPath) -> io::Result<()> {
        Err(enosys())
    }

    fn fsync(&self, handle: &OpenHandle, datasync: bool) -> io::Result<()> {
        Err(enosys())
    }

    fn statfs(&self, path: &LogicalPath) -> io::Result<statfs64> {
        Err(enosys())
    }

    /// Reads an extended attribute. An empty `value` queries its size.
    fn getxattr(&self, path: &LogicalPath, name: &CStr, value: &mut [u8]) -> io::Result<usize> {
        Err(enosys())
    }

    /// Lists extended attribute names. An empty `value` queries the list size.
    fn listxattr(&self, path: &LogicalPath, value: &mut [u8]) -> io::Result<usize> {
        Err(enosys())
    }

    fn setxattr(
        &self,
        path: &LogicalPath,
        name: &CStr,
        value: &[u8],
        flags: i32,
    ) -> io::Result<()> {
        Err(enosys())
    }

    fn removexattr(&self, path: &LogicalPath, name: &CStr) -> io::Result<()> {
        Err(enosys())
    }

    /// Builds the logical path of `name` inside `dir`.
    fn name_to_path(&self, dir: Option<&LogicalPath>, name: &CStr) -> io::Result<LogicalPath> {
        Ok(LogicalPath::join(dir, name))
    }

    fn renameat(
        &self,
        olddir: &LogicalPath,
        oldname: &CStr,
        newdir: &LogicalPath,
        newname: &CStr,
    ) -> io::Result<()> {
        Err(enosys())
    }

    /// Removes `name` from `dir`. `flags` may hold `AT_REMOVEDIR`.
    fn unlinkat(&self, dir: &LogicalPath, name: &CStr, flags: i32) -> io::Result<()> {
        Err(enosys())
    }

    /// Returns the inode generation number of the object at `path`.
    fn get_st_gen(&self, path: &LogicalPath, st_mode: libc::mode_t) -> io::Result<u64> {
        Err(io::Error::from_raw_os_error(libc::ENOTTY))
    }
}
