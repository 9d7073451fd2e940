//! Open descriptors and directory streams owned by fids.

use std::{
    ffi::CString,
    fs::File,
    io,
    mem::ManuallyDrop,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    ptr::NonNull,
};

use super::{path::LogicalPath, util::cvt};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An open regular file (or other non-directory object).
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) file: File,

    /// Flags the file was opened with.
    pub(crate) flags: i32,

    /// Logical path the file was opened through.
    pub(crate) path: LogicalPath,
}

/// An open directory stream.
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    pub(crate) path: LogicalPath,
}

/// Either kind of open object bound to a fid.
#[derive(Debug)]
pub enum OpenHandle {
    File(FileHandle),
    Dir(DirStream),
}

/// One entry returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,

    /// Opaque stream position after this entry, usable with `seekdir`.
    pub offset: i64,

    /// `DT_*` type, or `DT_UNKNOWN`.
    pub kind: u8,

    pub name: CString,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileHandle {
    pub fn path(&self) -> &LogicalPath {
        &self.path
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }
}

impl DirStream {
    /// Wraps an open directory descriptor into a stream.
    pub(crate) fn from_file(file: File, path: LogicalPath) -> io::Result<Self> {
        let fd = file.into_raw_fd();
        let dir = unsafe { libc::fdopendir(fd) };
        match NonNull::new(dir) {
            Some(dir) => Ok(Self { dir, path }),
            None => {
                let err = io::Error::last_os_error();
                // Safe because `fdopendir` failed and we still own the fd.
                unsafe { libc::close(fd) };
                Err(err)
            }
        }
    }

    pub fn path(&self) -> &LogicalPath {
        &self.path
    }

    /// Reads the next raw entry, `None` at the end of the stream.
    pub(crate) fn next_entry(&mut self) -> io::Result<Option<DirEntry>> {
        // `readdir` reports errors only through errno, so it has to be cleared first.
        unsafe { *libc::__errno_location() = 0 };

        let dent = unsafe { libc::readdir64(self.dir.as_ptr()) };
        if dent.is_null() {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(0) | None => Ok(None),
                Some(_) => Err(err),
            };
        }

        // Safe because `readdir64` returned a valid entry that lives until the next call.
        let dent = unsafe { &*dent };
        let name = unsafe { std::ffi::CStr::from_ptr(dent.d_name.as_ptr()) }.to_owned();

        Ok(Some(DirEntry {
            ino: dent.d_ino,
            offset: dent.d_off,
            kind: dent.d_type,
            name,
        }))
    }

    pub(crate) fn tell(&self) -> io::Result<i64> {
        let off = cvt(unsafe { libc::telldir(self.dir.as_ptr()) })?;
        Ok(off as i64)
    }

    pub(crate) fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dir.as_ptr(), offset as libc::c_long) };
    }

    pub(crate) fn rewind(&mut self) {
        unsafe { libc::rewinddir(self.dir.as_ptr()) };
    }

    /// Closes the stream, reporting the error `Drop` would swallow.
    pub(crate) fn close(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        // Safe because `this` is neither used nor dropped after the path is moved out.
        let _path = unsafe { std::ptr::read(&this.path) };
        cvt(unsafe { libc::closedir(this.dir.as_ptr()) })?;
        Ok(())
    }
}

impl OpenHandle {
    /// Returns the descriptor backing the handle.
    pub fn raw_fd(&self) -> RawFd {
        match self {
            OpenHandle::File(f) => f.file.as_raw_fd(),
            OpenHandle::Dir(d) => d.as_raw_fd(),
        }
    }

    /// Logical path the handle was opened through.
    pub fn path(&self) -> &LogicalPath {
        match self {
            OpenHandle::File(f) => &f.path,
            OpenHandle::Dir(d) => &d.path,
        }
    }

    pub(crate) fn set_path(&mut self, path: LogicalPath) {
        match self {
            OpenHandle::File(f) => f.path = path,
            OpenHandle::Dir(d) => d.path = path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, OpenHandle::Dir(_))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

// The stream is only ever used by one thread at a time, through `&mut` or by value.
unsafe impl Send for DirStream {}

impl AsRawFd for DirStream {
    fn as_raw_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir.as_ptr()) }
    }
}

impl std::fmt::Debug for DirStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirStream")
            .field("fd", &self.as_raw_fd())
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        if unsafe { libc::closedir(self.dir.as_ptr()) } < 0 {
            log::error!(
                "failed to close directory stream: {}",
                io::Error::last_os_error()
            );
        }
    }
}
