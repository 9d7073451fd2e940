use std::{
    ffi::{CStr, CString},
    fs::File,
    io,
    mem::MaybeUninit,
    os::unix::io::{FromRawFd, RawFd},
};

use crate::virtio::bindings::stat64;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Turns a negative libc return value into the current OS error.
pub(crate) fn cvt<T: Default + PartialOrd>(res: T) -> io::Result<T> {
    if res < T::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Stats a path without following a final symlink.
pub(crate) fn lstat(path: &CStr) -> io::Result<stat64> {
    let mut st = MaybeUninit::<stat64>::zeroed();
    cvt(unsafe { libc::lstat64(path.as_ptr(), st.as_mut_ptr()) })?;

    // Safe because the kernel filled the struct.
    Ok(unsafe { st.assume_init() })
}

/// Stats an open descriptor.
pub(crate) fn fstat(fd: RawFd) -> io::Result<stat64> {
    let mut st = MaybeUninit::<stat64>::zeroed();
    cvt(unsafe { libc::fstat64(fd, st.as_mut_ptr()) })?;

    // Safe because the kernel filled the struct.
    Ok(unsafe { st.assume_init() })
}

/// Opens a host path. `O_NOFOLLOW` and `O_CLOEXEC` are always added.
pub(crate) fn open_file(path: &CStr, flags: i32, mode: libc::mode_t) -> io::Result<File> {
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            flags | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // Safe because we just opened this fd.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Opens a host path as an `O_PATH` file, never following a final symlink.
pub(crate) fn open_path_file(path: &CStr) -> io::Result<File> {
    open_file(path, libc::O_PATH, 0)
}

/// Opens `name` inside the directory `dir` as an `O_PATH` file without following it.
pub(crate) fn openat_path_file(dir: RawFd, name: &CStr) -> io::Result<File> {
    let fd = unsafe {
        libc::openat(
            dir,
            name.as_ptr(),
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // Safe because we just opened this fd.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Returns the `/proc/self/fd/N` path naming an open descriptor.
pub(crate) fn proc_fd_path(fd: RawFd) -> CString {
    // A decimal integer never contains a nul byte.
    CString::new(format!("/proc/self/fd/{fd}")).unwrap_or_default()
}

/// Splits a host path into its parent directory and final component.
pub(crate) fn split_host(path: &CStr) -> io::Result<(CString, CString)> {
    let bytes = path.to_bytes();
    let idx = bytes.iter().rposition(|b| *b == b'/').ok_or_else(einval)?;
    let name = &bytes[idx + 1..];
    if name.is_empty() || name == b"." || name == b".." {
        return Err(einval());
    }

    let dir = if idx == 0 { &bytes[..1] } else { &bytes[..idx] };
    Ok((cstring(dir.to_vec())?, cstring(name.to_vec())?))
}

/// Appends `/name` to a host directory path.
pub(crate) fn host_join(dir: &CStr, name: &[u8]) -> io::Result<CString> {
    let mut buf = dir.to_bytes().to_vec();
    if buf.last() != Some(&b'/') {
        buf.push(b'/');
    }
    buf.extend_from_slice(name);
    cstring(buf)
}

/// Builds a `CString`, reporting an interior nul byte as `EINVAL`.
pub(crate) fn cstring(bytes: Vec<u8>) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| einval())
}

/// Whether `err` carries the raw OS error `errno`.
pub(crate) fn is_errno(err: &io::Error, errno: i32) -> bool {
    err.raw_os_error() == Some(errno)
}

pub(crate) fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

pub(crate) fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

pub(crate) fn enosys() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOSYS)
}

pub(crate) fn eopnotsupp() -> io::Error {
    io::Error::from_raw_os_error(libc::EOPNOTSUPP)
}
