//! Logical paths and their translation into host paths under the export root.

use std::{
    ffi::{CStr, CString},
    fmt,
    fs::File,
    io,
    ops::Deref,
    os::unix::{
        ffi::OsStrExt,
        io::{AsRawFd, FromRawFd},
    },
    path::Path,
};

use super::{
    config::SecurityModel,
    util::{cstring, einval, fstat, host_join, openat_path_file, proc_fd_path},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Name of the per-directory shadow metadata directory used by the mapped-file model.
pub const METADATA_DIR: &str = ".virtfs_metadata";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A path relative to the export root, as named by the protocol engine.
///
/// A logical path is never handed to a syscall directly; it has to go through
/// [`PathTranslator::resolve`] first.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LogicalPath(CString);

/// A host path produced by [`PathTranslator::resolve`], usable with no-follow syscalls.
///
/// Paths nested deeper than the root's own entries go through the parent directory opened
/// during resolution (`/proc/self/fd/N/name`). Swapping an intermediate directory for a
/// symlink afterwards does not change where the path points while this value is alive.
pub struct HostPath {
    path: CString,
    _parent: Option<File>,
}

/// Resolves logical paths to host paths rooted at the export directory.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: CString,
    hide_metadata: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LogicalPath {
    /// Creates a logical path from raw bytes. Interior nul bytes are rejected with `EINVAL`.
    pub fn new(bytes: impl Into<Vec<u8>>) -> io::Result<Self> {
        cstring(bytes.into()).map(LogicalPath)
    }

    /// The path naming the export root.
    pub fn root() -> Self {
        LogicalPath(c"/".to_owned())
    }

    /// Builds the path of `name` inside `parent`, separated by a single `/`.
    ///
    /// Without a parent the result is `name` alone.
    pub fn join(parent: Option<&LogicalPath>, name: &CStr) -> Self {
        let Some(parent) = parent else {
            return LogicalPath(name.to_owned());
        };

        let mut buf = Vec::with_capacity(parent.0.as_bytes().len() + name.to_bytes().len() + 1);
        buf.extend_from_slice(parent.0.as_bytes());
        buf.push(b'/');
        buf.extend_from_slice(name.to_bytes());

        // Neither half contains a nul byte.
        LogicalPath(CString::new(buf).unwrap_or_default())
    }

    /// Returns the path bytes without the terminator.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_c_str(&self) -> &CStr {
        &self.0
    }

    /// Storage size of the path, terminator included.
    pub fn size(&self) -> usize {
        self.0.as_bytes_with_nul().len()
    }

    /// Iterates the meaningful components, skipping empty and `.` ones.
    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        self.0
            .as_bytes()
            .split(|b| *b == b'/')
            .filter(|c| !c.is_empty() && *c != b".")
    }

    /// Returns this path with the prefix `old` replaced by `new`.
    ///
    /// Returns `None` if `old` is not a component-wise prefix of this path.
    pub fn rebase(&self, old: &LogicalPath, new: &LogicalPath) -> Option<LogicalPath> {
        let mut ours = self.components();
        for theirs in old.components() {
            if ours.next()? != theirs {
                return None;
            }
        }

        let mut buf = new.0.as_bytes().to_vec();
        for component in ours {
            if buf.last() != Some(&b'/') {
                buf.push(b'/');
            }
            buf.extend_from_slice(component);
        }

        Some(LogicalPath(CString::new(buf).unwrap_or_default()))
    }
}

impl PathTranslator {
    /// Creates a translator for the export rooted at `root`.
    pub fn new(root: &Path, model: SecurityModel) -> io::Result<Self> {
        let mut bytes = root.as_os_str().as_bytes().to_vec();
        if bytes.is_empty() {
            return Err(einval());
        }
        while bytes.len() > 1 && bytes.last() == Some(&b'/') {
            bytes.pop();
        }

        Ok(Self {
            root: cstring(bytes)?,
            hide_metadata: model == SecurityModel::MappedFile,
        })
    }

    /// Returns the host path of the export root.
    pub fn root(&self) -> &CStr {
        &self.root
    }

    /// Resolves `path` to a host path.
    ///
    /// Fails with `EINVAL` on a `..` component (or a `.virtfs_metadata` component when shadow
    /// metadata is hidden), with `ELOOP` when an intermediate component is a symlink, and
    /// with `ENOENT`/`ENOTDIR` when an intermediate component is missing or not a directory.
    /// Intermediate directories are opened one by one relative to each other, never followed.
    /// The final component is not inspected; callers never follow it.
    pub fn resolve(&self, path: &LogicalPath) -> io::Result<HostPath> {
        let components: Vec<&[u8]> = path.components().collect();
        for component in &components {
            if *component == b".." {
                return Err(einval());
            }
            if self.hide_metadata && *component == METADATA_DIR.as_bytes() {
                return Err(einval());
            }
        }

        let Some((last, parents)) = components.split_last() else {
            return Ok(HostPath::plain(self.root.clone()));
        };
        if parents.is_empty() {
            return Ok(HostPath::plain(host_join(&self.root, last)?));
        }

        let mut dir = self.open_root()?;
        for component in parents {
            let next = openat_path_file(dir.as_raw_fd(), &cstring(component.to_vec())?)?;
            match fstat(next.as_raw_fd())?.st_mode & libc::S_IFMT {
                libc::S_IFDIR => {}
                libc::S_IFLNK => return Err(io::Error::from_raw_os_error(libc::ELOOP)),
                _ => return Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
            }
            dir = next;
        }

        Ok(HostPath {
            path: host_join(&proc_fd_path(dir.as_raw_fd()), last)?,
            _parent: Some(dir),
        })
    }

    /// Joins `name` onto `dir` and resolves the result.
    ///
    /// `name` must be a single component.
    pub fn resolve_at(
        &self,
        dir: &LogicalPath,
        name: &CStr,
    ) -> io::Result<(LogicalPath, HostPath)> {
        validate_name(name)?;
        let path = LogicalPath::join(Some(dir), name);
        let host = self.resolve(&path)?;
        Ok((path, host))
    }

    fn open_root(&self) -> io::Result<File> {
        let fd = unsafe {
            libc::open(
                self.root.as_ptr(),
                libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Safe because we just opened this fd.
        Ok(unsafe { File::from_raw_fd(fd) })
    }
}

impl HostPath {
    fn plain(path: CString) -> Self {
        Self {
            path,
            _parent: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that `name` is a single, non-special path component.
pub(crate) fn validate_name(name: &CStr) -> io::Result<()> {
    let bytes = name.to_bytes();
    if bytes.is_empty() || bytes == b"." || bytes == b".." || bytes.contains(&b'/') {
        return Err(einval());
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

impl From<&CStr> for LogicalPath {
    fn from(path: &CStr) -> Self {
        LogicalPath(path.to_owned())
    }
}

impl fmt::Debug for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.path)
    }
}

impl Deref for HostPath {
    type Target = CStr;

    fn deref(&self) -> &CStr {
        &self.path
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
