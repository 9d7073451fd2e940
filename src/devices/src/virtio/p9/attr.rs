//! Synthetic ownership storage for the mapped security models.
//!
//! Mapped-xattr keeps `uid`, `gid`, `mode` and `rdev` in `user.virtfs.*` extended attributes
//! on the object itself, as little-endian integers of the native width. Mapped-file keeps them
//! as `virtfs.<key>=<decimal>` lines in `<parent>/.virtfs_metadata/<name>`, a file that is
//! rewritten as a whole on every update.

use std::{
    ffi::{CStr, CString},
    fs::File,
    io::{self, Read, Write},
    os::unix::{ffi::OsStrExt, io::RawFd},
    path::Path,
};

use super::{
    path::METADATA_DIR,
    util::{cvt, host_join, is_errno, open_file, split_host},
};
use crate::virtio::bindings::{stat64, P9_NO_ID};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

pub const XATTR_UID: &CStr = c"user.virtfs.uid";
pub const XATTR_GID: &CStr = c"user.virtfs.gid";
pub const XATTR_MODE: &CStr = c"user.virtfs.mode";
pub const XATTR_RDEV: &CStr = c"user.virtfs.rdev";

/// Prefix shared by all attribute names reserved for synthetic credentials.
pub const XATTR_PREFIX: &[u8] = b"user.virtfs.";

/// Longest shadow metadata line that is honoured, newline included.
const SHADOW_LINE_MAX: usize = 99;

/// Permissions of a lazily created `.virtfs_metadata` directory.
const SHADOW_DIR_MODE: libc::mode_t = 0o700;

/// Permissions of a shadow metadata file.
const SHADOW_FILE_MODE: libc::mode_t = 0o666;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Requested ownership of an object. A `None` field is left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Option<libc::uid_t>,
    pub gid: Option<libc::gid_t>,
    pub mode: Option<libc::mode_t>,
    pub rdev: Option<libc::dev_t>,
}

/// Where synthetic credentials are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeStore {
    /// `user.virtfs.*` extended attributes.
    Xattr,

    /// Text files under `.virtfs_metadata`.
    ShadowFile,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Credentials {
    /// Builds credentials from protocol values, where `-1` means "unset".
    pub fn from_raw(uid: i64, gid: i64, mode: i64, rdev: i64) -> Self {
        fn field<T: TryFrom<i64>>(v: i64) -> Option<T> {
            if v == P9_NO_ID {
                None
            } else {
                T::try_from(v).ok()
            }
        }

        Self {
            uid: field(uid),
            gid: field(gid),
            mode: field(mode),
            rdev: field(rdev),
        }
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns `self` with every field set in `newer` overwritten.
    pub fn merge(self, newer: &Credentials) -> Self {
        Self {
            uid: newer.uid.or(self.uid),
            gid: newer.gid.or(self.gid),
            mode: newer.mode.or(self.mode),
            rdev: newer.rdev.or(self.rdev),
        }
    }

    /// Replaces the file type bits of the mode, if one is set.
    pub fn with_file_type(mut self, kind: libc::mode_t) -> Self {
        self.mode = self.mode.map(|m| (m & !libc::S_IFMT) | kind);
        self
    }

    /// Overwrites the fields of `st` that are set.
    pub fn apply_to(&self, st: &mut stat64) {
        if let Some(uid) = self.uid {
            st.st_uid = uid;
        }
        if let Some(gid) = self.gid {
            st.st_gid = gid;
        }
        if let Some(mode) = self.mode {
            st.st_mode = mode;
        }
        if let Some(rdev) = self.rdev {
            st.st_rdev = rdev;
        }
    }

    /// Parses the content of a shadow metadata file.
    ///
    /// Unknown keys and unparsable values are ignored. Only the first bytes of an
    /// overlong line are considered; the rest of it is skipped.
    pub fn parse_shadow(content: &[u8]) -> Self {
        let mut creds = Self::default();

        for line in content.split(|b| *b == b'\n') {
            let line = &line[..line.len().min(SHADOW_LINE_MAX)];
            let Some(eq) = line.iter().position(|b| *b == b'=') else {
                continue;
            };
            let value = std::str::from_utf8(&line[eq + 1..])
                .ok()
                .map(str::trim);

            match &line[..eq] {
                b"virtfs.uid" => creds.uid = value.and_then(|v| v.parse().ok()).or(creds.uid),
                b"virtfs.gid" => creds.gid = value.and_then(|v| v.parse().ok()).or(creds.gid),
                b"virtfs.mode" => creds.mode = value.and_then(|v| v.parse().ok()).or(creds.mode),
                b"virtfs.rdev" => creds.rdev = value.and_then(|v| v.parse().ok()).or(creds.rdev),
                _ => {}
            }
        }

        creds
    }

    /// Formats the set fields as shadow metadata lines.
    pub fn format_shadow(&self) -> String {
        let mut out = String::new();
        if let Some(uid) = self.uid {
            out.push_str(&format!("virtfs.uid={uid}\n"));
        }
        if let Some(gid) = self.gid {
            out.push_str(&format!("virtfs.gid={gid}\n"));
        }
        if let Some(mode) = self.mode {
            out.push_str(&format!("virtfs.mode={mode}\n"));
        }
        if let Some(rdev) = self.rdev {
            out.push_str(&format!("virtfs.rdev={rdev}\n"));
        }
        out
    }
}

impl AttributeStore {
    /// Reads the synthetic credentials of the object at `host`.
    ///
    /// Missing attributes or a missing shadow file yield unset fields.
    pub fn load(&self, host: &CStr) -> io::Result<Credentials> {
        match self {
            AttributeStore::Xattr => load_xattrs(XattrTarget::Path(host)),
            AttributeStore::ShadowFile => read_shadow(host),
        }
    }

    /// Like [`AttributeStore::load`], reading extended attributes through `fd`.
    pub fn load_fd(&self, fd: RawFd, host: &CStr) -> io::Result<Credentials> {
        match self {
            AttributeStore::Xattr => load_xattrs(XattrTarget::Fd(fd)),
            AttributeStore::ShadowFile => read_shadow(host),
        }
    }

    /// Persists the set fields of `creds` for the object at `host`, keeping the others.
    pub fn store(&self, host: &CStr, creds: &Credentials) -> io::Result<()> {
        match self {
            AttributeStore::Xattr => store_xattrs(host, creds),
            AttributeStore::ShadowFile => write_shadow(host, creds),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Extended Attributes
//--------------------------------------------------------------------------------------------------

enum XattrTarget<'a> {
    Path(&'a CStr),
    Fd(RawFd),
}

/// Reads one fixed-width attribute. Absent or wrongly sized values yield `None`.
fn get_fixed<const N: usize>(target: &XattrTarget, name: &CStr) -> io::Result<Option<[u8; N]>> {
    let mut buf = [0u8; N];
    let res = unsafe {
        match target {
            XattrTarget::Path(path) => libc::lgetxattr(
                path.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                N,
            ),
            XattrTarget::Fd(fd) => libc::fgetxattr(
                *fd,
                name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                N,
            ),
        }
    };

    if res < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENODATA) | Some(libc::ERANGE) | Some(libc::EOPNOTSUPP) => Ok(None),
            _ => Err(err),
        };
    }

    Ok((res as usize == N).then_some(buf))
}

fn load_xattrs(target: XattrTarget) -> io::Result<Credentials> {
    Ok(Credentials {
        uid: get_fixed::<4>(&target, XATTR_UID)?.map(u32::from_le_bytes),
        gid: get_fixed::<4>(&target, XATTR_GID)?.map(u32::from_le_bytes),
        mode: get_fixed::<4>(&target, XATTR_MODE)?.map(u32::from_le_bytes),
        rdev: get_fixed::<8>(&target, XATTR_RDEV)?.map(u64::from_le_bytes),
    })
}

fn set_fixed(host: &CStr, name: &CStr, value: &[u8]) -> io::Result<()> {
    cvt(unsafe {
        libc::lsetxattr(
            host.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    })?;
    Ok(())
}

fn store_xattrs(host: &CStr, creds: &Credentials) -> io::Result<()> {
    if let Some(uid) = creds.uid {
        set_fixed(host, XATTR_UID, &uid.to_le_bytes())?;
    }
    if let Some(gid) = creds.gid {
        set_fixed(host, XATTR_GID, &gid.to_le_bytes())?;
    }
    if let Some(mode) = creds.mode {
        set_fixed(host, XATTR_MODE, &mode.to_le_bytes())?;
    }
    if let Some(rdev) = creds.rdev {
        set_fixed(host, XATTR_RDEV, &rdev.to_le_bytes())?;
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Shadow Files
//--------------------------------------------------------------------------------------------------

/// Returns the `.virtfs_metadata` directory holding the shadow entry of `host`.
pub(crate) fn shadow_dir(host: &CStr) -> io::Result<CString> {
    let (dir, _) = split_host(host)?;
    host_join(&dir, METADATA_DIR.as_bytes())
}

/// Returns the shadow metadata file of the object at `host`.
pub(crate) fn shadow_file(host: &CStr) -> io::Result<CString> {
    let (dir, name) = split_host(host)?;
    let meta = host_join(&dir, METADATA_DIR.as_bytes())?;
    host_join(&meta, name.as_bytes())
}

/// Returns the `.virtfs_metadata` directory inside the directory at `host`.
pub(crate) fn inner_shadow_dir(host: &CStr) -> io::Result<CString> {
    host_join(host, METADATA_DIR.as_bytes())
}

/// Creates the shadow directory that will hold the entry for `host`. Existing is fine.
pub(crate) fn create_shadow_dir(host: &CStr) -> io::Result<()> {
    let dir = shadow_dir(host)?;
    match cvt(unsafe { libc::mkdir(dir.as_ptr(), SHADOW_DIR_MODE) }) {
        Err(e) if !is_errno(&e, libc::EEXIST) => Err(e),
        _ => Ok(()),
    }
}

/// Reads the shadow entry of `host`. A missing entry yields empty credentials.
pub(crate) fn read_shadow(host: &CStr) -> io::Result<Credentials> {
    let path = match shadow_file(host) {
        Ok(path) => path,
        Err(_) => return Ok(Credentials::default()),
    };

    let mut file = match open_file(&path, libc::O_RDONLY, 0) {
        Ok(file) => file,
        Err(e) if is_errno(&e, libc::ENOENT) => return Ok(Credentials::default()),
        Err(e) => return Err(e),
    };

    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    Ok(Credentials::parse_shadow(&content))
}

/// Merges `creds` into the shadow entry of `host` and rewrites it.
///
/// The shadow directory is created when no entry could be read. There is no lock around
/// the read-modify-write cycle.
pub(crate) fn write_shadow(host: &CStr, creds: &Credentials) -> io::Result<()> {
    let path = shadow_file(host)?;

    let existing = match open_file(&path, libc::O_RDONLY, 0) {
        Ok(mut file) => {
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;
            Some(Credentials::parse_shadow(&content))
        }
        Err(_) => None,
    };

    let merged = match existing {
        Some(existing) => existing.merge(creds),
        None => {
            create_shadow_dir(host)?;
            *creds
        }
    };

    let mut file: File = open_file(
        &path,
        libc::O_WRONLY | libc::O_TRUNC | libc::O_CREAT,
        SHADOW_FILE_MODE,
    )?;
    file.write_all(merged.format_shadow().as_bytes())?;
    Ok(())
}

/// Removes the shadow entry of `host`.
pub(crate) fn remove_shadow(host: &CStr) -> io::Result<()> {
    let path = shadow_file(host)?;
    cvt(unsafe { libc::unlink(path.as_ptr()) })?;
    Ok(())
}

/// Removes the `.virtfs_metadata` directory inside `dir_host` and all entries in it.
pub(crate) fn remove_shadow_subtree(dir_host: &CStr) -> io::Result<()> {
    let meta = inner_shadow_dir(dir_host)?;

    for entry in std::fs::read_dir(host_path(&meta))? {
        let path = host_join(&meta, entry?.file_name().as_bytes())?;
        match cvt(unsafe { libc::unlink(path.as_ptr()) }) {
            Err(e) if !is_errno(&e, libc::ENOENT) => return Err(e),
            _ => {}
        }
    }

    cvt(unsafe { libc::rmdir(meta.as_ptr()) })?;
    Ok(())
}

/// Whether the directory at `host` holds nothing besides a `.virtfs_metadata` directory.
pub(crate) fn only_shadow_left(host: &CStr) -> io::Result<bool> {
    for entry in std::fs::read_dir(host_path(host))? {
        if entry?.file_name() != METADATA_DIR {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Hard-links the shadow entry of `old` to the one of `new`.
pub(crate) fn link_shadow(old: &CStr, new: &CStr) -> io::Result<()> {
    let from = shadow_file(old)?;
    let to = shadow_file(new)?;
    cvt(unsafe { libc::link(from.as_ptr(), to.as_ptr()) })?;
    Ok(())
}

/// Moves the shadow entry of `old` to the one of `new`.
pub(crate) fn rename_shadow(old: &CStr, new: &CStr) -> io::Result<()> {
    let from = shadow_file(old)?;
    let to = shadow_file(new)?;
    cvt(unsafe { libc::rename(from.as_ptr(), to.as_ptr()) })?;
    Ok(())
}

fn host_path(host: &CStr) -> &Path {
    Path::new(std::ffi::OsStr::from_bytes(host.to_bytes()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
