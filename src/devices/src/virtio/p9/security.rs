//! Per-model handling of ownership and mode bits.
//!
//! Every creating operation goes through [`SecurityDispatcher::create_then_tag`]: the real
//! object is created first, then tagged with the requested credentials the way the active
//! model wants it. If tagging fails the object is removed again and the tagging error is
//! returned, so no object is ever left behind with missing or wrong credentials.

use std::{
    ffi::{CStr, CString},
    io,
    os::unix::io::{AsRawFd, RawFd},
};

use super::{
    attr::{self, AttributeStore, Credentials},
    config::SecurityModel,
    util::{cvt, einval, is_errno, lstat, open_path_file, proc_fd_path},
};
use crate::virtio::bindings::stat64;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Host permissions of files created under a mapped model.
pub const MAPPED_FILE_MODE: libc::mode_t = 0o600;

/// Host permissions of directories created under a mapped model.
pub const MAPPED_DIR_MODE: libc::mode_t = 0o700;

/// Mode used when the caller did not ask for one.
const DEFAULT_FILE_MODE: libc::mode_t = 0o644;
const DEFAULT_DIR_MODE: libc::mode_t = 0o755;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What kind of object a [`PendingCreate`] has to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreatedKind {
    Dir,
    NonDir,
}

/// A freshly created object that is removed on drop unless committed.
pub(crate) struct PendingCreate<'a> {
    host: &'a CStr,
    kind: CreatedKind,
    shadow: bool,
    armed: bool,
}

/// Applies the active security model to creations, attribute reads and ownership changes.
#[derive(Debug, Clone)]
pub struct SecurityDispatcher {
    model: SecurityModel,
    store: Option<AttributeStore>,
    root: CString,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<'a> PendingCreate<'a> {
    /// Takes ownership of the object at `host`. `shadow` also removes its shadow entry.
    pub(crate) fn new(host: &'a CStr, kind: CreatedKind, shadow: bool) -> Self {
        Self {
            host,
            kind,
            shadow,
            armed: true,
        }
    }

    /// Keeps the object.
    pub(crate) fn commit(mut self) {
        self.armed = false;
    }
}

impl SecurityDispatcher {
    pub fn new(model: SecurityModel, root: &CStr) -> Self {
        let store = match model {
            SecurityModel::MappedXattr => Some(AttributeStore::Xattr),
            SecurityModel::MappedFile => Some(AttributeStore::ShadowFile),
            SecurityModel::Passthrough | SecurityModel::None => None,
        };

        Self {
            model,
            store,
            root: root.to_owned(),
        }
    }

    pub fn model(&self) -> SecurityModel {
        self.model
    }

    pub fn store(&self) -> Option<AttributeStore> {
        self.store
    }

    /// Host mode and device for a `mknod` of the requested node.
    pub fn node_mode(&self, creds: &Credentials) -> (libc::mode_t, libc::dev_t) {
        if self.model.is_mapped() {
            (libc::S_IFREG | MAPPED_FILE_MODE, 0)
        } else {
            (
                creds.mode.unwrap_or(libc::S_IFREG | DEFAULT_FILE_MODE),
                creds.rdev.unwrap_or(0),
            )
        }
    }

    /// Host mode for a new directory.
    pub fn dir_mode(&self, creds: &Credentials) -> libc::mode_t {
        if self.model.is_mapped() {
            MAPPED_DIR_MODE
        } else {
            creds.mode.map_or(DEFAULT_DIR_MODE, |m| m & 0o7777)
        }
    }

    /// Host mode for a new regular file or an emulated symlink.
    pub fn file_mode(&self, creds: &Credentials) -> libc::mode_t {
        if self.model.is_mapped() {
            MAPPED_FILE_MODE
        } else {
            creds.mode.map_or(DEFAULT_FILE_MODE, |m| m & 0o7777)
        }
    }

    /// Runs `create`, then `tag` on what it returned. If tagging fails the created object is
    /// removed and the tagging error returned.
    pub(crate) fn create_then_tag<T>(
        &self,
        host: &CStr,
        kind: CreatedKind,
        create: impl FnOnce() -> io::Result<T>,
        tag: impl FnOnce(&mut T) -> io::Result<()>,
    ) -> io::Result<T> {
        let mut created = create()?;
        let pending = PendingCreate::new(host, kind, self.model == SecurityModel::MappedFile);
        tag(&mut created)?;
        pending.commit();
        Ok(created)
    }

    /// Records the credentials of a newly created object.
    ///
    /// Mapped models store `creds`, with the file type forced to `file_type` when given.
    /// Passthrough and none change the real owner, then the real permission bits.
    pub fn tag_created(
        &self,
        host: &CStr,
        creds: &Credentials,
        file_type: Option<libc::mode_t>,
    ) -> io::Result<()> {
        if self.store.is_some() {
            let creds = match file_type {
                Some(kind) => creds.with_file_type(kind),
                None => *creds,
            };
            return self.store_creds(host, &creds);
        }

        self.lchown(host, creds)?;
        if let Some(mode) = creds.mode {
            chmod_nofollow(host, mode & 0o7777)?;
        }
        Ok(())
    }

    /// Records the credentials of a new real symlink. Only ownership is changed.
    pub fn tag_symlink(&self, host: &CStr, creds: &Credentials) -> io::Result<()> {
        self.lchown(host, creds)
    }

    /// Overlays synthetic credentials of the object at `host` onto `st`.
    pub fn overlay(&self, host: &CStr, st: &mut stat64) -> io::Result<()> {
        if let Some(creds) = self.load(host, None)? {
            creds.apply_to(st);
        }
        Ok(())
    }

    /// Like [`SecurityDispatcher::overlay`], reading attributes through an open descriptor.
    pub fn overlay_fd(&self, fd: RawFd, host: &CStr, st: &mut stat64) -> io::Result<()> {
        if let Some(creds) = self.load(host, Some(fd))? {
            creds.apply_to(st);
        }
        Ok(())
    }

    /// Changes the mode of the object at `host`.
    ///
    /// Under mapped models a mode without type bits keeps the current synthetic type.
    pub fn chmod(&self, host: &CStr, mode: libc::mode_t) -> io::Result<()> {
        if self.store.is_none() {
            return chmod_nofollow(host, mode);
        }

        let mut mode = mode;
        if mode & libc::S_IFMT == 0 {
            let mut st = lstat(host)?;
            self.overlay(host, &mut st)?;
            mode |= st.st_mode & libc::S_IFMT;
        }

        self.store_creds(
            host,
            &Credentials {
                mode: Some(mode),
                ..Default::default()
            },
        )
    }

    /// Changes the ownership of the object at `host`.
    pub fn chown(&self, host: &CStr, creds: &Credentials) -> io::Result<()> {
        let ownership = Credentials {
            uid: creds.uid,
            gid: creds.gid,
            ..Default::default()
        };

        if self.store.is_none() || ownership.is_empty() {
            return self.lchown(host, &ownership);
        }
        self.store_creds(host, &ownership)
    }

    /// Persists `creds` through the attribute store.
    pub(crate) fn store_creds(&self, host: &CStr, creds: &Credentials) -> io::Result<()> {
        match self.store {
            Some(AttributeStore::ShadowFile) if self.is_root(host) => Err(einval()),
            Some(store) => store.store(host, creds),
            None => Err(einval()),
        }
    }

    fn load(&self, host: &CStr, fd: Option<RawFd>) -> io::Result<Option<Credentials>> {
        match (self.store, fd) {
            (None, _) => Ok(None),
            (Some(AttributeStore::ShadowFile), _) if self.is_root(host) => Ok(None),
            (Some(store), Some(fd)) => store.load_fd(fd, host).map(Some),
            (Some(store), None) => store.load(host).map(Some),
        }
    }

    /// Changes the real owner. Under the none model a refused change is ignored.
    fn lchown(&self, host: &CStr, creds: &Credentials) -> io::Result<()> {
        let uid = creds.uid.unwrap_or(libc::uid_t::MAX);
        let gid = creds.gid.unwrap_or(libc::gid_t::MAX);

        match cvt(unsafe { libc::lchown(host.as_ptr(), uid, gid) }) {
            Err(e)
                if self.model == SecurityModel::None
                    && (is_errno(&e, libc::EPERM) || is_errno(&e, libc::EINVAL)) =>
            {
                log::debug!("ignoring ownership change failure on {host:?}: {e}");
                Ok(())
            }
            Err(e) => Err(e),
            Ok(_) => Ok(()),
        }
    }

    fn is_root(&self, host: &CStr) -> bool {
        host == self.root.as_c_str()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Changes the mode of `host` without following a final symlink.
pub(crate) fn chmod_nofollow(host: &CStr, mode: libc::mode_t) -> io::Result<()> {
    let file = open_path_file(host)?;
    let proc_path = proc_fd_path(file.as_raw_fd());
    cvt(unsafe { libc::chmod(proc_path.as_ptr(), mode) })?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for PendingCreate<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let res = match self.kind {
            CreatedKind::Dir => unsafe { libc::rmdir(self.host.as_ptr()) },
            CreatedKind::NonDir => unsafe { libc::unlink(self.host.as_ptr()) },
        };
        if res < 0 {
            log::error!(
                "failed to roll back creation of {:?}: {}",
                self.host,
                io::Error::last_os_error()
            );
        }

        if self.shadow {
            if let Err(e) = attr::remove_shadow(self.host) {
                if !is_errno(&e, libc::ENOENT) {
                    log::warn!("failed to remove shadow entry of {:?}: {e}", self.host);
                }
            }
        }
    }
}
