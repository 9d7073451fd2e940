use std::{
    ffi::CStr,
    io::{self, IoSlice, IoSliceMut, Read, Write},
    mem::MaybeUninit,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};

use caps::{has_cap, CapSet, Capability};

use super::{
    attr::{self, AttributeStore, Credentials},
    config::{ExportConfig, ExportFlags, SecurityModel},
    file_ops::FileOperations,
    handle::{DirEntry, DirStream, FileHandle, OpenHandle},
    path::{HostPath, LogicalPath, PathTranslator, METADATA_DIR},
    security::{CreatedKind, SecurityDispatcher, MAPPED_FILE_MODE},
    util::{cvt, ebadf, einval, fstat, is_errno, lstat, open_file, open_path_file},
    xattr::XattrBackend,
};
use crate::virtio::bindings::{stat64, statfs64};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const EXT2_SUPER_MAGIC: u32 = 0xEF53;
const XFS_SUPER_MAGIC: u32 = 0x5846_5342;
const REISERFS_SUPER_MAGIC: u32 = 0x5265_4973;
const BTRFS_SUPER_MAGIC: u32 = 0x9123_683E;

/// Filesystems known to answer `FS_IOC_GETVERSION`.
const ST_GEN_FILESYSTEMS: [u32; 4] = [
    EXT2_SUPER_MAGIC,
    XFS_SUPER_MAGIC,
    REISERFS_SUPER_MAGIC,
    BTRFS_SUPER_MAGIC,
];

/// Flags never passed on when opening an existing object.
const CREATE_FLAGS: i32 = libc::O_CREAT | libc::O_EXCL;

nix::ioctl_read!(fs_ioc_getversion, b'v', 1, libc::c_long);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Exports a host directory tree under one of the four security models.
pub struct LocalFs {
    config: ExportConfig,
    paths: PathTranslator,
    security: SecurityDispatcher,

    /// Selected by `init`.
    xattr: OnceLock<XattrBackend>,

    /// Whether the export root lives on a filesystem with generation numbers.
    st_gen: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalFs {
    /// Creates a backend for `config`. The export root must be an existing directory.
    pub fn new(config: ExportConfig) -> io::Result<Self> {
        let paths = PathTranslator::new(&config.root_dir, config.security_model)?;

        let meta = std::fs::metadata(&config.root_dir)?;
        if !meta.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }

        let security = SecurityDispatcher::new(config.security_model, paths.root());

        Ok(Self {
            config,
            paths,
            security,
            xattr: OnceLock::new(),
            st_gen: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.paths
    }

    fn model(&self) -> SecurityModel {
        self.config.security_model
    }

    fn hides_metadata(&self) -> bool {
        self.model() == SecurityModel::MappedFile
    }

    fn xattr_backend(&self) -> XattrBackend {
        *self
            .xattr
            .get_or_init(|| XattrBackend::for_model(self.config.security_model))
    }

    fn resolve(&self, path: &LogicalPath) -> io::Result<HostPath> {
        self.paths.resolve(path)
    }

    fn resolve_not_root(&self, path: &LogicalPath) -> io::Result<HostPath> {
        if path.components().next().is_none() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.resolve(path)
    }

    fn do_lstat(&self, host: &CStr) -> io::Result<stat64> {
        let mut st = lstat(host)?;
        self.security.overlay(host, &mut st)?;
        Ok(st)
    }

    fn do_fstat(&self, handle: &OpenHandle) -> io::Result<stat64> {
        let fd = handle.raw_fd();
        let mut st = fstat(fd)?;

        let host = match self.security.store() {
            Some(AttributeStore::ShadowFile) => Some(self.resolve(handle.path())?),
            _ => None,
        };
        self.security
            .overlay_fd(fd, host.as_deref().unwrap_or_default(), &mut st)?;
        Ok(st)
    }

    fn do_readlink(&self, host: &CStr) -> io::Result<Vec<u8>> {
        if self.model().is_mapped() {
            let mut file = open_file(host, libc::O_RDONLY, 0)?;
            let mut target = Vec::new();
            file.read_to_end(&mut target)?;
            return Ok(target);
        }

        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        let len = cvt(unsafe {
            libc::readlink(
                host.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        })?;
        buf.truncate(len as usize);
        Ok(buf)
    }

    fn do_readdir(&self, handle: &mut OpenHandle) -> io::Result<Option<DirEntry>> {
        let dir = dir_stream(handle)?;

        loop {
            let Some(mut entry) = dir.next_entry()? else {
                return Ok(None);
            };

            if self.hides_metadata() && entry.name.to_bytes() == METADATA_DIR.as_bytes() {
                continue;
            }

            // The real type may not match the synthetic one, e.g. emulated symlinks.
            if self.model().is_mapped() {
                entry.kind = libc::DT_UNKNOWN;
            }

            return Ok(Some(entry));
        }
    }

    fn do_preadv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>], offset: i64) -> io::Result<usize> {
        let iov = bufs.as_ptr() as *const libc::iovec;
        let cnt = bufs.len() as libc::c_int;

        match cvt(unsafe { libc::preadv64(fd, iov, cnt, offset) }) {
            Err(e) if is_errno(&e, libc::ENOSYS) => {
                cvt(unsafe { libc::lseek64(fd, offset, libc::SEEK_SET) })?;
                let res = cvt(unsafe { libc::readv(fd, iov, cnt) })?;
                Ok(res as usize)
            }
            res => res.map(|n| n as usize),
        }
    }

    fn do_pwritev(&self, fd: RawFd, bufs: &[IoSlice<'_>], offset: i64) -> io::Result<usize> {
        let iov = bufs.as_ptr() as *const libc::iovec;
        let cnt = bufs.len() as libc::c_int;

        let written = match cvt(unsafe { libc::pwritev64(fd, iov, cnt, offset) }) {
            Err(e) if is_errno(&e, libc::ENOSYS) => {
                cvt(unsafe { libc::lseek64(fd, offset, libc::SEEK_SET) })?;
                cvt(unsafe { libc::writev(fd, iov, cnt) })? as usize
            }
            res => res? as usize,
        };

        if written > 0 && self.config.flags.contains(ExportFlags::IMMEDIATE_WRITEOUT) {
            // Starts writeback of the range without waiting for it, which keeps dirty
            // pages short-lived without paying for a full sync.
            let res = unsafe {
                libc::sync_file_range(
                    fd,
                    offset,
                    written as i64,
                    libc::SYNC_FILE_RANGE_WAIT_BEFORE | libc::SYNC_FILE_RANGE_WRITE,
                )
            };
            if res < 0 {
                log::warn!(
                    "sync_file_range failed on fd {fd}: {}",
                    io::Error::last_os_error()
                );
            }
        }

        Ok(written)
    }

    fn do_mknod(&self, dir: &LogicalPath, name: &CStr, creds: &Credentials) -> io::Result<()> {
        let (_, host) = self.paths.resolve_at(dir, name)?;
        let (mode, rdev) = self.security.node_mode(creds);

        self.security.create_then_tag(
            &host,
            CreatedKind::NonDir,
            || cvt(unsafe { libc::mknod(host.as_ptr(), mode, rdev) }).map(drop),
            |_| self.security.tag_created(&host, creds, None),
        )
    }

    fn do_mkdir(&self, dir: &LogicalPath, name: &CStr, creds: &Credentials) -> io::Result<()> {
        let (_, host) = self.paths.resolve_at(dir, name)?;
        let mode = self.security.dir_mode(creds);

        self.security.create_then_tag(
            &host,
            CreatedKind::Dir,
            || cvt(unsafe { libc::mkdir(host.as_ptr(), mode) }).map(drop),
            |_| self.security.tag_created(&host, creds, Some(libc::S_IFDIR)),
        )
    }

    fn do_create(
        &self,
        dir: &LogicalPath,
        name: &CStr,
        flags: i32,
        creds: &Credentials,
    ) -> io::Result<OpenHandle> {
        let (path, host) = self.paths.resolve_at(dir, name)?;
        let flags = flags | CREATE_FLAGS;
        let mode = self.security.file_mode(creds);

        let file = self.security.create_then_tag(
            &host,
            CreatedKind::NonDir,
            || open_file(&host, flags, mode),
            |_| self.security.tag_created(&host, creds, Some(libc::S_IFREG)),
        )?;

        Ok(OpenHandle::File(FileHandle { file, flags, path }))
    }

    fn do_symlink(
        &self,
        target: &CStr,
        dir: &LogicalPath,
        name: &CStr,
        creds: &Credentials,
    ) -> io::Result<()> {
        let (_, host) = self.paths.resolve_at(dir, name)?;

        if !self.model().is_mapped() {
            return self.security.create_then_tag(
                &host,
                CreatedKind::NonDir,
                || cvt(unsafe { libc::symlink(target.as_ptr(), host.as_ptr()) }).map(drop),
                |_| self.security.tag_symlink(&host, creds),
            );
        }

        // Mapped models keep the target as the content of a regular file, since a real
        // symlink cannot carry synthetic credentials.
        self.security
            .create_then_tag(
                &host,
                CreatedKind::NonDir,
                || {
                    open_file(
                        &host,
                        libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                        MAPPED_FILE_MODE,
                    )
                },
                |file| {
                    file.write_all(target.to_bytes())?;
                    self.security
                        .tag_created(&host, creds, Some(libc::S_IFLNK))
                },
            )
            .map(drop)
    }

    fn do_link(&self, old: &LogicalPath, dir: &LogicalPath, name: &CStr) -> io::Result<()> {
        let old_host = self.resolve(old)?;
        let (_, new_host) = self.paths.resolve_at(dir, name)?;

        cvt(unsafe {
            libc::linkat(
                libc::AT_FDCWD,
                old_host.as_ptr(),
                libc::AT_FDCWD,
                new_host.as_ptr(),
                0,
            )
        })?;

        if !self.hides_metadata() {
            return Ok(());
        }

        let res = attr::create_shadow_dir(&new_host)
            .and_then(|_| attr::link_shadow(&old_host, &new_host));
        match res {
            Err(e) if !is_errno(&e, libc::ENOENT) => {
                if unsafe { libc::unlink(new_host.as_ptr()) } < 0 {
                    log::error!(
                        "failed to undo link {new_host:?}: {}",
                        io::Error::last_os_error()
                    );
                }
                Err(e)
            }
            _ => Ok(()),
        }
    }

    fn do_rename(&self, old_host: &CStr, new_host: &CStr) -> io::Result<()> {
        if !self.hides_metadata() {
            cvt(unsafe { libc::rename(old_host.as_ptr(), new_host.as_ptr()) })?;
            return Ok(());
        }

        attr::create_shadow_dir(new_host)?;
        let moved = match attr::rename_shadow(old_host, new_host) {
            Ok(()) => true,
            Err(e) if is_errno(&e, libc::ENOENT) => false,
            Err(e) => return Err(e),
        };

        if let Err(e) = cvt(unsafe { libc::rename(old_host.as_ptr(), new_host.as_ptr()) }) {
            if moved {
                if let Err(re) = attr::rename_shadow(new_host, old_host) {
                    log::error!("failed to restore shadow entry of {old_host:?}: {re}");
                }
            }
            return Err(e);
        }

        // The source carried no shadow entry, so one left over for the target is stale.
        if !moved {
            if let Err(e) = attr::remove_shadow(new_host) {
                if !is_errno(&e, libc::ENOENT) {
                    log::warn!("failed to remove stale shadow entry of {new_host:?}: {e}");
                }
            }
        }

        Ok(())
    }

    fn do_remove_dir(&self, host: &CStr) -> io::Result<()> {
        if self.hides_metadata() {
            if !attr::only_shadow_left(host)? {
                return Err(io::Error::from_raw_os_error(libc::ENOTEMPTY));
            }
            tolerate_missing(attr::remove_shadow_subtree(host))?;
            tolerate_missing(attr::remove_shadow(host))?;
        }

        cvt(unsafe { libc::rmdir(host.as_ptr()) })?;
        Ok(())
    }

    fn do_remove_nondir(&self, host: &CStr) -> io::Result<()> {
        if self.hides_metadata() {
            // Shadow entries go first, and only for objects unlink can take.
            if lstat(host)?.st_mode & libc::S_IFMT == libc::S_IFDIR {
                return Err(io::Error::from_raw_os_error(libc::EISDIR));
            }
            tolerate_missing(attr::remove_shadow(host))?;
        }

        cvt(unsafe { libc::unlink(host.as_ptr()) })?;
        Ok(())
    }

    fn do_statfs(&self, host: &CStr) -> io::Result<statfs64> {
        let file = open_path_file(host)?;
        let mut st = MaybeUninit::<statfs64>::zeroed();
        cvt(unsafe { libc::fstatfs64(file.as_raw_fd(), st.as_mut_ptr()) })?;

        // Safe because the kernel filled the struct.
        Ok(unsafe { st.assume_init() })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Treats `ENOENT` from a shadow metadata step as success.
fn tolerate_missing(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if is_errno(&e, libc::ENOENT) => Ok(()),
        res => res,
    }
}

fn file_handle(handle: &OpenHandle) -> io::Result<&FileHandle> {
    match handle {
        OpenHandle::File(f) => Ok(f),
        OpenHandle::Dir(_) => Err(io::Error::from_raw_os_error(libc::EISDIR)),
    }
}

fn dir_stream(handle: &mut OpenHandle) -> io::Result<&mut DirStream> {
    match handle {
        OpenHandle::Dir(d) => Ok(d),
        OpenHandle::File(_) => Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FileOperations for LocalFs {
    fn init(&self) -> io::Result<()> {
        let backend = XattrBackend::for_model(self.model());
        if self.xattr.set(backend).is_err() {
            log::debug!("xattr backend already selected");
        }

        let root = self.paths.root();
        let mut stfs = MaybeUninit::<statfs64>::zeroed();
        cvt(unsafe { libc::statfs64(root.as_ptr(), stfs.as_mut_ptr()) })?;

        // Safe because the kernel filled the struct.
        let stfs = unsafe { stfs.assume_init() };
        let fs_type = stfs.f_type as u32;
        if ST_GEN_FILESYSTEMS.contains(&fs_type) {
            self.st_gen.store(true, Ordering::Relaxed);
        }

        if self.model() == SecurityModel::Passthrough
            && !has_cap(None, CapSet::Effective, Capability::CAP_CHOWN).unwrap_or_default()
        {
            log::warn!("passthrough security model without CAP_CHOWN, ownership changes will fail");
        }

        log::debug!(
            "local export {:?} ready: model {}, fs type {fs_type:#x}",
            self.config.root_dir,
            self.model()
        );
        Ok(())
    }

    fn lstat(&self, path: &LogicalPath) -> io::Result<stat64> {
        let host = self.resolve(path)?;
        self.do_lstat(&host)
    }

    fn fstat(&self, handle: &OpenHandle) -> io::Result<stat64> {
        self.do_fstat(handle)
    }

    fn readlink(&self, path: &LogicalPath) -> io::Result<Vec<u8>> {
        let host = self.resolve(path)?;
        self.do_readlink(&host)
    }

    fn open(&self, path: &LogicalPath, flags: i32) -> io::Result<OpenHandle> {
        let host = self.resolve(path)?;
        let flags = flags & !CREATE_FLAGS;
        let file = open_file(&host, flags, 0)?;

        Ok(OpenHandle::File(FileHandle {
            file,
            flags,
            path: path.clone(),
        }))
    }

    fn opendir(&self, path: &LogicalPath) -> io::Result<OpenHandle> {
        let host = self.resolve(path)?;
        let file = open_file(&host, libc::O_RDONLY | libc::O_DIRECTORY, 0)?;
        DirStream::from_file(file, path.clone()).map(OpenHandle::Dir)
    }

    fn close(&self, handle: OpenHandle) -> io::Result<()> {
        match handle {
            OpenHandle::File(f) => {
                let fd = f.file.into_raw_fd();
                cvt(unsafe { libc::close(fd) })?;
                Ok(())
            }
            OpenHandle::Dir(_) => Err(ebadf()),
        }
    }

    fn closedir(&self, handle: OpenHandle) -> io::Result<()> {
        match handle {
            OpenHandle::Dir(d) => d.close(),
            OpenHandle::File(_) => Err(ebadf()),
        }
    }

    fn rewinddir(&self, handle: &mut OpenHandle) -> io::Result<()> {
        dir_stream(handle)?.rewind();
        Ok(())
    }

    fn telldir(&self, handle: &mut OpenHandle) -> io::Result<i64> {
        dir_stream(handle)?.tell()
    }

    fn readdir(&self, handle: &mut OpenHandle) -> io::Result<Option<DirEntry>> {
        self.do_readdir(handle)
    }

    fn seekdir(&self, handle: &mut OpenHandle, offset: i64) -> io::Result<()> {
        dir_stream(handle)?.seek(offset);
        Ok(())
    }

    fn preadv(
        &self,
        handle: &OpenHandle,
        bufs: &mut [IoSliceMut<'_>],
        offset: i64,
    ) -> io::Result<usize> {
        let f = file_handle(handle)?;
        self.do_preadv(f.file.as_raw_fd(), bufs, offset)
    }

    fn pwritev(&self, handle: &OpenHandle, bufs: &[IoSlice<'_>], offset: i64) -> io::Result<usize> {
        let f = file_handle(handle)?;
        self.do_pwritev(f.file.as_raw_fd(), bufs, offset)
    }

    fn chmod(&self, path: &LogicalPath, mode: libc::mode_t) -> io::Result<()> {
        let host = self.resolve(path)?;
        self.security.chmod(&host, mode)
    }

    fn mknod(&self, dir: &LogicalPath, name: &CStr, creds: &Credentials) -> io::Result<()> {
        self.do_mknod(dir, name, creds)
    }

    fn mkdir(&self, dir: &LogicalPath, name: &CStr, creds: &Credentials) -> io::Result<()> {
        self.do_mkdir(dir, name, creds)
    }

    fn create(
        &self,
        dir: &LogicalPath,
        name: &CStr,
        flags: i32,
        creds: &Credentials,
    ) -> io::Result<OpenHandle> {
        self.do_create(dir, name, flags, creds)
    }

    fn symlink(
        &self,
        target: &CStr,
        dir: &LogicalPath,
        name: &CStr,
        creds: &Credentials,
    ) -> io::Result<()> {
        self.do_symlink(target, dir, name, creds)
    }

    fn link(&self, old: &LogicalPath, dir: &LogicalPath, name: &CStr) -> io::Result<()> {
        self.do_link(old, dir, name)
    }

    fn truncate(&self, path: &LogicalPath, size: u64) -> io::Result<()> {
        let host = self.resolve(path)?;
        let size = i64::try_from(size).map_err(|_| einval())?;
        let file = open_file(&host, libc::O_WRONLY, 0)?;
        cvt(unsafe { libc::ftruncate64(file.as_raw_fd(), size) })?;
        Ok(())
    }

    fn rename(&self, old: &LogicalPath, new: &LogicalPath) -> io::Result<()> {
        let old_host = self.resolve_not_root(old)?;
        let new_host = self.resolve_not_root(new)?;
        self.do_rename(&old_host, &new_host)
    }

    fn chown(&self, path: &LogicalPath, creds: &Credentials) -> io::Result<()> {
        let host = self.resolve(path)?;
        self.security.chown(&host, creds)
    }

    fn utimensat(&self, path: &LogicalPath, times: &[libc::timespec; 2]) -> io::Result<()> {
        let host = self.resolve(path)?;
        cvt(unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                host.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        })?;
        Ok(())
    }

    fn remove(&self, path: &LogicalPath) -> io::Result<()> {
        let host = self.resolve_not_root(path)?;

        // Always look at the object right before choosing how to remove it.
        let st = lstat(&host)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            self.do_remove_dir(&host)
        } else {
            self.do_remove_nondir(&host)
        }
    }

    fn fsync(&self, handle: &OpenHandle, datasync: bool) -> io::Result<()> {
        let fd = handle.raw_fd();
        let res = if datasync {
            unsafe { libc::fdatasync(fd) }
        } else {
            unsafe { libc::fsync(fd) }
        };
        cvt(res)?;
        Ok(())
    }

    fn statfs(&self, path: &LogicalPath) -> io::Result<statfs64> {
        let host = self.resolve(path)?;
        self.do_statfs(&host)
    }

    fn getxattr(&self, path: &LogicalPath, name: &CStr, value: &mut [u8]) -> io::Result<usize> {
        let host = self.resolve(path)?;
        self.xattr_backend().get(&host, name, value)
    }

    fn listxattr(&self, path: &LogicalPath, value: &mut [u8]) -> io::Result<usize> {
        let host = self.resolve(path)?;
        self.xattr_backend().list(&host, value)
    }

    fn setxattr(
        &self,
        path: &LogicalPath,
        name: &CStr,
        value: &[u8],
        flags: i32,
    ) -> io::Result<()> {
        let host = self.resolve(path)?;
        self.xattr_backend().set(&host, name, value, flags)
    }

    fn removexattr(&self, path: &LogicalPath, name: &CStr) -> io::Result<()> {
        let host = self.resolve(path)?;
        self.xattr_backend().remove(&host, name)
    }

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
        let (_, old_host) = self.paths.resolve_at(olddir, oldname)?;
        let (_, new_host) = self.paths.resolve_at(newdir, newname)?;
        self.do_rename(&old_host, &new_host)
    }

    fn unlinkat(&self, dir: &LogicalPath, name: &CStr, flags: i32) -> io::Result<()> {
        let (_, host) = self.paths.resolve_at(dir, name)?;

        if flags & libc::AT_REMOVEDIR == 0 {
            return self.do_remove_nondir(&host);
        }

        // The shadow cleanup walks the directory, so it has to be a real one.
        if self.hides_metadata() && lstat(&host)?.st_mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        self.do_remove_dir(&host)
    }

    fn get_st_gen(&self, path: &LogicalPath, st_mode: libc::mode_t) -> io::Result<u64> {
        let kind = st_mode & libc::S_IFMT;
        if !self.st_gen.load(Ordering::Relaxed) || (kind != libc::S_IFREG && kind != libc::S_IFDIR)
        {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }

        let host = self.resolve(path)?;
        let file = open_file(&host, libc::O_RDONLY, 0)?;
        let mut version: libc::c_long = 0;
        unsafe { fs_ioc_getversion(file.as_raw_fd(), &mut version) }?;
        Ok(version as u64)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
#[path = "tests/local/mod.rs"]
mod tests;
