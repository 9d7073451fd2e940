//! Runs blocking directory and fid operations off the request scheduler.
//!
//! The protocol engine drives requests on a cooperative (async) scheduler. Every
//! [`Dispatch`] operation first checks whether its [`Request`] was cancelled, then hands the
//! blocking call to the worker pool and suspends until a worker returns the result. The worker
//! checks again before touching the backend, so a request cancelled while it waited on the
//! path lock or in the queue does nothing.
//!
//! Open descriptors are tracked by an [`FdWatermark`]. Crossing its high-water mark, on a
//! fresh open or on reopening a reclaimed fid, starts a pass that closes the descriptors of
//! idle fids. Those are reopened transparently on next use.

use std::{
    ffi::{CStr, CString},
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::RwLock;
use utils::WorkerPool;

use super::{
    attr::Credentials,
    config::DispatchConfig,
    fid::{Fid, FidState, FidTable},
    file_ops::FileOperations,
    handle::{DirEntry, OpenHandle},
    util::ebadf,
};
use crate::virtio::bindings::stat64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Cancellation state of one protocol request. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct Request {
    cancelled: Arc<AtomicBool>,
}

/// Advisory count of open descriptors against a high-water mark.
#[derive(Debug)]
pub struct FdWatermark {
    open: AtomicUsize,
    high_water: usize,
}

/// Bridge between the request scheduler and blocking filesystem calls.
pub struct Dispatch {
    fs: Arc<dyn FileOperations>,
    pool: WorkerPool,
    fids: Arc<FidTable>,

    /// Held shared while a path is created or opened, exclusively while paths move.
    path_lock: RwLock<()>,

    watermark: Arc<FdWatermark>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Conversion of errors into the negative errno values the protocol layer reports.
pub trait NegErrno {
    fn neg_errno(&self) -> i32;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the request cancelled. Operations not handed to a worker yet will not run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with `EINTR` if the request was cancelled.
    fn check(&self) -> io::Result<()> {
        if self.is_cancelled() {
            return Err(io::Error::from_raw_os_error(libc::EINTR));
        }
        Ok(())
    }
}

impl FdWatermark {
    pub fn new(high_water: usize) -> Self {
        Self {
            open: AtomicUsize::new(0),
            high_water,
        }
    }

    /// Counts a new descriptor. Returns whether the count is now above the high-water mark.
    pub fn opened(&self) -> bool {
        self.open.fetch_add(1, Ordering::SeqCst) + 1 > self.high_water
    }

    /// Counts a closed descriptor.
    pub fn closed(&self) {
        self.reclaimed(1);
    }

    /// Subtracts `n` closed descriptors, stopping at zero.
    pub fn reclaimed(&self, n: usize) {
        let _ = self
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                Some(open.saturating_sub(n))
            });
    }

    pub fn count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

impl Dispatch {
    /// Starts `config.workers` worker threads serving `fs`.
    pub fn new(fs: Arc<dyn FileOperations>, config: DispatchConfig) -> io::Result<Self> {
        let pool = WorkerPool::new("p9-worker", config.workers)?;

        Ok(Self {
            fs,
            pool,
            fids: Arc::new(FidTable::new()),
            path_lock: RwLock::new(()),
            watermark: Arc::new(FdWatermark::new(config.fd_high_water)),
        })
    }

    pub fn fs(&self) -> &Arc<dyn FileOperations> {
        &self.fs
    }

    pub fn fids(&self) -> &Arc<FidTable> {
        &self.fids
    }

    pub fn watermark(&self) -> &FdWatermark {
        &self.watermark
    }

    /// Stats the path named by `fid`.
    pub async fn lstat(&self, req: &Request, fid: &Arc<Fid>) -> io::Result<stat64> {
        req.check()?;

        let fs = self.fs.clone();
        let path = fid.path();
        self.run(req, move || fs.lstat(&path)).await
    }

    /// Creates directory `name` below `dir` and returns its attributes.
    pub async fn mkdir(
        &self,
        req: &Request,
        dir: &Arc<Fid>,
        name: &CStr,
        creds: Credentials,
    ) -> io::Result<stat64> {
        req.check()?;
        let _paths = self.path_lock.read().await;

        let fs = self.fs.clone();
        let dir_path = dir.path();
        let name = name.to_owned();
        self.run(req, move || {
            fs.mkdir(&dir_path, &name, &creds)?;
            let path = fs.name_to_path(Some(&dir_path), &name)?;
            fs.lstat(&path)
        })
        .await
    }

    /// Opens the directory named by `fid`.
    pub async fn opendir(&self, req: &Request, fid: &Arc<Fid>) -> io::Result<()> {
        req.check()?;
        {
            let _paths = self.path_lock.read().await;
            let fs = self.fs.clone();
            let fid = fid.clone();
            self.run(req, move || attach_handle(&fid, || fs.opendir(&fid.path())))
                .await?;
        }

        self.opened().await;
        Ok(())
    }

    /// Opens the non-directory object named by `fid`.
    pub async fn open(&self, req: &Request, fid: &Arc<Fid>, flags: i32) -> io::Result<()> {
        req.check()?;
        {
            let _paths = self.path_lock.read().await;
            let fs = self.fs.clone();
            let fid = fid.clone();
            self.run(req, move || attach_handle(&fid, || fs.open(&fid.path(), flags)))
                .await?;
        }

        self.opened().await;
        Ok(())
    }

    /// Closes the directory stream of `fid`.
    pub async fn closedir(&self, req: &Request, fid: &Arc<Fid>) -> io::Result<()> {
        req.check()?;

        let fs = self.fs.clone();
        let fid = fid.clone();
        let closed = self
            .run(req, move || detach_handle(&fid, true, |h| fs.closedir(h)))
            .await?;

        if closed {
            self.watermark.closed();
        }
        Ok(())
    }

    /// Closes the file of `fid`.
    pub async fn close(&self, req: &Request, fid: &Arc<Fid>) -> io::Result<()> {
        req.check()?;

        let fs = self.fs.clone();
        let fid = fid.clone();
        let closed = self
            .run(req, move || detach_handle(&fid, false, |h| fs.close(h)))
            .await?;

        if closed {
            self.watermark.closed();
        }
        Ok(())
    }

    /// Returns the next entry of the directory stream of `fid`, `None` at its end.
    pub async fn readdir(&self, req: &Request, fid: &Arc<Fid>) -> io::Result<Option<DirEntry>> {
        self.with_handle(req, fid, |fs, h| fs.readdir(h)).await
    }

    pub async fn telldir(&self, req: &Request, fid: &Arc<Fid>) -> io::Result<i64> {
        self.with_handle(req, fid, |fs, h| fs.telldir(h)).await
    }

    pub async fn seekdir(&self, req: &Request, fid: &Arc<Fid>, offset: i64) -> io::Result<()> {
        self.with_handle(req, fid, move |fs, h| fs.seekdir(h, offset))
            .await
    }

    pub async fn rewinddir(&self, req: &Request, fid: &Arc<Fid>) -> io::Result<()> {
        self.with_handle(req, fid, |fs, h| fs.rewinddir(h)).await
    }

    /// Renames `oldname` in `olddir` to `newname` in `newdir` and moves the fids below it.
    pub async fn renameat(
        &self,
        req: &Request,
        olddir: &Arc<Fid>,
        oldname: &CStr,
        newdir: &Arc<Fid>,
        newname: &CStr,
    ) -> io::Result<()> {
        req.check()?;
        let _paths = self.path_lock.write().await;

        let fs = self.fs.clone();
        let fids = self.fids.clone();
        let (olddir, newdir) = (olddir.path(), newdir.path());
        let (oldname, newname): (CString, CString) = (oldname.to_owned(), newname.to_owned());
        self.run(req, move || {
            fs.renameat(&olddir, &oldname, &newdir, &newname)?;
            let old = fs.name_to_path(Some(&olddir), &oldname)?;
            let new = fs.name_to_path(Some(&newdir), &newname)?;
            // Fid states are locked by workers, so the fix-up stays off the scheduler too
            fids.fix_paths(&old, &new);
            Ok(())
        })
        .await
    }

    /// Closes the descriptors of fids no request holds. Returns how many were closed.
    pub async fn reclaim(&self) -> usize {
        let idle = self.fids.idle_open();
        if idle.is_empty() {
            return 0;
        }

        let fs = self.fs.clone();
        let closed = self
            .pool
            .run(move || idle.iter().filter(|fid| fid.reclaim(fs.as_ref())).count())
            .await
            .unwrap_or_else(|e| {
                log::warn!("descriptor reclaim failed: {e}");
                0
            });

        self.watermark.reclaimed(closed);
        log::debug!(
            "reclaimed {closed} descriptors, {} still open",
            self.watermark.count()
        );
        closed
    }

    /// Counts a new descriptor and reclaims idle ones above the high-water mark.
    async fn opened(&self) {
        if self.watermark.opened() {
            self.reclaim().await;
        }
    }

    /// Runs `f` on a worker unless `req` was cancelled by the time the worker picks it up.
    async fn run<T, F>(&self, req: &Request, f: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let req = req.clone();
        self.pool
            .run(move || {
                req.check()?;
                f()
            })
            .await?
    }

    async fn with_handle<T, F>(&self, req: &Request, fid: &Arc<Fid>, f: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FileOperations, &mut OpenHandle) -> io::Result<T> + Send + 'static,
    {
        req.check()?;

        let fs = self.fs.clone();
        let fid = fid.clone();
        let watermark = self.watermark.clone();
        let (res, crossed) = self
            .run(req, move || {
                let mut crossed = false;
                let res = fid.with_handle(
                    fs.as_ref(),
                    || crossed = watermark.opened(),
                    |h| f(fs.as_ref(), h),
                );
                Ok((res, crossed))
            })
            .await?;

        if crossed {
            self.reclaim().await;
        }
        res
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Opens a handle for a fid without one.
fn attach_handle(fid: &Fid, open: impl FnOnce() -> io::Result<OpenHandle>) -> io::Result<()> {
    let mut state = fid.lock_state();
    if !matches!(*state, FidState::Closed) {
        return Err(ebadf());
    }

    *state = FidState::Open(open()?);
    Ok(())
}

/// Takes the handle of a fid and closes it.
///
/// Returns whether a descriptor was closed; a reclaimed fid has none left.
fn detach_handle(
    fid: &Fid,
    dir: bool,
    close: impl FnOnce(OpenHandle) -> io::Result<()>,
) -> io::Result<bool> {
    let mut state = fid.lock_state();
    match std::mem::replace(&mut *state, FidState::Closed) {
        FidState::Open(handle) if handle.is_dir() == dir => {
            close(handle)?;
            Ok(true)
        }
        FidState::Reclaimed(_) => Ok(false),
        other => {
            *state = other;
            Err(ebadf())
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl NegErrno for io::Error {
    fn neg_errno(&self) -> i32 {
        -self.raw_os_error().unwrap_or(libc::EIO)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
#[path = "tests/dispatch/mod.rs"]
mod tests;
