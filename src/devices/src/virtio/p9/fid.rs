//! Fids and the table that owns them.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use super::{
    file_ops::FileOperations,
    handle::OpenHandle,
    path::LogicalPath,
    util::ebadf,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Flags dropped when a reclaimed file is opened again.
const REOPEN_STRIP_FLAGS: i32 = libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pub type FidId = u32;

/// How to bring back a handle that was closed by a reclaim pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReopenAs {
    File { flags: i32 },
    Dir { offset: Option<i64> },
}

#[derive(Debug)]
pub(crate) enum FidState {
    Closed,
    Open(OpenHandle),
    Reclaimed(ReopenAs),
}

/// A client handle naming a path, possibly with an open descriptor.
#[derive(Debug)]
pub struct Fid {
    id: FidId,
    path: RwLock<LogicalPath>,
    state: Mutex<FidState>,
}

/// All fids of one export.
#[derive(Debug, Default)]
pub struct FidTable {
    fids: Mutex<HashMap<FidId, Arc<Fid>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Fid {
    pub fn new(id: FidId, path: LogicalPath) -> Self {
        Self {
            id,
            path: RwLock::new(path),
            state: Mutex::new(FidState::Closed),
        }
    }

    pub fn id(&self) -> FidId {
        self.id
    }

    /// Returns the current logical path of the fid.
    pub fn path(&self) -> LogicalPath {
        self.path.read().unwrap().clone()
    }

    /// Whether the fid has an open handle, possibly reclaimed.
    pub fn is_open(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), FidState::Closed)
    }

    /// Whether the descriptor of the fid was closed by a reclaim pass.
    pub fn is_reclaimed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), FidState::Reclaimed(_))
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, FidState> {
        self.state.lock().unwrap()
    }

    fn set_path(&self, path: LogicalPath) {
        if let FidState::Open(handle) = &mut *self.state.lock().unwrap() {
            handle.set_path(path.clone());
        }
        *self.path.write().unwrap() = path;
    }

    /// Runs `f` on the open handle of the fid, reopening a reclaimed one first.
    ///
    /// `reopened` is called after a handle had to be opened again.
    pub(crate) fn with_handle<T>(
        &self,
        fs: &dyn FileOperations,
        reopened: impl FnOnce(),
        f: impl FnOnce(&mut OpenHandle) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut state = self.lock_state();

        if let FidState::Reclaimed(how) = *state {
            let path = self.path();
            let mut handle = match how {
                ReopenAs::File { flags } => fs.open(&path, flags)?,
                ReopenAs::Dir { offset } => {
                    let mut handle = fs.opendir(&path)?;
                    if let Some(offset) = offset {
                        fs.seekdir(&mut handle, offset)?;
                    }
                    handle
                }
            };
            handle.set_path(path);
            *state = FidState::Open(handle);
            log::debug!("reopened reclaimed fid {}", self.id);
            reopened();
        }

        match &mut *state {
            FidState::Open(handle) => f(handle),
            _ => Err(ebadf()),
        }
    }

    /// Closes the descriptor of an idle fid, remembering how to reopen it.
    ///
    /// Returns whether a descriptor was closed. A fid in use is skipped.
    pub(crate) fn reclaim(&self, fs: &dyn FileOperations) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };

        let FidState::Open(handle) = &mut *state else {
            return false;
        };

        let how = if handle.is_dir() {
            ReopenAs::Dir {
                offset: fs.telldir(handle).ok(),
            }
        } else if let OpenHandle::File(f) = handle {
            ReopenAs::File {
                flags: f.flags() & !REOPEN_STRIP_FLAGS,
            }
        } else {
            return false;
        };

        let FidState::Open(handle) = std::mem::replace(&mut *state, FidState::Reclaimed(how))
        else {
            return false;
        };

        let res = if handle.is_dir() {
            fs.closedir(handle)
        } else {
            fs.close(handle)
        };
        if let Err(e) = res {
            log::warn!("error closing reclaimed fid {}: {e}", self.id);
        }
        true
    }
}

impl FidTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds fid `id` naming `path`. Fails with `EEXIST` if the id is in use.
    pub fn insert(&self, id: FidId, path: LogicalPath) -> io::Result<Arc<Fid>> {
        let mut fids = self.fids.lock().unwrap();
        if fids.contains_key(&id) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        let fid = Arc::new(Fid::new(id, path));
        fids.insert(id, fid.clone());
        Ok(fid)
    }

    /// Looks up fid `id`. Fails with `EBADF` if it does not exist.
    pub fn get(&self, id: FidId) -> io::Result<Arc<Fid>> {
        self.fids.lock().unwrap().get(&id).cloned().ok_or_else(ebadf)
    }

    /// Removes fid `id` from the table. Its handle is closed once the last user drops it.
    pub fn remove(&self, id: FidId) -> Option<Arc<Fid>> {
        self.fids.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.fids.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the path of every fid at or below `old` to live below `new`.
    ///
    /// Takes the state lock of open fids, so it runs on a worker.
    pub fn fix_paths(&self, old: &LogicalPath, new: &LogicalPath) {
        let fids = self.fids.lock().unwrap();
        for fid in fids.values() {
            if let Some(path) = fid.path().rebase(old, new) {
                fid.set_path(path);
            }
        }
    }

    /// Returns open fids that no request currently holds.
    pub(crate) fn idle_open(&self) -> Vec<Arc<Fid>> {
        let fids = self.fids.lock().unwrap();
        fids.values()
            .filter(|fid| Arc::strong_count(fid) == 1)
            .filter(|fid| {
                fid.state
                    .try_lock()
                    .map(|state| matches!(*state, FidState::Open(_)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
