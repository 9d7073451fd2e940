use std::{
    collections::BTreeSet,
    ffi::{CStr, CString},
    fs, io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use tempfile::TempDir;

use crate::virtio::{
    bindings::stat64,
    p9::{
        Credentials, Dispatch, DispatchConfig, ExportConfig, FileOperations, LocalFs,
        LogicalPath, NegErrno, Request, SecurityModel,
    },
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Backend that only counts how often it was reached.
#[derive(Default)]
struct CountingFs {
    calls: AtomicUsize,

    /// How long `renameat` keeps its worker busy.
    rename_delay: Duration,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn local_dispatch(
    model: SecurityModel,
    dirs: &[&str],
    fd_high_water: usize,
) -> io::Result<(Dispatch, TempDir)> {
    let temp_dir = TempDir::new()?;
    for dir in dirs {
        fs::create_dir_all(temp_dir.path().join(dir))?;
    }

    let fs = LocalFs::new(ExportConfig::new(temp_dir.path(), model))?;
    fs.init()?;

    let config = DispatchConfig {
        workers: 2,
        fd_high_water,
    };
    Ok((Dispatch::new(Arc::new(fs), config)?, temp_dir))
}

fn lpath(rel: &str) -> LogicalPath {
    LogicalPath::new(format!("/{rel}")).unwrap()
}

fn name(s: &str) -> CString {
    CString::new(s).unwrap()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl CountingFs {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FileOperations for CountingFs {
    fn lstat(&self, _path: &LogicalPath) -> io::Result<stat64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(unsafe { std::mem::zeroed() })
    }

    fn mkdir(&self, _dir: &LogicalPath, _name: &CStr, _creds: &Credentials) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn renameat(
        &self,
        _olddir: &LogicalPath,
        _oldname: &CStr,
        _newdir: &LogicalPath,
        _newname: &CStr,
    ) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.rename_delay);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_cancelled_request_never_reaches_backend() -> io::Result<()> {
    let backend = Arc::new(CountingFs::default());
    let dispatch = Dispatch::new(backend.clone(), DispatchConfig::default())?;
    let fid = dispatch.fids().insert(1, LogicalPath::root())?;

    let req = Request::new();
    dispatch.lstat(&req, &fid).await?;
    assert_eq!(backend.calls(), 1);

    // Clones observe the cancellation
    let clone = req.clone();
    req.cancel();
    assert!(clone.is_cancelled());

    let eintr = |res: io::Result<()>| res.unwrap_err().raw_os_error() == Some(libc::EINTR);
    let creds = Credentials::default();

    assert!(eintr(dispatch.lstat(&clone, &fid).await.map(drop)));
    assert!(eintr(
        dispatch
            .mkdir(&clone, &fid, &name("dir"), creds)
            .await
            .map(drop)
    ));
    assert!(eintr(dispatch.opendir(&clone, &fid).await));
    assert!(eintr(dispatch.open(&clone, &fid, libc::O_RDONLY).await));
    assert!(eintr(dispatch.closedir(&clone, &fid).await));
    assert!(eintr(dispatch.close(&clone, &fid).await));
    assert!(eintr(dispatch.readdir(&clone, &fid).await.map(drop)));
    assert!(eintr(dispatch.telldir(&clone, &fid).await.map(drop)));
    assert!(eintr(dispatch.seekdir(&clone, &fid, 0).await));
    assert!(eintr(dispatch.rewinddir(&clone, &fid).await));
    assert!(eintr(
        dispatch
            .renameat(&clone, &fid, &name("a"), &fid, &name("b"))
            .await
    ));

    assert_eq!(backend.calls(), 1);
    assert!(!fid.is_open());

    Ok(())
}

#[tokio::test]
async fn test_cancelled_while_waiting_on_path_lock() -> io::Result<()> {
    let backend = Arc::new(CountingFs {
        rename_delay: Duration::from_millis(300),
        ..Default::default()
    });
    let dispatch = Dispatch::new(backend.clone(), DispatchConfig::default())?;
    let root = dispatch.fids().insert(0, LogicalPath::root())?;

    let rename_req = Request::new();
    let mkdir_req = Request::new();

    // The rename holds the path lock exclusively while its worker sleeps. The mkdir queues
    // behind it and is cancelled before the lock is released.
    let (name_a, name_b) = (name("a"), name("b"));
    let (renamed, made, ()) = tokio::join!(
        dispatch.renameat(&rename_req, &root, &name_a, &root, &name_b),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            dispatch
                .mkdir(&mkdir_req, &root, &name("dir"), Credentials::default())
                .await
        },
        async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            mkdir_req.cancel();
        },
    );

    renamed?;
    assert_eq!(made.unwrap_err().raw_os_error(), Some(libc::EINTR));

    // Only the rename got through
    assert_eq!(backend.calls(), 1);

    Ok(())
}

#[tokio::test]
async fn test_cancelled_readdir_keeps_stream_position() -> io::Result<()> {
    let (dispatch, temp_dir) = local_dispatch(SecurityModel::None, &["dir"], 8)?;
    fs::write(temp_dir.path().join("dir").join("a"), b"")?;

    let fid = dispatch.fids().insert(1, lpath("dir"))?;
    dispatch.opendir(&Request::new(), &fid).await?;
    let before = dispatch.telldir(&Request::new(), &fid).await?;

    let req = Request::new();
    req.cancel();
    let err = dispatch.readdir(&req, &fid).await.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINTR));

    assert_eq!(dispatch.telldir(&Request::new(), &fid).await?, before);

    Ok(())
}

#[tokio::test]
async fn test_unimplemented_operation_reports_enosys() -> io::Result<()> {
    let dispatch = Dispatch::new(Arc::new(CountingFs::default()), DispatchConfig::default())?;
    let fid = dispatch.fids().insert(1, LogicalPath::root())?;

    let err = dispatch.opendir(&Request::new(), &fid).await.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));
    assert!(!fid.is_open());
    assert_eq!(dispatch.watermark().count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_mkdir_returns_attributes() -> io::Result<()> {
    let (dispatch, temp_dir) = local_dispatch(SecurityModel::MappedFile, &[], 8)?;
    let root = dispatch.fids().insert(0, LogicalPath::root())?;

    let creds = Credentials {
        uid: Some(1000),
        gid: Some(100),
        mode: Some(0o750),
        rdev: None,
    };
    let st = dispatch
        .mkdir(&Request::new(), &root, &name("made"), creds)
        .await?;

    assert_eq!(st.st_uid, 1000);
    assert_eq!(st.st_gid, 100);
    assert_eq!(st.st_mode, libc::S_IFDIR | 0o750);
    assert!(temp_dir.path().join("made").is_dir());

    Ok(())
}

#[tokio::test]
async fn test_open_close_tracks_descriptors() -> io::Result<()> {
    let (dispatch, temp_dir) = local_dispatch(SecurityModel::Passthrough, &["dir"], 8)?;
    fs::write(temp_dir.path().join("file"), b"data")?;
    let req = Request::new();

    let dir = dispatch.fids().insert(1, lpath("dir"))?;
    let file = dispatch.fids().insert(2, lpath("file"))?;

    dispatch.opendir(&req, &dir).await?;
    dispatch.open(&req, &file, libc::O_RDONLY).await?;
    assert_eq!(dispatch.watermark().count(), 2);

    // A fid holds at most one handle
    let err = dispatch.opendir(&req, &dir).await.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));

    // Closing with the wrong kind leaves the handle in place
    let err = dispatch.close(&req, &dir).await.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    assert!(dir.is_open());

    dispatch.closedir(&req, &dir).await?;
    dispatch.close(&req, &file).await?;
    assert!(!dir.is_open());
    assert!(!file.is_open());
    assert_eq!(dispatch.watermark().count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_high_water_reclaims_idle_descriptors() -> io::Result<()> {
    let (dispatch, _temp_dir) = local_dispatch(SecurityModel::None, &["d1", "d2", "d3"], 1)?;
    let req = Request::new();

    for (id, dir) in [(1, "d1"), (2, "d2"), (3, "d3")] {
        let fid = dispatch.fids().insert(id, lpath(dir))?;
        dispatch.opendir(&req, &fid).await?;
        assert!(dispatch.watermark().count() <= 2);
    }

    // Every open past the first pushed an older idle fid out
    assert_eq!(dispatch.watermark().count(), 1);
    assert!(dispatch.fids().get(1)?.is_reclaimed());
    assert!(dispatch.fids().get(2)?.is_reclaimed());
    assert!(!dispatch.fids().get(3)?.is_reclaimed());

    // Using a reclaimed fid reopens it transparently. The reopen counts against the mark
    // too, so the idle d3 goes instead.
    let fid = dispatch.fids().get(1)?;
    assert!(dispatch.readdir(&req, &fid).await?.is_some());
    assert!(!fid.is_reclaimed());
    assert!(dispatch.fids().get(3)?.is_reclaimed());
    assert_eq!(dispatch.watermark().count(), 1);
    drop(fid);

    // An explicit pass takes everything idle
    assert_eq!(dispatch.reclaim().await, 1);
    assert_eq!(dispatch.watermark().count(), 0);

    // Closing a reclaimed fid has no descriptor to give back
    let fid = dispatch.fids().get(3)?;
    dispatch.closedir(&req, &fid).await?;
    assert!(!fid.is_open());
    assert_eq!(dispatch.watermark().count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_reopen_never_leaves_count_above_high_water() -> io::Result<()> {
    let (dispatch, _temp_dir) = local_dispatch(SecurityModel::None, &["d1", "d2"], 1)?;
    let req = Request::new();

    let d1 = dispatch.fids().insert(1, lpath("d1"))?;
    dispatch.opendir(&req, &d1).await?;
    drop(d1);

    let d2 = dispatch.fids().insert(2, lpath("d2"))?;
    dispatch.opendir(&req, &d2).await?;
    drop(d2);
    assert!(dispatch.fids().get(1)?.is_reclaimed());

    let d1 = dispatch.fids().get(1)?;
    dispatch.telldir(&req, &d1).await?;
    assert!(dispatch.fids().get(2)?.is_reclaimed());
    assert!(dispatch.watermark().count() <= dispatch.watermark().high_water());

    Ok(())
}

#[tokio::test]
async fn test_held_fid_is_not_reclaimed() -> io::Result<()> {
    let (dispatch, _temp_dir) = local_dispatch(SecurityModel::None, &["d1"], 8)?;
    let fid = dispatch.fids().insert(1, lpath("d1"))?;
    dispatch.opendir(&Request::new(), &fid).await?;

    assert_eq!(dispatch.reclaim().await, 0);
    assert!(!fid.is_reclaimed());

    drop(fid);
    assert_eq!(dispatch.reclaim().await, 1);

    Ok(())
}

#[tokio::test]
async fn test_reclaimed_dir_resumes_position() -> io::Result<()> {
    let (dispatch, temp_dir) = local_dispatch(SecurityModel::None, &["dir"], 8)?;
    for entry in ["a", "b", "c"] {
        fs::write(temp_dir.path().join("dir").join(entry), b"")?;
    }
    let req = Request::new();

    let fid = dispatch.fids().insert(1, lpath("dir"))?;
    dispatch.opendir(&req, &fid).await?;

    let mut seen = BTreeSet::new();
    for _ in 0..2 {
        let entry = dispatch.readdir(&req, &fid).await?.unwrap();
        seen.insert(entry.name);
    }
    drop(fid);

    assert_eq!(dispatch.reclaim().await, 1);

    // The stream continues where it stopped
    let fid = dispatch.fids().get(1)?;
    while let Some(entry) = dispatch.readdir(&req, &fid).await? {
        assert!(seen.insert(entry.name));
    }
    assert_eq!(seen.len(), 5);

    Ok(())
}

#[tokio::test]
async fn test_renameat_moves_fid_paths() -> io::Result<()> {
    let (dispatch, temp_dir) = local_dispatch(SecurityModel::MappedFile, &["a/x"], 8)?;
    let req = Request::new();

    let root = dispatch.fids().insert(0, LogicalPath::root())?;
    let inner = dispatch.fids().insert(1, lpath("a/x"))?;
    let other = dispatch.fids().insert(2, lpath("ab"))?;

    dispatch
        .renameat(&req, &root, &name("a"), &root, &name("b"))
        .await?;

    assert!(temp_dir.path().join("b/x").is_dir());
    assert_eq!(inner.path().as_bytes(), b"//b/x");
    assert_eq!(other.path().as_bytes(), b"/ab");

    // The moved fid still resolves
    let st = dispatch.lstat(&req, &inner).await?;
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFDIR);

    Ok(())
}

#[tokio::test]
async fn test_renameat_moves_open_handle_path() -> io::Result<()> {
    let (dispatch, _temp_dir) = local_dispatch(SecurityModel::None, &["old"], 8)?;
    let req = Request::new();

    let root = dispatch.fids().insert(0, LogicalPath::root())?;
    let dir = dispatch.fids().insert(1, lpath("old"))?;
    dispatch.opendir(&req, &dir).await?;
    drop(dir);

    dispatch
        .renameat(&req, &root, &name("old"), &root, &name("new"))
        .await?;
    assert_eq!(dispatch.reclaim().await, 1);

    // Reopening goes through the new path
    let dir = dispatch.fids().get(1)?;
    assert!(dispatch.readdir(&req, &dir).await?.is_some());
    assert_eq!(dir.path().as_bytes(), b"//new");

    Ok(())
}

#[tokio::test]
async fn test_rename_fixup_stays_off_scheduler() -> io::Result<()> {
    let (dispatch, _temp_dir) = local_dispatch(SecurityModel::None, &["old", "other"], 8)?;
    let req = Request::new();

    let root = dispatch.fids().insert(0, LogicalPath::root())?;
    let moved = dispatch.fids().insert(1, lpath("old"))?;
    let other = dispatch.fids().insert(2, lpath("other"))?;
    dispatch.opendir(&req, &moved).await?;

    // Keep the moved fid busy as if a worker were deep in a readdir on it
    let busy = moved.clone();
    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = thread::spawn(move || {
        let _state = busy.lock_state();
        locked_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(500));
    });
    locked_rx.recv().unwrap();

    let started = Instant::now();
    let (name_old, name_new) = (name("old"), name("new"));
    let (renamed, elapsed) = tokio::join!(
        dispatch.renameat(&req, &root, &name_old, &root, &name_new),
        async {
            dispatch.lstat(&req, &other).await.map(drop)?;
            Ok::<_, io::Error>(started.elapsed())
        },
    );

    // Other requests were served while the fix-up waited
    assert!(elapsed? < Duration::from_millis(250));
    renamed?;
    assert_eq!(moved.path().as_bytes(), b"//new");

    holder.join().unwrap();
    Ok(())
}

#[test]
fn test_watermark_saturates() {
    let mark = crate::virtio::p9::FdWatermark::new(2);
    assert!(!mark.opened());
    assert!(!mark.opened());
    assert!(mark.opened());

    mark.reclaimed(10);
    assert_eq!(mark.count(), 0);
    mark.closed();
    assert_eq!(mark.count(), 0);
    assert_eq!(mark.high_water(), 2);
}

#[test]
fn test_neg_errno() {
    assert_eq!(
        io::Error::from_raw_os_error(libc::ENOENT).neg_errno(),
        -libc::ENOENT
    );
    assert_eq!(io::Error::other("no errno").neg_errno(), -libc::EIO);
}
