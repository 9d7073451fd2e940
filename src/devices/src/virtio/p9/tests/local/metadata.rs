use std::{fs, io, os::unix::fs::MetadataExt};

use crate::virtio::p9::{
    attr::{Credentials, XATTR_MODE, XATTR_UID},
    AttributeStore, FileOperations, SecurityModel,
};

use super::helper;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test]
fn test_shadow_entry_merges_updates() -> io::Result<()> {
    let files = [("file", false, 0o644)];
    let temp_dir = helper::setup_test_dir(&files)?;
    let host = helper::host(&temp_dir.path().join("file"));

    // Set uid, then gid on its own
    AttributeStore::ShadowFile.store(
        &host,
        &Credentials {
            uid: Some(1000),
            ..Default::default()
        },
    )?;
    AttributeStore::ShadowFile.store(
        &host,
        &Credentials {
            gid: Some(2000),
            ..Default::default()
        },
    )?;

    let creds = AttributeStore::ShadowFile.load(&host)?;
    assert_eq!(creds.uid, Some(1000));
    assert_eq!(creds.gid, Some(2000));
    assert_eq!(creds.mode, None);

    let content = fs::read_to_string(temp_dir.path().join(".virtfs_metadata/file"))?;
    assert_eq!(content, "virtfs.uid=1000\nvirtfs.gid=2000\n");

    Ok(())
}

#[test]
fn test_shadow_dir_creation_is_idempotent() -> io::Result<()> {
    let files = [("a", false, 0o644), ("b", false, 0o644)];
    let temp_dir = helper::setup_test_dir(&files)?;

    // Two entries in the same directory share one shadow directory
    for name in ["a", "b"] {
        let host = helper::host(&temp_dir.path().join(name));
        AttributeStore::ShadowFile.store(
            &host,
            &Credentials {
                mode: Some(libc::S_IFREG | 0o600),
                ..Default::default()
            },
        )?;
    }

    let meta = fs::symlink_metadata(temp_dir.path().join(".virtfs_metadata"))?;
    assert!(meta.is_dir());
    assert_eq!(meta.mode() & 0o7777, 0o700);
    assert!(temp_dir.path().join(".virtfs_metadata/a").is_file());
    assert!(temp_dir.path().join(".virtfs_metadata/b").is_file());

    Ok(())
}

#[test]
fn test_missing_shadow_entry_reads_as_unset() -> io::Result<()> {
    let files = [("file", false, 0o644)];
    let temp_dir = helper::setup_test_dir(&files)?;
    let host = helper::host(&temp_dir.path().join("file"));

    assert!(AttributeStore::ShadowFile.load(&host)?.is_empty());

    Ok(())
}

#[test]
fn test_lstat_mapped_file_overlays_partial_entry() -> io::Result<()> {
    let files = [("file", false, 0o640)];
    let (fs, temp_dir) = helper::create_localfs(SecurityModel::MappedFile, &files)?;

    // Only the uid is recorded; everything else comes from the real file
    fs::create_dir(temp_dir.path().join(".virtfs_metadata"))?;
    fs::write(
        temp_dir.path().join(".virtfs_metadata/file"),
        "virtfs.uid=77\n",
    )?;

    let st = fs.lstat(&helper::lpath("file"))?;
    assert_eq!(st.st_uid, 77);
    assert_eq!(st.st_gid, helper::egid());
    assert_eq!(st.st_mode, libc::S_IFREG | 0o640);

    Ok(())
}

#[test]
fn test_lstat_root_has_no_shadow_entry() -> io::Result<()> {
    let (fs, _temp_dir) = helper::create_localfs(SecurityModel::MappedFile, &[])?;

    let st = fs.lstat(&helper::root())?;
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFDIR);
    assert_eq!(st.st_uid, helper::euid());

    // Nothing can be recorded for the root either
    let err = fs.chmod(&helper::root(), 0o700).unwrap_err();
    assert_eq!(helper::errno(err), libc::EINVAL);

    Ok(())
}

#[test]
fn test_chmod_mapped_keeps_file_type() -> io::Result<()> {
    let (fs, temp_dir) = helper::create_localfs(SecurityModel::MappedFile, &[])?;

    fs.symlink(
        c"target",
        &helper::root(),
        &helper::name("link"),
        &helper::creds(1, 1, 0o777),
    )?;

    // A bare permission change must not turn the symlink into something else
    fs.chmod(&helper::lpath("link"), 0o700)?;
    let st = fs.lstat(&helper::lpath("link"))?;
    assert_eq!(st.st_mode, libc::S_IFLNK | 0o700);

    // The host file keeps its private permissions
    let meta = fs::symlink_metadata(temp_dir.path().join("link"))?;
    assert_eq!(meta.mode() & 0o7777, 0o600);

    // A mode with type bits is stored as given
    fs.chmod(&helper::lpath("link"), libc::S_IFREG | 0o644)?;
    let st = fs.lstat(&helper::lpath("link"))?;
    assert_eq!(st.st_mode, libc::S_IFREG | 0o644);

    Ok(())
}

#[test]
fn test_chmod_passthrough_changes_real_mode() -> io::Result<()> {
    let files = [("file", false, 0o644)];
    let (fs, temp_dir) = helper::create_localfs(SecurityModel::Passthrough, &files)?;

    fs.chmod(&helper::lpath("file"), 0o600)?;

    let meta = fs::symlink_metadata(temp_dir.path().join("file"))?;
    assert_eq!(meta.mode() & 0o7777, 0o600);

    Ok(())
}

#[test]
fn test_chown_mapped_file_is_synthetic() -> io::Result<()> {
    let files = [("file", false, 0o644)];
    let (fs, temp_dir) = helper::create_localfs(SecurityModel::MappedFile, &files)?;

    let creds = Credentials {
        uid: Some(4242),
        gid: None,
        mode: Some(0o777),
        rdev: None,
    };
    fs.chown(&helper::lpath("file"), &creds)?;

    // Only ownership is recorded, the real owner is untouched
    let st = fs.lstat(&helper::lpath("file"))?;
    assert_eq!(st.st_uid, 4242);
    assert_eq!(st.st_gid, helper::egid());
    assert_eq!(st.st_mode, libc::S_IFREG | 0o644);
    assert_eq!(
        fs::symlink_metadata(temp_dir.path().join("file"))?.uid(),
        helper::euid()
    );

    Ok(())
}

#[test]
fn test_chown_without_ids_is_real_noop() -> io::Result<()> {
    let files = [("file", false, 0o644)];
    let (fs, temp_dir) = helper::create_localfs(SecurityModel::MappedFile, &files)?;

    fs.chown(&helper::lpath("file"), &Credentials::default())?;
    assert!(!temp_dir.path().join(".virtfs_metadata").exists());

    Ok(())
}

#[test]
fn test_chown_none_ignores_refusal() -> io::Result<()> {
    if helper::is_root() {
        return Ok(());
    }
    let files = [("file", false, 0o644)];
    let (fs, temp_dir) = helper::create_localfs(SecurityModel::None, &files)?;

    let creds = helper::creds(helper::euid() + 1, helper::egid(), 0o644);
    fs.chown(&helper::lpath("file"), &creds)?;

    let meta = fs::symlink_metadata(temp_dir.path().join("file"))?;
    assert_eq!(meta.uid(), helper::euid());

    Ok(())
}

#[test]
fn test_chown_passthrough_reports_refusal() -> io::Result<()> {
    if helper::is_root() {
        return Ok(());
    }
    let files = [("file", false, 0o644)];
    let (fs, _temp_dir) = helper::create_localfs(SecurityModel::Passthrough, &files)?;

    let creds = helper::creds(helper::euid() + 1, helper::egid(), 0o644);
    let err = fs.chown(&helper::lpath("file"), &creds).unwrap_err();
    assert_eq!(helper::errno(err), libc::EPERM);

    Ok(())
}

#[test]
fn test_xattrs_are_little_endian_native_width() -> io::Result<()> {
    let files = [("file", false, 0o644)];
    let temp_dir = helper::setup_test_dir(&files)?;
    if !helper::user_xattrs_supported(temp_dir.path()) {
        return Ok(());
    }
    let host = helper::host(&temp_dir.path().join("file"));

    AttributeStore::Xattr.store(
        &host,
        &Credentials {
            uid: Some(0x0102_0304),
            ..Default::default()
        },
    )?;

    // Read the raw value back
    let mut buf = [0u8; 16];
    let len = unsafe {
        libc::lgetxattr(
            host.as_ptr(),
            XATTR_UID.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    assert_eq!(len, 4);
    assert_eq!(&buf[..4], &[0x04, 0x03, 0x02, 0x01]);

    Ok(())
}

#[test]
fn test_xattr_of_wrong_width_is_ignored() -> io::Result<()> {
    let files = [("file", false, 0o640)];
    let (fs, temp_dir) = helper::create_localfs(SecurityModel::MappedXattr, &files)?;
    if !helper::user_xattrs_supported(temp_dir.path()) {
        return Ok(());
    }
    let host = helper::host(&temp_dir.path().join("file"));

    // Two bytes where four are expected
    let res = unsafe {
        libc::lsetxattr(
            host.as_ptr(),
            XATTR_MODE.as_ptr(),
            [0xffu8, 0xff].as_ptr() as *const libc::c_void,
            2,
            0,
        )
    };
    assert_eq!(res, 0);

    let st = fs.lstat(&helper::lpath("file"))?;
    assert_eq!(st.st_mode, libc::S_IFREG | 0o640);

    Ok(())
}

#[test]
fn test_fstat_overlays_synthetic_credentials() -> io::Result<()> {
    let (fs, _temp_dir) = helper::create_localfs(SecurityModel::MappedFile, &[])?;

    let handle = fs.create(
        &helper::root(),
        &helper::name("file"),
        libc::O_RDWR,
        &helper::creds(321, 654, 0o751),
    )?;

    let st = fs.fstat(&handle)?;
    assert_eq!(st.st_uid, 321);
    assert_eq!(st.st_gid, 654);
    assert_eq!(st.st_mode, libc::S_IFREG | 0o751);
    fs.close(handle)?;

    Ok(())
}

#[test]
fn test_fstat_mapped_xattr_reads_through_descriptor() -> io::Result<()> {
    let (fs, temp_dir) = helper::create_localfs(SecurityModel::MappedXattr, &[])?;
    if !helper::user_xattrs_supported(temp_dir.path()) {
        return Ok(());
    }

    fs.mkdir(&helper::root(), &helper::name("dir"), &helper::creds(9, 9, 0o555))?;
    let handle = fs.opendir(&helper::lpath("dir"))?;

    let st = fs.fstat(&handle)?;
    assert_eq!(st.st_uid, 9);
    assert_eq!(st.st_mode, libc::S_IFDIR | 0o555);
    fs.closedir(handle)?;

    Ok(())
}
