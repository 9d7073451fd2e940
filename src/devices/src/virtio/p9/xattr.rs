//! Guest-visible extended attribute backends.

use std::{ffi::CStr, io};

use super::{
    attr::XATTR_PREFIX,
    config::SecurityModel,
    util::{cvt, eopnotsupp},
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Extended attribute handling selected once at init from the security model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrBackend {
    /// Host attributes exposed as they are.
    Native,

    /// Host attributes, minus the `user.virtfs.*` names holding synthetic credentials.
    Mapped,

    /// Every request fails with `EOPNOTSUPP`.
    Unsupported,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl XattrBackend {
    pub fn for_model(model: SecurityModel) -> Self {
        match model {
            SecurityModel::Passthrough | SecurityModel::None => XattrBackend::Native,
            SecurityModel::MappedXattr => XattrBackend::Mapped,
            SecurityModel::MappedFile => XattrBackend::Unsupported,
        }
    }

    /// Reads attribute `name` of `host` into `value`.
    ///
    /// An empty `value` queries the size of the attribute.
    pub fn get(&self, host: &CStr, name: &CStr, value: &mut [u8]) -> io::Result<usize> {
        // Hidden credential attributes read as absent
        if let Err(e) = self.check_name(name) {
            return match self {
                XattrBackend::Mapped => Err(io::Error::from_raw_os_error(libc::ENODATA)),
                _ => Err(e),
            };
        }
        let res = cvt(unsafe {
            libc::lgetxattr(
                host.as_ptr(),
                name.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        })?;
        Ok(res as usize)
    }

    /// Lists the attribute names of `host` as a sequence of nul-terminated strings.
    ///
    /// An empty `value` queries the size of the list.
    pub fn list(&self, host: &CStr, value: &mut [u8]) -> io::Result<usize> {
        match self {
            XattrBackend::Unsupported => Err(eopnotsupp()),
            XattrBackend::Native => list_raw(host, value),
            XattrBackend::Mapped => {
                let size = list_raw(host, &mut [])?;
                let mut all = vec![0u8; size];
                let size = list_raw(host, &mut all)?;
                all.truncate(size);

                let visible: Vec<u8> = all
                    .split_inclusive(|b| *b == 0)
                    .filter(|name| !name.starts_with(XATTR_PREFIX))
                    .flatten()
                    .copied()
                    .collect();

                if value.is_empty() {
                    return Ok(visible.len());
                }
                if value.len() < visible.len() {
                    return Err(io::Error::from_raw_os_error(libc::ERANGE));
                }
                value[..visible.len()].copy_from_slice(&visible);
                Ok(visible.len())
            }
        }
    }

    /// Sets attribute `name` of `host`. `flags` takes `XATTR_CREATE`/`XATTR_REPLACE`.
    pub fn set(&self, host: &CStr, name: &CStr, value: &[u8], flags: i32) -> io::Result<()> {
        self.check_name(name)?;
        cvt(unsafe {
            libc::lsetxattr(
                host.as_ptr(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        })?;
        Ok(())
    }

    /// Removes attribute `name` of `host`.
    pub fn remove(&self, host: &CStr, name: &CStr) -> io::Result<()> {
        self.check_name(name)?;
        cvt(unsafe { libc::lremovexattr(host.as_ptr(), name.as_ptr()) })?;
        Ok(())
    }

    fn check_name(&self, name: &CStr) -> io::Result<()> {
        match self {
            XattrBackend::Unsupported => Err(eopnotsupp()),
            XattrBackend::Mapped if name.to_bytes().starts_with(XATTR_PREFIX) => {
                Err(io::Error::from_raw_os_error(libc::EACCES))
            }
            _ => Ok(()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn list_raw(host: &CStr, value: &mut [u8]) -> io::Result<usize> {
    let res = cvt(unsafe {
        libc::llistxattr(
            host.as_ptr(),
            value.as_mut_ptr() as *mut libc::c_char,
            value.len(),
        )
    })?;
    Ok(res as usize)
}
