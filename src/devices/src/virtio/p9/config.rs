//! Export configuration and mount option parsing.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    str::FromStr,
};

use bitflags::bitflags;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Option key selecting the security model.
pub const SECURITY_MODEL_OPT: &str = "security_model";

/// Option key naming the export root.
pub const PATH_OPT: &str = "path";

/// Option key selecting the writeout policy.
pub const WRITEOUT_OPT: &str = "writeout";

/// Upper bound of the default descriptor high-water mark.
const MAX_FD_HIGH_WATER: usize = 400;

const DEFAULT_WORKERS: usize = 4;

/// Message appended to security model errors.
const VALID_MODELS: &str = "valid options are: passthrough, mapped-xattr, mapped-file, none";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How file ownership and mode bits are represented on the host.
///
/// Exactly one model is active for an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityModel {
    /// Ownership and mode are the real host values. Needs privileges to set arbitrary owners.
    Passthrough,

    /// Ownership and mode live in `user.virtfs.*` extended attributes.
    MappedXattr,

    /// Ownership and mode live in text files under `.virtfs_metadata`.
    MappedFile,

    /// Like passthrough, but ownership changes that fail are ignored.
    None,
}

bitflags! {
    /// Independent export features, orthogonal to the security model.
    #[derive(Default)]
    pub struct ExportFlags: u32 {
        /// Start writeback of dirty pages right after every write.
        const IMMEDIATE_WRITEOUT = 0x1;
    }
}

/// Configuration of one exported directory tree.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// The host directory made available to the guest.
    pub root_dir: PathBuf,

    /// The security model. See [`SecurityModel`].
    pub security_model: SecurityModel,

    /// Independent feature flags.
    ///
    /// The default is no flags.
    pub flags: ExportFlags,
}

/// Sizing of the worker dispatch bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Number of blocking worker threads.
    pub workers: usize,

    /// Open descriptor count above which idle descriptors are reclaimed.
    ///
    /// Defaults to a third of the soft `RLIMIT_NOFILE`, capped at 400.
    pub fd_high_water: usize,
}

/// Errors raised while validating mount options. A failed parse never produces a config.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `security_model` was not given.
    #[error("security model not specified, local fs needs security model ({VALID_MODELS})")]
    MissingSecurityModel,

    /// `security_model` named an unknown model.
    #[error("invalid security model {0:?} specified ({VALID_MODELS})")]
    InvalidSecurityModel(String),

    /// `path` was not given or was empty.
    #[error("no export path specified")]
    MissingPath,

    /// `writeout` was given with a value other than `immediate`.
    #[error("invalid writeout policy {0:?}, only \"immediate\" is supported")]
    InvalidWriteout(String),
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Read-only view over validated mount options.
pub trait OptionLookup {
    /// Returns the value of option `key`, if present.
    fn lookup(&self, key: &str) -> Option<&str>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SecurityModel {
    /// Whether ownership is stored out of band rather than on the real object.
    pub fn is_mapped(self) -> bool {
        matches!(self, SecurityModel::MappedXattr | SecurityModel::MappedFile)
    }

    /// Returns the canonical option keyword for this model.
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityModel::Passthrough => "passthrough",
            SecurityModel::MappedXattr => "mapped-xattr",
            SecurityModel::MappedFile => "mapped-file",
            SecurityModel::None => "none",
        }
    }
}

impl ExportConfig {
    /// Creates a config for `root_dir` with no feature flags.
    pub fn new(root_dir: impl Into<PathBuf>, security_model: SecurityModel) -> Self {
        Self {
            root_dir: root_dir.into(),
            security_model,
            flags: ExportFlags::empty(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds an [`ExportConfig`] from mount options.
///
/// `security_model` and a non-empty `path` are required; `writeout=immediate` is optional.
pub fn parse_config(opts: &dyn OptionLookup) -> Result<ExportConfig, ConfigError> {
    let security_model = opts
        .lookup(SECURITY_MODEL_OPT)
        .ok_or(ConfigError::MissingSecurityModel)?
        .parse::<SecurityModel>()?;

    let root_dir = match opts.lookup(PATH_OPT) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => return Err(ConfigError::MissingPath),
    };

    let mut flags = ExportFlags::empty();
    if let Some(writeout) = opts.lookup(WRITEOUT_OPT) {
        if writeout != "immediate" {
            return Err(ConfigError::InvalidWriteout(writeout.to_string()));
        }
        flags |= ExportFlags::IMMEDIATE_WRITEOUT;
    }

    Ok(ExportConfig {
        root_dir,
        security_model,
        flags,
    })
}

/// Derives the default descriptor high-water mark from the process descriptor limit.
pub fn default_fd_high_water() -> usize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } < 0 {
        log::warn!(
            "getrlimit(RLIMIT_NOFILE) failed: {}",
            std::io::Error::last_os_error()
        );
        return MAX_FD_HIGH_WATER;
    }

    let third = usize::try_from(rlim.rlim_cur / 3).unwrap_or(usize::MAX);
    third.clamp(1, MAX_FD_HIGH_WATER)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            workers: DEFAULT_WORKERS,
            fd_high_water: default_fd_high_water(),
        }
    }
}

impl FromStr for SecurityModel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passthrough" => Ok(SecurityModel::Passthrough),
            "mapped" | "mapped-xattr" => Ok(SecurityModel::MappedXattr),
            "mapped-file" => Ok(SecurityModel::MappedFile),
            "none" => Ok(SecurityModel::None),
            other => Err(ConfigError::InvalidSecurityModel(other.to_string())),
        }
    }
}

impl fmt::Display for SecurityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            root_dir: PathBuf::from("/"),
            security_model: SecurityModel::MappedXattr,
            flags: ExportFlags::empty(),
        }
    }
}

impl OptionLookup for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl OptionLookup for BTreeMap<String, String> {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl OptionLookup for &[(&str, &str)] {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
