use std::fmt;
use std::io;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Result type for virtfs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for virtfs.
#[derive(Debug)]
pub enum Error {
    /// Configuration error.
    Config(ConfigError),

    /// Export build error.
    Build(BuildError),

    /// I/O error.
    Io(io::Error),
}

/// Configuration-related errors.
#[derive(Debug)]
pub enum ConfigError {
    /// No export root was given.
    MissingPath,

    /// No security model was given.
    MissingSecurityModel,

    /// Invalid worker thread count.
    InvalidWorkerCount(usize),

    /// Invalid descriptor high-water mark.
    InvalidFdHighWater(usize),

    /// Mount options were rejected.
    Options(devices::virtio::p9::ConfigError),
}

/// Export build errors.
#[derive(Debug)]
pub enum BuildError {
    /// The export root could not be opened as a directory.
    Root(String),

    /// Backend initialisation failed.
    Init(String),

    /// Failed to start the worker pool.
    Workers(String),
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "configuration error: {}", e),
            Error::Build(e) => write!(f, "build error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingPath => write!(f, "missing export path"),
            ConfigError::MissingSecurityModel => write!(f, "missing security model"),
            ConfigError::InvalidWorkerCount(n) => write!(f, "invalid worker count: {}", n),
            ConfigError::InvalidFdHighWater(n) => {
                write!(f, "invalid descriptor high-water mark: {}", n)
            }
            ConfigError::Options(e) => write!(f, "mount options: {}", e),
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Root(s) => write!(f, "export root: {}", s),
            BuildError::Init(s) => write!(f, "backend init: {}", s),
            BuildError::Workers(s) => write!(f, "worker pool: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Config(ConfigError::Options(e)) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for BuildError {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<BuildError> for Error {
    fn from(err: BuildError) -> Self {
        Error::Build(err)
    }
}

impl From<devices::virtio::p9::ConfigError> for Error {
    fn from(err: devices::virtio::p9::ConfigError) -> Self {
        Error::Config(ConfigError::Options(err))
    }
}
