//! Local filesystem backend of the 9P file server.
//!
//! [`LocalFs`] implements the [`FileOperations`] table on top of a host directory, emulating
//! ownership under one of the [`SecurityModel`]s. [`Dispatch`] runs the blocking directory
//! and fid operations of that table on a worker pool for an async request scheduler.

//--------------------------------------------------------------------------------------------------
// Modules
//--------------------------------------------------------------------------------------------------

pub mod attr;
pub mod config;
pub mod dispatch;
pub mod fid;
pub mod file_ops;
pub mod handle;
pub mod local;
pub mod path;
pub mod security;
pub mod xattr;

mod util;

//--------------------------------------------------------------------------------------------------
// Re-Exports
//--------------------------------------------------------------------------------------------------

pub use attr::{AttributeStore, Credentials};
pub use config::{
    parse_config, ConfigError, DispatchConfig, ExportConfig, ExportFlags, OptionLookup,
    SecurityModel,
};
pub use dispatch::{Dispatch, FdWatermark, NegErrno, Request};
pub use fid::{Fid, FidId, FidTable};
pub use file_ops::FileOperations;
pub use handle::{DirEntry, OpenHandle};
pub use local::LocalFs;
pub use path::{HostPath, LogicalPath, PathTranslator, METADATA_DIR};
pub use security::SecurityDispatcher;
pub use xattr::XattrBackend;
