//! virtfs - local filesystem backend of a 9P file server.
//!
//! This crate provides a builder-pattern API for exporting a host directory tree under
//! one of four security models, on top of the `virtio::p9` backend of the devices crate.
//!
//! # Example
//!
//! ```rust,no_run
//! use virtfs::{ExportBuilder, FileOperations, Result, SecurityModel};
//!
//! fn main() -> Result<()> {
//!     virtfs::init_logging();
//!
//!     let export = ExportBuilder::new()
//!         .root(|r| r.path("/srv/share").security_model(SecurityModel::MappedXattr))
//!         .build()?;
//!
//!     let st = export.fs().lstat(&virtfs::LogicalPath::root())?;
//!     println!("root mode: {:o}", st.st_mode);
//!     Ok(())
//! }
//! ```

//--------------------------------------------------------------------------------------------------
// Modules
//--------------------------------------------------------------------------------------------------

#[cfg(target_os = "linux")]
pub mod api;

//--------------------------------------------------------------------------------------------------
// Re-Exports
//--------------------------------------------------------------------------------------------------

#[cfg(target_os = "linux")]
pub use api::{
    BuildError, ConfigError, DispatchBuilder, Error, Export, ExportBuilder, Result, RootBuilder,
};

#[cfg(target_os = "linux")]
pub use devices::virtio::p9::{
    Credentials, Dispatch, FileOperations, LocalFs, LogicalPath, OpenHandle, Request,
    SecurityModel,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Installs `env_logger` as the `log` backend, filtered by `RUST_LOG` and `warn` by default.
///
/// Calling it more than once is harmless.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("warn");
    if env_logger::Builder::from_env(env).try_init().is_err() {
        log::debug!("logger already initialised");
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
