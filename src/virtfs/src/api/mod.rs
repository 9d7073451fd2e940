//! Native Rust API for virtfs.
//!
//! This module provides a builder-pattern API for mounting a host directory as a 9P
//! export, using nested builders for organized configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use virtfs::{ExportBuilder, Result, SecurityModel};
//!
//! fn main() -> Result<()> {
//!     let export = ExportBuilder::new()
//!         .root(|r| r.path("/srv/share").security_model(SecurityModel::MappedFile))
//!         .dispatch(|d| d.workers(4).fd_high_water(256))
//!         .build()?;
//!
//!     println!("exported {:?}", export.config().root_dir);
//!     Ok(())
//! }
//! ```

//--------------------------------------------------------------------------------------------------
// Modules
//--------------------------------------------------------------------------------------------------

pub mod builder;
pub mod builders;
pub mod error;
pub mod export;

//--------------------------------------------------------------------------------------------------
// Re-Exports
//--------------------------------------------------------------------------------------------------

pub use builder::ExportBuilder;
pub use builders::{DispatchBuilder, RootBuilder};
pub use error::{BuildError, ConfigError, Error, Result};
pub use export::Export;
