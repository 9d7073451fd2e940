//! Export builder for mounting a host directory using nested builders.

use std::sync::Arc;

use devices::virtio::p9::{
    parse_config, Dispatch, DispatchConfig, ExportConfig, FileOperations, LocalFs, OptionLookup,
};

use super::builders::{DispatchBuilder, RootBuilder};
use super::error::{BuildError, ConfigError, Result};
use super::export::Export;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Builder for creating and initialising an export.
///
/// # Example
///
/// ```rust,no_run
/// use virtfs::{ExportBuilder, SecurityModel};
///
/// let export = ExportBuilder::new()
///     .root(|r| r.path("/srv/share").security_model(SecurityModel::MappedXattr))
///     .dispatch(|d| d.workers(8))
///     .build()
///     .expect("Failed to build export");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExportBuilder {
    root: RootBuilder,
    dispatch: DispatchBuilder,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExportBuilder {
    /// Create a new export builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from `security_model`, `path` and `writeout` mount options.
    pub fn from_options(opts: &dyn OptionLookup) -> Result<Self> {
        let config = parse_config(opts)?;

        let mut root = RootBuilder::new()
            .path(config.root_dir)
            .security_model(config.security_model);
        root.flags = config.flags;

        Ok(Self {
            root,
            dispatch: DispatchBuilder::new(),
        })
    }

    /// Configure the exported directory.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use virtfs::{ExportBuilder, SecurityModel};
    /// ExportBuilder::new()
    ///     .root(|r| r.path("/srv/share").security_model(SecurityModel::MappedFile).writeout_immediate(true));
    /// ```
    pub fn root(mut self, f: impl FnOnce(RootBuilder) -> RootBuilder) -> Self {
        self.root = f(self.root);
        self
    }

    /// Configure the worker dispatch bridge.
    pub fn dispatch(mut self, f: impl FnOnce(DispatchBuilder) -> DispatchBuilder) -> Self {
        self.dispatch = f(self.dispatch);
        self
    }

    /// Validate the configuration without touching the host.
    pub fn config(&self) -> Result<(ExportConfig, DispatchConfig)> {
        let root_dir = match &self.root.path {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => return Err(ConfigError::MissingPath.into()),
        };
        let security_model = self
            .root
            .security_model
            .ok_or(ConfigError::MissingSecurityModel)?;

        if self.dispatch.workers == 0 {
            return Err(ConfigError::InvalidWorkerCount(0).into());
        }
        if self.dispatch.fd_high_water == 0 {
            return Err(ConfigError::InvalidFdHighWater(0).into());
        }

        let export = ExportConfig {
            root_dir,
            security_model,
            flags: self.root.flags,
        };
        let dispatch = DispatchConfig {
            workers: self.dispatch.workers,
            fd_high_water: self.dispatch.fd_high_water,
        };
        Ok((export, dispatch))
    }

    /// Build the export.
    ///
    /// This validates the configuration, opens and initialises the local backend and
    /// starts the worker threads.
    pub fn build(self) -> Result<Export> {
        let (export_config, dispatch_config) = self.config()?;

        let fs = LocalFs::new(export_config).map_err(|e| BuildError::Root(e.to_string()))?;
        fs.init().map_err(|e| BuildError::Init(e.to_string()))?;
        let fs = Arc::new(fs);

        let dispatch = Dispatch::new(fs.clone(), dispatch_config)
            .map_err(|e| BuildError::Workers(e.to_string()))?;

        log::info!(
            "exporting {:?} with the {} security model, {} workers",
            fs.config().root_dir,
            fs.config().security_model,
            dispatch_config.workers
        );

        Ok(Export::new(fs, dispatch))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
