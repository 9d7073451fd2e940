//! Sub-builders used by [`ExportBuilder`](super::ExportBuilder).

use std::path::PathBuf;

use devices::virtio::p9::{DispatchConfig, ExportFlags, SecurityModel};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Builder for the exported directory tree.
#[derive(Debug, Clone, Default)]
pub struct RootBuilder {
    pub(crate) path: Option<PathBuf>,
    pub(crate) security_model: Option<SecurityModel>,
    pub(crate) flags: ExportFlags,
}

/// Builder for the worker dispatch bridge.
#[derive(Debug, Clone)]
pub struct DispatchBuilder {
    pub(crate) workers: usize,
    pub(crate) fd_high_water: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RootBuilder {
    /// Create a new root builder. Path and security model have to be set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host directory to export.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set how ownership and mode bits are stored.
    pub fn security_model(mut self, model: SecurityModel) -> Self {
        self.security_model = Some(model);
        self
    }

    /// Start writeback right after every write.
    pub fn writeout_immediate(mut self, enabled: bool) -> Self {
        self.flags.set(ExportFlags::IMMEDIATE_WRITEOUT, enabled);
        self
    }
}

impl DispatchBuilder {
    /// Create a new dispatch builder.
    ///
    /// Defaults:
    /// - 4 worker threads
    /// - High-water mark derived from `RLIMIT_NOFILE`
    pub fn new() -> Self {
        let DispatchConfig {
            workers,
            fd_high_water,
        } = DispatchConfig::default();
        Self {
            workers,
            fd_high_water,
        }
    }

    /// Set the number of blocking worker threads.
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Set the open descriptor count above which idle descriptors are reclaimed.
    pub fn fd_high_water(mut self, count: usize) -> Self {
        self.fd_high_water = count;
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DispatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}
