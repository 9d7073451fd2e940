//! A mounted export: the local backend and the dispatch bridge serving it.

use std::sync::Arc;

use devices::virtio::p9::{Dispatch, ExportConfig, LocalFs};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An initialised export, ready to serve requests.
pub struct Export {
    fs: Arc<LocalFs>,
    dispatch: Dispatch,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Export {
    pub(crate) fn new(fs: Arc<LocalFs>, dispatch: Dispatch) -> Self {
        Self { fs, dispatch }
    }

    /// The local backend, for synchronous calls through `FileOperations`.
    pub fn fs(&self) -> &Arc<LocalFs> {
        &self.fs
    }

    /// The dispatch bridge, for calls from an async request scheduler.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn config(&self) -> &ExportConfig {
        self.fs.config()
    }
}
