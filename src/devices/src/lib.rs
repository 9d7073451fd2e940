//! Virtio device backends for virtfs.
//!
//! The only device implemented here is the host side of a virtio 9P share: the local
//! filesystem backend that maps protocol paths and fids onto a host directory tree.

//--------------------------------------------------------------------------------------------------
// Modules
//--------------------------------------------------------------------------------------------------

pub mod virtio;
