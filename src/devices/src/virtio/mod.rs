//! Virtio device implementations.

//--------------------------------------------------------------------------------------------------
// Modules
//--------------------------------------------------------------------------------------------------

pub mod bindings;

#[cfg(target_os = "linux")]
pub mod p9;
