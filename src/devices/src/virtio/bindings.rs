//! Host structure aliases shared by the 9P backend.

#![allow(non_camel_case_types)]

pub type stat64 = libc::stat64;
pub type statfs64 = libc::statfs64;

/// Sentinel the 9P protocol uses for "leave this credential field unchanged".
pub const P9_NO_ID: i64 = -1;
