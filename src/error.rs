//! Allocator error type.
//!
//! A small closed enum with a hand-written `Display`, matching
//! `mem::phys::AllocError` / `drivers::nvme::NvmeError` in spirit: no
//! `thiserror`, no `std::error::Error` impl beyond what callers need.

use std::fmt;

/// Failure modes for the public façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Slab growth was refused (ceiling reached and the class is not under
    /// reservation) or the system allocator returned null.
    OutOfMemory,
    /// `set_memlimit` rejected the new ceiling.
    BadValue,
    /// The requested size exceeds the per-item maximum.
    TooLarge,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
            AllocError::BadValue => write!(f, "invalid memory limit"),
            AllocError::TooLarge => write!(f, "requested size exceeds the per-item maximum"),
        }
    }
}

impl std::error::Error for AllocError {}

pub type AllocResult<T> = Result<T, AllocError>;
