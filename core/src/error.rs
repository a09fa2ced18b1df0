//! Pool error types.

use std::fmt;

/// Errors reported by the allocation-reuse primitives in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The handle refers to a slot that was released or reused since.
    StaleHandle,
    /// A unique key was returned while it was not handed out.
    DoubleReturn(u32),
    /// A unique key was returned that the pool never handed out.
    UnknownKey(u32),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleHandle => write!(f, "stale pool handle"),
            Self::DoubleReturn(key) => write!(f, "unique key {key} returned twice"),
            Self::UnknownKey(key) => write!(f, "unique key {key} was never handed out"),
        }
    }
}

impl std::error::Error for PoolError {}
