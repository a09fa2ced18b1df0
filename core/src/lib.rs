//! # Ember Core
//!
//! Allocation-reuse primitives and math aliases shared by the Ember renderer.

pub mod error;
pub mod math;
pub mod pool;
pub mod unique_key;

pub use error::PoolError;
pub use pool::{Arena, Handle, Poolable, PooledList};
pub use unique_key::UniqueKeyPool;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
