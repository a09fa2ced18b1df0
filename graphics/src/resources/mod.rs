//! GPU resources.
//!
//! Resources are reference-counted with [`Arc`] and can be shared across threads.
//! Each resource holds a weak reference back to its parent device.
//!
//! [`Arc`]: std::sync::Arc

mod buffer;

pub use buffer::Buffer;
