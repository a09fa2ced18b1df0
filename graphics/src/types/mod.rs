//! Common types and descriptors for graphics resources.

mod buffer;

pub use buffer::{BufferBinding, BufferBindingKind, BufferDescriptor, BufferUsage};
