//! Buffer types and descriptors.

use bitflags::bitflags;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be bound as a uniform block.
        const UNIFORM = 1 << 0;
        /// Buffer can be bound as a shader storage block.
        const STORAGE = 1 << 1;
        /// Buffer can be bound as an atomic counter buffer.
        const ATOMIC_COUNTER = 1 << 2;
        /// Buffer can be used for indirect dispatch or draw arguments.
        const INDIRECT = 1 << 3;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 4;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 5;
        /// Buffer is mappable for CPU read.
        const MAP_READ = 1 << 6;
        /// Buffer is mappable for CPU write.
        const MAP_WRITE = 1 << 7;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Binding target for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferBindingKind {
    Uniform,
    Storage,
    AtomicCounter,
    DispatchIndirect,
}

/// A buffer binding: target, binding point and byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub kind: BufferBindingKind,
    pub point: u32,
    pub offset: u64,
    /// Size of the bound range, `None` for the whole buffer.
    pub size: Option<u64>,
}

impl BufferBinding {
    /// Bind the whole buffer.
    pub fn whole(kind: BufferBindingKind, point: u32) -> Self {
        Self {
            kind,
            point,
            offset: 0,
            size: None,
        }
    }

    /// Bind a byte range.
    pub fn range(kind: BufferBindingKind, point: u32, offset: u64, size: u64) -> Self {
        Self {
            kind,
            point,
            offset,
            size: Some(size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_descriptor_builder() {
        let desc = BufferDescriptor::new(256, BufferUsage::STORAGE | BufferUsage::COPY_DST)
            .with_label("world elements");
        assert_eq!(desc.size, 256);
        assert!(desc.usage.contains(BufferUsage::STORAGE));
        assert_eq!(desc.label.as_deref(), Some("world elements"));
    }

    #[test]
    fn test_binding_whole_has_no_size() {
        let binding = BufferBinding::whole(BufferBindingKind::Uniform, 3);
        assert_eq!(binding.offset, 0);
        assert_eq!(binding.size, None);
    }
}
