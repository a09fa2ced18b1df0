//! Graphics device.
//!
//! The [`GraphicsDevice`] owns the backend and is the only way to create GPU
//! buffers. It validates descriptors against [`DeviceCapabilities`], which
//! also feed the block-size limits of parameter blocks and render tasks.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::backend::{GpuBackend, GpuFence, create_backend};
use crate::error::GraphicsError;
use crate::resources::Buffer;
use crate::types::{BufferBinding, BufferDescriptor};

/// Capabilities of a graphics device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCapabilities {
    /// Maximum buffer size.
    pub max_buffer_size: u64,
    /// Maximum size of a bound uniform block in bytes.
    pub max_uniform_block_size: u64,
    /// Maximum size of a bound storage block in bytes.
    pub max_storage_block_size: u64,
    /// Required alignment of uniform range binding offsets.
    pub uniform_offset_alignment: u32,
    /// Required alignment of storage range binding offsets.
    pub storage_offset_alignment: u32,
    /// Whether compute shaders are supported.
    pub compute_shaders: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_buffer_size: 1 << 30, // 1 GB
            max_uniform_block_size: 1 << 16,
            max_storage_block_size: 1 << 27,
            uniform_offset_alignment: 256,
            storage_offset_alignment: 16,
            compute_shaders: true,
        }
    }
}

impl DeviceCapabilities {
    pub fn with_max_uniform_block_size(mut self, size: u64) -> Self {
        self.max_uniform_block_size = size;
        self
    }

    pub fn with_max_storage_block_size(mut self, size: u64) -> Self {
        self.max_storage_block_size = size;
        self
    }

    pub fn with_uniform_offset_alignment(mut self, alignment: u32) -> Self {
        self.uniform_offset_alignment = alignment;
        self
    }

    pub fn with_compute_shaders(mut self, supported: bool) -> Self {
        self.compute_shaders = supported;
        self
    }
}

/// A graphics device for creating GPU buffers.
///
/// # Thread Safety
///
/// `GraphicsDevice` is `Send + Sync`. The render-task structures using it are
/// driven from one render thread, but buffers may be dropped anywhere.
///
/// # Example
///
/// ```
/// use ember_graphics::{BufferDescriptor, BufferUsage, GraphicsDevice};
///
/// let device = GraphicsDevice::dummy();
/// let buffer = device
///     .create_buffer(&BufferDescriptor::new(1024, BufferUsage::STORAGE))
///     .unwrap();
/// assert_eq!(buffer.size(), 1024);
/// ```
pub struct GraphicsDevice {
    backend: Arc<dyn GpuBackend>,
    name: String,
    capabilities: DeviceCapabilities,
    // Track allocated buffers (weak references for cleanup/debugging)
    buffers: RwLock<Vec<Weak<Buffer>>>,
}

impl GraphicsDevice {
    /// Create a device on top of a backend.
    pub fn new(backend: Arc<dyn GpuBackend>, capabilities: DeviceCapabilities) -> Arc<Self> {
        let name = backend.name().to_string();
        log::info!("GraphicsDevice: created on {name}");
        Arc::new(Self {
            backend,
            name,
            capabilities,
            buffers: RwLock::new(Vec::new()),
        })
    }

    /// Create a device on the default backend.
    pub fn with_default_backend(capabilities: DeviceCapabilities) -> Result<Arc<Self>, GraphicsError> {
        Ok(Self::new(create_backend()?, capabilities))
    }

    /// Create a device on a fresh dummy backend with default capabilities.
    pub fn dummy() -> Arc<Self> {
        Self::new(
            Arc::new(crate::backend::dummy::DummyBackend::new()),
            DeviceCapabilities::default(),
        )
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the device capabilities.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Create a GPU buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer size exceeds device limits or allocation fails.
    pub fn create_buffer(
        self: &Arc<Self>,
        descriptor: &BufferDescriptor,
    ) -> Result<Arc<Buffer>, GraphicsError> {
        if descriptor.size > self.capabilities.max_buffer_size {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer size {} exceeds maximum {}",
                descriptor.size, self.capabilities.max_buffer_size
            )));
        }

        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }

        let handle = self.backend.create_buffer(descriptor)?;
        let buffer = Arc::new(Buffer::new(
            Arc::downgrade(self),
            descriptor.clone(),
            handle,
        ));

        let mut buffers = self.buffers.write();
        buffers.retain(|weak| weak.strong_count() > 0);
        buffers.push(Arc::downgrade(&buffer));

        log::trace!(
            "GraphicsDevice: created buffer {:?}, size={}",
            descriptor.label,
            descriptor.size
        );

        Ok(buffer)
    }

    /// Number of buffers created by this device that are still alive.
    pub fn live_buffer_count(&self) -> usize {
        self.buffers
            .read()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Upload bytes into a buffer.
    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        self.backend.write_buffer(buffer.handle(), offset, data)
    }

    /// Read bytes back from a buffer.
    pub fn read_buffer(&self, buffer: &Buffer, offset: u64, size: u64) -> Result<Vec<u8>, GraphicsError> {
        self.backend.read_buffer(buffer.handle(), offset, size)
    }

    /// Copy bytes between two buffers on the GPU timeline.
    pub fn copy_buffer(
        &self,
        source: &Buffer,
        source_offset: u64,
        destination: &Buffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), GraphicsError> {
        self.backend.copy_buffer(
            source.handle(),
            source_offset,
            destination.handle(),
            destination_offset,
            size,
        )
    }

    /// Fill a byte range with a 16 byte pattern on the GPU timeline.
    pub fn clear_buffer(
        &self,
        buffer: &Buffer,
        offset: u64,
        size: u64,
        pattern: [u8; 16],
    ) -> Result<(), GraphicsError> {
        self.backend.clear_buffer(buffer.handle(), offset, size, pattern)
    }

    pub fn bind_buffer(&self, buffer: &Buffer, binding: BufferBinding) {
        self.backend.bind_buffer(buffer.handle(), binding);
    }

    pub fn fence_sync(&self) -> GpuFence {
        self.backend.fence_sync()
    }

    pub fn wait_fence(&self, fence: GpuFence) {
        self.backend.wait_fence(fence);
    }

    pub fn is_fence_signaled(&self, fence: GpuFence) -> bool {
        self.backend.is_fence_signaled(fence)
    }

    pub fn destroy_fence(&self, fence: GpuFence) {
        self.backend.destroy_fence(fence);
    }
}

impl std::fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

// Ensure GraphicsDevice is Send + Sync
static_assertions::assert_impl_all!(GraphicsDevice: Send, Sync);
