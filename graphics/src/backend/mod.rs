//! GPU backend abstraction layer.
//!
//! The render-task code never talks to a driver directly. Everything it needs
//! from the GPU is a handful of buffer operations, a binding call and fences,
//! captured by the [`GpuBackend`] trait. Handles are opaque ids; the backend
//! keeps its own table from id to driver object.
//!
//! # Available Backends
//!
//! - [`dummy::DummyBackend`]: keeps buffer memory on the host and signals
//!   fences immediately. Used for tests and headless tooling.

pub mod dummy;

use std::sync::Arc;

use crate::error::GraphicsError;
use crate::types::{BufferBinding, BufferDescriptor};

/// Handle to a GPU buffer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuBuffer {
    id: u64,
}

impl GpuBuffer {
    /// Wrap a backend-specific buffer id.
    pub fn from_raw(id: u64) -> Self {
        Self { id }
    }

    pub fn raw(&self) -> u64 {
        self.id
    }
}

/// Handle to a GPU fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuFence {
    id: u64,
}

impl GpuFence {
    pub fn from_raw(id: u64) -> Self {
        Self { id }
    }

    pub fn raw(&self) -> u64 {
        self.id
    }
}

/// GPU backend trait for abstracting different GPU APIs.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError>;

    /// Destroy a buffer resource.
    fn destroy_buffer(&self, buffer: GpuBuffer);

    /// Write data to a buffer.
    fn write_buffer(&self, buffer: GpuBuffer, offset: u64, data: &[u8])
    -> Result<(), GraphicsError>;

    /// Read data from a buffer.
    ///
    /// Callers make sure GPU writes are complete (see [`fence_sync`](Self::fence_sync)).
    fn read_buffer(&self, buffer: GpuBuffer, offset: u64, size: u64)
    -> Result<Vec<u8>, GraphicsError>;

    /// Copy a byte range between buffers on the GPU timeline.
    fn copy_buffer(
        &self,
        source: GpuBuffer,
        source_offset: u64,
        destination: GpuBuffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), GraphicsError>;

    /// Fill a byte range with a repeated 16 byte pattern on the GPU timeline.
    fn clear_buffer(
        &self,
        buffer: GpuBuffer,
        offset: u64,
        size: u64,
        pattern: [u8; 16],
    ) -> Result<(), GraphicsError>;

    /// Bind a buffer (range) to a binding point.
    fn bind_buffer(&self, buffer: GpuBuffer, binding: BufferBinding);

    /// Insert a fence after all previously submitted GPU work.
    fn fence_sync(&self) -> GpuFence;

    /// Wait for a fence to be signaled.
    fn wait_fence(&self, fence: GpuFence);

    /// Check if a fence is signaled (non-blocking).
    fn is_fence_signaled(&self, fence: GpuFence) -> bool;

    /// Destroy a fence.
    fn destroy_fence(&self, fence: GpuFence);
}

/// Selects and creates the backend.
pub fn create_backend() -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    log::info!("Using dummy backend");
    Ok(Arc::new(dummy::DummyBackend::new()))
}
