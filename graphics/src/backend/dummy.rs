//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't talk to a GPU. Buffers live in host memory so that
//! tests can inspect exactly what the render tasks uploaded, and fences are
//! signaled as soon as they are created since there is no GPU timeline.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::GraphicsError;
use crate::types::{BufferBinding, BufferBindingKind, BufferDescriptor, BufferUsage};

use super::{GpuBackend, GpuBuffer, GpuFence};

#[derive(Debug)]
struct DummyBuffer {
    label: Option<String>,
    usage: BufferUsage,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct DummyState {
    next_id: u64,
    buffers: HashMap<u64, DummyBuffer>,
    bindings: HashMap<(BufferBindingKind, u32), (GpuBuffer, BufferBinding)>,
    fences: HashMap<u64, bool>,
    write_count: usize,
}

impl DummyState {
    fn buffer(&self, buffer: GpuBuffer) -> Result<&DummyBuffer, GraphicsError> {
        self.buffers.get(&buffer.raw()).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("unknown buffer {}", buffer.raw()))
        })
    }

    fn buffer_mut(&mut self, buffer: GpuBuffer) -> Result<&mut DummyBuffer, GraphicsError> {
        self.buffers.get_mut(&buffer.raw()).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("unknown buffer {}", buffer.raw()))
        })
    }
}

fn checked_range(len: usize, offset: u64, size: u64) -> Result<std::ops::Range<usize>, GraphicsError> {
    let start = offset as usize;
    let end = start.checked_add(size as usize).filter(|end| *end <= len);
    match end {
        Some(end) => Ok(start..end),
        None => Err(GraphicsError::InvalidParameter(format!(
            "range offset={offset} size={size} exceeds buffer size {len}"
        ))),
    }
}

/// Dummy GPU backend.
#[derive(Debug, Default)]
pub struct DummyBackend {
    state: Mutex<DummyState>,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of a buffer's current contents.
    pub fn buffer_contents(&self, buffer: GpuBuffer) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer.raw())
            .map(|b| b.data.clone())
    }

    /// Label a buffer was created with.
    pub fn buffer_label(&self, buffer: GpuBuffer) -> Option<String> {
        self.state
            .lock()
            .buffers
            .get(&buffer.raw())
            .and_then(|b| b.label.clone())
    }

    /// Usage a buffer was created with.
    pub fn buffer_usage(&self, buffer: GpuBuffer) -> Option<BufferUsage> {
        self.state.lock().buffers.get(&buffer.raw()).map(|b| b.usage)
    }

    /// Buffer currently bound at a binding point.
    pub fn bound_buffer(
        &self,
        kind: BufferBindingKind,
        point: u32,
    ) -> Option<(GpuBuffer, BufferBinding)> {
        self.state.lock().bindings.get(&(kind, point)).copied()
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of `write_buffer` calls so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().write_count
    }

    /// Overwrite buffer memory as if a GPU kernel had written it.
    pub fn simulate_gpu_write(
        &self,
        buffer: GpuBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        let target = state.buffer_mut(buffer)?;
        let range = checked_range(target.data.len(), offset, data.len() as u64)?;
        target.data[range].copy_from_slice(data);
        Ok(())
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.buffers.insert(
            id,
            DummyBuffer {
                label: descriptor.label.clone(),
                usage: descriptor.usage,
                data: vec![0; descriptor.size as usize],
            },
        );
        Ok(GpuBuffer::from_raw(id))
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        log::trace!("DummyBackend: destroying buffer {}", buffer.raw());
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.raw());
        state.bindings.retain(|_, (bound, _)| *bound != buffer);
    }

    fn write_buffer(
        &self,
        buffer: GpuBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        log::trace!(
            "DummyBackend: write_buffer offset={} len={}",
            offset,
            data.len()
        );
        let mut state = self.state.lock();
        let target = state.buffer_mut(buffer)?;
        let range = checked_range(target.data.len(), offset, data.len() as u64)?;
        target.data[range].copy_from_slice(data);
        state.write_count += 1;
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: GpuBuffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        log::trace!("DummyBackend: read_buffer offset={} size={}", offset, size);
        let state = self.state.lock();
        let source = state.buffer(buffer)?;
        let range = checked_range(source.data.len(), offset, size)?;
        Ok(source.data[range].to_vec())
    }

    fn copy_buffer(
        &self,
        source: GpuBuffer,
        source_offset: u64,
        destination: GpuBuffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        let bytes = {
            let src = state.buffer(source)?;
            let range = checked_range(src.data.len(), source_offset, size)?;
            src.data[range].to_vec()
        };
        let dst = state.buffer_mut(destination)?;
        let range = checked_range(dst.data.len(), destination_offset, size)?;
        dst.data[range].copy_from_slice(&bytes);
        Ok(())
    }

    fn clear_buffer(
        &self,
        buffer: GpuBuffer,
        offset: u64,
        size: u64,
        pattern: [u8; 16],
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        let target = state.buffer_mut(buffer)?;
        let range = checked_range(target.data.len(), offset, size)?;
        for (i, byte) in target.data[range].iter_mut().enumerate() {
            *byte = pattern[i % 16];
        }
        Ok(())
    }

    fn bind_buffer(&self, buffer: GpuBuffer, binding: BufferBinding) {
        log::trace!(
            "DummyBackend: bind buffer {} to {:?} {}",
            buffer.raw(),
            binding.kind,
            binding.point
        );
        self.state
            .lock()
            .bindings
            .insert((binding.kind, binding.point), (buffer, binding));
    }

    fn fence_sync(&self) -> GpuFence {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        // No GPU timeline: every submitted command is already complete.
        state.fences.insert(id, true);
        GpuFence::from_raw(id)
    }

    fn wait_fence(&self, fence: GpuFence) {
        log::trace!("DummyBackend: wait fence {}", fence.raw());
    }

    fn is_fence_signaled(&self, fence: GpuFence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.raw())
            .copied()
            .unwrap_or(false)
    }

    fn destroy_fence(&self, fence: GpuFence) {
        self.state.lock().fences.remove(&fence.raw());
    }
}

static_assertions::assert_impl_all!(DummyBackend: Send, Sync);
