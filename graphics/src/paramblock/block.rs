//! Element-addressable shader parameter block.
//!
//! A [`ParameterBlock`] is an array of `element_count` elements, each laid out
//! by a [`ParameterBlockLayout`]. Writes go through an explicit map / set /
//! unmap cycle: mapping grants exclusive access to an element range, the typed
//! setters write into a CPU shadow copy, and unmapping uploads the mapped
//! bytes to the GPU buffer.
//!
//! # Example
//!
//! ```
//! use ember_graphics::paramblock::{BlockKind, ParameterBlock, ValueType};
//! use ember_graphics::GraphicsDevice;
//!
//! let device = GraphicsDevice::dummy();
//! let mut block = ParameterBlock::new(device, BlockKind::Uniform);
//! block.set_parameter_count(2);
//! block.parameter_mut(0).unwrap().set_all(ValueType::Float, 4, 1, 1);
//! block.parameter_mut(1).unwrap().set_all(ValueType::Int, 1, 1, 1);
//! block.map_to_std140().unwrap();
//! block.set_element_count(8).unwrap();
//!
//! block.map_buffer_element(3).unwrap();
//! block.set_parameter(0, 3, [1.0f32, 0.0, 0.0, 1.0]).unwrap();
//! block.set_parameter(1, 3, 42i32).unwrap();
//! block.unmap_buffer().unwrap();
//! ```

use std::sync::Arc;

use crate::backend::GpuFence;
use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::resources::Buffer;
use crate::types::{BufferBinding, BufferBindingKind, BufferDescriptor, BufferUsage};

use super::layout::ParameterBlockLayout;
use super::parameter::{Parameter, ParameterData};

/// How a storage block is used, which decides mapping rules and buffer usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Written rarely, always as a whole.
    Static,
    /// Written often, any element range.
    Stream,
    /// Written by the GPU and read back by the CPU.
    Read,
    /// Written and read by the GPU only.
    Gpu,
}

/// Backing of a parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Uniform,
    Storage(StorageKind),
    /// CPU memory only, consumed by the submission stage directly.
    ClientMemory,
}

impl BlockKind {
    fn buffer_usage(self) -> BufferUsage {
        match self {
            Self::Uniform => BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            Self::Storage(StorageKind::Read) => {
                BufferUsage::STORAGE
                    | BufferUsage::ATOMIC_COUNTER
                    | BufferUsage::INDIRECT
                    | BufferUsage::COPY_SRC
                    | BufferUsage::COPY_DST
            }
            Self::Storage(_) => {
                BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST
            }
            Self::ClientMemory => BufferUsage::empty(),
        }
    }
}

/// Inclusive element range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ElementRange {
    lower: u32,
    upper: u32,
}

impl ElementRange {
    fn contains(&self, element: u32) -> bool {
        (self.lower..=self.upper).contains(&element)
    }

    fn count(&self) -> u32 {
        self.upper - self.lower + 1
    }
}

/// GPU to CPU read-back staging state of a `Storage(Read)` block.
#[derive(Debug)]
struct Readback {
    staging: Arc<Buffer>,
    fence: Option<GpuFence>,
    element_count: u32,
    data: Vec<u8>,
    mapped: Option<ElementRange>,
}

/// Typed, element-addressable GPU buffer wrapper.
pub struct ParameterBlock {
    device: Arc<GraphicsDevice>,
    kind: BlockKind,
    label: Option<String>,
    layout: ParameterBlockLayout,
    element_count: u32,
    data: Vec<u8>,
    buffer: Option<Arc<Buffer>>,
    mapped: Option<ElementRange>,
    gpu_written: bool,
    readback: Option<Readback>,
}

impl ParameterBlock {
    /// Create an empty block. Define parameters and map the layout before use.
    pub fn new(device: Arc<GraphicsDevice>, kind: BlockKind) -> Self {
        Self::with_layout(device, kind, ParameterBlockLayout::new())
    }

    /// Create a block with a ready layout and one element.
    pub fn with_layout(device: Arc<GraphicsDevice>, kind: BlockKind, layout: ParameterBlockLayout) -> Self {
        let mut block = Self {
            device,
            kind,
            label: None,
            layout,
            element_count: 1,
            data: Vec::new(),
            buffer: None,
            mapped: None,
            gpu_written: false,
            readback: None,
        };
        block.resize_shadow();
        block
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn layout(&self) -> &ParameterBlockLayout {
        &self.layout
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    pub fn set_parameter_count(&mut self, count: usize) {
        self.assert_unmapped("change parameters of");
        self.layout.set_parameter_count(count);
    }

    pub fn parameter_count(&self) -> usize {
        self.layout.parameter_count()
    }

    pub fn parameter(&self, index: usize) -> Result<&Parameter, GraphicsError> {
        self.layout.parameter(index)
    }

    pub fn parameter_mut(&mut self, index: usize) -> Result<&mut Parameter, GraphicsError> {
        self.assert_unmapped("change parameters of");
        self.layout.parameter_mut(index)
    }

    pub fn set_row_major(&mut self, row_major: bool) {
        self.layout.set_row_major(row_major);
    }

    pub fn set_compact(&mut self, compact: bool) {
        self.layout.set_compact(compact);
    }

    /// Binding offset alignment the layout honours, 0 for compact blocks.
    pub fn alignment_requirement(&self) -> u32 {
        if self.layout.compact() {
            return 0;
        }
        let caps = self.device.capabilities();
        match self.kind {
            BlockKind::Uniform => caps.uniform_offset_alignment,
            BlockKind::Storage(_) => caps.storage_offset_alignment,
            BlockKind::ClientMemory => 0,
        }
    }

    pub fn map_to_std140(&mut self) -> Result<(), GraphicsError> {
        self.assert_unmapped("relayout");
        let alignment = self.alignment_requirement();
        self.layout.map_to_std140(alignment)?;
        self.resize_shadow();
        Ok(())
    }

    pub fn map_to_std430(&mut self) -> Result<(), GraphicsError> {
        self.assert_unmapped("relayout");
        let alignment = self.alignment_requirement();
        self.layout.map_to_std430(alignment)?;
        self.resize_shadow();
        Ok(())
    }

    /// Bytes per element.
    pub fn element_stride(&self) -> u32 {
        self.layout.element_stride()
    }

    // -----------------------------------------------------------------------
    // Capacity and buffer
    // -----------------------------------------------------------------------

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Set the number of elements.
    ///
    /// # Errors
    ///
    /// Fails for a zero count.
    pub fn set_element_count(&mut self, count: u32) -> Result<(), GraphicsError> {
        if count == 0 {
            return Err(GraphicsError::InvalidParameter(
                "element count must be at least 1".to_string(),
            ));
        }
        self.assert_unmapped("resize");
        if count != self.element_count {
            self.element_count = count;
            self.resize_shadow();
        }
        Ok(())
    }

    /// Total size in bytes of all elements.
    pub fn buffer_size(&self) -> u64 {
        u64::from(self.layout.element_stride()) * u64::from(self.element_count)
    }

    /// The GPU buffer, if created.
    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffer.as_ref()
    }

    /// Create the GPU buffer if missing or sized differently.
    ///
    /// A recreated buffer starts with the content of the CPU shadow copy.
    pub fn ensure_buffer(&mut self) -> Result<(), GraphicsError> {
        if self.kind == BlockKind::ClientMemory {
            return Ok(());
        }
        self.require_layout()?;
        let size = self.buffer_size();
        if self.buffer.as_ref().is_some_and(|b| b.size() == size) {
            return Ok(());
        }

        let mut descriptor = BufferDescriptor::new(size, self.kind.buffer_usage());
        if let Some(label) = &self.label {
            descriptor = descriptor.with_label(label.clone());
        }
        let buffer = self.device.create_buffer(&descriptor)?;
        self.device.write_buffer(&buffer, 0, &self.data)?;
        log::debug!(
            "ParameterBlock {:?}: buffer (re)created, {} elements x {} bytes",
            self.label,
            self.element_count,
            self.layout.element_stride()
        );
        self.buffer = Some(buffer);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Mapping
    // -----------------------------------------------------------------------

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Map all elements for writing.
    pub fn map_buffer(&mut self) -> Result<(), GraphicsError> {
        self.map_buffer_range(0, self.element_count)
    }

    /// Map a single element for writing.
    pub fn map_buffer_element(&mut self, element: u32) -> Result<(), GraphicsError> {
        self.map_buffer_range(element, 1)
    }

    /// Map `count` elements starting at `element` for writing.
    ///
    /// # Errors
    ///
    /// Fails if the range is empty or out of bounds, if a static storage block
    /// is mapped partially, or if the block is GPU-only.
    ///
    /// # Panics
    ///
    /// Panics if the block is already mapped.
    pub fn map_buffer_range(&mut self, element: u32, count: u32) -> Result<(), GraphicsError> {
        assert!(
            self.mapped.is_none(),
            "parameter block {:?} is already mapped",
            self.label
        );
        self.require_layout()?;
        if count == 0 || element.checked_add(count).is_none_or(|end| end > self.element_count) {
            return Err(GraphicsError::InvalidParameter(format!(
                "map range {element}+{count} outside {} elements",
                self.element_count
            )));
        }
        match self.kind {
            BlockKind::Storage(StorageKind::Gpu) => {
                return Err(GraphicsError::InvalidParameter(
                    "GPU-only storage block cannot be mapped".to_string(),
                ));
            }
            BlockKind::Storage(StorageKind::Static) if count != self.element_count => {
                return Err(GraphicsError::InvalidParameter(
                    "static storage block can only be mapped whole".to_string(),
                ));
            }
            _ => {}
        }

        self.ensure_buffer()?;
        self.mapped = Some(ElementRange {
            lower: element,
            upper: element + count - 1,
        });
        Ok(())
    }

    /// Upload the mapped range and release the mapping.
    pub fn unmap_buffer(&mut self) -> Result<(), GraphicsError> {
        let range = self.mapped.take().ok_or_else(|| {
            GraphicsError::InvalidState("parameter block is not mapped".to_string())
        })?;
        let Some(buffer) = &self.buffer else {
            return Ok(());
        };
        let stride = self.layout.element_stride() as usize;
        let start = range.lower as usize * stride;
        let end = start + range.count() as usize * stride;
        self.device.write_buffer(buffer, start as u64, &self.data[start..end])
    }

    /// Map `count` elements, run `f`, and unmap even if `f` fails.
    pub fn with_mapped<R>(
        &mut self,
        element: u32,
        count: u32,
        f: impl FnOnce(&mut Self) -> Result<R, GraphicsError>,
    ) -> Result<R, GraphicsError> {
        self.map_buffer_range(element, count)?;
        let result = f(self);
        let unmapped = self.unmap_buffer();
        let value = result?;
        unmapped?;
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Typed setters
    // -----------------------------------------------------------------------

    /// Write a value into a parameter of a mapped element.
    pub fn set_parameter<T: ParameterData>(
        &mut self,
        parameter: usize,
        element: u32,
        value: T,
    ) -> Result<(), GraphicsError> {
        self.set_parameter_array(parameter, element, 0, value)
    }

    /// Write a value into one array entry of a parameter of a mapped element.
    pub fn set_parameter_array<T: ParameterData>(
        &mut self,
        parameter: usize,
        element: u32,
        array_index: u32,
        value: T,
    ) -> Result<(), GraphicsError> {
        let range = self.mapped.ok_or_else(|| {
            GraphicsError::InvalidState("parameter block is not mapped".to_string())
        })?;
        if !range.contains(element) {
            return Err(GraphicsError::InvalidParameter(format!(
                "element {element} outside mapped range {}..={}",
                range.lower, range.upper
            )));
        }

        let param = self.layout.parameter(parameter)?;
        if !param.value_type().accepts(T::VALUE_TYPE)
            || param.component_count() != T::COLUMNS
            || param.vector_count() != T::ROWS
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "parameter {parameter} is {}, value is {:?} {}x{}",
                param.type_name(),
                T::VALUE_TYPE,
                T::ROWS,
                T::COLUMNS
            )));
        }
        if array_index >= param.array_count() {
            return Err(GraphicsError::InvalidParameter(format!(
                "array index {array_index} out of range for parameter {parameter} ({})",
                param.array_count()
            )));
        }

        let base = element as usize * self.layout.element_stride() as usize
            + param.offset() as usize
            + array_index as usize * param.array_stride() as usize;
        let vector_stride = param.vector_stride() as usize;
        let transposed = param.is_matrix() && !self.layout.row_major();

        for row in 0..T::ROWS as usize {
            for column in 0..T::COLUMNS as usize {
                let offset = if transposed {
                    base + column * vector_stride + row * 4
                } else {
                    base + row * vector_stride + column * 4
                };
                let bits = value.component_bits(row, column);
                self.data[offset..offset + 4].copy_from_slice(&bits.to_le_bytes());
            }
        }
        Ok(())
    }

    /// CPU shadow copy. For client-memory blocks this is the block's storage.
    pub fn client_data(&self) -> &[u8] {
        &self.data
    }

    // -----------------------------------------------------------------------
    // GPU side operations
    // -----------------------------------------------------------------------

    /// Fill `count` elements starting at `element` with an unsigned pattern.
    pub fn clear_data_uint(&mut self, element: u32, count: u32, values: [u32; 4]) -> Result<(), GraphicsError> {
        let mut pattern = [0u8; 16];
        for (chunk, value) in pattern.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        self.clear_data(element, count, pattern)
    }

    /// Fill `count` elements starting at `element` with a float pattern.
    pub fn clear_data_float(&mut self, element: u32, count: u32, values: [f32; 4]) -> Result<(), GraphicsError> {
        self.clear_data_uint(element, count, values.map(f32::to_bits))
    }

    fn clear_data(&mut self, element: u32, count: u32, pattern: [u8; 16]) -> Result<(), GraphicsError> {
        self.require_range(element, count)?;
        self.ensure_buffer()?;
        let stride = self.layout.element_stride() as usize;
        let start = element as usize * stride;
        let end = start + count as usize * stride;
        for (i, byte) in self.data[start..end].iter_mut().enumerate() {
            *byte = pattern[i % 16];
        }
        if let Some(buffer) = &self.buffer {
            self.device
                .clear_buffer(buffer, start as u64, (end - start) as u64, pattern)?;
        }
        Ok(())
    }

    /// Copy `count` elements from `source` (starting at `source_element`)
    /// to this block (starting at `element`).
    pub fn copy_data(
        &mut self,
        source: &ParameterBlock,
        element: u32,
        count: u32,
        source_element: u32,
    ) -> Result<(), GraphicsError> {
        if source.element_stride() != self.element_stride() {
            return Err(GraphicsError::InvalidParameter(format!(
                "element stride mismatch: {} vs {}",
                source.element_stride(),
                self.element_stride()
            )));
        }
        self.require_range(element, count)?;
        source.require_range(source_element, count)?;
        self.ensure_buffer()?;

        let stride = self.layout.element_stride() as usize;
        let dst = element as usize * stride;
        let src = source_element as usize * stride;
        let len = count as usize * stride;
        self.data[dst..dst + len].copy_from_slice(&source.data[src..src + len]);

        match (&source.buffer, &self.buffer) {
            (Some(from), Some(to)) => {
                self.device
                    .copy_buffer(from, src as u64, to, dst as u64, len as u64)
            }
            (None, Some(to)) => self.device.write_buffer(to, dst as u64, &self.data[dst..dst + len]),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Read back
    // -----------------------------------------------------------------------

    /// Mark the end of GPU writes to a read-back block.
    pub fn gpu_finished_writing(&mut self) -> Result<(), GraphicsError> {
        self.require_read_kind()?;
        self.gpu_written = true;
        Ok(())
    }

    /// Start copying the first `count` elements into CPU-visible memory.
    ///
    /// Arms a fence that [`map_buffer_read`](Self::map_buffer_read) waits on.
    pub fn gpu_read_to_cpu(&mut self, count: u32) -> Result<(), GraphicsError> {
        self.require_read_kind()?;
        self.require_range(0, count)?;
        if !self.gpu_written {
            log::warn!(
                "ParameterBlock {:?}: read back without gpu_finished_writing",
                self.label
            );
        }
        self.ensure_buffer()?;
        let Some(buffer) = self.buffer.clone() else {
            return Err(GraphicsError::Internal("read-back block has no buffer".to_string()));
        };

        let size = u64::from(count) * u64::from(self.layout.element_stride());
        let staging = match self.readback.take() {
            Some(readback) if readback.staging.size() >= size && readback.mapped.is_none() => {
                if let Some(fence) = readback.fence {
                    self.device.destroy_fence(fence);
                }
                readback.staging
            }
            Some(readback) if readback.mapped.is_some() => {
                self.readback = Some(readback);
                return Err(GraphicsError::InvalidState(
                    "read-back memory is still mapped".to_string(),
                ));
            }
            previous => {
                if let Some(fence) = previous.and_then(|r| r.fence) {
                    self.device.destroy_fence(fence);
                }
                let mut descriptor =
                    BufferDescriptor::new(self.buffer_size(), BufferUsage::MAP_READ | BufferUsage::COPY_DST);
                if let Some(label) = &self.label {
                    descriptor = descriptor.with_label(format!("{label} (read back)"));
                }
                self.device.create_buffer(&descriptor)?
            }
        };

        self.device.copy_buffer(&buffer, 0, &staging, 0, size)?;
        let fence = self.device.fence_sync();
        self.readback = Some(Readback {
            staging,
            fence: Some(fence),
            element_count: count,
            data: Vec::new(),
            mapped: None,
        });
        self.gpu_written = false;
        Ok(())
    }

    /// Wait for the read-back fence and map elements for reading.
    ///
    /// # Panics
    ///
    /// Panics if the read-back memory is already mapped.
    pub fn map_buffer_read(&mut self, element: u32, count: u32) -> Result<(), GraphicsError> {
        let stride = u64::from(self.layout.element_stride());
        let device = Arc::clone(&self.device);
        let readback = self.readback.as_mut().ok_or_else(|| {
            GraphicsError::InvalidState("gpu_read_to_cpu was not called".to_string())
        })?;
        assert!(readback.mapped.is_none(), "read-back memory is already mapped");
        if count == 0 || element.checked_add(count).is_none_or(|end| end > readback.element_count) {
            return Err(GraphicsError::InvalidParameter(format!(
                "read range {element}+{count} outside {} read-back elements",
                readback.element_count
            )));
        }

        if let Some(fence) = readback.fence.take() {
            device.wait_fence(fence);
            device.destroy_fence(fence);
        }
        readback.data = device.read_buffer(
            &readback.staging,
            u64::from(element) * stride,
            u64::from(count) * stride,
        )?;
        readback.mapped = Some(ElementRange {
            lower: element,
            upper: element + count - 1,
        });
        Ok(())
    }

    pub fn unmap_buffer_read(&mut self) -> Result<(), GraphicsError> {
        match self.readback.as_mut().and_then(|r| r.mapped.take()) {
            Some(_) => Ok(()),
            None => Err(GraphicsError::InvalidState(
                "read-back memory is not mapped".to_string(),
            )),
        }
    }

    /// Read one unsigned component of a read-mapped element.
    pub fn read_uint(&self, parameter: usize, element: u32, component: u32) -> Result<u32, GraphicsError> {
        let Some((readback, range)) = self
            .readback
            .as_ref()
            .and_then(|r| r.mapped.map(|range| (r, range)))
        else {
            return Err(GraphicsError::InvalidState(
                "read-back memory is not mapped".to_string(),
            ));
        };
        if !range.contains(element) {
            return Err(GraphicsError::InvalidParameter(format!(
                "element {element} outside read range {}..={}",
                range.lower, range.upper
            )));
        }
        let param = self.layout.parameter(parameter)?;
        if component >= param.component_count() * param.vector_count() {
            return Err(GraphicsError::InvalidParameter(format!(
                "component {component} out of range for {}",
                param.type_name()
            )));
        }
        let (_, per_vector) = self.layout.storage_shape(param);
        let offset = (element - range.lower) as usize * self.layout.element_stride() as usize
            + param.offset() as usize
            + (component / per_vector) as usize * param.vector_stride() as usize
            + (component % per_vector) as usize * 4;
        let bytes: [u8; 4] = readback.data[offset..offset + 4]
            .try_into()
            .map_err(|_| GraphicsError::Internal("short read-back data".to_string()))?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_int(&self, parameter: usize, element: u32, component: u32) -> Result<i32, GraphicsError> {
        self.read_uint(parameter, element, component).map(|v| v as i32)
    }

    pub fn read_float(&self, parameter: usize, element: u32, component: u32) -> Result<f32, GraphicsError> {
        self.read_uint(parameter, element, component).map(f32::from_bits)
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    fn binding_kind(&self) -> Result<BufferBindingKind, GraphicsError> {
        match self.kind {
            BlockKind::Uniform => Ok(BufferBindingKind::Uniform),
            BlockKind::Storage(_) => Ok(BufferBindingKind::Storage),
            BlockKind::ClientMemory => Err(GraphicsError::InvalidState(
                "client memory block has no GPU buffer to bind".to_string(),
            )),
        }
    }

    fn bound_buffer(&self) -> Result<&Arc<Buffer>, GraphicsError> {
        self.buffer.as_ref().ok_or_else(|| {
            GraphicsError::InvalidState("parameter block buffer not created".to_string())
        })
    }

    /// Bind the whole block.
    pub fn bind(&self, point: u32) -> Result<(), GraphicsError> {
        let kind = self.binding_kind()?;
        self.device
            .bind_buffer(self.bound_buffer()?, BufferBinding::whole(kind, point));
        Ok(())
    }

    /// Bind a single element. Requires a non-compact layout.
    pub fn bind_element(&self, point: u32, element: u32) -> Result<(), GraphicsError> {
        let kind = self.binding_kind()?;
        if self.layout.compact() {
            return Err(GraphicsError::InvalidState(
                "element binding requires a non-compact layout".to_string(),
            ));
        }
        self.require_range(element, 1)?;
        let stride = u64::from(self.layout.element_stride());
        let size = stride - u64::from(self.layout.offset_padding());
        self.device.bind_buffer(
            self.bound_buffer()?,
            BufferBinding::range(kind, point, u64::from(element) * stride, size),
        );
        Ok(())
    }

    /// Bind the block as an atomic counter buffer.
    pub fn bind_atomic(&self, point: u32) -> Result<(), GraphicsError> {
        self.require_read_kind()?;
        self.device.bind_buffer(
            self.bound_buffer()?,
            BufferBinding::whole(BufferBindingKind::AtomicCounter, point),
        );
        Ok(())
    }

    /// Bind the block as dispatch-indirect argument buffer.
    pub fn bind_dispatch_indirect(&self) -> Result<(), GraphicsError> {
        self.require_read_kind()?;
        self.device.bind_buffer(
            self.bound_buffer()?,
            BufferBinding::whole(BufferBindingKind::DispatchIndirect, 0),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Debug
    // -----------------------------------------------------------------------

    /// Log the layout.
    pub fn debug_print_config(&self, name: &str) {
        log::info!(
            "{name}: {:?} {:?} elements={} stride={} padding={} row_major={}",
            self.kind,
            self.layout.rule(),
            self.element_count,
            self.layout.element_stride(),
            self.layout.offset_padding(),
            self.layout.row_major()
        );
        for (i, param) in self.layout.parameters().iter().enumerate() {
            log::info!(
                "  {i}: {} offset={} vector_stride={} array_stride={} size={}",
                param.type_name(),
                param.offset(),
                param.vector_stride(),
                param.array_stride(),
                param.data_size()
            );
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn assert_unmapped(&self, action: &str) {
        assert!(
            self.mapped.is_none(),
            "cannot {action} parameter block {:?} while mapped",
            self.label
        );
    }

    fn require_layout(&self) -> Result<(), GraphicsError> {
        if self.layout.is_mapped() {
            Ok(())
        } else {
            Err(GraphicsError::InvalidState(
                "parameter block layout not mapped to std140/std430".to_string(),
            ))
        }
    }

    fn require_range(&self, element: u32, count: u32) -> Result<(), GraphicsError> {
        self.require_layout()?;
        if count == 0 || element.checked_add(count).is_none_or(|end| end > self.element_count) {
            return Err(GraphicsError::InvalidParameter(format!(
                "element range {element}+{count} outside {} elements",
                self.element_count
            )));
        }
        Ok(())
    }

    fn require_read_kind(&self) -> Result<(), GraphicsError> {
        if self.kind == BlockKind::Storage(StorageKind::Read) {
            Ok(())
        } else {
            Err(GraphicsError::InvalidState(format!(
                "operation requires a read-back storage block, block is {:?}",
                self.kind
            )))
        }
    }

    fn resize_shadow(&mut self) {
        let size = self.buffer_size() as usize;
        if self.data.len() != size {
            self.data.resize(size, 0);
        }
    }
}

impl std::fmt::Debug for ParameterBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterBlock")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("element_count", &self.element_count)
            .field("element_stride", &self.layout.element_stride())
            .field("mapped", &self.mapped)
            .finish()
    }
}

static_assertions::assert_impl_all!(ParameterBlock: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::device::DeviceCapabilities;
    use crate::paramblock::ValueType;
    use ember_core::math::{Mat4, Vec3};

    fn dummy() -> (Arc<DummyBackend>, Arc<GraphicsDevice>) {
        let backend = Arc::new(DummyBackend::new());
        let device = GraphicsDevice::new(backend.clone(), DeviceCapabilities::default());
        (backend, device)
    }

    fn vec4_int_block(device: Arc<GraphicsDevice>, kind: BlockKind, count: u32) -> ParameterBlock {
        let mut block = ParameterBlock::new(device, kind);
        block.set_parameter_count(2);
        block.parameter_mut(0).unwrap().set_all(ValueType::Float, 4, 1, 1);
        block.parameter_mut(1).unwrap().set_all(ValueType::Int, 1, 1, 1);
        block.map_to_std140().unwrap();
        block.set_element_count(count).unwrap();
        block
    }

    fn word(data: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_element_stride_and_size() {
        let (_, device) = dummy();
        let block = vec4_int_block(device, BlockKind::Uniform, 4);
        assert_eq!(block.element_stride(), 32);
        assert_eq!(block.buffer_size(), 128);
    }

    #[test]
    fn test_zero_element_count_fails() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Uniform, 4);
        assert!(matches!(
            block.set_element_count(0),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_map_write_unmap_uploads_range() {
        let (backend, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Storage(StorageKind::Stream), 4);
        block.map_buffer_range(1, 2).unwrap();
        block.set_parameter(0, 2, [1.0f32, 2.0, 3.0, 4.0]).unwrap();
        block.set_parameter(1, 1, -5i32).unwrap();
        block.unmap_buffer().unwrap();

        let data = backend
            .buffer_contents(block.buffer().unwrap().handle())
            .unwrap();
        assert_eq!(word(&data, 32 + 16), (-5i32) as u32);
        assert_eq!(word(&data, 64), 1.0f32.to_bits());
        assert_eq!(word(&data, 64 + 12), 4.0f32.to_bits());
    }

    #[test]
    fn test_write_outside_mapped_range_fails() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Uniform, 4);
        block.map_buffer_element(1).unwrap();
        let result = block.set_parameter(1, 2, 1i32);
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
        block.unmap_buffer().unwrap();
    }

    #[test]
    fn test_write_without_map_fails() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Uniform, 1);
        assert!(matches!(
            block.set_parameter(1, 0, 1i32),
            Err(GraphicsError::InvalidState(_))
        ));
    }

    #[test]
    fn test_type_mismatch_fails() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Uniform, 1);
        block.map_buffer().unwrap();
        assert!(block.set_parameter(0, 0, 1.0f32).is_err());
        assert!(block.set_parameter(1, 0, 1.0f32).is_err());
        assert!(block.set_parameter(1, 0, 7u32).is_ok());
        block.unmap_buffer().unwrap();
    }

    #[test]
    fn test_array_index_out_of_range_fails() {
        let (_, device) = dummy();
        let mut block = ParameterBlock::new(device, BlockKind::Uniform);
        block.set_parameter_count(1);
        block.parameter_mut(0).unwrap().set_all(ValueType::Float, 3, 1, 2);
        block.map_to_std140().unwrap();
        block.map_buffer().unwrap();
        assert!(block.set_parameter_array(0, 0, 1, Vec3::new(1.0, 2.0, 3.0)).is_ok());
        assert!(block.set_parameter_array(0, 0, 2, Vec3::new(1.0, 2.0, 3.0)).is_err());
        block.unmap_buffer().unwrap();
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn test_double_map_panics() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Uniform, 2);
        block.map_buffer().unwrap();
        let _ = block.map_buffer_element(0);
    }

    #[test]
    fn test_map_out_of_bounds_fails() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Uniform, 2);
        assert!(block.map_buffer_range(1, 2).is_err());
        assert!(block.map_buffer_range(0, 0).is_err());
        assert!(!block.is_mapped());
    }

    #[test]
    fn test_static_storage_maps_whole_only() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Storage(StorageKind::Static), 4);
        assert!(block.map_buffer_element(0).is_err());
        block.map_buffer().unwrap();
        block.unmap_buffer().unwrap();
    }

    #[test]
    fn test_gpu_storage_cannot_map() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Storage(StorageKind::Gpu), 4);
        assert!(block.map_buffer().is_err());
    }

    #[test]
    fn test_column_major_matrix_layout() {
        let (backend, device) = dummy();
        let mut block = ParameterBlock::new(device, BlockKind::Uniform);
        block.set_parameter_count(1);
        block.parameter_mut(0).unwrap().set_all(ValueType::Float, 4, 4, 1);
        block.map_to_std140().unwrap();
        let m = Mat4::new(
            1.0, 2.0, 3.0, 4.0, //
            5.0, 6.0, 7.0, 8.0, //
            9.0, 10.0, 11.0, 12.0, //
            13.0, 14.0, 15.0, 16.0,
        );
        block.map_buffer().unwrap();
        block.set_parameter(0, 0, m).unwrap();
        block.unmap_buffer().unwrap();

        let data = backend
            .buffer_contents(block.buffer().unwrap().handle())
            .unwrap();
        // Second column starts at byte 16: m[(0, 1)] = 2.
        assert_eq!(word(&data, 16), 2.0f32.to_bits());
        assert_eq!(word(&data, 4), 5.0f32.to_bits());
    }

    #[test]
    fn test_client_memory_has_no_buffer() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::ClientMemory, 1);
        block.map_buffer().unwrap();
        block.set_parameter(1, 0, 9i32).unwrap();
        block.unmap_buffer().unwrap();
        assert!(block.buffer().is_none());
        assert_eq!(word(block.client_data(), 16), 9);
        assert!(block.bind(0).is_err());
    }

    #[test]
    fn test_read_back_round() {
        let (backend, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Storage(StorageKind::Read), 2);
        block.ensure_buffer().unwrap();
        let handle = block.buffer().unwrap().handle();
        backend
            .simulate_gpu_write(handle, 32 + 16, &77u32.to_le_bytes())
            .unwrap();

        block.gpu_finished_writing().unwrap();
        block.gpu_read_to_cpu(2).unwrap();
        block.map_buffer_read(1, 1).unwrap();
        assert_eq!(block.read_uint(1, 1, 0).unwrap(), 77);
        assert!(block.read_uint(1, 0, 0).is_err());
        block.unmap_buffer_read().unwrap();
        assert!(block.read_uint(1, 1, 0).is_err());
    }

    #[test]
    fn test_read_back_requires_read_kind() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Storage(StorageKind::Stream), 2);
        assert!(block.gpu_read_to_cpu(1).is_err());
        assert!(block.map_buffer_read(0, 1).is_err());
    }

    #[test]
    fn test_clear_data_uint() {
        let (backend, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Storage(StorageKind::Gpu), 3);
        block.clear_data_uint(1, 2, [1, 2, 3, 4]).unwrap();
        let data = backend
            .buffer_contents(block.buffer().unwrap().handle())
            .unwrap();
        assert_eq!(word(&data, 0), 0);
        assert_eq!(word(&data, 32), 1);
        assert_eq!(word(&data, 36), 2);
        assert_eq!(word(&data, 48), 1);
        assert_eq!(word(&data, 64), 1);
    }

    #[test]
    fn test_copy_data_between_blocks() {
        let (backend, device) = dummy();
        let mut source = vec4_int_block(device.clone(), BlockKind::Storage(StorageKind::Stream), 2);
        source.map_buffer().unwrap();
        source.set_parameter(1, 1, 11i32).unwrap();
        source.unmap_buffer().unwrap();

        let mut target = vec4_int_block(device, BlockKind::Storage(StorageKind::Stream), 4);
        target.copy_data(&source, 3, 1, 1).unwrap();
        let data = backend
            .buffer_contents(target.buffer().unwrap().handle())
            .unwrap();
        assert_eq!(word(&data, 3 * 32 + 16), 11);
    }

    #[test]
    fn test_resize_keeps_shadow_content() {
        let (backend, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Storage(StorageKind::Stream), 1);
        block.map_buffer().unwrap();
        block.set_parameter(1, 0, 3i32).unwrap();
        block.unmap_buffer().unwrap();

        block.set_element_count(4).unwrap();
        block.ensure_buffer().unwrap();
        let data = backend
            .buffer_contents(block.buffer().unwrap().handle())
            .unwrap();
        assert_eq!(data.len(), 128);
        assert_eq!(word(&data, 16), 3);
    }

    #[test]
    fn test_bind_element_needs_non_compact() {
        let (backend, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Uniform, 2);
        block.ensure_buffer().unwrap();
        assert!(block.bind_element(1, 1).is_err());

        block.set_compact(false);
        block.map_to_std140().unwrap();
        block.ensure_buffer().unwrap();
        block.bind_element(1, 1).unwrap();
        let (_, binding) = backend.bound_buffer(BufferBindingKind::Uniform, 1).unwrap();
        assert_eq!(binding.offset, 256);
        assert_eq!(binding.size, Some(32));
    }

    #[test]
    fn test_with_mapped_unmaps_on_error() {
        let (_, device) = dummy();
        let mut block = vec4_int_block(device, BlockKind::Uniform, 2);
        let result = block.with_mapped(0, 1, |b| b.set_parameter(1, 1, 0i32));
        assert!(result.is_err());
        assert!(!block.is_mapped());
    }
}
