//! Growable list of shared parameter blocks of one layout.

use std::sync::Arc;

use crate::device::GraphicsDevice;
use crate::error::GraphicsError;

use super::block::{BlockKind, ParameterBlock};
use super::layout::ParameterBlockLayout;
use super::shared_block::{SharedBlock, SharedBlockElement};

/// Pool of [`SharedBlock`]s sharing a layout.
///
/// Elements are allocated from the first block with room. When every block
/// is full a new block is created.
#[derive(Debug)]
pub struct SharedSpbList {
    device: Arc<GraphicsDevice>,
    kind: BlockKind,
    layout: ParameterBlockLayout,
    label: Option<String>,
    max_element_count: u32,
    block_element_count: u32,
    blocks: Vec<SharedBlock>,
}

impl SharedSpbList {
    /// Create an empty list.
    ///
    /// The per-block element capacity is the device's block size limit for
    /// `kind` divided by the layout's element stride.
    ///
    /// # Errors
    ///
    /// Fails if the layout has not been mapped.
    pub fn new(
        device: Arc<GraphicsDevice>,
        kind: BlockKind,
        layout: ParameterBlockLayout,
    ) -> Result<Self, GraphicsError> {
        let stride = u64::from(layout.element_stride());
        if !layout.is_mapped() || stride == 0 {
            return Err(GraphicsError::InvalidParameter(
                "shared SPB list needs a mapped layout".to_string(),
            ));
        }
        let caps = device.capabilities();
        let max_size = match kind {
            BlockKind::Uniform => caps.max_uniform_block_size,
            BlockKind::Storage(_) => caps.max_storage_block_size,
            BlockKind::ClientMemory => caps.max_buffer_size,
        };
        let max_element_count = u32::try_from(max_size / stride).unwrap_or(u32::MAX).max(1);

        Ok(Self {
            device,
            kind,
            layout,
            label: None,
            max_element_count,
            block_element_count: max_element_count,
            blocks: Vec::new(),
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Create new blocks with `count` elements instead of the maximum.
    pub fn with_block_element_count(mut self, count: u32) -> Self {
        self.block_element_count = count.clamp(1, self.max_element_count);
        self
    }

    /// Largest element count a single block can hold.
    pub fn max_element_count(&self) -> u32 {
        self.max_element_count
    }

    pub fn layout(&self) -> &ParameterBlockLayout {
        &self.layout
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_at(&self, index: usize) -> Option<&SharedBlock> {
        self.blocks.get(index)
    }

    /// Allocate `count` consecutive elements from the first block with room.
    ///
    /// # Errors
    ///
    /// Fails if `count` is zero or larger than a block can hold.
    pub fn add_element(&mut self, count: u32) -> Result<Arc<SharedBlockElement>, GraphicsError> {
        if count == 0 || count > self.block_element_count {
            return Err(GraphicsError::InvalidParameter(format!(
                "element count {count} outside 1..={}",
                self.block_element_count
            )));
        }

        for block in &self.blocks {
            if let Some(element) = block.get_element(count)? {
                return Ok(Arc::new(element));
            }
        }

        let block = self.create_block()?;
        let element = block.get_element(count)?.ok_or_else(|| {
            GraphicsError::Internal("fresh shared block has no room".to_string())
        })?;
        self.blocks.push(block);
        Ok(Arc::new(element))
    }

    fn create_block(&self) -> Result<SharedBlock, GraphicsError> {
        let mut block = ParameterBlock::with_layout(Arc::clone(&self.device), self.kind, self.layout.clone());
        if let Some(label) = &self.label {
            block.set_label(format!("{label} #{}", self.blocks.len()));
        }
        block.set_element_count(self.block_element_count)?;
        log::debug!(
            "SharedSpbList {:?}: new block #{} with {} elements",
            self.label,
            self.blocks.len(),
            self.block_element_count
        );
        Ok(SharedBlock::new(block))
    }
}
