//! Sub-instance index parameter blocks.
//!
//! Every instance of a render task draws its sub-instances with GPU
//! instancing. The shader finds the per-draw parameters through an index
//! list stored in `ivec4` elements of a parameter block. Preparing a render
//! task runs two passes over its instances in the same order:
//!
//! 1. [`InstanceIndexBlocks::assign`] hands each instance a
//!    `(block, first_index)` slot. Uniform blocks roll over to the next block
//!    when an instance would not fit, so no instance crosses a block.
//! 2. [`InstanceIndexBlocks::stage`] records each instance's entries, and
//!    [`InstanceIndexBlocks::flush`] maps every used block once and uploads.

use std::sync::Arc;

use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::paramblock::{BlockKind, Parameter, ParameterBlock, ParameterBlockLayout, StorageKind, ValueType};

/// How sub-instance entries are packed into `ivec4` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstanceIndexPacking {
    /// Four indices per element.
    #[default]
    Index,
    /// Two `(index, flags)` pairs per element.
    IndexFlags,
    /// Eight 16-bit indices per element.
    Short,
}

impl InstanceIndexPacking {
    /// Entries stored in one `ivec4` element.
    pub fn entries_per_element(self) -> u32 {
        match self {
            Self::Index => 4,
            Self::IndexFlags => 2,
            Self::Short => 8,
        }
    }

    /// Elements needed to hold `entries` entries.
    pub fn element_count(self, entries: u32) -> u32 {
        let groups = entries.saturating_sub(1);
        match self {
            Self::Index => groups / 4 + 1,
            Self::IndexFlags => 2 * (groups / 4 + 1),
            Self::Short => groups / 8 + 1,
        }
    }

    /// Most entries a block of `elements` elements can hold.
    fn max_entries(self, elements: u32) -> u32 {
        match self {
            // Pairs are written in groups of two elements.
            Self::IndexFlags => (elements & !1).saturating_mul(2),
            _ => elements.saturating_mul(self.entries_per_element()),
        }
    }
}

/// Kind of block holding the index lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstanceIndexBacking {
    /// Uniform blocks limited by the uniform block size, rolling over.
    #[default]
    Uniform,
    /// One storage block sized to the whole task, used by compute rendering.
    Storage,
}

/// One sub-instance: an index into the instance parameter array plus flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubInstance {
    pub index: u32,
    pub flags: u32,
}

/// Location of an instance's index list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceIndexSlot {
    /// Index of the block in [`InstanceIndexBlocks`].
    pub block: usize,
    /// Entry index of the first sub-instance inside the block.
    pub first_index: u32,
}

/// Layout of instance index blocks: a single `ivec4`.
pub fn instance_index_layout() -> ParameterBlockLayout {
    ParameterBlockLayout::new().with_parameter(Parameter::new(ValueType::Int, 4, 1, 1))
}

/// Pool of instance index blocks reused across frames.
#[derive(Debug)]
pub struct InstanceIndexBlocks {
    device: Arc<GraphicsDevice>,
    backing: InstanceIndexBacking,
    packing: InstanceIndexPacking,
    blocks: Vec<ParameterBlock>,
    used_blocks: usize,
    max_entries: u32,
    first_index: u32,
    staging: Vec<Vec<u32>>,
}

impl InstanceIndexBlocks {
    pub fn new(device: Arc<GraphicsDevice>, backing: InstanceIndexBacking) -> Self {
        Self {
            device,
            backing,
            packing: InstanceIndexPacking::default(),
            blocks: Vec::new(),
            used_blocks: 0,
            max_entries: 0,
            first_index: 0,
            staging: Vec::new(),
        }
    }

    pub fn backing(&self) -> InstanceIndexBacking {
        self.backing
    }

    pub fn packing(&self) -> InstanceIndexPacking {
        self.packing
    }

    /// Entries a single block may hold for the current pass.
    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Blocks used by the last assignment pass.
    pub fn used_block_count(&self) -> usize {
        self.used_blocks
    }

    /// Blocks allocated so far, used or not.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, index: usize) -> Option<&ParameterBlock> {
        self.blocks.get(index)
    }

    /// Start an assignment pass.
    pub fn begin(&mut self, packing: InstanceIndexPacking) {
        let caps = self.device.capabilities();
        let block_size = match self.backing {
            InstanceIndexBacking::Uniform => caps.max_uniform_block_size,
            InstanceIndexBacking::Storage => caps.max_storage_block_size,
        };
        let elements = u32::try_from(block_size / 16).unwrap_or(u32::MAX);

        self.packing = packing;
        self.max_entries = packing.max_entries(elements);
        self.used_blocks = 0;
        self.first_index = 0;
        log::trace!(
            "InstanceIndexBlocks: begin {:?}/{:?}, {} entries per block",
            self.backing,
            packing,
            self.max_entries
        );
    }

    /// Assign a slot for an instance with `count` sub-instances.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the entries of a whole block, which means the
    /// caller's counts are broken.
    pub fn assign(&mut self, count: u32) -> Result<InstanceIndexSlot, GraphicsError> {
        let rollover = match self.backing {
            InstanceIndexBacking::Uniform => {
                self.used_blocks == 0 || self.first_index + count > self.max_entries
            }
            InstanceIndexBacking::Storage => self.used_blocks == 0,
        };
        if rollover {
            self.finish_block()?;
            if self.used_blocks == self.blocks.len() {
                self.create_block()?;
            }
            self.used_blocks += 1;
            self.first_index = 0;
        }

        assert!(
            self.first_index + count <= self.max_entries,
            "instance index overflow: {} + {count} entries exceed {} per block",
            self.first_index,
            self.max_entries
        );

        let slot = InstanceIndexSlot {
            block: self.used_blocks - 1,
            first_index: self.first_index,
        };
        self.first_index += count;
        Ok(slot)
    }

    /// End the assignment pass, sizing the last block.
    pub fn finish(&mut self) -> Result<(), GraphicsError> {
        self.finish_block()
    }

    fn finish_block(&mut self) -> Result<(), GraphicsError> {
        if self.used_blocks == 0 {
            return Ok(());
        }
        let count = self.packing.element_count(self.first_index);
        let block = &mut self.blocks[self.used_blocks - 1];
        if count > block.element_count() {
            log::debug!(
                "InstanceIndexBlocks: block {} grows to {count} elements",
                self.used_blocks - 1
            );
            block.set_element_count(count)?;
        }
        Ok(())
    }

    fn create_block(&mut self) -> Result<(), GraphicsError> {
        let kind = match self.backing {
            InstanceIndexBacking::Uniform => BlockKind::Uniform,
            InstanceIndexBacking::Storage => BlockKind::Storage(StorageKind::Stream),
        };
        let mut block = ParameterBlock::with_layout(Arc::clone(&self.device), kind, instance_index_layout());
        block.map_to_std140()?;
        block.set_label(format!("instance index #{}", self.blocks.len()));
        log::debug!("InstanceIndexBlocks: created block #{}", self.blocks.len());
        self.blocks.push(block);
        Ok(())
    }

    /// Start the write pass.
    pub fn begin_write(&mut self) {
        self.staging.resize_with(self.used_blocks, Vec::new);
        for (staging, block) in self.staging.iter_mut().zip(&self.blocks) {
            staging.clear();
            staging.resize(block.element_count() as usize * 4, 0);
        }
    }

    /// Record the entries of an instance at its slot.
    pub fn stage(&mut self, slot: InstanceIndexSlot, sub_instances: &[SubInstance]) -> Result<(), GraphicsError> {
        let staging = self.staging.get_mut(slot.block).ok_or_else(|| {
            GraphicsError::InvalidState(format!("instance index block {} not staged", slot.block))
        })?;

        for (offset, sub) in sub_instances.iter().enumerate() {
            let entry = (slot.first_index + offset as u32) as usize;
            match self.packing {
                InstanceIndexPacking::Index => staging[entry] = sub.index,
                InstanceIndexPacking::IndexFlags => {
                    staging[entry * 2] = sub.index;
                    staging[entry * 2 + 1] = sub.flags;
                }
                InstanceIndexPacking::Short => {
                    let index = u16::try_from(sub.index).map_err(|_| {
                        GraphicsError::InvalidParameter(format!(
                            "sub-instance index {} does not fit 16 bits",
                            sub.index
                        ))
                    })?;
                    let component = &mut staging[entry / 2];
                    let shift = (entry % 2) * 16;
                    *component = (*component & !(0xffff << shift)) | (u32::from(index) << shift);
                }
            }
        }
        Ok(())
    }

    /// Map each used block once and upload the staged entries.
    pub fn flush(&mut self) -> Result<(), GraphicsError> {
        for (block, staging) in self.blocks.iter_mut().zip(&self.staging) {
            let count = block.element_count();
            block.with_mapped(0, count, |block| {
                for (element, values) in staging.chunks_exact(4).enumerate() {
                    let values = [values[0] as i32, values[1] as i32, values[2] as i32, values[3] as i32];
                    block.set_parameter(0, element as u32, values)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}
