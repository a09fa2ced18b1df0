//! GPU mirror of the world's renderable elements.
//!
//! Every element (component, billboard, light, ...) owns one entry in the
//! element storage block and a consecutive range in the geometry storage
//! block. Compute shaders cull elements and build render tasks from these
//! blocks. Changes are queued and uploaded in [`WorldCompute::prepare`],
//! either element by element or, past a threshold, as a full rewrite.

use std::sync::Arc;

use bitflags::bitflags;
use ember_core::math::{relative_to_origin, DVec3};
use ember_core::UniqueKeyPool;

use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::paramblock::{
    BlockKind, Parameter, ParameterBlock, SharedBlock, SharedBlockElement, StorageKind, ValueType,
};
use crate::render_task::compute::RenderTaskFilter;

/// Stable identifier of a world compute element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementKey(u32);

impl ElementKey {
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Kind of a world compute element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Component,
    Billboard,
    Particles,
    Light,
    PropFieldCluster,
    HeightTerrainSectorCluster,
    Decal,
    EnvironmentMap,
}

impl ElementType {
    /// Type code stored in the low byte of the GPU flags.
    pub fn code(self) -> u32 {
        self as u32
    }
}

bitflags! {
    /// Element flags stored above the type code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ElementFlags: u32 {
        const STATIC = 1 << 0;
        const SKINNED = 1 << 1;
        const CASTS_SHADOW = 1 << 2;
        const NO_CULLING = 1 << 3;
    }
}

/// One drawable geometry of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElementGeometry {
    pub lod: u32,
    pub render_filter: RenderTaskFilter,
    pub skin_texture: u32,
    /// Index of the first pipeline of this geometry's pipeline set.
    pub pipeline_base: u32,
    pub vao: u32,
    pub instance: u32,
    pub spb_instance: u32,
    pub tucs: [u32; 4],
}

/// CPU description of a world compute element.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeElement {
    pub element_type: ElementType,
    /// Opaque owner id, for example the address of the scene object.
    pub owner: u64,
    pub min_extend: DVec3,
    pub max_extend: DVec3,
    pub flags: ElementFlags,
    pub layer_mask: u64,
    pub lod_factors: [f32; 4],
    pub highest_lod: u32,
    pub geometries: Vec<ElementGeometry>,
}

impl ComputeElement {
    pub fn new(element_type: ElementType, owner: u64) -> Self {
        Self {
            element_type,
            owner,
            min_extend: DVec3::zeros(),
            max_extend: DVec3::zeros(),
            flags: ElementFlags::empty(),
            layer_mask: 0,
            lod_factors: [0.0; 4],
            highest_lod: 0,
            geometries: Vec::new(),
        }
    }

    pub fn with_extends(mut self, min_extend: DVec3, max_extend: DVec3) -> Self {
        self.min_extend = min_extend;
        self.max_extend = max_extend;
        self
    }

    pub fn with_flags(mut self, flags: ElementFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_layer_mask(mut self, layer_mask: u64) -> Self {
        self.layer_mask = layer_mask;
        self
    }

    pub fn with_lod(mut self, lod_factors: [f32; 4], highest_lod: u32) -> Self {
        self.lod_factors = lod_factors;
        self.highest_lod = highest_lod;
        self
    }

    pub fn with_geometries(mut self, geometries: Vec<ElementGeometry>) -> Self {
        self.geometries = geometries;
        self
    }

    /// Flags word as stored on the GPU.
    pub fn gpu_flags(&self) -> u32 {
        self.element_type.code() | (self.flags.bits() << 8)
    }

    fn geometry_count(&self) -> u32 {
        self.geometries.len() as u32
    }
}

/// Sizing and update thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldComputeConfig {
    pub initial_element_capacity: u32,
    pub initial_geometry_capacity: u32,
    /// Full element update once this fraction of all elements changed.
    pub element_update_factor: f32,
    pub geometry_update_factor: f32,
    /// Extra entries added whenever a block grows.
    pub element_slack: u32,
    pub geometry_slack: u32,
}

impl Default for WorldComputeConfig {
    fn default() -> Self {
        Self {
            initial_element_capacity: 100,
            initial_geometry_capacity: 500,
            element_update_factor: 0.2,
            geometry_update_factor: 0.25,
            element_slack: 100,
            geometry_slack: 100,
        }
    }
}

impl WorldComputeConfig {
    pub fn with_initial_capacity(mut self, elements: u32, geometries: u32) -> Self {
        self.initial_element_capacity = elements;
        self.initial_geometry_capacity = geometries;
        self
    }

    pub fn with_slack(mut self, elements: u32, geometries: u32) -> Self {
        self.element_slack = elements;
        self.geometry_slack = geometries;
        self
    }
}

/// How the last [`WorldCompute::prepare`] uploaded a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateKind {
    #[default]
    None,
    Partial(usize),
    Full,
}

mod element_param {
    pub const MIN_EXTEND: usize = 0;
    pub const FLAGS: usize = 1;
    pub const MAX_EXTEND: usize = 2;
    pub const UPDATE_INDEX: usize = 3;
    pub const LAYER_MASK: usize = 4;
    pub const FIRST_GEOMETRY: usize = 5;
    pub const GEOMETRY_COUNT: usize = 6;
    pub const LOD_FACTORS: usize = 7;
    pub const HIGHEST_LOD: usize = 8;
    pub const CULL_RESULT: usize = 9;
    pub const LOD_INDEX: usize = 10;
    pub const COUNT: usize = 11;
}

mod geometry_param {
    pub const ELEMENT: usize = 0;
    pub const LOD: usize = 1;
    pub const RENDER_FILTER: usize = 2;
    pub const SKIN_TEXTURE: usize = 3;
    pub const PIPELINE_BASE: usize = 4;
    pub const VAO: usize = 5;
    pub const INSTANCE: usize = 6;
    pub const SPB_INSTANCE: usize = 7;
    pub const TUCS: usize = 8;
    pub const COUNT: usize = 9;
}

#[derive(Debug)]
struct ElementSlot {
    key: ElementKey,
    data: ComputeElement,
    geometries: Option<SharedBlockElement>,
    update_required: bool,
    update_geometries_required: bool,
}

/// Registry of world elements mirrored into GPU storage blocks.
#[derive(Debug)]
pub struct WorldCompute {
    config: WorldComputeConfig,
    keys: UniqueKeyPool,
    /// Key to dense index.
    indices: Vec<Option<u32>>,
    elements: Vec<ElementSlot>,
    reference_position: DVec3,

    ssbo_elements: ParameterBlock,
    geometries: SharedBlock,

    update_elements: Vec<ElementKey>,
    update_geometries: Vec<ElementKey>,
    full_update_limit: usize,
    full_update_geometry_limit: usize,
    force_full_update: bool,
    force_full_update_geometry: bool,

    last_element_update: UpdateKind,
    last_geometry_update: UpdateKind,
}

impl WorldCompute {
    pub fn new(device: Arc<GraphicsDevice>, config: WorldComputeConfig) -> Result<Self, GraphicsError> {
        let mut ssbo_elements = ParameterBlock::new(Arc::clone(&device), BlockKind::Storage(StorageKind::Stream));
        ssbo_elements.set_parameter_count(element_param::COUNT);
        *ssbo_elements.parameter_mut(element_param::MIN_EXTEND)? = Parameter::new(ValueType::Float, 3, 1, 1);
        *ssbo_elements.parameter_mut(element_param::FLAGS)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ssbo_elements.parameter_mut(element_param::MAX_EXTEND)? = Parameter::new(ValueType::Float, 3, 1, 1);
        *ssbo_elements.parameter_mut(element_param::UPDATE_INDEX)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ssbo_elements.parameter_mut(element_param::LAYER_MASK)? = Parameter::new(ValueType::UInt, 2, 1, 1);
        *ssbo_elements.parameter_mut(element_param::FIRST_GEOMETRY)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ssbo_elements.parameter_mut(element_param::GEOMETRY_COUNT)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ssbo_elements.parameter_mut(element_param::LOD_FACTORS)? = Parameter::new(ValueType::Float, 4, 1, 1);
        *ssbo_elements.parameter_mut(element_param::HIGHEST_LOD)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ssbo_elements.parameter_mut(element_param::CULL_RESULT)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ssbo_elements.parameter_mut(element_param::LOD_INDEX)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        ssbo_elements.map_to_std140()?;
        ssbo_elements.set_element_count(config.initial_element_capacity.max(1))?;
        ssbo_elements.set_label("world compute elements");

        let mut ssbo_geometries = ParameterBlock::new(device, BlockKind::Storage(StorageKind::Stream));
        ssbo_geometries.set_parameter_count(geometry_param::COUNT);
        for index in geometry_param::ELEMENT..geometry_param::TUCS {
            *ssbo_geometries.parameter_mut(index)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        }
        *ssbo_geometries.parameter_mut(geometry_param::TUCS)? = Parameter::new(ValueType::UInt, 4, 1, 1);
        ssbo_geometries.map_to_std140()?;
        ssbo_geometries.set_element_count(config.initial_geometry_capacity.max(1))?;
        ssbo_geometries.set_label("world compute geometries");

        Ok(Self {
            config,
            keys: UniqueKeyPool::new(),
            indices: Vec::new(),
            elements: Vec::new(),
            reference_position: DVec3::zeros(),
            ssbo_elements,
            geometries: SharedBlock::new(ssbo_geometries),
            update_elements: Vec::new(),
            update_geometries: Vec::new(),
            full_update_limit: 0,
            full_update_geometry_limit: 0,
            force_full_update: false,
            force_full_update_geometry: false,
            last_element_update: UpdateKind::None,
            last_geometry_update: UpdateKind::None,
        })
    }

    pub fn config(&self) -> &WorldComputeConfig {
        &self.config
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn element(&self, key: ElementKey) -> Option<&ComputeElement> {
        self.element_index(key).map(|index| &self.elements[index as usize].data)
    }

    /// Dense GPU index of the element.
    pub fn element_index(&self, key: ElementKey) -> Option<u32> {
        self.indices.get(key.0 as usize).copied().flatten()
    }

    /// Keys of all elements in GPU order.
    pub fn keys(&self) -> impl Iterator<Item = ElementKey> + '_ {
        self.elements.iter().map(|slot| slot.key)
    }

    pub fn reference_position(&self) -> DVec3 {
        self.reference_position
    }

    /// Move the floating origin. Element extends are stored relative to it,
    /// so a change rewrites all elements.
    pub fn set_reference_position(&mut self, position: DVec3) {
        if position == self.reference_position {
            return;
        }
        self.reference_position = position;
        self.force_full_update = true;
    }

    pub fn ssbo_elements(&self) -> &ParameterBlock {
        &self.ssbo_elements
    }

    pub fn geometry_block(&self) -> &SharedBlock {
        &self.geometries
    }

    /// Geometry entries up to the last used one.
    pub fn geometry_count(&self) -> u32 {
        self.geometries.element_count() - self.geometries.free_element_count_at_end()
    }

    pub fn last_element_update(&self) -> UpdateKind {
        self.last_element_update
    }

    pub fn last_geometry_update(&self) -> UpdateKind {
        self.last_geometry_update
    }

    /// First geometry entry and geometry count of the element.
    pub fn geometry_range(&self, key: ElementKey) -> Option<(u32, u32)> {
        let slot = &self.elements[self.element_index(key)? as usize];
        Some(
            slot.geometries
                .as_ref()
                .map_or((0, 0), |range| (range.index(), slot.data.geometry_count())),
        )
    }

    pub fn add_element(&mut self, element: ComputeElement) -> Result<ElementKey, GraphicsError> {
        let key = ElementKey(self.keys.get());
        let index = self.elements.len() as u32;
        let slot_index = key.0 as usize;
        if slot_index >= self.indices.len() {
            self.indices.resize(slot_index + 1, None);
        }
        self.indices[slot_index] = Some(index);

        log::trace!(
            "WorldCompute: add {:?} {:?} at {index} ({} geometries)",
            element.element_type,
            key,
            element.geometries.len()
        );
        self.elements.push(ElementSlot {
            key,
            data: element,
            geometries: None,
            update_required: false,
            update_geometries_required: false,
        });
        self.mark_update(index as usize);
        self.mark_update_geometries(index as usize);
        Ok(key)
    }

    /// Replace the element's bounds, flags and LOD data. Geometries are kept.
    pub fn update_element(&mut self, key: ElementKey, mut element: ComputeElement) -> Result<(), GraphicsError> {
        let index = self.require_index(key)? as usize;
        let slot = &mut self.elements[index];
        element.geometries = std::mem::take(&mut slot.data.geometries);
        slot.data = element;
        self.mark_update(index);
        Ok(())
    }

    pub fn update_element_geometries(
        &mut self,
        key: ElementKey,
        geometries: Vec<ElementGeometry>,
    ) -> Result<(), GraphicsError> {
        let index = self.require_index(key)? as usize;
        self.elements[index].data.geometries = geometries;
        // The element entry holds the geometry count.
        self.mark_update(index);
        self.mark_update_geometries(index);
        Ok(())
    }

    /// Remove the element. The last element moves into its GPU slot.
    pub fn remove_element(&mut self, key: ElementKey) -> Result<ComputeElement, GraphicsError> {
        let index = self.require_index(key)? as usize;
        let mut slot = self.elements.swap_remove(index);
        self.indices[key.0 as usize] = None;
        self.keys.put(key.0)?;

        if let Some(range) = slot.geometries.take() {
            range
                .lock_block()
                .clear_data_uint(range.index(), range.count(), [0; 4])?;
        }

        if index < self.elements.len() {
            let moved = self.elements[index].key;
            self.indices[moved.0 as usize] = Some(index as u32);
            self.mark_update(index);
            self.mark_update_geometries(index);
        }
        log::trace!("WorldCompute: removed {key:?} from {index}");
        Ok(slot.data)
    }

    fn require_index(&self, key: ElementKey) -> Result<u32, GraphicsError> {
        self.element_index(key)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown world compute element {key:?}")))
    }

    fn mark_update(&mut self, index: usize) {
        let slot = &mut self.elements[index];
        if slot.update_required {
            return;
        }
        slot.update_required = true;
        if self.update_elements.len() < self.full_update_limit {
            self.update_elements.push(slot.key);
        } else {
            self.force_full_update = true;
        }
    }

    fn mark_update_geometries(&mut self, index: usize) {
        let slot = &mut self.elements[index];
        if slot.update_geometries_required {
            return;
        }
        slot.update_geometries_required = true;
        if self.update_geometries.len() < self.full_update_geometry_limit {
            self.update_geometries.push(slot.key);
        } else {
            self.force_full_update_geometry = true;
        }
    }

    /// Upload pending changes.
    pub fn prepare(&mut self) -> Result<(), GraphicsError> {
        self.prepare_geometry_ranges()?;
        self.prepare_elements()?;
        self.prepare_geometries()?;

        let count = self.elements.len() as f32;
        self.full_update_limit = self
            .full_update_limit
            .max((self.config.element_update_factor * count) as usize);
        self.full_update_geometry_limit = self
            .full_update_geometry_limit
            .max((self.config.geometry_update_factor * count) as usize);
        Ok(())
    }

    /// Reallocate geometry ranges of elements whose geometry count changed.
    fn prepare_geometry_ranges(&mut self) -> Result<(), GraphicsError> {
        if self.force_full_update_geometry {
            for index in 0..self.elements.len() {
                if self.elements[index].update_geometries_required {
                    self.check_geometry_count(index)?;
                }
            }
        } else {
            let keys = std::mem::take(&mut self.update_geometries);
            for &key in &keys {
                if let Some(index) = self.element_index(key) {
                    self.check_geometry_count(index as usize)?;
                }
            }
            self.update_geometries = keys;
        }
        Ok(())
    }

    fn check_geometry_count(&mut self, index: usize) -> Result<(), GraphicsError> {
        let slot = &mut self.elements[index];
        let wanted = slot.data.geometry_count();
        let current = slot.geometries.as_ref().map_or(0, SharedBlockElement::count);
        if wanted == current || (wanted > 0 && wanted < current) {
            return Ok(());
        }

        if let Some(range) = slot.geometries.take() {
            range
                .lock_block()
                .clear_data_uint(range.index(), range.count(), [0; 4])?;
        }
        if wanted == 0 {
            return Ok(());
        }

        if let Some(range) = self.geometries.get_element(wanted)? {
            self.elements[index].geometries = Some(range);
            return Ok(());
        }

        let new_count = self.geometries.element_count() + wanted + self.config.geometry_slack;
        log::debug!("WorldCompute: geometry block grows to {new_count}");
        self.geometries.grow(new_count)?;
        self.force_full_update_geometry = true;
        match self.geometries.get_element(wanted)? {
            Some(range) => {
                self.elements[index].geometries = Some(range);
                Ok(())
            }
            None => Err(GraphicsError::Internal(format!(
                "no geometry range of {wanted} after growing to {new_count}"
            ))),
        }
    }

    fn prepare_elements(&mut self) -> Result<(), GraphicsError> {
        let count = self.elements.len() as u32;
        let partial = !self.force_full_update
            && self.update_elements.len() < self.full_update_limit
            && count <= self.ssbo_elements.element_count();

        if partial {
            let keys = std::mem::take(&mut self.update_elements);
            let indices: Vec<u32> = keys.iter().filter_map(|&key| self.element_index(key)).collect();
            if let (Some(&first), Some(&last)) = (indices.iter().min(), indices.iter().max()) {
                let reference = self.reference_position;
                let elements = &self.elements;
                self.ssbo_elements.with_mapped(first, last - first + 1, |block| {
                    for &index in &indices {
                        write_element(block, index, &elements[index as usize], &reference)?;
                    }
                    Ok(())
                })?;
            }
            self.last_element_update = if indices.is_empty() {
                UpdateKind::None
            } else {
                UpdateKind::Partial(indices.len())
            };
            log::trace!("WorldCompute: partial element update of {}", indices.len());
        } else {
            if count > self.ssbo_elements.element_count() {
                let new_count = count + self.config.element_slack;
                log::debug!("WorldCompute: element block grows to {new_count}");
                self.ssbo_elements.set_element_count(new_count)?;
            }
            if count > 0 {
                let reference = self.reference_position;
                let elements = &self.elements;
                self.ssbo_elements.with_mapped(0, count, |block| {
                    for (index, slot) in elements.iter().enumerate() {
                        write_element(block, index as u32, slot, &reference)?;
                    }
                    Ok(())
                })?;
            }
            self.update_elements.clear();
            self.force_full_update = false;
            self.last_element_update = UpdateKind::Full;
            log::trace!("WorldCompute: full element update of {count}");
        }

        for slot in &mut self.elements {
            slot.update_required = false;
        }
        Ok(())
    }

    fn prepare_geometries(&mut self) -> Result<(), GraphicsError> {
        if self.force_full_update_geometry {
            let mut block = self.geometries.lock_block();
            let total = block.element_count();
            block.clear_data_uint(0, total, [0; 4])?;
            let elements = &self.elements;
            block.with_mapped(0, total, |block| {
                for (index, slot) in elements.iter().enumerate() {
                    if let Some(range) = &slot.geometries {
                        write_geometries(block, index as u32, range.index(), range.count(), &slot.data)?;
                    }
                }
                Ok(())
            })?;
            drop(block);
            self.force_full_update_geometry = false;
            self.last_geometry_update = UpdateKind::Full;
            log::trace!("WorldCompute: full geometry update of {}", self.elements.len());
        } else {
            let keys = std::mem::take(&mut self.update_geometries);
            let mut written = 0;
            for key in keys {
                let Some(index) = self.element_index(key) else {
                    continue;
                };
                let slot = &self.elements[index as usize];
                if let Some(range) = &slot.geometries {
                    range.with_mapped(|block, first| {
                        write_geometries(block, index, first, range.count(), &slot.data)
                    })?;
                }
                written += 1;
            }
            self.last_geometry_update = if written == 0 {
                UpdateKind::None
            } else {
                UpdateKind::Partial(written)
            };
        }

        self.update_geometries.clear();
        for slot in &mut self.elements {
            slot.update_geometries_required = false;
        }
        Ok(())
    }

    /// Log the registry state at info level.
    pub fn debug_print(&self) {
        log::info!(
            "WorldCompute: {} elements (block {}), geometries {}/{} ({} empty ranges), limits {}/{}",
            self.elements.len(),
            self.ssbo_elements.element_count(),
            self.geometries.used_element_count(),
            self.geometries.element_count(),
            self.geometries.empty_range_count(),
            self.full_update_limit,
            self.full_update_geometry_limit
        );
    }
}

fn write_element(
    block: &mut ParameterBlock,
    index: u32,
    slot: &ElementSlot,
    reference: &DVec3,
) -> Result<(), GraphicsError> {
    use element_param::*;

    let element = &slot.data;
    let (first_geometry, geometry_count) = slot
        .geometries
        .as_ref()
        .map_or((0, 0), |range| (range.index(), element.geometry_count()));

    block.set_parameter(MIN_EXTEND, index, relative_to_origin(&element.min_extend, reference))?;
    block.set_parameter(FLAGS, index, element.gpu_flags())?;
    block.set_parameter(MAX_EXTEND, index, relative_to_origin(&element.max_extend, reference))?;
    block.set_parameter(UPDATE_INDEX, index, index)?;
    block.set_parameter(
        LAYER_MASK,
        index,
        [element.layer_mask as u32, (element.layer_mask >> 32) as u32],
    )?;
    block.set_parameter(FIRST_GEOMETRY, index, first_geometry)?;
    block.set_parameter(GEOMETRY_COUNT, index, geometry_count)?;
    block.set_parameter(LOD_FACTORS, index, element.lod_factors)?;
    block.set_parameter(HIGHEST_LOD, index, element.highest_lod)?;
    block.set_parameter(CULL_RESULT, index, 0u32)?;
    block.set_parameter(LOD_INDEX, index, 0u32)
}

/// Write the element's geometries into `[first, first + count)`. Entries past
/// the geometry list are zeroed.
fn write_geometries(
    block: &mut ParameterBlock,
    element_index: u32,
    first: u32,
    count: u32,
    element: &ComputeElement,
) -> Result<(), GraphicsError> {
    use geometry_param::*;

    for offset in 0..count {
        let entry = first + offset;
        let (owner, geometry) = match element.geometries.get(offset as usize) {
            Some(geometry) => (element_index, *geometry),
            None => (0, ElementGeometry::default()),
        };
        block.set_parameter(ELEMENT, entry, owner)?;
        block.set_parameter(LOD, entry, geometry.lod)?;
        block.set_parameter(RENDER_FILTER, entry, geometry.render_filter.bits())?;
        block.set_parameter(SKIN_TEXTURE, entry, geometry.skin_texture)?;
        block.set_parameter(PIPELINE_BASE, entry, geometry.pipeline_base)?;
        block.set_parameter(VAO, entry, geometry.vao)?;
        block.set_parameter(INSTANCE, entry, geometry.instance)?;
        block.set_parameter(SPB_INSTANCE, entry, geometry.spb_instance)?;
        block.set_parameter(TUCS, entry, geometry.tucs)?;
    }
    Ok(())
}

static_assertions::assert_impl_all!(WorldCompute: Send, Sync);
