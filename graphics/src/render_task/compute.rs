//! Compute render task.
//!
//! The compute render task builds a flat array of draw steps on the GPU from
//! the world compute geometries. This type only prepares the inputs: a
//! configuration uniform block telling the build kernel what to accept, a
//! step storage block sized to the world geometry count and a counter block
//! the kernel bumps atomically. Devices without compute shaders use
//! [`ComputeRenderTask::build_on_cpu`], which applies the same filters.

use std::sync::Arc;

use bitflags::bitflags;

use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::paramblock::{BlockKind, Parameter, ParameterBlock, StorageKind, ValueType};
use crate::world::{ElementKey, ElementType, WorldCompute};

bitflags! {
    /// Render filter bits of a geometry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderTaskFilter: u32 {
        /// Geometry is rendered at all.
        const RENDER = 1 << 0;
        const SOLID = 1 << 1;
        /// Geometry casts no shadows.
        const SHADOW_NONE = 1 << 2;
        const REFLECTED = 1 << 3;
        /// Geometry shows a rendered (render target) texture.
        const RENDERED = 1 << 4;
        const OUTLINE = 1 << 5;
        const OUTLINE_SOLID = 1 << 6;
        const HOLES = 1 << 7;
        const DECAL = 1 << 8;
        const DOUBLE_SIDED = 1 << 9;
        const XRAY = 1 << 10;
        const SHADOW = 1 << 11;
    }
}

bitflags! {
    /// Pipeline lists a compute render task collects geometries from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineListMask: u32 {
        const COMPONENT = 1 << 0;
        const BILLBOARD = 1 << 1;
        const DECAL = 1 << 2;
        const PROP_FIELD = 1 << 3;
        const PROP_FIELD_IMPOSTER = 1 << 4;
        const HEIGHT_MAP = 1 << 5;
        const PARTICLE = 1 << 6;
    }
}

bitflags! {
    /// Pipeline variant bits packed into the configuration block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineModifier: u32 {
        const DOUBLE_SIDED = 1 << 0;
        const SPECIAL_PARAM_BLOCK = 1 << 1;
    }
}

impl PipelineListMask {
    /// Pipeline list geometries of `element_type` are drawn with.
    pub fn for_element(element_type: ElementType) -> Self {
        match element_type {
            ElementType::Component => Self::COMPONENT,
            ElementType::Billboard => Self::BILLBOARD,
            ElementType::Decal => Self::DECAL,
            ElementType::PropFieldCluster => Self::PROP_FIELD,
            ElementType::HeightTerrainSectorCluster => Self::HEIGHT_MAP,
            ElementType::Particles => Self::PARTICLE,
            ElementType::Light | ElementType::EnvironmentMap => Self::empty(),
        }
    }
}

/// Kind of pipeline the task selects from each geometry's pipeline set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineType {
    #[default]
    Geometry,
    Depth,
    DepthClipPlane,
    Counter,
    Mask,
    ShadowProjection,
    ShadowOrthogonal,
    ShadowDistance,
    EnvironmentMap,
    GiMaterial,
}

impl PipelineType {
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// What a compute render task collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeRenderTaskConfig {
    pub solid: bool,
    pub no_shadow_none: bool,
    pub no_not_reflected: bool,
    pub no_rendered: bool,
    pub outline: bool,
    pub force_double_sided: bool,
    pub filter_xray: bool,
    pub xray: bool,
    pub filter_holes: bool,
    pub with_holes: bool,
    pub filter_decal: bool,
    pub decal: bool,
    /// Only accept elements visible in this cube map face.
    pub filter_cube_face: Option<u32>,
    pub pipeline_lists: PipelineListMask,
    pub pipeline_type: PipelineType,
    pub use_special_param_block: bool,
    /// Layer mask elements have to share a bit with. 0 accepts all.
    pub layer_mask: u64,
}

impl Default for ComputeRenderTaskConfig {
    fn default() -> Self {
        Self {
            solid: true,
            no_shadow_none: false,
            no_not_reflected: false,
            no_rendered: false,
            outline: false,
            force_double_sided: false,
            filter_xray: false,
            xray: false,
            filter_holes: false,
            with_holes: false,
            filter_decal: false,
            decal: false,
            filter_cube_face: None,
            pipeline_lists: PipelineListMask::all(),
            pipeline_type: PipelineType::Geometry,
            use_special_param_block: false,
            layer_mask: 0,
        }
    }
}

impl ComputeRenderTaskConfig {
    pub fn with_solid(mut self, solid: bool) -> Self {
        self.solid = solid;
        self
    }

    pub fn with_outline(mut self, outline: bool) -> Self {
        self.outline = outline;
        self
    }

    pub fn with_xray(mut self, xray: bool) -> Self {
        self.filter_xray = true;
        self.xray = xray;
        self
    }

    pub fn with_holes(mut self, with_holes: bool) -> Self {
        self.filter_holes = true;
        self.with_holes = with_holes;
        self
    }

    pub fn with_decal(mut self, decal: bool) -> Self {
        self.filter_decal = true;
        self.decal = decal;
        self
    }

    pub fn with_cube_face(mut self, face: u32) -> Self {
        self.filter_cube_face = Some(face);
        self
    }

    pub fn with_pipeline_lists(mut self, lists: PipelineListMask) -> Self {
        self.pipeline_lists = lists;
        self
    }

    pub fn with_pipeline_type(mut self, pipeline_type: PipelineType) -> Self {
        self.pipeline_type = pipeline_type;
        self
    }

    pub fn with_layer_mask(mut self, layer_mask: u64) -> Self {
        self.layer_mask = layer_mask;
        self
    }

    /// Filter bits a geometry must have, restricted to [`filter_mask`](Self::filter_mask).
    pub fn filter(&self) -> RenderTaskFilter {
        let mut filter = RenderTaskFilter::RENDER;
        if self.outline {
            filter |= RenderTaskFilter::OUTLINE;
            if self.solid {
                filter |= RenderTaskFilter::OUTLINE_SOLID;
            }
        } else if self.solid {
            filter |= RenderTaskFilter::SOLID;
        }
        if self.filter_xray && self.xray {
            filter |= RenderTaskFilter::XRAY;
        }
        if self.no_not_reflected {
            filter |= RenderTaskFilter::REFLECTED;
        }
        if self.filter_holes && self.with_holes {
            filter |= RenderTaskFilter::HOLES;
        }
        if self.filter_decal && self.decal {
            filter |= RenderTaskFilter::DECAL;
        }
        filter & self.filter_mask()
    }

    /// Filter bits that are compared at all.
    pub fn filter_mask(&self) -> RenderTaskFilter {
        let mut mask = RenderTaskFilter::RENDER;
        if self.outline {
            mask |= RenderTaskFilter::OUTLINE | RenderTaskFilter::OUTLINE_SOLID;
        } else {
            mask |= RenderTaskFilter::SOLID;
        }
        if self.filter_xray {
            mask |= RenderTaskFilter::XRAY;
        }
        if self.no_not_reflected {
            mask |= RenderTaskFilter::REFLECTED;
        }
        if self.no_rendered {
            mask |= RenderTaskFilter::RENDERED;
        }
        if self.no_shadow_none {
            mask |= RenderTaskFilter::SHADOW_NONE;
        }
        if self.filter_holes {
            mask |= RenderTaskFilter::HOLES;
        }
        if self.filter_decal {
            mask |= RenderTaskFilter::DECAL;
        }
        mask
    }

    pub fn pipeline_modifier(&self) -> PipelineModifier {
        let mut modifier = PipelineModifier::empty();
        modifier.set(PipelineModifier::DOUBLE_SIDED, self.force_double_sided);
        modifier.set(PipelineModifier::SPECIAL_PARAM_BLOCK, self.use_special_param_block);
        modifier
    }

    fn accepts(&self, filter: RenderTaskFilter) -> bool {
        filter & self.filter_mask() == self.filter()
    }

    fn validate(&self) -> Result<(), GraphicsError> {
        match self.filter_cube_face {
            Some(face) if face >= CUBE_FACE_COUNT => Err(GraphicsError::InvalidParameter(format!(
                "cube face {face} out of range, a cube has {CUBE_FACE_COUNT} faces"
            ))),
            _ => Ok(()),
        }
    }
}

/// Faces of a cube map pass.
pub const CUBE_FACE_COUNT: u32 = 6;

/// Parameters of the configuration uniform block.
mod config_param {
    pub const FILTER: usize = 0;
    pub const FILTER_MASK: usize = 1;
    pub const PIPELINE_LISTS: usize = 2;
    pub const PIPELINE_TYPE: usize = 3;
    pub const PIPELINE_MODIFIER: usize = 4;
    pub const CUBE_FACE: usize = 5;
    pub const LAYER_MASK: usize = 6;
    pub const GEOMETRY_COUNT: usize = 7;
}

/// Counter block component holding the step count. The first three hold
/// the indirect dispatch size.
const COUNTER_STEP_COUNT: u32 = 3;

/// One draw step written by the build kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ComputeRenderTaskStep {
    pub pipeline: u32,
    pub tuc: u32,
    pub vao: u32,
    pub instance: u32,
    pub spb_instance: u32,
    pub special_flags: u32,
    /// Steps drawn by this step's instanced draw call. Zero for steps merged
    /// into a previous one.
    pub sub_instance_count: u32,
    pub padding: u32,
}

impl ComputeRenderTaskStep {
    fn draw_key(&self) -> (u32, u32, u32, u32) {
        (self.pipeline, self.tuc, self.vao, self.instance)
    }
}

/// A world element that passed culling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleElement {
    pub key: ElementKey,
    /// Level of detail chosen by culling.
    pub lod: u32,
    /// Cube map faces the element is visible in.
    pub cube_face_mask: u8,
}

impl VisibleElement {
    pub fn new(key: ElementKey) -> Self {
        Self {
            key,
            lod: 0,
            cube_face_mask: 0x3f,
        }
    }

    pub fn with_lod(mut self, lod: u32) -> Self {
        self.lod = lod;
        self
    }

    pub fn with_cube_face_mask(mut self, mask: u8) -> Self {
        self.cube_face_mask = mask;
        self
    }
}

/// Preparation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeRenderTaskState {
    /// Buffers are being prepared and filled.
    Preparing,
    /// Steps can be consumed.
    Ready,
}

/// GPU-side render task.
#[derive(Debug)]
pub struct ComputeRenderTask {
    config: ComputeRenderTaskConfig,
    state: ComputeRenderTaskState,
    ubo_config: ParameterBlock,
    ssbo_steps: ParameterBlock,
    ssbo_counters: ParameterBlock,
}

impl ComputeRenderTask {
    pub fn new(device: Arc<GraphicsDevice>, config: ComputeRenderTaskConfig) -> Result<Self, GraphicsError> {
        let mut ubo_config = ParameterBlock::new(Arc::clone(&device), BlockKind::Uniform);
        ubo_config.set_parameter_count(8);
        *ubo_config.parameter_mut(config_param::FILTER)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ubo_config.parameter_mut(config_param::FILTER_MASK)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ubo_config.parameter_mut(config_param::PIPELINE_LISTS)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ubo_config.parameter_mut(config_param::PIPELINE_TYPE)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ubo_config.parameter_mut(config_param::PIPELINE_MODIFIER)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        *ubo_config.parameter_mut(config_param::CUBE_FACE)? = Parameter::new(ValueType::Int, 1, 1, 1);
        *ubo_config.parameter_mut(config_param::LAYER_MASK)? = Parameter::new(ValueType::UInt, 2, 1, 1);
        *ubo_config.parameter_mut(config_param::GEOMETRY_COUNT)? = Parameter::new(ValueType::UInt, 1, 1, 1);
        ubo_config.map_to_std140()?;
        ubo_config.set_label("compute render task config");

        let mut ssbo_steps = ParameterBlock::new(Arc::clone(&device), BlockKind::Storage(StorageKind::Stream));
        ssbo_steps.set_parameter_count(2);
        *ssbo_steps.parameter_mut(0)? = Parameter::new(ValueType::UInt, 4, 1, 1);
        *ssbo_steps.parameter_mut(1)? = Parameter::new(ValueType::UInt, 4, 1, 1);
        ssbo_steps.map_to_std140()?;
        ssbo_steps.set_label("compute render task steps");

        let mut ssbo_counters = ParameterBlock::new(device, BlockKind::Storage(StorageKind::Read));
        ssbo_counters.set_parameter_count(1);
        *ssbo_counters.parameter_mut(0)? = Parameter::new(ValueType::UInt, 4, 1, 1);
        ssbo_counters.map_to_std140()?;
        ssbo_counters.set_label("compute render task counters");

        Ok(Self {
            config,
            state: ComputeRenderTaskState::Ready,
            ubo_config,
            ssbo_steps,
            ssbo_counters,
        })
    }

    pub fn config(&self) -> &ComputeRenderTaskConfig {
        &self.config
    }

    /// Change the configuration. Takes effect with the next `prepare_buffers`.
    pub fn set_config(&mut self, config: ComputeRenderTaskConfig) {
        self.config = config;
    }

    pub fn state(&self) -> ComputeRenderTaskState {
        self.state
    }

    pub fn ubo_config(&self) -> &ParameterBlock {
        &self.ubo_config
    }

    pub fn ssbo_steps(&self) -> &ParameterBlock {
        &self.ssbo_steps
    }

    pub fn ssbo_counters(&self) -> &ParameterBlock {
        &self.ssbo_counters
    }

    /// Build kernel dispatches: one per selected pipeline list.
    pub fn pass_count(&self) -> u32 {
        self.config.pipeline_lists.bits().count_ones().max(1)
    }

    pub fn begin_prepare(&mut self) {
        self.state = ComputeRenderTaskState::Preparing;
    }

    pub fn end_prepare(&mut self) -> Result<(), GraphicsError> {
        self.require_state(ComputeRenderTaskState::Preparing)?;
        self.state = ComputeRenderTaskState::Ready;
        Ok(())
    }

    fn require_state(&self, state: ComputeRenderTaskState) -> Result<(), GraphicsError> {
        if self.state != state {
            return Err(GraphicsError::InvalidState(format!(
                "compute render task is {:?}, expected {state:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Pack the configuration, size the step block to the world geometry
    /// count and reset the counters.
    pub fn prepare_buffers(&mut self, world: &WorldCompute) -> Result<(), GraphicsError> {
        self.require_state(ComputeRenderTaskState::Preparing)?;
        let config = self.config;
        config.validate()?;
        let geometry_count = world.geometry_count();

        self.ubo_config.with_mapped(0, 1, |block| {
            block.set_parameter(config_param::FILTER, 0, config.filter().bits())?;
            block.set_parameter(config_param::FILTER_MASK, 0, config.filter_mask().bits())?;
            block.set_parameter(config_param::PIPELINE_LISTS, 0, config.pipeline_lists.bits())?;
            block.set_parameter(config_param::PIPELINE_TYPE, 0, config.pipeline_type.index())?;
            block.set_parameter(config_param::PIPELINE_MODIFIER, 0, config.pipeline_modifier().bits())?;
            let cube_face = config.filter_cube_face.map_or(-1, |face| face as i32);
            block.set_parameter(config_param::CUBE_FACE, 0, cube_face)?;
            let layer_mask = [config.layer_mask as u32, (config.layer_mask >> 32) as u32];
            block.set_parameter(config_param::LAYER_MASK, 0, layer_mask)?;
            block.set_parameter(config_param::GEOMETRY_COUNT, 0, geometry_count)
        })?;

        let step_count = geometry_count.max(1);
        if step_count > self.ssbo_steps.element_count() {
            log::debug!("ComputeRenderTask: step block grows to {step_count}");
            self.ssbo_steps.set_element_count(step_count)?;
        }
        self.ssbo_steps.ensure_buffer()?;

        self.ssbo_counters.clear_data_uint(0, 1, [0, 1, 1, 0])?;
        log::trace!(
            "ComputeRenderTask: prepared for {geometry_count} geometries, filter={:?} mask={:?}",
            config.filter(),
            config.filter_mask()
        );
        Ok(())
    }

    /// Build the steps on the CPU.
    ///
    /// Used when the device has no compute shaders. Geometries of the visible
    /// elements pass the same tests the build kernel applies. Steps are sorted
    /// by pipeline, texture, VAO, instance and parameter block instance, and
    /// steps sharing a draw call are merged into the first one's
    /// `sub_instance_count`.
    pub fn build_on_cpu(&mut self, world: &WorldCompute, visible: &[VisibleElement]) -> Result<u32, GraphicsError> {
        self.require_state(ComputeRenderTaskState::Preparing)?;
        let config = self.config;
        config.validate()?;
        let modifier = config.pipeline_modifier();
        let mut steps = Vec::new();

        for visible_element in visible {
            let Some(element) = world.element(visible_element.key) else {
                log::warn!("ComputeRenderTask: visible element {:?} is not in the world", visible_element.key);
                continue;
            };
            if !config.pipeline_lists.intersects(PipelineListMask::for_element(element.element_type)) {
                continue;
            }
            if config.layer_mask != 0 && element.layer_mask != 0 && config.layer_mask & element.layer_mask == 0 {
                continue;
            }
            if let Some(face) = config.filter_cube_face {
                if u32::from(visible_element.cube_face_mask) & (1 << face) == 0 {
                    continue;
                }
            }

            for geometry in &element.geometries {
                if geometry.lod != visible_element.lod || !config.accepts(geometry.render_filter) {
                    continue;
                }
                let double_sided = modifier.contains(PipelineModifier::DOUBLE_SIDED)
                    || geometry.render_filter.contains(RenderTaskFilter::DOUBLE_SIDED);
                let pipeline = geometry
                    .pipeline_base
                    .checked_add(config.pipeline_type.index() * 2 + u32::from(double_sided))
                    .ok_or_else(|| {
                        GraphicsError::InvalidParameter(format!(
                            "pipeline base {} of element {:?} overflows the pipeline index",
                            geometry.pipeline_base, visible_element.key
                        ))
                    })?;
                steps.push(ComputeRenderTaskStep {
                    pipeline,
                    tuc: geometry.tucs[0],
                    vao: geometry.vao,
                    instance: geometry.instance,
                    spb_instance: geometry.spb_instance,
                    special_flags: config
                        .filter_cube_face
                        .map_or(0, |_| u32::from(visible_element.cube_face_mask)),
                    sub_instance_count: 1,
                    padding: 0,
                });
            }
        }

        steps.sort_by_key(|step| (step.draw_key(), step.spb_instance));
        let mut group_start = 0;
        for index in 1..steps.len() {
            if steps[index].draw_key() == steps[group_start].draw_key() {
                steps[group_start].sub_instance_count += 1;
                steps[index].sub_instance_count = 0;
            } else {
                group_start = index;
            }
        }

        let count = steps.len() as u32;
        if count > self.ssbo_steps.element_count() {
            self.ssbo_steps.set_element_count(count)?;
        }
        if count > 0 {
            self.ssbo_steps.with_mapped(0, count, |block| {
                for (index, step) in steps.iter().enumerate() {
                    let index = index as u32;
                    block.set_parameter(0, index, [step.pipeline, step.tuc, step.vao, step.instance])?;
                    block.set_parameter(
                        1,
                        index,
                        [step.spb_instance, step.special_flags, step.sub_instance_count, step.padding],
                    )?;
                }
                Ok(())
            })?;
        }

        self.ssbo_counters.with_mapped(0, 1, |block| {
            block.set_parameter(0, 0, [count.saturating_sub(1) / 64 + 1, 1, 1, count])
        })?;
        self.ssbo_counters.gpu_finished_writing()?;
        log::trace!("ComputeRenderTask: built {count} steps on the CPU");
        Ok(count)
    }

    /// Steps of the last CPU build as stored in the step block.
    pub fn cpu_steps(&self, count: u32) -> Vec<ComputeRenderTaskStep> {
        self.ssbo_steps
            .client_data()
            .chunks_exact(self.ssbo_steps.element_stride() as usize)
            .take(count as usize)
            .map(|chunk| bytemuck::pod_read_unaligned(&chunk[..std::mem::size_of::<ComputeRenderTaskStep>()]))
            .collect()
    }

    /// Read the number of built steps back from the counter block.
    ///
    /// Blocks on the read-back fence.
    pub fn read_step_count(&mut self) -> Result<u32, GraphicsError> {
        self.require_state(ComputeRenderTaskState::Ready)?;
        self.ssbo_counters.gpu_read_to_cpu(1)?;
        self.ssbo_counters.map_buffer_read(0, 1)?;
        let count = self.ssbo_counters.read_uint(0, 0, COUNTER_STEP_COUNT);
        self.ssbo_counters.unmap_buffer_read()?;
        count
    }
}

static_assertions::assert_impl_all!(ComputeRenderTask: Send, Sync);
static_assertions::const_assert_eq!(std::mem::size_of::<ComputeRenderTaskStep>(), 32);
