//! Per-frame render task.
//!
//! A [`RenderTask`] is a pipeline → texture → VAO → instance → sub-instance
//! tree rebuilt every frame. Nodes are kept in [`PooledList`]s, so clearing
//! the task keeps every node's allocations for the next frame. Each level
//! finds an existing child through a table indexed by the child's unique key,
//! which makes get-or-create constant time.
//!
//! # Example
//!
//! ```
//! use ember_graphics::render_task::{InstanceDescriptor, RenderTask, RenderTaskConfig, RenderTaskSharedPool};
//! use ember_graphics::GraphicsDevice;
//!
//! let shared = RenderTaskSharedPool::new();
//! let pipeline = shared.pipeline("geometry");
//! let texture = shared.texture(1);
//! let vao = shared.vao(1);
//! let instance = shared.instance(InstanceDescriptor::new(36));
//!
//! let mut task = RenderTask::new(GraphicsDevice::dummy(), RenderTaskConfig::default());
//! for index in 0..3 {
//!     task.add_pipeline(&pipeline)
//!         .add_texture(&texture)
//!         .add_vao(&vao)
//!         .add_instance(&instance)
//!         .add_sub_instance(index, 0)
//!         .unwrap();
//! }
//! assert_eq!(task.total_instance_count(), 1);
//! assert_eq!(task.total_sub_instance_count(), 3);
//!
//! task.prepare_for_render().unwrap();
//! ```

use std::sync::Arc;

use ember_core::math::DVec3;
use ember_core::{Poolable, PooledList};

use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::paramblock::ParameterBlock;

use super::instance_index::{
    InstanceIndexBacking, InstanceIndexBlocks, InstanceIndexPacking, InstanceIndexSlot, SubInstance,
};
use super::shared::{SharedInstance, SharedPipeline, SharedTexture, SharedVao};

/// Configuration of a render task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderTaskConfig {
    /// Packing used after every [`RenderTask::clear`].
    pub packing: InstanceIndexPacking,
    pub backing: InstanceIndexBacking,
}

impl RenderTaskConfig {
    pub fn with_packing(mut self, packing: InstanceIndexPacking) -> Self {
        self.packing = packing;
        self
    }

    pub fn with_backing(mut self, backing: InstanceIndexBacking) -> Self {
        self.backing = backing;
        self
    }
}

// ---------------------------------------------------------------------------
// Keyed node list
// ---------------------------------------------------------------------------

/// Pooled child list plus a table from child key to list position.
#[derive(Debug)]
struct KeyedNodes<T: Poolable> {
    nodes: PooledList<T>,
    positions: Vec<Option<u32>>,
    keys: Vec<u32>,
}

impl<T: Poolable> KeyedNodes<T> {
    fn new() -> Self {
        Self {
            nodes: PooledList::new(),
            positions: Vec::new(),
            keys: Vec::new(),
        }
    }

    /// Existing node for `key`, or a fresh one. The flag tells if it is new.
    fn get_or_insert(&mut self, key: u32) -> (&mut T, bool) {
        let slot = key as usize;
        if slot >= self.positions.len() {
            self.positions.resize((slot + 1).next_power_of_two(), None);
        }
        let len = self.nodes.len();
        if let Some(position) = self.positions[slot].filter(|&p| (p as usize) < len) {
            return (&mut self.nodes.as_mut_slice()[position as usize], false);
        }
        let (position, node) = self.nodes.acquire();
        self.positions[slot] = Some(position as u32);
        self.keys.push(key);
        (node, true)
    }

    /// Append a node without recording its key.
    fn push(&mut self) -> &mut T {
        self.nodes.acquire().1
    }

    fn clear(&mut self) {
        for &key in &self.keys {
            self.positions[key as usize] = None;
        }
        self.keys.clear();
        self.nodes.clear();
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn iter(&self) -> std::slice::Iter<'_, T> {
        self.nodes.iter()
    }

    fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.nodes.iter_mut()
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Instance node: the sub-instances drawn with one shared instance.
#[derive(Debug)]
pub struct RenderTaskInstance {
    instance: Option<Arc<SharedInstance>>,
    sub_instances: Vec<SubInstance>,
    position: Option<DVec3>,
    slot: Option<InstanceIndexSlot>,
}

impl Poolable for RenderTaskInstance {
    fn new_empty() -> Self {
        Self {
            instance: None,
            sub_instances: Vec::new(),
            position: None,
            slot: None,
        }
    }

    fn reset(&mut self) {
        self.instance = None;
        self.sub_instances.clear();
        self.position = None;
        self.slot = None;
    }
}

impl RenderTaskInstance {
    /// Add a sub-instance.
    ///
    /// # Errors
    ///
    /// Fails if the instance has a sub-instance parameter block range and
    /// `index` lies outside it.
    pub fn add_sub_instance(&mut self, index: u32, flags: u32) -> Result<&mut Self, GraphicsError> {
        if let Some(spb) = self.instance.as_ref().and_then(|i| i.sub_instance_spb()) {
            if index >= spb.count() {
                return Err(GraphicsError::InvalidParameter(format!(
                    "sub-instance index {index} outside parameter range of {}",
                    spb.count()
                )));
            }
        }
        self.sub_instances.push(SubInstance { index, flags });
        Ok(self)
    }

    pub fn instance(&self) -> Option<&Arc<SharedInstance>> {
        self.instance.as_ref()
    }

    pub fn sub_instances(&self) -> &[SubInstance] {
        &self.sub_instances
    }

    pub fn sub_instance_count(&self) -> u32 {
        self.sub_instances.len() as u32
    }

    /// World position used by [`RenderTask::sort_instances_by_distance`].
    pub fn set_position(&mut self, position: DVec3) -> &mut Self {
        self.position = Some(position);
        self
    }

    pub fn position(&self) -> Option<DVec3> {
        self.position
    }

    /// Index list location, assigned by `prepare_for_render`.
    pub fn instance_index_slot(&self) -> Option<InstanceIndexSlot> {
        self.slot
    }

    fn point_count(&self) -> u32 {
        self.instance.as_ref().map_or(0, |i| i.point_count()) * self.sub_instance_count()
    }
}

/// VAO node.
#[derive(Debug)]
pub struct RenderTaskVao {
    vao: Option<Arc<SharedVao>>,
    instances: KeyedNodes<RenderTaskInstance>,
}

impl Poolable for RenderTaskVao {
    fn new_empty() -> Self {
        Self {
            vao: None,
            instances: KeyedNodes::new(),
        }
    }

    fn reset(&mut self) {
        self.vao = None;
        self.instances.clear();
    }
}

impl RenderTaskVao {
    pub fn add_instance(&mut self, instance: &Arc<SharedInstance>) -> &mut RenderTaskInstance {
        let (node, created) = self.instances.get_or_insert(instance.key());
        if created {
            node.instance = Some(Arc::clone(instance));
        }
        node
    }

    pub fn vao(&self) -> Option<&Arc<SharedVao>> {
        self.vao.as_ref()
    }

    pub fn instances(&self) -> std::slice::Iter<'_, RenderTaskInstance> {
        self.instances.iter()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn total_sub_instance_count(&self) -> u32 {
        self.instances.iter().map(RenderTaskInstance::sub_instance_count).sum()
    }

    pub fn total_point_count(&self) -> u32 {
        self.instances.iter().map(RenderTaskInstance::point_count).sum()
    }

    /// Stable back to front order along `direction` as seen from `position`.
    ///
    /// Instances without a position count as distance 0.
    fn sort_instances_by_distance(&mut self, position: &DVec3, direction: &DVec3) {
        let offset = position.dot(direction);
        let distance = |instance: &RenderTaskInstance| {
            instance.position.map_or(0.0, |p| p.dot(direction) - offset)
        };
        self.instances
            .nodes
            .as_mut_slice()
            .sort_by(|a, b| distance(b).total_cmp(&distance(a)));

        // Positions moved: rebuild the key table.
        let instances = &mut self.instances;
        instances.keys.clear();
        for (position, node) in instances.nodes.iter().enumerate() {
            if let Some(key) = node.instance.as_ref().map(|i| i.key()) {
                instances.positions[key as usize] = Some(position as u32);
                instances.keys.push(key);
            }
        }
    }
}

/// Texture (TUC) node.
#[derive(Debug)]
pub struct RenderTaskTexture {
    texture: Option<Arc<SharedTexture>>,
    vaos: KeyedNodes<RenderTaskVao>,
}

impl Poolable for RenderTaskTexture {
    fn new_empty() -> Self {
        Self {
            texture: None,
            vaos: KeyedNodes::new(),
        }
    }

    fn reset(&mut self) {
        self.texture = None;
        self.vaos.clear();
    }
}

impl RenderTaskTexture {
    pub fn add_vao(&mut self, vao: &Arc<SharedVao>) -> &mut RenderTaskVao {
        let (node, created) = self.vaos.get_or_insert(vao.key());
        if created {
            node.vao = Some(Arc::clone(vao));
        }
        node
    }

    pub fn texture(&self) -> Option<&Arc<SharedTexture>> {
        self.texture.as_ref()
    }

    pub fn vaos(&self) -> std::slice::Iter<'_, RenderTaskVao> {
        self.vaos.iter()
    }

    pub fn vao_count(&self) -> usize {
        self.vaos.len()
    }

    pub fn total_instance_count(&self) -> usize {
        self.vaos.iter().map(RenderTaskVao::instance_count).sum()
    }

    pub fn total_sub_instance_count(&self) -> u32 {
        self.vaos.iter().map(RenderTaskVao::total_sub_instance_count).sum()
    }

    pub fn total_point_count(&self) -> u32 {
        self.vaos.iter().map(RenderTaskVao::total_point_count).sum()
    }
}

/// Pipeline node.
#[derive(Debug)]
pub struct RenderTaskPipeline {
    pipeline: Option<Arc<SharedPipeline>>,
    textures: KeyedNodes<RenderTaskTexture>,
}

impl Poolable for RenderTaskPipeline {
    fn new_empty() -> Self {
        Self {
            pipeline: None,
            textures: KeyedNodes::new(),
        }
    }

    fn reset(&mut self) {
        self.pipeline = None;
        self.textures.clear();
    }
}

impl RenderTaskPipeline {
    pub fn add_texture(&mut self, texture: &Arc<SharedTexture>) -> &mut RenderTaskTexture {
        let (node, created) = self.textures.get_or_insert(texture.key());
        if created {
            node.texture = Some(Arc::clone(texture));
        }
        node
    }

    pub fn pipeline(&self) -> Option<&Arc<SharedPipeline>> {
        self.pipeline.as_ref()
    }

    pub fn textures(&self) -> std::slice::Iter<'_, RenderTaskTexture> {
        self.textures.iter()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn total_vao_count(&self) -> usize {
        self.textures.iter().map(RenderTaskTexture::vao_count).sum()
    }

    pub fn total_instance_count(&self) -> usize {
        self.textures.iter().map(RenderTaskTexture::total_instance_count).sum()
    }

    pub fn total_sub_instance_count(&self) -> u32 {
        self.textures.iter().map(RenderTaskTexture::total_sub_instance_count).sum()
    }

    pub fn total_point_count(&self) -> u32 {
        self.textures.iter().map(RenderTaskTexture::total_point_count).sum()
    }
}

// ---------------------------------------------------------------------------
// RenderTask
// ---------------------------------------------------------------------------

/// Per-frame render task.
#[derive(Debug)]
pub struct RenderTask {
    config: RenderTaskConfig,
    packing: InstanceIndexPacking,
    pipelines: KeyedNodes<RenderTaskPipeline>,
    render_param_block: Option<Arc<ParameterBlock>>,
    instance_index: InstanceIndexBlocks,
}

impl RenderTask {
    pub fn new(device: Arc<GraphicsDevice>, config: RenderTaskConfig) -> Self {
        Self {
            config,
            packing: config.packing,
            pipelines: KeyedNodes::new(),
            render_param_block: None,
            instance_index: InstanceIndexBlocks::new(device, config.backing),
        }
    }

    /// Reset the task for a new frame. Node allocations are kept.
    pub fn clear(&mut self) {
        self.pipelines.clear();
        self.render_param_block = None;
        self.packing = self.config.packing;
    }

    pub fn add_pipeline(&mut self, pipeline: &Arc<SharedPipeline>) -> &mut RenderTaskPipeline {
        let (node, created) = self.pipelines.get_or_insert(pipeline.key());
        if created {
            node.pipeline = Some(Arc::clone(pipeline));
        }
        node
    }

    /// Append a pipeline node without looking for an existing one.
    pub fn add_pipeline_direct(&mut self, pipeline: &Arc<SharedPipeline>) -> &mut RenderTaskPipeline {
        let node = self.pipelines.push();
        node.pipeline = Some(Arc::clone(pipeline));
        node
    }

    pub fn pipelines(&self) -> std::slice::Iter<'_, RenderTaskPipeline> {
        self.pipelines.iter()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn set_render_param_block(&mut self, block: Option<Arc<ParameterBlock>>) {
        self.render_param_block = block;
    }

    pub fn render_param_block(&self) -> Option<&Arc<ParameterBlock>> {
        self.render_param_block.as_ref()
    }

    /// Carry per sub-instance flags in the index lists until the next clear.
    pub fn set_use_sub_instance_flags(&mut self, use_flags: bool) {
        self.packing = if use_flags {
            InstanceIndexPacking::IndexFlags
        } else {
            self.config.packing
        };
    }

    pub fn packing(&self) -> InstanceIndexPacking {
        self.packing
    }

    pub fn instance_index_blocks(&self) -> &InstanceIndexBlocks {
        &self.instance_index
    }

    /// Assign and write the sub-instance index lists.
    pub fn prepare_for_render(&mut self) -> Result<(), GraphicsError> {
        if self.pipelines.len() == 0 {
            return Ok(());
        }

        self.instance_index.begin(self.packing);
        for instance in instances_mut(&mut self.pipelines) {
            instance.slot = Some(self.instance_index.assign(instance.sub_instance_count())?);
        }
        self.instance_index.finish()?;

        self.instance_index.begin_write();
        for instance in instances_mut(&mut self.pipelines) {
            if let Some(slot) = instance.slot {
                self.instance_index.stage(slot, &instance.sub_instances)?;
            }
        }
        self.instance_index.flush()?;

        log::trace!(
            "RenderTask: prepared {} instances in {} index blocks",
            self.total_instance_count(),
            self.instance_index.used_block_count()
        );
        Ok(())
    }

    /// Sort each VAO's instances back to front along `direction`.
    pub fn sort_instances_by_distance(&mut self, position: &DVec3, direction: &DVec3) {
        for pipeline in self.pipelines.iter_mut() {
            for texture in pipeline.textures.iter_mut() {
                for vao in texture.vaos.iter_mut() {
                    vao.sort_instances_by_distance(position, direction);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    pub fn total_point_count(&self) -> u32 {
        self.pipelines.iter().map(RenderTaskPipeline::total_point_count).sum()
    }

    pub fn total_texture_count(&self) -> usize {
        self.pipelines.iter().map(RenderTaskPipeline::texture_count).sum()
    }

    pub fn total_vao_count(&self) -> usize {
        self.pipelines.iter().map(RenderTaskPipeline::total_vao_count).sum()
    }

    pub fn total_instance_count(&self) -> usize {
        self.pipelines.iter().map(RenderTaskPipeline::total_instance_count).sum()
    }

    pub fn total_sub_instance_count(&self) -> u32 {
        self.pipelines.iter().map(RenderTaskPipeline::total_sub_instance_count).sum()
    }

    // -----------------------------------------------------------------------
    // Debug
    // -----------------------------------------------------------------------

    /// Log the tree with per-level statistics.
    pub fn debug_print(&self) {
        log::info!(
            "RenderTask: pipelines={} points={} textures={} packing={:?}",
            self.pipeline_count(),
            self.total_point_count(),
            self.total_texture_count(),
            self.packing
        );
        for (p, pipeline) in self.pipelines.iter().enumerate() {
            log::info!(
                "- pipeline {p} {:?}: textures={} points={} vaos={} instances={} sub_instances={}",
                pipeline.pipeline.as_ref().map(|s| s.label()),
                pipeline.texture_count(),
                pipeline.total_point_count(),
                pipeline.total_vao_count(),
                pipeline.total_instance_count(),
                pipeline.total_sub_instance_count()
            );
            for (t, texture) in pipeline.textures.iter().enumerate() {
                log::info!(
                    "  - texture {t} tuc={:?}: vaos={} points={} instances={} sub_instances={}",
                    texture.texture.as_ref().map(|s| s.tuc_id()),
                    texture.vao_count(),
                    texture.total_point_count(),
                    texture.total_instance_count(),
                    texture.total_sub_instance_count()
                );
                for (v, vao) in texture.vaos.iter().enumerate() {
                    log::info!(
                        "    - vao {v} id={:?}: instances={} points={} sub_instances={}",
                        vao.vao.as_ref().map(|s| s.vao_id()),
                        vao.instance_count(),
                        vao.total_point_count(),
                        vao.total_sub_instance_count()
                    );
                    for (i, instance) in vao.instances.iter().enumerate() {
                        if let Some(shared) = &instance.instance {
                            log::info!(
                                "      - instance {i}: fp={} pc={} fi={} ic={} sic={} slot={:?}",
                                shared.first_point(),
                                shared.point_count(),
                                shared.first_index(),
                                shared.index_count(),
                                instance.sub_instance_count(),
                                instance.slot
                            );
                        }
                    }
                }
            }
        }
    }

    /// Log one line per sub-instance draw in submission order.
    pub fn debug_simple(&self) {
        log::info!("RenderTask");
        let mut step = 0;
        for pipeline in self.pipelines.iter() {
            let p = pipeline.pipeline.as_ref().map(|s| s.key());
            for texture in pipeline.textures.iter() {
                let t = texture.texture.as_ref().map(|s| s.key());
                for vao in texture.vaos.iter() {
                    let v = vao.vao.as_ref().map(|s| s.key());
                    for instance in vao.instances.iter() {
                        let i = instance.instance.as_ref().map(|s| s.key());
                        for sub in &instance.sub_instances {
                            log::info!(
                                "- {step}: p={p:?} t={t:?} v={v:?} i={i:?} si[i={} f={:x}]",
                                sub.index,
                                sub.flags
                            );
                            step += 1;
                        }
                    }
                }
            }
        }
    }
}

/// All instance nodes in tree order. Both prepare passes walk this order.
fn instances_mut(
    pipelines: &mut KeyedNodes<RenderTaskPipeline>,
) -> impl Iterator<Item = &mut RenderTaskInstance> {
    pipelines
        .iter_mut()
        .flat_map(|pipeline| pipeline.textures.iter_mut())
        .flat_map(|texture| texture.vaos.iter_mut())
        .flat_map(|vao| vao.instances.iter_mut())
}

static_assertions::assert_impl_all!(RenderTask: Send, Sync);
