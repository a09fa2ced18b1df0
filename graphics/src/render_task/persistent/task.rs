//! Long-lived render task with incremental removal.

use std::collections::HashMap;
use std::sync::Arc;

use ember_core::{Handle, PoolError};

use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::paramblock::ParameterBlock;
use crate::render_task::instance_index::{InstanceIndexBlocks, InstanceIndexPacking, SubInstance};
use crate::render_task::shared::{SharedInstance, SharedPipeline, SharedTexture, SharedVao};
use crate::render_task::task::RenderTaskConfig;

use super::pool::{
    OwnerKey, PersistentInstance, PersistentOwner, PersistentPipeline, PersistentRenderTaskPool,
    PersistentSubInstance, PersistentTexture, PersistentVao,
};

fn lookup<T>(table: &[Option<Handle<T>>], key: u32) -> Option<Handle<T>> {
    table.get(key as usize).copied().flatten()
}

fn set_lookup<T>(table: &mut Vec<Option<Handle<T>>>, key: u32, value: Option<Handle<T>>) {
    let slot = key as usize;
    if slot >= table.len() {
        if value.is_none() {
            return;
        }
        table.resize((slot + 1).next_power_of_two(), None);
    }
    table[slot] = value;
}

/// Swap-remove `slot` and return the handle that moved into it.
fn swap_remove<T>(list: &mut Vec<Handle<T>>, slot: u32) -> Option<Handle<T>> {
    let slot = slot as usize;
    if slot >= list.len() {
        return None;
    }
    list.swap_remove(slot);
    list.get(slot).copied()
}

/// Take a sub-instance out of its owner's list.
fn unlink_sub_instance_owner(pool: &mut PersistentRenderTaskPool, sub: Handle<PersistentSubInstance>) {
    let node = &pool.sub_instances[sub];
    if let Some(owner) = node.owner {
        let owner_slot = node.owner_slot;
        if let Some(moved) = swap_remove(&mut pool.owners[owner].sub_instances, owner_slot) {
            pool.sub_instances[moved].owner_slot = owner_slot;
        }
    }
}

/// Render task kept across frames.
///
/// Nodes live in a [`PersistentRenderTaskPool`] and are linked by handles.
/// Every node knows its parent and its slot in the parent's child list, so
/// removing a node is a swap-remove plus a slot fix-up. Parents left without
/// children are removed up to the pipeline level.
///
/// Owners record which sub-instances and instances an object contributed,
/// which lets [`remove_owned_by`](Self::remove_owned_by) drop them without
/// walking the tree.
#[derive(Debug)]
pub struct PersistentRenderTask {
    packing: InstanceIndexPacking,
    pipelines: Vec<Handle<PersistentPipeline>>,
    lookup: Vec<Option<Handle<PersistentPipeline>>>,
    owners: HashMap<OwnerKey, Handle<PersistentOwner>>,
    render_param_block: Option<Arc<ParameterBlock>>,
    instance_index: InstanceIndexBlocks,
}

impl PersistentRenderTask {
    pub fn new(device: Arc<GraphicsDevice>, config: RenderTaskConfig) -> Self {
        Self {
            packing: config.packing,
            pipelines: Vec::new(),
            lookup: Vec::new(),
            owners: HashMap::new(),
            render_param_block: None,
            instance_index: InstanceIndexBlocks::new(device, config.backing),
        }
    }

    pub fn packing(&self) -> InstanceIndexPacking {
        self.packing
    }

    pub fn set_packing(&mut self, packing: InstanceIndexPacking) {
        self.packing = packing;
    }

    pub fn set_render_param_block(&mut self, block: Option<Arc<ParameterBlock>>) {
        self.render_param_block = block;
    }

    pub fn render_param_block(&self) -> Option<&Arc<ParameterBlock>> {
        self.render_param_block.as_ref()
    }

    pub fn instance_index_blocks(&self) -> &InstanceIndexBlocks {
        &self.instance_index
    }

    pub fn pipelines(&self) -> &[Handle<PersistentPipeline>] {
        &self.pipelines
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    // -----------------------------------------------------------------------
    // Owners
    // -----------------------------------------------------------------------

    /// Owner record for `key`, created on first use.
    pub fn add_owner(&mut self, pool: &mut PersistentRenderTaskPool, key: OwnerKey) -> Handle<PersistentOwner> {
        *self.owners.entry(key).or_insert_with(|| {
            let handle = pool.owners.acquire();
            pool.owners[handle].key = Some(key);
            handle
        })
    }

    pub fn owner_with(&self, key: OwnerKey) -> Option<Handle<PersistentOwner>> {
        self.owners.get(&key).copied()
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Remove everything `owner` contributed. The owner record stays.
    pub fn remove_owned_by(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        owner: Handle<PersistentOwner>,
    ) -> Result<(), GraphicsError> {
        pool.owners.get(owner).ok_or(PoolError::StaleHandle)?;

        // Removals unlink from the owner lists, so always take the last entry.
        while let Some(&sub) = pool.owners[owner].sub_instances.last() {
            self.remove_sub_instance(pool, sub)?;
        }
        while let Some(&instance) = pool.owners[owner].instances.last() {
            self.remove_instance(pool, instance)?;
        }
        Ok(())
    }

    /// Remove everything `owner` contributed and the owner record itself.
    pub fn remove_owner(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        owner: Handle<PersistentOwner>,
    ) -> Result<(), GraphicsError> {
        self.remove_owned_by(pool, owner)?;
        if let Some(key) = pool.owners[owner].key {
            self.owners.remove(&key);
        }
        pool.owners.release(owner)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Building
    // -----------------------------------------------------------------------

    pub fn add_pipeline(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        pipeline: &Arc<SharedPipeline>,
    ) -> Handle<PersistentPipeline> {
        if let Some(handle) = lookup(&self.lookup, pipeline.key()) {
            return handle;
        }
        let handle = pool.pipelines.acquire();
        let node = &mut pool.pipelines[handle];
        node.pipeline = Some(Arc::clone(pipeline));
        node.slot = self.pipelines.len() as u32;
        self.pipelines.push(handle);
        set_lookup(&mut self.lookup, pipeline.key(), Some(handle));
        handle
    }

    pub fn pipeline_with(&self, pipeline: &SharedPipeline) -> Option<Handle<PersistentPipeline>> {
        lookup(&self.lookup, pipeline.key())
    }

    pub fn add_texture(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        pipeline: Handle<PersistentPipeline>,
        texture: &Arc<SharedTexture>,
    ) -> Result<Handle<PersistentTexture>, GraphicsError> {
        let parent = pool.pipelines.get(pipeline).ok_or(PoolError::StaleHandle)?;
        if let Some(handle) = lookup(&parent.lookup, texture.key()) {
            return Ok(handle);
        }
        let handle = pool.textures.acquire();
        let parent = &mut pool.pipelines[pipeline];
        let slot = parent.textures.len() as u32;
        parent.textures.push(handle);
        set_lookup(&mut parent.lookup, texture.key(), Some(handle));

        let node = &mut pool.textures[handle];
        node.texture = Some(Arc::clone(texture));
        node.parent = Some(pipeline);
        node.slot = slot;
        Ok(handle)
    }

    pub fn add_vao(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        texture: Handle<PersistentTexture>,
        vao: &Arc<SharedVao>,
    ) -> Result<Handle<PersistentVao>, GraphicsError> {
        let parent = pool.textures.get(texture).ok_or(PoolError::StaleHandle)?;
        if let Some(handle) = lookup(&parent.lookup, vao.key()) {
            return Ok(handle);
        }
        let handle = pool.vaos.acquire();
        let parent = &mut pool.textures[texture];
        let slot = parent.vaos.len() as u32;
        parent.vaos.push(handle);
        set_lookup(&mut parent.lookup, vao.key(), Some(handle));

        let node = &mut pool.vaos[handle];
        node.vao = Some(Arc::clone(vao));
        node.parent = Some(texture);
        node.slot = slot;
        Ok(handle)
    }

    /// Instance node for `instance` under `vao`, created on first use.
    ///
    /// `owner` is recorded only when the node is created.
    pub fn add_instance(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        vao: Handle<PersistentVao>,
        instance: &Arc<SharedInstance>,
        owner: Option<Handle<PersistentOwner>>,
    ) -> Result<Handle<PersistentInstance>, GraphicsError> {
        let parent = pool.vaos.get(vao).ok_or(PoolError::StaleHandle)?;
        if let Some(handle) = lookup(&parent.lookup, instance.key()) {
            return Ok(handle);
        }
        if let Some(owner) = owner {
            pool.owners.get(owner).ok_or(PoolError::StaleHandle)?;
        }

        let handle = pool.instances.acquire();
        let parent = &mut pool.vaos[vao];
        let slot = parent.instances.len() as u32;
        parent.instances.push(handle);
        set_lookup(&mut parent.lookup, instance.key(), Some(handle));

        let owner_slot = owner.map_or(0, |owner| {
            let list = &mut pool.owners[owner].instances;
            list.push(handle);
            list.len() as u32 - 1
        });

        let node = &mut pool.instances[handle];
        node.instance = Some(Arc::clone(instance));
        node.parent = Some(vao);
        node.slot = slot;
        node.owner = owner;
        node.owner_slot = owner_slot;
        Ok(handle)
    }

    /// Add a sub-instance to `instance`.
    ///
    /// # Errors
    ///
    /// Fails on stale handles and when `index` lies outside the instance's
    /// sub-instance parameter block range.
    pub fn add_sub_instance(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        instance: Handle<PersistentInstance>,
        index: u32,
        flags: u32,
        owner: Option<Handle<PersistentOwner>>,
    ) -> Result<Handle<PersistentSubInstance>, GraphicsError> {
        let parent = pool.instances.get(instance).ok_or(PoolError::StaleHandle)?;
        if let Some(spb) = parent.instance.as_ref().and_then(|i| i.sub_instance_spb()) {
            if index >= spb.count() {
                return Err(GraphicsError::InvalidParameter(format!(
                    "sub-instance index {index} outside parameter range of {}",
                    spb.count()
                )));
            }
        }
        if let Some(owner) = owner {
            pool.owners.get(owner).ok_or(PoolError::StaleHandle)?;
        }

        let handle = pool.sub_instances.acquire();
        let list = &mut pool.instances[instance].sub_instances;
        list.push(handle);
        let slot = list.len() as u32 - 1;

        let owner_slot = owner.map_or(0, |owner| {
            let list = &mut pool.owners[owner].sub_instances;
            list.push(handle);
            list.len() as u32 - 1
        });

        let node = &mut pool.sub_instances[handle];
        node.index = index;
        node.flags = flags;
        node.parent = Some(instance);
        node.slot = slot;
        node.owner = owner;
        node.owner_slot = owner_slot;
        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Remove a sub-instance. An instance left empty is removed too.
    pub fn remove_sub_instance(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        sub: Handle<PersistentSubInstance>,
    ) -> Result<(), GraphicsError> {
        let node = pool.sub_instances.get(sub).ok_or(PoolError::StaleHandle)?;
        let (parent, slot) = (node.parent, node.slot);

        unlink_sub_instance_owner(pool, sub);
        pool.sub_instances.release(sub)?;

        if let Some(parent) = parent {
            if let Some(moved) = swap_remove(&mut pool.instances[parent].sub_instances, slot) {
                pool.sub_instances[moved].slot = slot;
            }
            if pool.instances[parent].sub_instances.is_empty() {
                self.remove_instance(pool, parent)?;
            }
        }
        Ok(())
    }

    /// Remove an instance with all its sub-instances. Empty parents go too.
    pub fn remove_instance(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        instance: Handle<PersistentInstance>,
    ) -> Result<(), GraphicsError> {
        pool.instances.get(instance).ok_or(PoolError::StaleHandle)?;

        let subs = std::mem::take(&mut pool.instances[instance].sub_instances);
        for &sub in &subs {
            unlink_sub_instance_owner(pool, sub);
            pool.sub_instances.release(sub)?;
        }

        let node = &pool.instances[instance];
        let (parent, slot, owner, owner_slot) = (node.parent, node.slot, node.owner, node.owner_slot);
        let key = node.instance.as_ref().map(|i| i.key());

        if let Some(owner) = owner {
            if let Some(moved) = swap_remove(&mut pool.owners[owner].instances, owner_slot) {
                pool.instances[moved].owner_slot = owner_slot;
            }
        }
        pool.instances.release(instance)?;

        if let Some(vao) = parent {
            let node = &mut pool.vaos[vao];
            if let Some(key) = key {
                set_lookup(&mut node.lookup, key, None);
            }
            if let Some(moved) = swap_remove(&mut node.instances, slot) {
                pool.instances[moved].slot = slot;
            }
            if pool.vaos[vao].instances.is_empty() {
                self.remove_vao(pool, vao)?;
            }
        }
        Ok(())
    }

    fn remove_vao(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        vao: Handle<PersistentVao>,
    ) -> Result<(), GraphicsError> {
        let node = &pool.vaos[vao];
        let (parent, slot) = (node.parent, node.slot);
        let key = node.vao.as_ref().map(|v| v.key());
        pool.vaos.release(vao)?;

        if let Some(texture) = parent {
            let node = &mut pool.textures[texture];
            if let Some(key) = key {
                set_lookup(&mut node.lookup, key, None);
            }
            if let Some(moved) = swap_remove(&mut node.vaos, slot) {
                pool.vaos[moved].slot = slot;
            }
            if pool.textures[texture].vaos.is_empty() {
                self.remove_texture(pool, texture)?;
            }
        }
        Ok(())
    }

    fn remove_texture(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        texture: Handle<PersistentTexture>,
    ) -> Result<(), GraphicsError> {
        let node = &pool.textures[texture];
        let (parent, slot) = (node.parent, node.slot);
        let key = node.texture.as_ref().map(|t| t.key());
        pool.textures.release(texture)?;

        if let Some(pipeline) = parent {
            let node = &mut pool.pipelines[pipeline];
            if let Some(key) = key {
                set_lookup(&mut node.lookup, key, None);
            }
            if let Some(moved) = swap_remove(&mut node.textures, slot) {
                pool.textures[moved].slot = slot;
            }
            if pool.pipelines[pipeline].textures.is_empty() {
                self.remove_pipeline(pool, pipeline)?;
            }
        }
        Ok(())
    }

    fn remove_pipeline(
        &mut self,
        pool: &mut PersistentRenderTaskPool,
        pipeline: Handle<PersistentPipeline>,
    ) -> Result<(), GraphicsError> {
        let node = &pool.pipelines[pipeline];
        let slot = node.slot;
        if let Some(key) = node.pipeline.as_ref().map(|p| p.key()) {
            set_lookup(&mut self.lookup, key, None);
        }
        pool.pipelines.release(pipeline)?;
        if let Some(moved) = swap_remove(&mut self.pipelines, slot) {
            pool.pipelines[moved].slot = slot;
        }
        Ok(())
    }

    /// Release every node and owner back to the pool.
    pub fn clear(&mut self, pool: &mut PersistentRenderTaskPool) -> Result<(), GraphicsError> {
        for pipeline in self.pipelines.drain(..) {
            let textures = std::mem::take(&mut pool.pipelines[pipeline].textures);
            for texture in textures {
                let vaos = std::mem::take(&mut pool.textures[texture].vaos);
                for vao in vaos {
                    let instances = std::mem::take(&mut pool.vaos[vao].instances);
                    for instance in instances {
                        let subs = std::mem::take(&mut pool.instances[instance].sub_instances);
                        for sub in subs {
                            pool.sub_instances.release(sub)?;
                        }
                        pool.instances.release(instance)?;
                    }
                    pool.vaos.release(vao)?;
                }
                pool.textures.release(texture)?;
            }
            pool.pipelines.release(pipeline)?;
        }
        for (_, owner) in self.owners.drain() {
            pool.owners.release(owner)?;
        }
        self.lookup.clear();
        self.render_param_block = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// Instance handles in tree order.
    fn instance_order(&self, pool: &PersistentRenderTaskPool) -> Vec<Handle<PersistentInstance>> {
        let mut order = Vec::new();
        for &pipeline in &self.pipelines {
            for &texture in &pool.pipelines[pipeline].textures {
                for &vao in &pool.textures[texture].vaos {
                    order.extend_from_slice(&pool.vaos[vao].instances);
                }
            }
        }
        order
    }

    /// Assign and write the sub-instance index lists.
    pub fn prepare_for_render(&mut self, pool: &mut PersistentRenderTaskPool) -> Result<(), GraphicsError> {
        if self.pipelines.is_empty() {
            return Ok(());
        }
        let order = self.instance_order(pool);

        self.instance_index.begin(self.packing);
        for &instance in &order {
            let count = pool.instances[instance].sub_instances.len() as u32;
            pool.instances[instance].index_slot = Some(self.instance_index.assign(count)?);
        }
        self.instance_index.finish()?;

        self.instance_index.begin_write();
        let mut entries = Vec::new();
        for &instance in &order {
            let node = &pool.instances[instance];
            let Some(slot) = node.index_slot else {
                continue;
            };
            entries.clear();
            entries.extend(node.sub_instances.iter().map(|&sub| {
                let sub = &pool.sub_instances[sub];
                SubInstance {
                    index: sub.index,
                    flags: sub.flags,
                }
            }));
            self.instance_index.stage(slot, &entries)?;
        }
        self.instance_index.flush()?;

        log::trace!(
            "PersistentRenderTask: prepared {} instances in {} index blocks",
            order.len(),
            self.instance_index.used_block_count()
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    fn textures<'a>(&'a self, pool: &'a PersistentRenderTaskPool) -> impl Iterator<Item = &'a PersistentTexture> {
        self.pipelines
            .iter()
            .flat_map(move |&p| pool.pipelines[p].textures.iter())
            .map(move |&t| &pool.textures[t])
    }

    fn vaos<'a>(&'a self, pool: &'a PersistentRenderTaskPool) -> impl Iterator<Item = &'a PersistentVao> {
        self.textures(pool)
            .flat_map(|t| t.vaos.iter())
            .map(move |&v| &pool.vaos[v])
    }

    fn instances<'a>(&'a self, pool: &'a PersistentRenderTaskPool) -> impl Iterator<Item = &'a PersistentInstance> {
        self.vaos(pool)
            .flat_map(|v| v.instances.iter())
            .map(move |&i| &pool.instances[i])
    }

    pub fn total_texture_count(&self, pool: &PersistentRenderTaskPool) -> usize {
        self.textures(pool).count()
    }

    pub fn total_vao_count(&self, pool: &PersistentRenderTaskPool) -> usize {
        self.vaos(pool).count()
    }

    pub fn total_instance_count(&self, pool: &PersistentRenderTaskPool) -> usize {
        self.instances(pool).count()
    }

    pub fn total_sub_instance_count(&self, pool: &PersistentRenderTaskPool) -> usize {
        self.instances(pool).map(|i| i.sub_instances.len()).sum()
    }

    pub fn total_point_count(&self, pool: &PersistentRenderTaskPool) -> u64 {
        self.instances(pool)
            .map(|i| {
                let points = i.instance.as_ref().map_or(0, |s| u64::from(s.point_count()));
                points * i.sub_instances.len() as u64
            })
            .sum()
    }

    /// Log the tree with per-level statistics.
    pub fn debug_print(&self, pool: &PersistentRenderTaskPool) {
        log::info!(
            "PersistentRenderTask: pipelines={} textures={} vaos={} instances={} sub_instances={} owners={}",
            self.pipeline_count(),
            self.total_texture_count(pool),
            self.total_vao_count(pool),
            self.total_instance_count(pool),
            self.total_sub_instance_count(pool),
            self.owner_count()
        );
        for &p in &self.pipelines {
            let pipeline = &pool.pipelines[p];
            log::info!(
                "- pipeline {:?}: textures={}",
                pipeline.pipeline.as_ref().map(|s| s.label()),
                pipeline.textures.len()
            );
            for &t in &pipeline.textures {
                let texture = &pool.textures[t];
                log::info!(
                    "  - texture tuc={:?}: vaos={}",
                    texture.texture.as_ref().map(|s| s.tuc_id()),
                    texture.vaos.len()
                );
                for &v in &texture.vaos {
                    let vao = &pool.vaos[v];
                    log::info!(
                        "    - vao id={:?}: instances={}",
                        vao.vao.as_ref().map(|s| s.vao_id()),
                        vao.instances.len()
                    );
                }
            }
        }
    }
}

static_assertions::assert_impl_all!(PersistentRenderTask: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_task::persistent::PersistentPoolCapacity;
    use crate::render_task::{InstanceDescriptor, RenderTaskSharedPool};

    struct Fixture {
        shared: RenderTaskSharedPool,
        pool: PersistentRenderTaskPool,
        task: PersistentRenderTask,
        pipeline: Arc<SharedPipeline>,
        texture: Arc<SharedTexture>,
        vao: Arc<SharedVao>,
    }

    fn fixture() -> Fixture {
        let shared = RenderTaskSharedPool::new();
        Fixture {
            pipeline: shared.pipeline("p"),
            texture: shared.texture(0),
            vao: shared.vao(0),
            shared,
            pool: PersistentRenderTaskPool::new(PersistentPoolCapacity::empty()),
            task: PersistentRenderTask::new(GraphicsDevice::dummy(), RenderTaskConfig::default()),
        }
    }

    impl Fixture {
        fn vao_node(&mut self) -> Handle<PersistentVao> {
            let p = self.task.add_pipeline(&mut self.pool, &self.pipeline);
            let t = self.task.add_texture(&mut self.pool, p, &self.texture).unwrap();
            self.task.add_vao(&mut self.pool, t, &self.vao).unwrap()
        }
    }

    #[test]
    fn test_add_reuses_nodes() {
        let mut f = fixture();
        let instance = f.shared.instance(InstanceDescriptor::new(3));
        let v1 = f.vao_node();
        let v2 = f.vao_node();
        assert_eq!(v1, v2);

        let i1 = f.task.add_instance(&mut f.pool, v1, &instance, None).unwrap();
        let i2 = f.task.add_instance(&mut f.pool, v1, &instance, None).unwrap();
        assert_eq!(i1, i2);
        f.task.add_sub_instance(&mut f.pool, i1, 0, 0, None).unwrap();
        f.task.add_sub_instance(&mut f.pool, i1, 1, 0, None).unwrap();

        assert_eq!(f.task.pipeline_count(), 1);
        assert_eq!(f.task.total_instance_count(&f.pool), 1);
        assert_eq!(f.task.total_sub_instance_count(&f.pool), 2);
        assert_eq!(f.task.total_point_count(&f.pool), 6);
    }

    #[test]
    fn test_removing_last_sub_instance_cascades() {
        let mut f = fixture();
        let instance = f.shared.instance(InstanceDescriptor::new(3));
        let vao = f.vao_node();
        let i = f.task.add_instance(&mut f.pool, vao, &instance, None).unwrap();
        let a = f.task.add_sub_instance(&mut f.pool, i, 0, 0, None).unwrap();
        let b = f.task.add_sub_instance(&mut f.pool, i, 1, 0, None).unwrap();

        f.task.remove_sub_instance(&mut f.pool, a).unwrap();
        assert_eq!(f.pool.sub_instance(b).unwrap().slot, 0);
        assert_eq!(f.task.total_instance_count(&f.pool), 1);

        f.task.remove_sub_instance(&mut f.pool, b).unwrap();
        assert_eq!(f.task.pipeline_count(), 0);
        assert_eq!(f.pool.active_counts(), [0; 6]);
        assert!(f.task.pipeline_with(&f.pipeline).is_none());
    }

    #[test]
    fn test_swap_remove_fixes_moved_slot() {
        let mut f = fixture();
        let vao = f.vao_node();
        let instances: Vec<_> = (0..3)
            .map(|_| f.shared.instance(InstanceDescriptor::new(1)))
            .collect();
        let handles: Vec<_> = instances
            .iter()
            .map(|i| {
                let h = f.task.add_instance(&mut f.pool, vao, i, None).unwrap();
                f.task.add_sub_instance(&mut f.pool, h, 0, 0, None).unwrap();
                h
            })
            .collect();

        f.task.remove_instance(&mut f.pool, handles[0]).unwrap();
        let vao_node = f.pool.vao(vao).unwrap();
        assert_eq!(vao_node.instances(), &[handles[2], handles[1]]);
        assert_eq!(f.pool.instance(handles[2]).unwrap().slot, 0);

        // The lookup still finds the moved instance.
        let again = f.task.add_instance(&mut f.pool, vao, &instances[2], None).unwrap();
        assert_eq!(again, handles[2]);
        // And forgets the removed one.
        let fresh = f.task.add_instance(&mut f.pool, vao, &instances[0], None).unwrap();
        assert_ne!(fresh, handles[0]);
    }

    #[test]
    fn test_remove_owned_by() {
        let mut f = fixture();
        let vao = f.vao_node();
        let shared_a = f.shared.instance(InstanceDescriptor::new(1));
        let shared_b = f.shared.instance(InstanceDescriptor::new(1));
        let owner_a = f.task.add_owner(&mut f.pool, OwnerKey::new(1, 0));
        let owner_b = f.task.add_owner(&mut f.pool, OwnerKey::new(2, 0));

        // Both owners add sub-instances to a shared instance.
        let shared_node = f.task.add_instance(&mut f.pool, vao, &shared_a, None).unwrap();
        for n in 0..3 {
            f.task.add_sub_instance(&mut f.pool, shared_node, n, 0, Some(owner_a)).unwrap();
        }
        let kept = f.task.add_sub_instance(&mut f.pool, shared_node, 9, 0, Some(owner_b)).unwrap();

        // Owner A also owns a whole instance.
        let own = f.task.add_instance(&mut f.pool, vao, &shared_b, Some(owner_a)).unwrap();
        f.task.add_sub_instance(&mut f.pool, own, 0, 0, None).unwrap();

        assert_eq!(f.pool.owner(owner_a).unwrap().sub_instance_count(), 3);
        f.task.remove_owned_by(&mut f.pool, owner_a).unwrap();

        assert_eq!(f.pool.owner(owner_a).unwrap().sub_instance_count(), 0);
        assert_eq!(f.pool.owner(owner_a).unwrap().instance_count(), 0);
        assert_eq!(f.task.total_instance_count(&f.pool), 1);
        assert_eq!(f.task.total_sub_instance_count(&f.pool), 1);
        assert_eq!(f.pool.sub_instance(kept).unwrap().index(), 9);
        assert!(f.pool.instance(own).is_none());
    }

    #[test]
    fn test_remove_owner_releases_record() {
        let mut f = fixture();
        let key = OwnerKey::new(5, 1);
        let owner = f.task.add_owner(&mut f.pool, key);
        assert_eq!(f.task.add_owner(&mut f.pool, key), owner);
        f.task.remove_owner(&mut f.pool, owner).unwrap();
        assert!(f.task.owner_with(key).is_none());
        assert!(f.pool.owner(owner).is_none());
    }

    #[test]
    fn test_stale_handle_is_error() {
        let mut f = fixture();
        let instance = f.shared.instance(InstanceDescriptor::new(1));
        let vao = f.vao_node();
        let i = f.task.add_instance(&mut f.pool, vao, &instance, None).unwrap();
        let s = f.task.add_sub_instance(&mut f.pool, i, 0, 0, None).unwrap();
        f.task.remove_sub_instance(&mut f.pool, s).unwrap();

        assert_eq!(
            f.task.remove_sub_instance(&mut f.pool, s),
            Err(GraphicsError::Pool(PoolError::StaleHandle))
        );
        assert!(f.task.add_sub_instance(&mut f.pool, i, 0, 0, None).is_err());
    }

    #[test]
    fn test_clear_returns_everything() {
        let mut f = fixture();
        let vao = f.vao_node();
        let owner = f.task.add_owner(&mut f.pool, OwnerKey::new(1, 1));
        for _ in 0..4 {
            let instance = f.shared.instance(InstanceDescriptor::new(1));
            let i = f.task.add_instance(&mut f.pool, vao, &instance, Some(owner)).unwrap();
            f.task.add_sub_instance(&mut f.pool, i, 0, 0, Some(owner)).unwrap();
        }
        f.task.clear(&mut f.pool).unwrap();
        assert_eq!(f.pool.active_counts(), [0; 6]);
        assert_eq!(f.task.owner_count(), 0);
        assert_eq!(f.task.pipeline_count(), 0);
    }

    #[test]
    fn test_prepare_assigns_slots() {
        let mut f = fixture();
        f.task.set_packing(InstanceIndexPacking::Short);
        let vao = f.vao_node();
        let a = f.shared.instance(InstanceDescriptor::new(1));
        let b = f.shared.instance(InstanceDescriptor::new(1));
        let ia = f.task.add_instance(&mut f.pool, vao, &a, None).unwrap();
        let ib = f.task.add_instance(&mut f.pool, vao, &b, None).unwrap();
        for n in 0..5 {
            f.task.add_sub_instance(&mut f.pool, ia, n, 0, None).unwrap();
        }
        f.task.add_sub_instance(&mut f.pool, ib, 0, 0, None).unwrap();

        f.task.prepare_for_render(&mut f.pool).unwrap();
        let slot_a = f.pool.instance(ia).unwrap().instance_index_slot().unwrap();
        let slot_b = f.pool.instance(ib).unwrap().instance_index_slot().unwrap();
        assert_eq!((slot_a.block, slot_a.first_index), (0, 0));
        assert_eq!((slot_b.block, slot_b.first_index), (0, 5));
        assert_eq!(f.task.instance_index_blocks().block(0).unwrap().element_count(), 1);
    }
}
