//! Node arenas of persistent render tasks.

use std::sync::Arc;

use ember_core::{Arena, Handle, Poolable};

use crate::render_task::instance_index::InstanceIndexSlot;
use crate::render_task::shared::{SharedInstance, SharedPipeline, SharedTexture, SharedVao};

/// Identity of the CPU object that contributed draw data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    /// Id of the owning object.
    pub object: u64,
    /// Distinguishes several contributions of the same object.
    pub hash: u64,
}

impl OwnerKey {
    pub fn new(object: u64, hash: u64) -> Self {
        Self { object, hash }
    }
}

/// Owner record: everything an owner added.
#[derive(Debug)]
pub struct PersistentOwner {
    pub(crate) key: Option<OwnerKey>,
    pub(crate) instances: Vec<Handle<PersistentInstance>>,
    pub(crate) sub_instances: Vec<Handle<PersistentSubInstance>>,
}

impl Poolable for PersistentOwner {
    fn new_empty() -> Self {
        Self {
            key: None,
            instances: Vec::new(),
            sub_instances: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.key = None;
        self.instances.clear();
        self.sub_instances.clear();
    }
}

impl PersistentOwner {
    pub fn key(&self) -> Option<OwnerKey> {
        self.key
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn sub_instance_count(&self) -> usize {
        self.sub_instances.len()
    }
}

/// Pipeline node.
#[derive(Debug)]
pub struct PersistentPipeline {
    pub(crate) pipeline: Option<Arc<SharedPipeline>>,
    pub(crate) slot: u32,
    pub(crate) textures: Vec<Handle<PersistentTexture>>,
    pub(crate) lookup: Vec<Option<Handle<PersistentTexture>>>,
}

impl Poolable for PersistentPipeline {
    fn new_empty() -> Self {
        Self {
            pipeline: None,
            slot: 0,
            textures: Vec::new(),
            lookup: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.pipeline = None;
        self.slot = 0;
        self.textures.clear();
        self.lookup.clear();
    }
}

impl PersistentPipeline {
    pub fn pipeline(&self) -> Option<&Arc<SharedPipeline>> {
        self.pipeline.as_ref()
    }

    pub fn textures(&self) -> &[Handle<PersistentTexture>] {
        &self.textures
    }
}

/// Texture (TUC) node.
#[derive(Debug)]
pub struct PersistentTexture {
    pub(crate) texture: Option<Arc<SharedTexture>>,
    pub(crate) parent: Option<Handle<PersistentPipeline>>,
    pub(crate) slot: u32,
    pub(crate) vaos: Vec<Handle<PersistentVao>>,
    pub(crate) lookup: Vec<Option<Handle<PersistentVao>>>,
}

impl Poolable for PersistentTexture {
    fn new_empty() -> Self {
        Self {
            texture: None,
            parent: None,
            slot: 0,
            vaos: Vec::new(),
            lookup: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.texture = None;
        self.parent = None;
        self.slot = 0;
        self.vaos.clear();
        self.lookup.clear();
    }
}

impl PersistentTexture {
    pub fn texture(&self) -> Option<&Arc<SharedTexture>> {
        self.texture.as_ref()
    }

    pub fn parent(&self) -> Option<Handle<PersistentPipeline>> {
        self.parent
    }

    pub fn vaos(&self) -> &[Handle<PersistentVao>] {
        &self.vaos
    }
}

/// VAO node.
#[derive(Debug)]
pub struct PersistentVao {
    pub(crate) vao: Option<Arc<SharedVao>>,
    pub(crate) parent: Option<Handle<PersistentTexture>>,
    pub(crate) slot: u32,
    pub(crate) instances: Vec<Handle<PersistentInstance>>,
    pub(crate) lookup: Vec<Option<Handle<PersistentInstance>>>,
}

impl Poolable for PersistentVao {
    fn new_empty() -> Self {
        Self {
            vao: None,
            parent: None,
            slot: 0,
            instances: Vec::new(),
            lookup: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.vao = None;
        self.parent = None;
        self.slot = 0;
        self.instances.clear();
        self.lookup.clear();
    }
}

impl PersistentVao {
    pub fn vao(&self) -> Option<&Arc<SharedVao>> {
        self.vao.as_ref()
    }

    pub fn parent(&self) -> Option<Handle<PersistentTexture>> {
        self.parent
    }

    pub fn instances(&self) -> &[Handle<PersistentInstance>] {
        &self.instances
    }
}

/// Instance node.
#[derive(Debug)]
pub struct PersistentInstance {
    pub(crate) instance: Option<Arc<SharedInstance>>,
    pub(crate) parent: Option<Handle<PersistentVao>>,
    pub(crate) slot: u32,
    pub(crate) owner: Option<Handle<PersistentOwner>>,
    pub(crate) owner_slot: u32,
    pub(crate) sub_instances: Vec<Handle<PersistentSubInstance>>,
    pub(crate) index_slot: Option<InstanceIndexSlot>,
}

impl Poolable for PersistentInstance {
    fn new_empty() -> Self {
        Self {
            instance: None,
            parent: None,
            slot: 0,
            owner: None,
            owner_slot: 0,
            sub_instances: Vec::new(),
            index_slot: None,
        }
    }

    fn reset(&mut self) {
        self.instance = None;
        self.parent = None;
        self.slot = 0;
        self.owner = None;
        self.owner_slot = 0;
        self.sub_instances.clear();
        self.index_slot = None;
    }
}

impl PersistentInstance {
    pub fn instance(&self) -> Option<&Arc<SharedInstance>> {
        self.instance.as_ref()
    }

    pub fn parent(&self) -> Option<Handle<PersistentVao>> {
        self.parent
    }

    pub fn owner(&self) -> Option<Handle<PersistentOwner>> {
        self.owner
    }

    pub fn sub_instances(&self) -> &[Handle<PersistentSubInstance>] {
        &self.sub_instances
    }

    /// Index list location, assigned by `prepare_for_render`.
    pub fn instance_index_slot(&self) -> Option<InstanceIndexSlot> {
        self.index_slot
    }
}

/// Sub-instance node.
#[derive(Debug)]
pub struct PersistentSubInstance {
    pub(crate) index: u32,
    pub(crate) flags: u32,
    pub(crate) parent: Option<Handle<PersistentInstance>>,
    pub(crate) slot: u32,
    pub(crate) owner: Option<Handle<PersistentOwner>>,
    pub(crate) owner_slot: u32,
}

impl Poolable for PersistentSubInstance {
    fn new_empty() -> Self {
        Self {
            index: 0,
            flags: 0,
            parent: None,
            slot: 0,
            owner: None,
            owner_slot: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new_empty();
    }
}

impl PersistentSubInstance {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn parent(&self) -> Option<Handle<PersistentInstance>> {
        self.parent
    }

    pub fn owner(&self) -> Option<Handle<PersistentOwner>> {
        self.owner
    }
}

/// Pre-warm sizes of a [`PersistentRenderTaskPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentPoolCapacity {
    pub owners: usize,
    pub pipelines: usize,
    pub textures: usize,
    pub vaos: usize,
    pub instances: usize,
    pub sub_instances: usize,
}

impl Default for PersistentPoolCapacity {
    /// Sized for typical shadow map scenes.
    fn default() -> Self {
        Self {
            owners: 8000,
            pipelines: 50,
            textures: 500,
            vaos: 1000,
            instances: 2500,
            sub_instances: 50000,
        }
    }
}

impl PersistentPoolCapacity {
    /// No pre-warming at all.
    pub fn empty() -> Self {
        Self {
            owners: 0,
            pipelines: 0,
            textures: 0,
            vaos: 0,
            instances: 0,
            sub_instances: 0,
        }
    }

    pub fn with_owners(mut self, owners: usize) -> Self {
        self.owners = owners;
        self
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_sub_instances(mut self, sub_instances: usize) -> Self {
        self.sub_instances = sub_instances;
        self
    }
}

/// Arenas shared by all persistent render tasks of a render thread.
#[derive(Debug)]
pub struct PersistentRenderTaskPool {
    pub(crate) owners: Arena<PersistentOwner>,
    pub(crate) pipelines: Arena<PersistentPipeline>,
    pub(crate) textures: Arena<PersistentTexture>,
    pub(crate) vaos: Arena<PersistentVao>,
    pub(crate) instances: Arena<PersistentInstance>,
    pub(crate) sub_instances: Arena<PersistentSubInstance>,
}

impl Default for PersistentRenderTaskPool {
    fn default() -> Self {
        Self::new(PersistentPoolCapacity::default())
    }
}

impl PersistentRenderTaskPool {
    pub fn new(capacity: PersistentPoolCapacity) -> Self {
        log::debug!("PersistentRenderTaskPool: pre-warming {capacity:?}");
        Self {
            owners: Arena::with_capacity(capacity.owners),
            pipelines: Arena::with_capacity(capacity.pipelines),
            textures: Arena::with_capacity(capacity.textures),
            vaos: Arena::with_capacity(capacity.vaos),
            instances: Arena::with_capacity(capacity.instances),
            sub_instances: Arena::with_capacity(capacity.sub_instances),
        }
    }

    pub fn owner(&self, handle: Handle<PersistentOwner>) -> Option<&PersistentOwner> {
        self.owners.get(handle)
    }

    pub fn pipeline(&self, handle: Handle<PersistentPipeline>) -> Option<&PersistentPipeline> {
        self.pipelines.get(handle)
    }

    pub fn texture(&self, handle: Handle<PersistentTexture>) -> Option<&PersistentTexture> {
        self.textures.get(handle)
    }

    pub fn vao(&self, handle: Handle<PersistentVao>) -> Option<&PersistentVao> {
        self.vaos.get(handle)
    }

    pub fn instance(&self, handle: Handle<PersistentInstance>) -> Option<&PersistentInstance> {
        self.instances.get(handle)
    }

    pub fn sub_instance(&self, handle: Handle<PersistentSubInstance>) -> Option<&PersistentSubInstance> {
        self.sub_instances.get(handle)
    }

    /// Active node counts: owners, pipelines, textures, VAOs, instances, sub-instances.
    pub fn active_counts(&self) -> [usize; 6] {
        [
            self.owners.len(),
            self.pipelines.len(),
            self.textures.len(),
            self.vaos.len(),
            self.instances.len(),
            self.sub_instances.len(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity_prewarms() {
        let pool = PersistentRenderTaskPool::default();
        assert_eq!(pool.owners.pooled_count(), 8000);
        assert_eq!(pool.instances.pooled_count(), 2500);
        assert_eq!(pool.sub_instances.pooled_count(), 50000);
        assert_eq!(pool.active_counts(), [0; 6]);
    }

    #[test]
    fn test_custom_capacity() {
        let pool = PersistentRenderTaskPool::new(PersistentPoolCapacity::empty().with_owners(3));
        assert_eq!(pool.owners.pooled_count(), 3);
        assert_eq!(pool.sub_instances.pooled_count(), 0);
    }

    #[test]
    fn test_node_reset_clears_links() {
        let mut pool = PersistentRenderTaskPool::new(PersistentPoolCapacity::empty());
        let sub = pool.sub_instances.acquire();
        pool.sub_instances[sub].index = 9;
        pool.sub_instances.release(sub).unwrap();
        let again = pool.sub_instances.acquire();
        assert_eq!(pool.sub_instances[again].index(), 0);
    }
}
