//! Shared render-task identities.
//!
//! Pipelines, texture unit configurations (TUCs), VAOs and draw instances are
//! identified in render tasks by dense unique keys. Keys come from per-kind
//! [`UniqueKeyPool`]s owned by a [`RenderTaskSharedPool`] and go back to the
//! pool when the last `Arc` of the shared object drops, so the direct-indexed
//! lookup tables of render tasks stay small.

use std::sync::Arc;

use ember_core::UniqueKeyPool;
use parking_lot::Mutex;

use crate::paramblock::SharedBlockElement;

type KeyPool = Arc<Mutex<UniqueKeyPool>>;

/// A key taken from a key pool, returned on drop.
#[derive(Debug)]
struct PooledKey {
    key: u32,
    pool: KeyPool,
    kind: &'static str,
}

impl PooledKey {
    fn take(pool: &KeyPool, kind: &'static str) -> Self {
        let key = pool.lock().get();
        log::trace!("RenderTaskSharedPool: {kind} key {key} taken");
        Self {
            key,
            pool: Arc::clone(pool),
            kind,
        }
    }
}

impl Drop for PooledKey {
    fn drop(&mut self) {
        if let Err(e) = self.pool.lock().put(self.key) {
            log::error!("RenderTaskSharedPool: returning {} key failed: {e}", self.kind);
        }
    }
}

/// Primitive topology of an instance's draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveType {
    Points,
    Lines,
    #[default]
    Triangles,
    Patches,
}

/// A pipeline (shader program plus fixed state) known to render tasks.
#[derive(Debug)]
pub struct SharedPipeline {
    key: PooledKey,
    label: String,
}

impl SharedPipeline {
    pub fn key(&self) -> u32 {
        self.key.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A texture unit configuration.
#[derive(Debug)]
pub struct SharedTexture {
    key: PooledKey,
    tuc_id: u64,
}

impl SharedTexture {
    pub fn key(&self) -> u32 {
        self.key.key
    }

    /// Id of the external texture unit configuration.
    pub fn tuc_id(&self) -> u64 {
        self.tuc_id
    }
}

/// A vertex array object.
#[derive(Debug)]
pub struct SharedVao {
    key: PooledKey,
    vao_id: u64,
}

impl SharedVao {
    pub fn key(&self) -> u32 {
        self.key.key
    }

    pub fn vao_id(&self) -> u64 {
        self.vao_id
    }
}

/// Draw parameters of a shared instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceDescriptor {
    pub first_point: u32,
    pub point_count: u32,
    pub first_index: u32,
    pub index_count: u32,
    pub primitive: PrimitiveType,
    /// Per sub-instance parameters. Sub-instance indices must fall inside it.
    pub sub_instance_spb: Option<Arc<SharedBlockElement>>,
}

impl InstanceDescriptor {
    pub fn new(point_count: u32) -> Self {
        Self {
            point_count,
            ..Default::default()
        }
    }

    pub fn with_first_point(mut self, first_point: u32) -> Self {
        self.first_point = first_point;
        self
    }

    pub fn with_indices(mut self, first_index: u32, index_count: u32) -> Self {
        self.first_index = first_index;
        self.index_count = index_count;
        self
    }

    pub fn with_primitive(mut self, primitive: PrimitiveType) -> Self {
        self.primitive = primitive;
        self
    }

    pub fn with_sub_instance_spb(mut self, element: Arc<SharedBlockElement>) -> Self {
        self.sub_instance_spb = Some(element);
        self
    }
}

/// A draw instance: a point/index range of a VAO.
#[derive(Debug)]
pub struct SharedInstance {
    key: PooledKey,
    descriptor: InstanceDescriptor,
}

impl SharedInstance {
    pub fn key(&self) -> u32 {
        self.key.key
    }

    pub fn first_point(&self) -> u32 {
        self.descriptor.first_point
    }

    pub fn point_count(&self) -> u32 {
        self.descriptor.point_count
    }

    pub fn first_index(&self) -> u32 {
        self.descriptor.first_index
    }

    pub fn index_count(&self) -> u32 {
        self.descriptor.index_count
    }

    pub fn primitive(&self) -> PrimitiveType {
        self.descriptor.primitive
    }

    pub fn sub_instance_spb(&self) -> Option<&Arc<SharedBlockElement>> {
        self.descriptor.sub_instance_spb.as_ref()
    }
}

/// Factory for shared render-task identities.
#[derive(Debug, Default)]
pub struct RenderTaskSharedPool {
    pipelines: KeyPool,
    textures: KeyPool,
    vaos: KeyPool,
    instances: KeyPool,
}

impl RenderTaskSharedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(&self, label: impl Into<String>) -> Arc<SharedPipeline> {
        Arc::new(SharedPipeline {
            key: PooledKey::take(&self.pipelines, "pipeline"),
            label: label.into(),
        })
    }

    pub fn texture(&self, tuc_id: u64) -> Arc<SharedTexture> {
        Arc::new(SharedTexture {
            key: PooledKey::take(&self.textures, "texture"),
            tuc_id,
        })
    }

    pub fn vao(&self, vao_id: u64) -> Arc<SharedVao> {
        Arc::new(SharedVao {
            key: PooledKey::take(&self.vaos, "vao"),
            vao_id,
        })
    }

    pub fn instance(&self, descriptor: InstanceDescriptor) -> Arc<SharedInstance> {
        Arc::new(SharedInstance {
            key: PooledKey::take(&self.instances, "instance"),
            descriptor,
        })
    }

    /// Keys currently held by live shared pipelines.
    pub fn pipeline_key_count(&self) -> usize {
        self.pipelines.lock().in_use_count()
    }

    pub fn texture_key_count(&self) -> usize {
        self.textures.lock().in_use_count()
    }

    pub fn vao_key_count(&self) -> usize {
        self.vaos.lock().in_use_count()
    }

    pub fn instance_key_count(&self) -> usize {
        self.instances.lock().in_use_count()
    }
}

static_assertions::assert_impl_all!(SharedInstance: Send, Sync);
static_assertions::assert_impl_all!(RenderTaskSharedPool: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_dense_and_recycled() {
        let pool = RenderTaskSharedPool::new();
        let a = pool.pipeline("a");
        let b = pool.pipeline("b");
        assert_eq!((a.key(), b.key()), (0, 1));
        assert_eq!(pool.pipeline_key_count(), 2);

        drop(a);
        assert_eq!(pool.pipeline_key_count(), 1);
        let c = pool.pipeline("c");
        assert_eq!(c.key(), 0);
        assert_eq!(c.label(), "c");
    }

    #[test]
    fn test_kinds_have_separate_keys() {
        let pool = RenderTaskSharedPool::new();
        let texture = pool.texture(7);
        let vao = pool.vao(9);
        assert_eq!(texture.key(), 0);
        assert_eq!(vao.key(), 0);
        assert_eq!(texture.tuc_id(), 7);
        assert_eq!(vao.vao_id(), 9);
    }

    #[test]
    fn test_key_held_until_last_arc() {
        let pool = RenderTaskSharedPool::new();
        let instance = pool.instance(InstanceDescriptor::new(36).with_indices(0, 36));
        let clone = Arc::clone(&instance);
        drop(instance);
        assert_eq!(pool.instance_key_count(), 1);
        assert_eq!(clone.index_count(), 36);
        drop(clone);
        assert_eq!(pool.instance_key_count(), 0);
    }
}
