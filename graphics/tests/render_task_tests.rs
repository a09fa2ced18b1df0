//! Render task integration tests.
//!
//! Exercise the ephemeral, persistent and compute render tasks together with
//! the shared parameter blocks they reference.

mod common;

use std::sync::Arc;

use rstest::rstest;

use common::TestContext;
use ember_graphics::paramblock::{BlockKind, SharedSpbList};
use ember_graphics::render_task::persistent::{
    OwnerKey, PersistentPoolCapacity, PersistentRenderTask, PersistentRenderTaskPool,
};
use ember_graphics::render_task::{
    ComputeRenderTask, ComputeRenderTaskConfig, InstanceDescriptor, InstanceIndexBacking, InstanceIndexPacking,
    RenderTask, RenderTaskConfig, RenderTaskFilter, RenderTaskSharedPool, VisibleElement,
};
use ember_graphics::world::{ComputeElement, ElementGeometry, ElementType, WorldCompute, WorldComputeConfig};

// ============================================================================
// Ephemeral render task
// ============================================================================

#[test]
fn test_repeated_adds_deduplicate_every_level() {
    let ctx = TestContext::new();
    let shared = RenderTaskSharedPool::new();
    let mut task = RenderTask::new(ctx.device, RenderTaskConfig::default());

    let pipelines = [shared.pipeline("opaque"), shared.pipeline("masked")];
    let texture = shared.texture(7);
    let vao = shared.vao(3);
    let instance = shared.instance(InstanceDescriptor::new(36));

    for frame_object in 0..100u32 {
        let pipeline = &pipelines[(frame_object % 2) as usize];
        task.add_pipeline(pipeline)
            .add_texture(&texture)
            .add_vao(&vao)
            .add_instance(&instance)
            .add_sub_instance(frame_object, 0)
            .unwrap();
    }

    assert_eq!(task.pipeline_count(), 2);
    assert_eq!(task.total_texture_count(), 2);
    assert_eq!(task.total_vao_count(), 2);
    assert_eq!(task.total_instance_count(), 2);
    assert_eq!(task.total_sub_instance_count(), 100);
    assert_eq!(task.total_point_count(), 3600);
}

/// Entries of every instance lie consecutively in tree order, rolling over to
/// the next block only when the current one cannot take the whole instance.
#[rstest]
#[case::index(InstanceIndexPacking::Index, false)]
#[case::index_flags(InstanceIndexPacking::IndexFlags, true)]
fn test_assignment_follows_tree_order(#[case] packing: InstanceIndexPacking, #[case] use_flags: bool) {
    let ctx = TestContext::with_index_entries(32);
    let shared = RenderTaskSharedPool::new();
    let mut task = RenderTask::new(ctx.device, RenderTaskConfig::default().with_packing(packing));
    task.set_use_sub_instance_flags(use_flags);
    assert_eq!(task.packing(), packing);

    let pipeline = shared.pipeline("p");
    let textures = [shared.texture(0), shared.texture(1)];
    let vao = shared.vao(0);
    let sizes = [5u32, 3, 7, 2, 6, 4];
    let instances: Vec<_> = sizes.iter().map(|_| shared.instance(InstanceDescriptor::new(1))).collect();

    for (n, (instance, &size)) in instances.iter().zip(&sizes).enumerate() {
        let node = task
            .add_pipeline(&pipeline)
            .add_texture(&textures[n % 2])
            .add_vao(&vao)
            .add_instance(instance);
        for s in 0..size {
            node.add_sub_instance(s, 1).unwrap();
        }
    }
    task.prepare_for_render().unwrap();

    let max_entries = task.instance_index_blocks().max_entries();
    let mut expected_block = 0;
    let mut expected_first = 0;
    let nodes = task
        .pipelines()
        .flat_map(|p| p.textures())
        .flat_map(|t| t.vaos())
        .flat_map(|v| v.instances());
    for node in nodes {
        let count = node.sub_instance_count();
        if expected_first + count > max_entries {
            expected_block += 1;
            expected_first = 0;
        }
        let slot = node.instance_index_slot().unwrap();
        assert_eq!((slot.block, slot.first_index), (expected_block, expected_first));
        expected_first += count;
    }
    assert_eq!(task.instance_index_blocks().used_block_count(), expected_block + 1);
}

#[test]
fn test_storage_backing_uses_one_block() {
    let ctx = TestContext::with_index_entries(8);
    let shared = RenderTaskSharedPool::new();
    let config = RenderTaskConfig::default().with_backing(InstanceIndexBacking::Storage);
    let mut task = RenderTask::new(ctx.device, config);
    let pipeline = shared.pipeline("p");
    let texture = shared.texture(0);
    let vao = shared.vao(0);

    for _ in 0..4 {
        let instance = shared.instance(InstanceDescriptor::new(1));
        let node = task
            .add_pipeline(&pipeline)
            .add_texture(&texture)
            .add_vao(&vao)
            .add_instance(&instance);
        for s in 0..6 {
            node.add_sub_instance(s, 0).unwrap();
        }
    }
    task.prepare_for_render().unwrap();
    assert_eq!(task.instance_index_blocks().used_block_count(), 1);
}

#[test]
fn test_sub_instances_reference_shared_spb_ranges() {
    let ctx = TestContext::new();
    let mut list = SharedSpbList::new(ctx.device.clone(), BlockKind::Uniform, common::vec4_layout()).unwrap();
    let first = list.add_element(10).unwrap();
    let second = list.add_element(10).unwrap();
    assert_eq!(second.index(), 10);

    let shared = RenderTaskSharedPool::new();
    let instance = shared.instance(InstanceDescriptor::new(4).with_sub_instance_spb(Arc::clone(&second)));
    let mut task = RenderTask::new(ctx.device, RenderTaskConfig::default());
    let node = task
        .add_pipeline(&shared.pipeline("p"))
        .add_texture(&shared.texture(0))
        .add_vao(&shared.vao(0))
        .add_instance(&instance);
    assert!(node.add_sub_instance(9, 0).is_ok());
    assert!(node.add_sub_instance(10, 0).is_err());

    drop(first);
    let block = list.block_at(0).unwrap();
    assert_eq!(block.used_element_count(), 10);
}

// ============================================================================
// Persistent render task
// ============================================================================

#[test]
fn test_removing_an_owner_cascades_to_empty_parents() {
    let ctx = TestContext::new();
    let shared = RenderTaskSharedPool::new();
    let mut pool = PersistentRenderTaskPool::new(PersistentPoolCapacity::empty());
    let mut task = PersistentRenderTask::new(ctx.device, RenderTaskConfig::default());

    let kept_instance = shared.instance(InstanceDescriptor::new(3));
    let owned_instance = shared.instance(InstanceDescriptor::new(3));
    let kept_vao = shared.vao(1);
    let owned_vao = shared.vao(2);
    let pipeline = shared.pipeline("p");
    let texture = shared.texture(0);

    let owner = task.add_owner(&mut pool, OwnerKey::new(1, 0));
    let p = task.add_pipeline(&mut pool, &pipeline);
    let t = task.add_texture(&mut pool, p, &texture).unwrap();

    let v = task.add_vao(&mut pool, t, &kept_vao).unwrap();
    let i = task.add_instance(&mut pool, v, &kept_instance, None).unwrap();
    task.add_sub_instance(&mut pool, i, 0, 0, None).unwrap();

    let v = task.add_vao(&mut pool, t, &owned_vao).unwrap();
    let i = task.add_instance(&mut pool, v, &owned_instance, Some(owner)).unwrap();
    for index in 0..5 {
        task.add_sub_instance(&mut pool, i, index, 0, Some(owner)).unwrap();
    }
    assert_eq!(task.total_vao_count(&pool), 2);
    assert_eq!(task.total_sub_instance_count(&pool), 6);

    task.remove_owner(&mut pool, owner).unwrap();
    assert_eq!(task.owner_count(), 0);
    assert_eq!(task.total_vao_count(&pool), 1);
    assert_eq!(task.total_instance_count(&pool), 1);
    assert_eq!(task.total_sub_instance_count(&pool), 1);

    task.prepare_for_render(&mut pool).unwrap();
    task.clear(&mut pool).unwrap();
    assert_eq!(pool.active_counts(), [0; 6]);
}

// ============================================================================
// Compute render task
// ============================================================================

fn solid_geometry(pipeline_base: u32, instance: u32) -> ElementGeometry {
    ElementGeometry {
        render_filter: RenderTaskFilter::RENDER | RenderTaskFilter::SOLID,
        pipeline_base,
        vao: 1,
        instance,
        ..Default::default()
    }
}

#[test]
fn test_compute_task_sizes_steps_to_world_geometries() {
    let ctx = TestContext::new();
    let mut world = WorldCompute::new(ctx.device.clone(), WorldComputeConfig::default()).unwrap();
    let keys: Vec<_> = (0..4)
        .map(|i| {
            world
                .add_element(
                    ComputeElement::new(ElementType::Component, i)
                        .with_geometries(vec![solid_geometry(0, i as u32), solid_geometry(4, i as u32)]),
                )
                .unwrap()
        })
        .collect();
    world.prepare().unwrap();
    assert_eq!(world.geometry_count(), 8);

    let mut task = ComputeRenderTask::new(ctx.device, ComputeRenderTaskConfig::default()).unwrap();
    task.begin_prepare();
    task.prepare_buffers(&world).unwrap();
    assert!(task.ssbo_steps().element_count() >= 8);

    let visible: Vec<_> = keys.iter().map(|&key| VisibleElement::new(key)).collect();
    let count = task.build_on_cpu(&world, &visible).unwrap();
    task.end_prepare().unwrap();
    assert_eq!(count, 8);

    let steps = task.cpu_steps(count);
    assert!(steps.windows(2).all(|w| w[0].pipeline <= w[1].pipeline));
    assert!(steps.iter().all(|step| step.sub_instance_count == 1));
    assert_eq!(task.read_step_count().unwrap(), 8);
}

#[test]
fn test_transparent_pass_skips_solid_geometry() {
    let ctx = TestContext::new();
    let mut world = WorldCompute::new(ctx.device.clone(), WorldComputeConfig::default()).unwrap();
    let key = world
        .add_element(ComputeElement::new(ElementType::Component, 1).with_geometries(vec![
            solid_geometry(0, 1),
            ElementGeometry {
                render_filter: RenderTaskFilter::RENDER,
                instance: 2,
                ..Default::default()
            },
        ]))
        .unwrap();
    world.prepare().unwrap();

    let config = ComputeRenderTaskConfig::default().with_solid(false);
    let mut task = ComputeRenderTask::new(ctx.device, config).unwrap();
    task.begin_prepare();
    let count = task.build_on_cpu(&world, &[VisibleElement::new(key)]).unwrap();
    assert_eq!(count, 1);
    assert_eq!(task.cpu_steps(1)[0].instance, 2);
}
