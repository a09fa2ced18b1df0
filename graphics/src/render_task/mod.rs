//! Render tasks.
//!
//! A render task groups draw work as pipeline → texture → VAO → instance →
//! sub-instance so that state changes happen as rarely as possible.
//!
//! - [`RenderTask`]: rebuilt every frame from pooled nodes.
//! - [`PersistentRenderTask`](persistent::PersistentRenderTask): kept across
//!   frames with incremental removal.
//! - [`ComputeRenderTask`](compute::ComputeRenderTask): GPU-side render task
//!   built by compute shaders from the world octree.

pub mod compute;
mod instance_index;
pub mod persistent;
mod shared;
mod task;

pub use compute::{
    ComputeRenderTask, ComputeRenderTaskConfig, ComputeRenderTaskState, ComputeRenderTaskStep, PipelineListMask,
    PipelineModifier, PipelineType, RenderTaskFilter, VisibleElement,
};
pub use instance_index::{
    instance_index_layout, InstanceIndexBacking, InstanceIndexBlocks, InstanceIndexPacking, InstanceIndexSlot,
    SubInstance,
};
pub use shared::{
    InstanceDescriptor, PrimitiveType, RenderTaskSharedPool, SharedInstance, SharedPipeline, SharedTexture,
    SharedVao,
};
pub use task::{RenderTask, RenderTaskConfig, RenderTaskInstance, RenderTaskPipeline, RenderTaskTexture, RenderTaskVao};
