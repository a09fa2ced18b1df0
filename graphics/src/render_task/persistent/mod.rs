//! Persistent render tasks.
//!
//! A [`PersistentRenderTask`] keeps its tree across frames and supports
//! removing single sub-instances or everything an owner contributed. Nodes
//! come from a [`PersistentRenderTaskPool`] shared by all persistent tasks of
//! a render thread, so the task itself only stores handles.

mod pool;
mod task;

pub use pool::{
    OwnerKey, PersistentInstance, PersistentOwner, PersistentPipeline, PersistentPoolCapacity,
    PersistentRenderTaskPool, PersistentSubInstance, PersistentTexture, PersistentVao,
};
pub use task::PersistentRenderTask;
