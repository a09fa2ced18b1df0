//! World-side GPU data.
//!
//! [`WorldCompute`] mirrors renderable elements into storage blocks,
//! [`WorldOctree`] partitions them spatially and [`WorldCsOctree`] holds the
//! flattened octree the culling kernels traverse.

mod compute;
mod cs_octree;
mod octree;

pub use compute::{
    ComputeElement, ElementFlags, ElementGeometry, ElementKey, ElementType, UpdateKind, WorldCompute,
    WorldComputeConfig,
};
pub use cs_octree::{CsElement, CsElementLink, CsNode, WorldCsOctree};
pub use octree::{OctreeEntry, WorldOctree};
