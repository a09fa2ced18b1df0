//! Shader parameter blocks.
//!
//! A parameter block is a GPU buffer holding an array of elements whose
//! layout is described by typed parameters and computed with the std140 or
//! std430 rules. [`SharedBlock`] and [`SharedSpbList`] hand out element
//! ranges of large blocks to many users.

mod block;
mod layout;
mod parameter;
mod shared_block;
mod shared_list;

pub use block::{BlockKind, ParameterBlock, StorageKind};
pub use layout::{LayoutRule, ParameterBlockLayout};
pub use parameter::{Parameter, ParameterData, ValueType};
pub use shared_block::{SharedBlock, SharedBlockElement};
pub use shared_list::SharedSpbList;
