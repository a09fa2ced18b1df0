//! # Ember Graphics
//!
//! Render task assembly on top of shader parameter blocks.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`paramblock`] - Typed GPU buffers laid out with std140/std430, and
//!   allocators sharing element ranges of large blocks
//! - [`render_task`] - Per-frame, persistent and compute render tasks
//! - [`world`] - GPU mirror of world elements and the compute shader octree
//! - [`GraphicsDevice`] - Buffer creation and transfers on a [`backend::GpuBackend`]
//!
//! ## Example
//!
//! ```
//! use ember_graphics::GraphicsDevice;
//! use ember_graphics::paramblock::{BlockKind, Parameter, ParameterBlock, ValueType};
//!
//! let device = GraphicsDevice::dummy();
//! let mut block = ParameterBlock::new(device, BlockKind::Uniform);
//! block.set_parameter_count(1);
//! *block.parameter_mut(0).unwrap() = Parameter::new(ValueType::Float, 4, 1, 1);
//! block.map_to_std140().unwrap();
//! block
//!     .with_mapped(0, 1, |block| block.set_parameter(0, 0, [1.0f32, 0.0, 0.0, 1.0]))
//!     .unwrap();
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod paramblock;
pub mod render_task;
pub mod resources;
pub mod types;
pub mod world;

// Re-export main types for convenience
pub use device::{DeviceCapabilities, GraphicsDevice};
pub use error::GraphicsError;
pub use resources::Buffer;
pub use types::{BufferDescriptor, BufferUsage};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
pub fn init() {
    log::info!("Ember Graphics v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_device() {
        let device = GraphicsDevice::dummy();
        assert_eq!(device.name(), "Dummy Backend");
        assert!(device.capabilities().compute_shaders);
    }
}
