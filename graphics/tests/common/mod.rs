//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ember_graphics::backend::dummy::DummyBackend;
use ember_graphics::paramblock::{Parameter, ParameterBlockLayout, ValueType};
use ember_graphics::{DeviceCapabilities, GraphicsDevice};

/// Route `log` output to the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A device on a dummy backend the test can inspect.
pub struct TestContext {
    pub backend: Arc<DummyBackend>,
    pub device: Arc<GraphicsDevice>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::default())
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        init_logging();
        let backend = Arc::new(DummyBackend::new());
        let device = GraphicsDevice::new(backend.clone(), capabilities);
        Self { backend, device }
    }

    /// Uniform block limit holding `entries` instance index entries.
    pub fn with_index_entries(entries: u64) -> Self {
        Self::with_capabilities(DeviceCapabilities::default().with_max_uniform_block_size(entries * 4))
    }
}

/// A mapped compact layout with a single `vec4`.
pub fn vec4_layout() -> ParameterBlockLayout {
    let mut layout = ParameterBlockLayout::new().with_parameter(Parameter::new(ValueType::Float, 4, 1, 1));
    layout
        .map_to_std140(0)
        .expect("single vec4 layout maps");
    layout
}

/// Deterministic pseudo random numbers for property style tests.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1))
    }

    pub fn next_u32(&mut self, bound: u32) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) % u64::from(bound)) as u32
    }
}
