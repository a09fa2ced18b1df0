//! Parameter block layout and shared block allocator tests.

mod common;

use rstest::rstest;

use common::{Lcg, TestContext};
use ember_graphics::GraphicsError;
use ember_graphics::paramblock::{
    BlockKind, Parameter, ParameterBlock, ParameterBlockLayout, SharedBlock, SharedBlockElement, StorageKind,
    ValueType,
};

// ============================================================================
// Layout
// ============================================================================

fn float(components: u32) -> Parameter {
    Parameter::new(ValueType::Float, components, 1, 1)
}

#[rstest]
#[case::vec4(vec![float(4)], 16)]
#[case::two_vec3(vec![float(3), float(3)], 32)]
#[case::vec3_then_float(vec![float(3), float(1)], 16)]
#[case::float_then_vec2(vec![float(1), float(2)], 16)]
#[case::mat4(vec![Parameter::new(ValueType::Float, 4, 4, 1)], 64)]
#[case::float_array(vec![Parameter::new(ValueType::Float, 1, 1, 3)], 48)]
fn test_std140_stride(#[case] parameters: Vec<Parameter>, #[case] stride: u32) {
    let mut layout = parameters
        .into_iter()
        .fold(ParameterBlockLayout::new(), ParameterBlockLayout::with_parameter);
    layout.map_to_std140(0).unwrap();
    assert_eq!(layout.element_stride(), stride);
}

#[test]
fn test_two_vec3_offsets() {
    let mut layout = ParameterBlockLayout::new()
        .with_parameter(float(3))
        .with_parameter(float(3));
    layout.map_to_std140(0).unwrap();
    assert_eq!(layout.parameter(0).unwrap().offset(), 0);
    assert_eq!(layout.parameter(1).unwrap().offset(), 16);
}

#[test]
fn test_std430_packs_arrays() {
    let mut layout = ParameterBlockLayout::new().with_parameter(Parameter::new(ValueType::Float, 1, 1, 3));
    layout.map_to_std430(0).unwrap();
    assert_eq!(layout.element_stride(), 12);
}

#[rstest]
#[case::uniform(BlockKind::Uniform, 256)]
#[case::storage(BlockKind::Storage(StorageKind::Stream), 16)]
fn test_padded_blocks_honour_offset_alignment(#[case] kind: BlockKind, #[case] stride: u32) {
    let ctx = TestContext::new();
    let mut block = ParameterBlock::new(ctx.device, kind);
    block.set_parameter_count(1);
    *block.parameter_mut(0).unwrap() = float(4);
    block.set_compact(false);
    block.map_to_std140().unwrap();
    assert_eq!(block.element_stride(), stride);
}

// ============================================================================
// Mapping and read back
// ============================================================================

#[test]
fn test_static_storage_maps_whole_only() {
    let ctx = TestContext::new();
    let mut block = ParameterBlock::with_layout(
        ctx.device,
        BlockKind::Storage(StorageKind::Static),
        common::vec4_layout(),
    );
    block.set_element_count(4).unwrap();
    assert!(matches!(
        block.map_buffer_range(1, 2),
        Err(GraphicsError::InvalidParameter(_))
    ));
    block.map_buffer().unwrap();
    block.unmap_buffer().unwrap();
}

#[test]
fn test_gpu_block_cannot_be_mapped() {
    let ctx = TestContext::new();
    let mut block =
        ParameterBlock::with_layout(ctx.device, BlockKind::Storage(StorageKind::Gpu), common::vec4_layout());
    assert!(block.map_buffer().is_err());
    assert!(!block.is_mapped());
}

#[test]
fn test_upload_reaches_backend() {
    let ctx = TestContext::new();
    let mut block = ParameterBlock::with_layout(ctx.device, BlockKind::Uniform, common::vec4_layout());
    block.set_element_count(2).unwrap();
    block
        .with_mapped(1, 1, |block| block.set_parameter(0, 1, [1.0f32, 2.0, 3.0, 4.0]))
        .unwrap();

    let data = ctx
        .backend
        .buffer_contents(block.buffer().unwrap().handle())
        .unwrap();
    assert_eq!(f32::from_le_bytes(data[16..20].try_into().unwrap()), 1.0);
    assert_eq!(f32::from_le_bytes(data[28..32].try_into().unwrap()), 4.0);
}

#[test]
fn test_read_back_gpu_results() {
    let ctx = TestContext::new();
    let mut block = ParameterBlock::with_layout(
        ctx.device,
        BlockKind::Storage(StorageKind::Read),
        ParameterBlockLayout::new().with_parameter(Parameter::new(ValueType::UInt, 4, 1, 1)),
    );
    block.map_to_std430().unwrap();
    block.set_element_count(2).unwrap();
    block.ensure_buffer().unwrap();

    let gpu_data: Vec<u8> = [5u32, 6, 7, 8].iter().flat_map(|v| v.to_le_bytes()).collect();
    ctx.backend
        .simulate_gpu_write(block.buffer().unwrap().handle(), 16, &gpu_data)
        .unwrap();

    block.gpu_finished_writing().unwrap();
    block.gpu_read_to_cpu(2).unwrap();
    block.map_buffer_read(1, 1).unwrap();
    assert_eq!(block.read_uint(0, 1, 2).unwrap(), 7);
    assert!(block.read_uint(0, 0, 0).is_err());
    block.unmap_buffer_read().unwrap();
}

// ============================================================================
// Shared block allocator
// ============================================================================

fn shared_block(count: u32) -> SharedBlock {
    let ctx = TestContext::new();
    let mut block =
        ParameterBlock::with_layout(ctx.device, BlockKind::Storage(StorageKind::Stream), common::vec4_layout());
    block.set_element_count(count).unwrap();
    SharedBlock::new(block)
}

fn assert_disjoint(elements: &[SharedBlockElement]) {
    let mut ranges: Vec<(u32, u32)> = elements.iter().map(|e| (e.index(), e.index() + e.count())).collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping ranges {pair:?}");
    }
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(42)]
#[case(1234)]
fn test_random_churn_keeps_ranges_disjoint_and_coalesces(#[case] seed: u64) {
    let block = shared_block(256);
    let mut rng = Lcg::new(seed);
    let mut live: Vec<SharedBlockElement> = Vec::new();

    for _ in 0..500 {
        if live.is_empty() || rng.next_u32(3) > 0 {
            if let Some(element) = block.get_element(rng.next_u32(8) + 1).unwrap() {
                live.push(element);
            }
        } else {
            let index = rng.next_u32(live.len() as u32) as usize;
            live.swap_remove(index);
        }
        assert_disjoint(&live);
        let used: u32 = live.iter().map(SharedBlockElement::count).sum();
        assert_eq!(block.used_element_count(), used);
    }

    live.clear();
    assert_eq!(block.used_element_count(), 0);
    assert_eq!(block.empty_ranges(), vec![(0, 256)]);
}

#[test]
fn test_freed_front_range_is_reused() {
    let block = shared_block(32);
    let a = block.get_element(4).unwrap().unwrap();
    let b = block.get_element(4).unwrap().unwrap();
    let _c = block.get_element(4).unwrap().unwrap();
    assert_eq!((a.index(), b.index()), (0, 4));

    drop(b);
    let d = block.get_element(2).unwrap().unwrap();
    assert_eq!(d.index(), 4);
}

#[test]
fn test_exact_fit_is_preferred() {
    let block = shared_block(20);
    let _a = block.get_element(2).unwrap().unwrap();
    let b = block.get_element(3).unwrap().unwrap();
    let _c = block.get_element(2).unwrap().unwrap();
    let d = block.get_element(2).unwrap().unwrap();
    let _e = block.get_element(2).unwrap().unwrap();
    assert_eq!((b.index(), d.index()), (2, 7));

    drop(b);
    drop(d);
    let exact = block.get_element(2).unwrap().unwrap();
    assert_eq!(exact.index(), 7);
    let front = block.get_element(2).unwrap().unwrap();
    assert_eq!(front.index(), 2);
}

#[test]
fn test_exhaustion_is_not_an_error() {
    let block = shared_block(4);
    let _all = block.get_element(4).unwrap().unwrap();
    assert!(block.get_element(1).unwrap().is_none());
    block.grow(6).unwrap();
    assert_eq!(block.get_element(2).unwrap().unwrap().index(), 4);
}
