//! Flattened world octree for compute shader culling.
//!
//! The CPU octree is written depth-first into a node array and an element
//! array, then uploaded into storage buffers. Two buffer pairs alternate so
//! the GPU may still read last frame's octree while the next one uploads.
//! Every element also records a link back to the CPU object it came from.

use std::sync::Arc;

use ember_core::math::{relative_to_origin, DVec3};

use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::resources::Buffer;
use crate::types::{BufferDescriptor, BufferUsage};

use super::compute::ElementType;

/// Octree node as read by the culling kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CsNode {
    pub min_extend: [f32; 3],
    pub first_node: u32,
    pub max_extend: [f32; 3],
    pub child_node_count: u32,
    pub first_element: u32,
    pub element_count: u32,
    pub padding: [u32; 2],
}

/// Octree element as read by the culling kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CsElement {
    pub min_extend: [f32; 3],
    pub element_type: u32,
    pub max_extend: [f32; 3],
    /// Index into the world compute element block.
    pub element_index: u32,
    pub layer_mask: [u32; 2],
    pub padding: [u32; 2],
}

static_assertions::const_assert_eq!(std::mem::size_of::<CsNode>(), 48);
static_assertions::const_assert_eq!(std::mem::size_of::<CsElement>(), 48);

impl CsElement {
    pub fn set_layer_mask(&mut self, layer_mask: u64) {
        self.layer_mask = [layer_mask as u32, (layer_mask >> 32) as u32];
    }
}

/// CPU object a written element stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CsElementLink {
    pub element_type: ElementType,
    pub link: u64,
}

#[derive(Debug, Default)]
struct BufferPair {
    nodes: Option<Arc<Buffer>>,
    elements: Option<Arc<Buffer>>,
}

/// Double-buffered compute shader octree.
#[derive(Debug)]
pub struct WorldCsOctree {
    device: Arc<GraphicsDevice>,
    reference_position: DVec3,
    nodes: Vec<CsNode>,
    elements: Vec<CsElement>,
    links: Vec<Option<CsElementLink>>,
    next_node: usize,
    next_element: usize,
    writing: bool,
    buffers: [BufferPair; 2],
    front: usize,
}

impl WorldCsOctree {
    pub fn new(device: Arc<GraphicsDevice>) -> Self {
        Self {
            device,
            reference_position: DVec3::zeros(),
            nodes: Vec::new(),
            elements: Vec::new(),
            links: Vec::new(),
            next_node: 0,
            next_element: 0,
            writing: false,
            buffers: Default::default(),
            front: 0,
        }
    }

    pub fn reference_position(&self) -> DVec3 {
        self.reference_position
    }

    pub fn set_reference_position(&mut self, position: DVec3) {
        self.reference_position = position;
    }

    /// Extends relative to the reference position.
    pub fn relative(&self, position: &DVec3) -> [f32; 3] {
        relative_to_origin(position, &self.reference_position).into()
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Start writing an octree of exactly `node_count` nodes and
    /// `element_count` elements. Resets both cursors.
    pub fn begin_writing(&mut self, node_count: usize, element_count: usize) {
        assert!(!self.writing, "WorldCsOctree: begin_writing while writing");
        self.nodes.clear();
        self.nodes.resize(node_count, CsNode::default());
        self.elements.clear();
        self.elements.resize(element_count, CsElement::default());
        self.links.clear();
        self.links.resize(element_count, None);
        self.next_node = 0;
        self.next_element = 0;
        self.writing = true;
        log::trace!("WorldCsOctree: writing {node_count} nodes, {element_count} elements");
    }

    /// Claim the next node.
    ///
    /// # Panics
    ///
    /// Panics when more nodes are written than declared in `begin_writing`.
    pub fn next_node(&mut self) -> (usize, &mut CsNode) {
        assert!(self.writing, "WorldCsOctree: next_node outside begin/end_writing");
        assert!(
            self.next_node < self.nodes.len(),
            "WorldCsOctree: node cursor overflow ({} declared)",
            self.nodes.len()
        );
        let index = self.next_node;
        self.next_node += 1;
        (index, &mut self.nodes[index])
    }

    /// Claim the next element and record what it links back to.
    ///
    /// # Panics
    ///
    /// Panics when more elements are written than declared in `begin_writing`.
    pub fn next_element(&mut self, element_type: ElementType, link: u64) -> (usize, &mut CsElement) {
        assert!(self.writing, "WorldCsOctree: next_element outside begin/end_writing");
        assert!(
            self.next_element < self.elements.len(),
            "WorldCsOctree: element cursor overflow ({} declared)",
            self.elements.len()
        );
        let index = self.next_element;
        self.next_element += 1;
        self.links[index] = Some(CsElementLink { element_type, link });
        let element = &mut self.elements[index];
        element.element_type = element_type.code();
        (index, element)
    }

    pub fn node_at(&mut self, index: usize) -> &mut CsNode {
        assert!(self.writing, "WorldCsOctree: node_at outside begin/end_writing");
        &mut self.nodes[index]
    }

    pub fn element_at(&mut self, index: usize) -> &mut CsElement {
        assert!(self.writing, "WorldCsOctree: element_at outside begin/end_writing");
        &mut self.elements[index]
    }

    pub fn nodes(&self) -> &[CsNode] {
        &self.nodes
    }

    pub fn elements(&self) -> &[CsElement] {
        &self.elements
    }

    pub fn written_counts(&self) -> (usize, usize) {
        (self.next_node, self.next_element)
    }

    /// Upload into the back buffers and make them the front.
    pub fn end_writing(&mut self) -> Result<(), GraphicsError> {
        if !self.writing {
            return Err(GraphicsError::InvalidState(
                "end_writing without begin_writing".to_string(),
            ));
        }
        self.writing = false;
        if self.next_node != self.nodes.len() || self.next_element != self.elements.len() {
            log::warn!(
                "WorldCsOctree: wrote {}/{} nodes, {}/{} elements",
                self.next_node,
                self.nodes.len(),
                self.next_element,
                self.elements.len()
            );
        }

        let back = 1 - self.front;
        let nodes = upload(&self.device, self.buffers[back].nodes.take(), &self.nodes, "world cs octree nodes")?;
        let elements = upload(
            &self.device,
            self.buffers[back].elements.take(),
            &self.elements,
            "world cs octree elements",
        )?;
        self.buffers[back] = BufferPair { nodes, elements };
        self.front = back;
        Ok(())
    }

    /// Node buffer of the last finished octree. `None` when it had no nodes.
    pub fn node_buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffers[self.front].nodes.as_ref()
    }

    pub fn element_buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffers[self.front].elements.as_ref()
    }

    /// CPU object of a written element.
    pub fn element_link(&self, index: usize) -> Option<CsElementLink> {
        self.links.get(index).copied().flatten()
    }
}

/// Write `data` into `buffer`, recreating it when the size differs.
fn upload<T: bytemuck::Pod>(
    device: &Arc<GraphicsDevice>,
    buffer: Option<Arc<Buffer>>,
    data: &[T],
    label: &str,
) -> Result<Option<Arc<Buffer>>, GraphicsError> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    if bytes.is_empty() {
        return Ok(None);
    }
    let buffer = match buffer {
        Some(buffer) if buffer.size() == bytes.len() as u64 => buffer,
        _ => device.create_buffer(
            &BufferDescriptor::new(bytes.len() as u64, BufferUsage::STORAGE | BufferUsage::COPY_DST)
                .with_label(label),
        )?,
    };
    device.write_buffer(&buffer, 0, bytes)?;
    Ok(Some(buffer))
}

static_assertions::assert_impl_all!(WorldCsOctree: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::device::DeviceCapabilities;

    #[test]
    fn test_cursor_order_and_links() {
        let mut octree = WorldCsOctree::new(GraphicsDevice::dummy());
        octree.begin_writing(2, 3);
        let (index, node) = octree.next_node();
        node.child_node_count = 1;
        assert_eq!(index, 0);
        assert_eq!(octree.next_node().0, 1);
        assert_eq!(octree.next_element(ElementType::Component, 11).0, 0);
        assert_eq!(octree.next_element(ElementType::Light, 12).0, 1);
        assert_eq!(octree.written_counts(), (2, 2));
        octree.end_writing().unwrap();

        assert_eq!(
            octree.element_link(1),
            Some(CsElementLink {
                element_type: ElementType::Light,
                link: 12
            })
        );
        assert_eq!(octree.element_link(2), None);
        assert_eq!(octree.elements()[1].element_type, ElementType::Light.code());
    }

    #[test]
    #[should_panic(expected = "node cursor overflow")]
    fn test_node_overflow_panics() {
        let mut octree = WorldCsOctree::new(GraphicsDevice::dummy());
        octree.begin_writing(1, 0);
        octree.next_node();
        octree.next_node();
    }

    #[test]
    #[should_panic(expected = "element cursor overflow")]
    fn test_element_overflow_panics() {
        let mut octree = WorldCsOctree::new(GraphicsDevice::dummy());
        octree.begin_writing(1, 1);
        octree.next_element(ElementType::Decal, 1);
        octree.next_element(ElementType::Decal, 2);
    }

    #[test]
    fn test_begin_resets_cursors() {
        let mut octree = WorldCsOctree::new(GraphicsDevice::dummy());
        octree.begin_writing(1, 1);
        octree.next_node();
        octree.next_element(ElementType::Billboard, 5);
        octree.end_writing().unwrap();

        octree.begin_writing(1, 1);
        assert_eq!(octree.written_counts(), (0, 0));
        assert_eq!(octree.element_link(0), None);
        assert_eq!(octree.next_node().0, 0);
        octree.end_writing().unwrap();
    }

    #[test]
    fn test_double_buffered_upload() {
        let backend = Arc::new(DummyBackend::new());
        let device = GraphicsDevice::new(backend.clone(), DeviceCapabilities::default());
        let mut octree = WorldCsOctree::new(device);
        octree.set_reference_position(DVec3::new(10.0, 0.0, 0.0));

        octree.begin_writing(1, 1);
        let min = octree.relative(&DVec3::new(9.0, -1.0, -1.0));
        let (_, node) = octree.next_node();
        node.min_extend = min;
        node.element_count = 1;
        let (_, element) = octree.next_element(ElementType::Component, 1);
        element.set_layer_mask(1 << 40);
        octree.end_writing().unwrap();

        let first = octree.node_buffer().unwrap().handle();
        let contents = backend.buffer_contents(first).unwrap();
        let node: CsNode = bytemuck::pod_read_unaligned(&contents);
        assert_eq!(node.min_extend, [-1.0, -1.0, -1.0]);
        assert_eq!(node.element_count, 1);
        let element: CsElement =
            bytemuck::pod_read_unaligned(&backend.buffer_contents(octree.element_buffer().unwrap().handle()).unwrap());
        assert_eq!(element.layer_mask, [0, 1 << 8]);

        octree.begin_writing(1, 0);
        octree.next_node();
        octree.end_writing().unwrap();
        assert_ne!(octree.node_buffer().unwrap().handle(), first);
        assert!(octree.element_buffer().is_none());
    }

    #[test]
    fn test_records_patchable_until_end_writing() {
        let mut octree = WorldCsOctree::new(GraphicsDevice::dummy());
        octree.begin_writing(1, 1);
        octree.next_node();
        octree.next_element(ElementType::Light, 3);
        octree.node_at(0).element_count = 1;
        octree.element_at(0).element_index = 7;
        octree.end_writing().unwrap();
        assert_eq!(octree.nodes()[0].element_count, 1);
        assert_eq!(octree.elements()[0].element_index, 7);
    }

    #[test]
    #[should_panic(expected = "node_at outside begin/end_writing")]
    fn test_node_at_after_end_writing_panics() {
        let mut octree = WorldCsOctree::new(GraphicsDevice::dummy());
        octree.begin_writing(1, 0);
        octree.next_node();
        octree.end_writing().unwrap();
        octree.node_at(0).child_node_count = 2;
    }

    #[test]
    #[should_panic(expected = "element_at outside begin/end_writing")]
    fn test_element_at_after_end_writing_panics() {
        let mut octree = WorldCsOctree::new(GraphicsDevice::dummy());
        octree.begin_writing(0, 1);
        octree.next_element(ElementType::Component, 0);
        octree.end_writing().unwrap();
        octree.element_at(0).element_index = 1;
    }

    #[test]
    fn test_end_without_begin_fails() {
        let mut octree = WorldCsOctree::new(GraphicsDevice::dummy());
        assert!(octree.end_writing().is_err());
    }
}
