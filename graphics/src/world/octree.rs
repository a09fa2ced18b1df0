//! CPU-side loose octree feeding [`WorldCsOctree`].
//!
//! Entries descend into the child octant containing their center as long as
//! their bounds fit the child's loose bounds (twice the child's size).
//! Before writing, [`WorldOctree::update_cs_counts`] counts the nodes and
//! elements the flattened octree needs. [`WorldOctree::write_cs_octree`]
//! then emits exactly that many.

use ember_core::math::DVec3;

use super::compute::ElementType;
use super::cs_octree::WorldCsOctree;

/// Object stored in the octree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctreeEntry {
    pub element_type: ElementType,
    /// Back-link to the CPU object.
    pub link: u64,
    pub min_extend: DVec3,
    pub max_extend: DVec3,
    /// Index of the matching world compute element.
    pub element_index: u32,
    pub layer_mask: u64,
}

impl OctreeEntry {
    pub fn new(element_type: ElementType, link: u64, min_extend: DVec3, max_extend: DVec3) -> Self {
        Self {
            element_type,
            link,
            min_extend,
            max_extend,
            element_index: 0,
            layer_mask: 0,
        }
    }

    pub fn with_element_index(mut self, element_index: u32) -> Self {
        self.element_index = element_index;
        self
    }

    pub fn with_layer_mask(mut self, layer_mask: u64) -> Self {
        self.layer_mask = layer_mask;
        self
    }

    fn center(&self) -> DVec3 {
        (self.min_extend + self.max_extend) * 0.5
    }
}

#[derive(Debug, Clone)]
struct OctreeNode {
    center: DVec3,
    half_size: DVec3,
    children: [Option<usize>; 8],
    entries: Vec<OctreeEntry>,
    cs_node_count: usize,
    cs_element_count: usize,
}

impl OctreeNode {
    fn new(center: DVec3, half_size: DVec3) -> Self {
        Self {
            center,
            half_size,
            children: [None; 8],
            entries: Vec::new(),
            cs_node_count: 0,
            cs_element_count: 0,
        }
    }

    fn loose_min(&self) -> DVec3 {
        self.center - self.half_size * 2.0
    }

    fn loose_max(&self) -> DVec3 {
        self.center + self.half_size * 2.0
    }

    fn octant(&self, point: &DVec3) -> usize {
        usize::from(point.x >= self.center.x)
            | usize::from(point.y >= self.center.y) << 1
            | usize::from(point.z >= self.center.z) << 2
    }

    fn child_center(&self, octant: usize) -> DVec3 {
        let quarter = self.half_size * 0.5;
        let sign = |bit: usize| if octant & bit != 0 { 1.0 } else { -1.0 };
        self.center + DVec3::new(sign(1) * quarter.x, sign(2) * quarter.y, sign(4) * quarter.z)
    }
}

/// Loose octree over world space.
#[derive(Debug, Clone)]
pub struct WorldOctree {
    nodes: Vec<OctreeNode>,
    max_depth: u32,
    entry_count: usize,
}

impl WorldOctree {
    /// Octree centered at `center` covering `half_size` in every direction.
    pub fn new(center: DVec3, half_size: DVec3, max_depth: u32) -> Self {
        Self {
            nodes: vec![OctreeNode::new(center, half_size)],
            max_depth,
            entry_count: 0,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Drop all entries and child nodes.
    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        let root = &mut self.nodes[0];
        root.children = [None; 8];
        root.entries.clear();
        self.entry_count = 0;
    }

    /// Insert an entry. Returns the depth it was stored at.
    pub fn insert(&mut self, entry: OctreeEntry) -> u32 {
        let center = entry.center();
        let mut node = 0;
        let mut depth = 0;

        while depth < self.max_depth {
            let octant = self.nodes[node].octant(&center);
            let child = match self.nodes[node].children[octant] {
                Some(child) => child,
                None => {
                    let child_node =
                        OctreeNode::new(self.nodes[node].child_center(octant), self.nodes[node].half_size * 0.5);
                    if !fits(&entry, &child_node) {
                        break;
                    }
                    self.nodes.push(child_node);
                    let child = self.nodes.len() - 1;
                    self.nodes[node].children[octant] = Some(child);
                    child
                }
            };
            if !fits(&entry, &self.nodes[child]) {
                break;
            }
            node = child;
            depth += 1;
        }

        self.nodes[node].entries.push(entry);
        self.entry_count += 1;
        depth
    }

    /// Count nodes and elements of the flattened octree.
    pub fn update_cs_counts(&mut self) -> (usize, usize) {
        self.update_cs_counts_at(0)
    }

    /// Counts of the last `update_cs_counts`.
    pub fn cs_counts(&self) -> (usize, usize) {
        let root = &self.nodes[0];
        (root.cs_node_count, root.cs_element_count)
    }

    fn update_cs_counts_at(&mut self, node: usize) -> (usize, usize) {
        let mut node_count = 1;
        let mut element_count = self.nodes[node].entries.len();
        for octant in 0..8 {
            if let Some(child) = self.nodes[node].children[octant] {
                let (nodes, elements) = self.update_cs_counts_at(child);
                node_count += nodes;
                element_count += elements;
            }
        }
        let node = &mut self.nodes[node];
        node.cs_node_count = node_count;
        node.cs_element_count = element_count;
        (node_count, element_count)
    }

    /// Write the whole octree into `cs_octree`.
    ///
    /// Children of a node occupy consecutive node records. Each node's own
    /// entries occupy consecutive element records.
    pub fn write_cs_octree(&mut self, cs_octree: &mut WorldCsOctree) -> Result<(), crate::error::GraphicsError> {
        let (node_count, element_count) = self.update_cs_counts();
        cs_octree.begin_writing(node_count, element_count);
        let (root, _) = cs_octree.next_node();
        self.write_node(cs_octree, 0, root);
        log::trace!("WorldOctree: wrote {node_count} nodes, {element_count} elements");
        cs_octree.end_writing()
    }

    fn write_node(&self, cs_octree: &mut WorldCsOctree, node: usize, cs_index: usize) {
        let source = &self.nodes[node];

        let first_element = cs_octree.written_counts().1;
        for entry in &source.entries {
            let min_extend = cs_octree.relative(&entry.min_extend);
            let max_extend = cs_octree.relative(&entry.max_extend);
            let (_, element) = cs_octree.next_element(entry.element_type, entry.link);
            element.min_extend = min_extend;
            element.max_extend = max_extend;
            element.element_index = entry.element_index;
            element.set_layer_mask(entry.layer_mask);
        }

        let children: Vec<usize> = source.children.iter().flatten().copied().collect();
        let first_node = cs_octree.written_counts().0;
        let child_slots: Vec<usize> = children.iter().map(|_| cs_octree.next_node().0).collect();

        let min_extend = cs_octree.relative(&source.loose_min());
        let max_extend = cs_octree.relative(&source.loose_max());
        let record = cs_octree.node_at(cs_index);
        record.min_extend = min_extend;
        record.max_extend = max_extend;
        record.first_node = if children.is_empty() { 0 } else { first_node as u32 };
        record.child_node_count = children.len() as u32;
        record.first_element = first_element as u32;
        record.element_count = source.entries.len() as u32;

        for (child, slot) in children.into_iter().zip(child_slots) {
            self.write_node(cs_octree, child, slot);
        }
    }
}

fn fits(entry: &OctreeEntry, node: &OctreeNode) -> bool {
    let min = node.loose_min();
    let max = node.loose_max();
    (0..3).all(|axis| entry.min_extend[axis] >= min[axis] && entry.max_extend[axis] <= max[axis])
}
