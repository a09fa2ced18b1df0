//! Free-list allocator carving one parameter block into element ranges.
//!
//! The block's elements are partitioned into consecutive ranges, each either
//! occupied by a [`SharedBlockElement`] or empty. The last range is the
//! "terminal" range. Non-terminal empty ranges are tracked in a side set so
//! allocation prefers holes near the front before eating into the terminal
//! range. Released ranges merge with empty neighbours immediately.
//!
//! An element dropped while its block is locked, for example inside
//! [`SharedBlockElement::with_mapped`], is queued and merged on the next lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::GraphicsError;

use super::block::ParameterBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRange {
    count: u32,
    empty: bool,
}

#[derive(Debug)]
struct SharedBlockState {
    block: ParameterBlock,
    /// Ranges keyed by first element, covering the whole block.
    ranges: BTreeMap<u32, BlockRange>,
    /// First elements of the empty ranges that are not the terminal range.
    empty: BTreeSet<u32>,
    used: u32,
}

impl SharedBlockState {
    fn is_terminal(&self, index: u32) -> bool {
        self.ranges.range(index + 1..).next().is_none()
    }

    fn find_empty(&self, count: u32) -> Option<u32> {
        let mut first_fit = None;
        for &index in &self.empty {
            let size = self.ranges[&index].count;
            if size == count {
                return Some(index);
            }
            if size > count && first_fit.is_none() {
                first_fit = Some(index);
            }
        }
        if first_fit.is_some() {
            return first_fit;
        }

        self.ranges
            .last_key_value()
            .filter(|(_, range)| range.empty && range.count >= count)
            .map(|(&index, _)| index)
    }

    fn take(&mut self, index: u32, count: u32) {
        let terminal = self.is_terminal(index);
        let Some(range) = self.ranges.get_mut(&index) else {
            return;
        };
        let leftover = range.count - count;
        *range = BlockRange { count, empty: false };
        self.empty.remove(&index);

        if leftover > 0 {
            let rest = index + count;
            self.ranges.insert(
                rest,
                BlockRange {
                    count: leftover,
                    empty: true,
                },
            );
            if !terminal {
                self.empty.insert(rest);
            }
        }
        self.used += count;
    }

    fn give_back(&mut self, index: u32, count: u32) {
        let Some(range) = self.ranges.get_mut(&index) else {
            log::error!("SharedBlock: returned range {index}+{count} is unknown");
            return;
        };
        if range.empty || range.count != count {
            log::error!(
                "SharedBlock: returned range {index}+{count} does not match {:?}",
                range
            );
            return;
        }
        range.empty = true;
        self.used -= count;

        let mut start = index;
        let mut size = count;

        let next = index + count;
        if let Some(right) = self.ranges.get(&next).copied().filter(|r| r.empty) {
            self.ranges.remove(&next);
            self.empty.remove(&next);
            size += right.count;
        }

        let left = self
            .ranges
            .range(..index)
            .next_back()
            .map(|(&left_index, range)| (left_index, *range));
        if let Some((left_index, left)) = left {
            if left.empty {
                self.ranges.remove(&index);
                self.empty.remove(&left_index);
                start = left_index;
                size += left.count;
            }
        }

        self.ranges.insert(
            start,
            BlockRange {
                count: size,
                empty: true,
            },
        );
        if self.is_terminal(start) {
            self.empty.remove(&start);
        } else {
            self.empty.insert(start);
        }
    }
}

/// Block state plus the ranges released while the state was locked.
#[derive(Debug)]
struct SharedBlockInner {
    state: Mutex<SharedBlockState>,
    deferred: Mutex<Vec<(u32, u32)>>,
}

impl SharedBlockInner {
    fn new(state: SharedBlockState) -> Self {
        Self {
            state: Mutex::new(state),
            deferred: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedBlockState> {
        let mut state = self.state.lock();
        for (index, count) in self.deferred.lock().drain(..) {
            state.give_back(index, count);
        }
        state
    }

    fn release(&self, index: u32, count: u32) {
        match self.state.try_lock() {
            Some(mut state) => {
                for (index, count) in self.deferred.lock().drain(..) {
                    state.give_back(index, count);
                }
                state.give_back(index, count);
            }
            None => {
                log::trace!("SharedBlock: block locked, deferring return of {index}+{count}");
                self.deferred.lock().push((index, count));
            }
        }
    }
}

/// Parameter block shared between many variable-length elements.
///
/// Cloning is cheap; clones refer to the same block.
#[derive(Debug, Clone)]
pub struct SharedBlock {
    inner: Arc<SharedBlockInner>,
}

impl SharedBlock {
    /// Wrap a block. All its elements start as one empty range.
    pub fn new(block: ParameterBlock) -> Self {
        let count = block.element_count();
        let mut ranges = BTreeMap::new();
        ranges.insert(0, BlockRange { count, empty: true });
        Self {
            inner: Arc::new(SharedBlockInner::new(SharedBlockState {
                block,
                ranges,
                empty: BTreeSet::new(),
                used: 0,
            })),
        }
    }

    /// Allocate `count` consecutive elements.
    ///
    /// Returns `Ok(None)` if no empty range is large enough.
    ///
    /// # Errors
    ///
    /// Fails for a zero count.
    pub fn get_element(&self, count: u32) -> Result<Option<SharedBlockElement>, GraphicsError> {
        if count == 0 {
            return Err(GraphicsError::InvalidParameter(
                "shared block element count must be at least 1".to_string(),
            ));
        }
        let mut state = self.inner.lock();
        let Some(index) = state.find_empty(count) else {
            return Ok(None);
        };
        state.take(index, count);
        log::trace!("SharedBlock: allocated {index}+{count}");
        Ok(Some(SharedBlockElement {
            shared: Arc::clone(&self.inner),
            index,
            count,
        }))
    }

    /// Total number of elements of the backing block.
    pub fn element_count(&self) -> u32 {
        self.inner.lock().block.element_count()
    }

    /// Number of elements held by live elements.
    pub fn used_element_count(&self) -> u32 {
        self.inner.lock().used
    }

    /// Size of the terminal range if it is empty.
    pub fn free_element_count_at_end(&self) -> u32 {
        self.inner
            .lock()
            .ranges
            .last_key_value()
            .filter(|(_, range)| range.empty)
            .map_or(0, |(_, range)| range.count)
    }

    /// Number of empty ranges, the terminal one included.
    pub fn empty_range_count(&self) -> usize {
        self.inner
            .lock()
            .ranges
            .values()
            .filter(|range| range.empty)
            .count()
    }

    /// `(index, count)` of every empty range in ascending order.
    pub fn empty_ranges(&self) -> Vec<(u32, u32)> {
        self.inner
            .lock()
            .ranges
            .iter()
            .filter(|(_, range)| range.empty)
            .map(|(&index, range)| (index, range.count))
            .collect()
    }

    /// Grow the backing block to `new_count` elements.
    ///
    /// The new elements extend the terminal range if it is empty, or become a
    /// new terminal range otherwise. Shrinking is ignored.
    pub fn grow(&self, new_count: u32) -> Result<(), GraphicsError> {
        let mut state = self.inner.lock();
        let old_count = state.block.element_count();
        if new_count <= old_count {
            return Ok(());
        }
        state.block.set_element_count(new_count)?;
        let added = new_count - old_count;

        match state.ranges.last_entry() {
            Some(mut last) if last.get().empty => last.get_mut().count += added,
            _ => {
                state.ranges.insert(
                    old_count,
                    BlockRange {
                        count: added,
                        empty: true,
                    },
                );
            }
        }
        log::debug!("SharedBlock: grown from {old_count} to {new_count} elements");
        Ok(())
    }

    /// Exclusive access to the backing block.
    pub fn lock_block(&self) -> MappedMutexGuard<'_, ParameterBlock> {
        MutexGuard::map(self.inner.lock(), |state| &mut state.block)
    }

    /// Whether `element` was allocated from this block.
    pub fn owns(&self, element: &SharedBlockElement) -> bool {
        Arc::ptr_eq(&self.inner, &element.shared)
    }

    pub fn ptr_eq(&self, other: &SharedBlock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A live `[index, index + count)` range of a [`SharedBlock`].
///
/// Dropping the element returns the range to the block.
#[derive(Debug)]
pub struct SharedBlockElement {
    shared: Arc<SharedBlockInner>,
    index: u32,
    count: u32,
}

impl SharedBlockElement {
    /// First element of the range.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// The block this element was allocated from.
    pub fn shared_block(&self) -> SharedBlock {
        SharedBlock {
            inner: Arc::clone(&self.shared),
        }
    }

    /// Exclusive access to the backing block.
    pub fn lock_block(&self) -> MappedMutexGuard<'_, ParameterBlock> {
        MutexGuard::map(self.shared.lock(), |state| &mut state.block)
    }

    /// Map this element's range, run `f` with the block and the first element
    /// index, then unmap.
    pub fn with_mapped<R>(
        &self,
        f: impl FnOnce(&mut ParameterBlock, u32) -> Result<R, GraphicsError>,
    ) -> Result<R, GraphicsError> {
        let index = self.index;
        self.lock_block()
            .with_mapped(index, self.count, |block| f(block, index))
    }
}

impl Drop for SharedBlockElement {
    fn drop(&mut self) {
        log::trace!("SharedBlock: returned {}+{}", self.index, self.count);
        self.shared.release(self.index, self.count);
    }
}

static_assertions::assert_impl_all!(SharedBlock: Send, Sync);
static_assertions::assert_impl_all!(SharedBlockElement: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GraphicsDevice;
    use crate::paramblock::{BlockKind, StorageKind, ValueType};

    fn shared(count: u32) -> SharedBlock {
        let mut block = ParameterBlock::new(GraphicsDevice::dummy(), BlockKind::Storage(StorageKind::Stream));
        block.set_parameter_count(1);
        block.parameter_mut(0).unwrap().set_all(ValueType::Int, 4, 1, 1);
        block.map_to_std140().unwrap();
        block.set_element_count(count).unwrap();
        SharedBlock::new(block)
    }

    #[test]
    fn test_zero_count_fails() {
        let block = shared(10);
        assert!(block.get_element(0).is_err());
    }

    #[test]
    fn test_sequential_allocation() {
        let block = shared(100);
        let a = block.get_element(30).unwrap().unwrap();
        let b = block.get_element(40).unwrap().unwrap();
        assert_eq!((a.index(), a.count()), (0, 30));
        assert_eq!((b.index(), b.count()), (30, 40));
        assert_eq!(block.used_element_count(), 70);
        assert_eq!(block.free_element_count_at_end(), 30);
    }

    #[test]
    fn test_front_fit_reuses_freed_range() {
        let block = shared(100);
        let a = block.get_element(30).unwrap().unwrap();
        let _b = block.get_element(40).unwrap().unwrap();
        drop(a);
        let c = block.get_element(30).unwrap().unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(block.free_element_count_at_end(), 30);
    }

    #[test]
    fn test_exact_fit_preferred_over_first_fit() {
        let block = shared(100);
        let a = block.get_element(20).unwrap().unwrap();
        let _k1 = block.get_element(5).unwrap().unwrap();
        let b = block.get_element(10).unwrap().unwrap();
        let _k2 = block.get_element(5).unwrap().unwrap();
        drop(a);
        drop(b);
        let c = block.get_element(10).unwrap().unwrap();
        assert_eq!(c.index(), 25);
    }

    #[test]
    fn test_split_leaves_hole_after() {
        let block = shared(100);
        let a = block.get_element(20).unwrap().unwrap();
        let _keep = block.get_element(10).unwrap().unwrap();
        drop(a);
        let c = block.get_element(5).unwrap().unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(block.empty_ranges(), vec![(5, 15), (30, 70)]);
    }

    #[test]
    fn test_no_space_returns_none() {
        let block = shared(10);
        let _a = block.get_element(8).unwrap().unwrap();
        assert!(block.get_element(3).unwrap().is_none());
    }

    #[test]
    fn test_release_coalesces_everything() {
        let block = shared(64);
        let elements: Vec<_> = (0..8).map(|_| block.get_element(8).unwrap().unwrap()).collect();
        assert_eq!(block.free_element_count_at_end(), 0);

        // Release odd ones first to fragment, then the rest.
        let (odd, even): (Vec<_>, Vec<_>) = elements.into_iter().partition(|e| e.index() / 8 % 2 == 1);
        drop(odd);
        assert_eq!(block.empty_range_count(), 4);
        drop(even);
        assert_eq!(block.empty_ranges(), vec![(0, 64)]);
        assert_eq!(block.used_element_count(), 0);
    }

    #[test]
    fn test_grow_extends_terminal_range() {
        let block = shared(10);
        let _a = block.get_element(4).unwrap().unwrap();
        block.grow(20).unwrap();
        assert_eq!(block.element_count(), 20);
        assert_eq!(block.free_element_count_at_end(), 16);
    }

    #[test]
    fn test_grow_full_block_appends_range() {
        let block = shared(10);
        let a = block.get_element(10).unwrap().unwrap();
        block.grow(15).unwrap();
        assert_eq!(block.empty_ranges(), vec![(10, 5)]);
        drop(a);
        assert_eq!(block.empty_ranges(), vec![(0, 15)]);
    }

    #[test]
    fn test_element_write_through_mapping() {
        let block = shared(8);
        let element = block.get_element(2).unwrap().unwrap();
        element
            .with_mapped(|spb, first| spb.set_parameter(0, first + 1, [1i32, 2, 3, 4]))
            .unwrap();
        assert!(!block.lock_block().is_mapped());
        assert!(block.owns(&element));
        assert!(element.shared_block().ptr_eq(&block));
    }

    #[test]
    fn test_drop_inside_mapping_is_merged_after_unlock() {
        let block = shared(8);
        let writer = block.get_element(2).unwrap().unwrap();
        let released = block.get_element(3).unwrap().unwrap();
        writer
            .with_mapped(|spb, first| {
                drop(released);
                spb.set_parameter(0, first, [5i32, 6, 7, 8])
            })
            .unwrap();
        assert_eq!(block.used_element_count(), 2);
        assert_eq!(block.empty_ranges(), vec![(2, 6)]);
        assert_eq!(block.get_element(3).unwrap().unwrap().index(), 2);
    }
}
