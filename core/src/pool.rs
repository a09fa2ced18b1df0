//! Allocation reuse for frame-based render structures.
//!
//! Render tasks are rebuilt (or patched) every frame. Dropping their nodes
//! would free every `Vec` they own just to allocate it again a few
//! milliseconds later, so nodes are recycled instead:
//!
//! - [`PooledList<T>`] is a list whose entries past `len()` are kept cleared
//!   for the next frame. The ephemeral render task nests these per level.
//! - [`Arena<T>`] hands out generational [`Handle`]s and keeps released slots
//!   for reuse. Its pre-warm size is a constructor parameter.
//!
//! # Example
//!
//! ```
//! use ember_core::pool::{Arena, Poolable};
//!
//! #[derive(Debug, Default)]
//! struct Node {
//!     children: Vec<u32>,
//! }
//!
//! impl Poolable for Node {
//!     fn new_empty() -> Self {
//!         Self::default()
//!     }
//!     fn reset(&mut self) {
//!         self.children.clear();
//!     }
//! }
//!
//! let mut arena = Arena::<Node>::with_capacity(16);
//! assert_eq!(arena.pooled_count(), 16);
//!
//! let node = arena.acquire();
//! arena[node].children.push(3);
//! assert_eq!(arena.len(), 1);
//!
//! arena.release(node).unwrap();
//! assert!(arena.get(node).is_none());
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use crate::error::PoolError;

/// Trait for types that can be pooled and reused.
///
/// Implementors must be able to create an empty instance and clear their
/// contents while preserving allocated capacity.
pub trait Poolable {
    /// Create a new empty instance for pool initialization.
    fn new_empty() -> Self;

    /// Reset the value to an empty state, preserving allocated capacity.
    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// PooledList
// ---------------------------------------------------------------------------

/// A list that keeps cleared entries beyond its length for reuse.
///
/// [`clear`](Self::clear) resets the active entries but keeps them allocated,
/// so the next [`acquire`](Self::acquire) hands back an empty entry that
/// still owns its previous capacity.
pub struct PooledList<T: Poolable> {
    items: Vec<T>,
    len: usize,
}

impl<T: Poolable> PooledList<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            len: 0,
        }
    }

    /// Append an entry, reusing a cleared one when available.
    ///
    /// Returns the new entry's position and the (empty) entry itself.
    pub fn acquire(&mut self) -> (usize, &mut T) {
        let position = self.len;
        if position == self.items.len() {
            self.items.push(T::new_empty());
        }
        self.len += 1;
        (position, &mut self.items[position])
    }

    /// Reset all active entries and keep them for reuse.
    pub fn clear(&mut self) {
        for item in &mut self.items[..self.len] {
            item.reset();
        }
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of entries allocated, active or not.
    pub fn pooled_capacity(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, position: usize) -> Option<&T> {
        self.as_slice().get(position)
    }

    pub fn get_mut(&mut self, position: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(position)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.items[..self.len]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.as_mut_slice().iter_mut()
    }
}

impl<T: Poolable> Default for PooledList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Poolable + fmt::Debug> fmt::Debug for PooledList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledList")
            .field("len", &self.len)
            .field("pooled", &(self.items.len() - self.len))
            .field("items", &self.as_slice())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Generational handle into an [`Arena`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index inside the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Arena slot. A released value stays in place, cleared, until reacquired.
struct Slot<T: Poolable> {
    value: T,
    generation: u32,
    active: bool,
}

impl<T: Poolable> Slot<T> {
    fn parked() -> Self {
        Self {
            value: T::new_empty(),
            generation: 0,
            active: false,
        }
    }

    fn live(&self, generation: u32) -> Option<&T> {
        (self.active && self.generation == generation).then_some(&self.value)
    }

    fn live_mut(&mut self, generation: u32) -> Option<&mut T> {
        (self.active && self.generation == generation).then_some(&mut self.value)
    }
}

/// Slot arena whose released values are cleared and recycled.
///
/// Indexing with a stale handle panics; use [`get`](Self::get) when the
/// handle may have been released.
pub struct Arena<T: Poolable> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    active: usize,
}

impl<T: Poolable> Arena<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an arena with `prewarm` cleared slots ready for reuse.
    pub fn with_capacity(prewarm: usize) -> Self {
        let mut slots = Vec::with_capacity(prewarm);
        slots.resize_with(prewarm, Slot::parked);
        // Reversed so the lowest slot is handed out first.
        let free = (0..prewarm as u32).rev().collect();
        Self {
            slots,
            free,
            active: 0,
        }
    }

    /// Take a cleared slot (or allocate one) and mark it active.
    pub fn acquire(&mut self) -> Handle<T> {
        self.active += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.active = true;
                Handle::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                let mut slot = Slot::parked();
                slot.active = true;
                self.slots.push(slot);
                Handle::new(index, 0)
            }
        }
    }

    /// Clear the value behind `handle` and park its slot.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::StaleHandle`] if the handle was already released.
    pub fn release(&mut self, handle: Handle<T>) -> Result<(), PoolError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.active && slot.generation == handle.generation)
            .ok_or(PoolError::StaleHandle)?;
        slot.value.reset();
        slot.active = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.active -= 1;
        Ok(())
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .and_then(|slot| slot.live(handle.generation))
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .and_then(|slot| slot.live_mut(handle.generation))
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Number of active values.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Number of parked slots ready for reuse.
    pub fn pooled_count(&self) -> usize {
        self.free.len()
    }

    /// Iterate over active values.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.live(slot.generation)
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }
}

impl<T: Poolable> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Poolable> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => panic!("stale arena handle {handle:?}"),
        }
    }
}

impl<T: Poolable> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        match self.get_mut(handle) {
            Some(value) => value,
            None => panic!("stale arena handle {handle:?}"),
        }
    }
}

impl<T: Poolable> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("active", &self.active)
            .field("pooled", &self.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct TestNode {
        data: Vec<u32>,
    }

    impl Poolable for TestNode {
        fn new_empty() -> Self {
            Self::default()
        }
        fn reset(&mut self) {
            self.data.clear();
        }
    }

    #[test]
    fn test_arena_release_keeps_node_capacity() {
        let mut arena = Arena::<TestNode>::new();
        let node = arena.acquire();
        arena[node].data.extend([1, 2, 3, 4, 5]);
        arena.release(node).unwrap();

        let reused = arena.acquire();
        assert_eq!(reused.index(), node.index());
        assert!(arena[reused].data.is_empty());
        assert!(arena[reused].data.capacity() >= 5);
        arena[reused].data.push(9);
        assert_eq!(arena[reused].data, vec![9]);
    }

    #[test]
    fn test_pooled_list_reuses_entries() {
        let mut list = PooledList::<TestNode>::new();
        for i in 0..3 {
            let (position, node) = list.acquire();
            assert_eq!(position, i);
            node.data.extend(0..10);
        }
        assert_eq!(list.len(), 3);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.pooled_capacity(), 3);

        let (position, node) = list.acquire();
        assert_eq!(position, 0);
        assert!(node.data.is_empty());
        assert!(node.data.capacity() >= 10);
        assert_eq!(list.pooled_capacity(), 3);
    }

    #[test]
    fn test_pooled_list_get_is_bounded_by_len() {
        let mut list = PooledList::<TestNode>::new();
        list.acquire();
        list.acquire();
        list.clear();
        list.acquire();
        assert!(list.get(0).is_some());
        assert!(list.get(1).is_none());
    }

    #[test]
    fn test_arena_prewarm() {
        let arena = Arena::<TestNode>::with_capacity(8);
        assert_eq!(arena.len(), 0);
        assert_eq!(arena.pooled_count(), 8);
    }

    #[test]
    fn test_arena_acquire_lowest_first() {
        let mut arena = Arena::<TestNode>::with_capacity(4);
        let a = arena.acquire();
        let b = arena.acquire();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.pooled_count(), 2);
    }

    #[test]
    fn test_arena_release_invalidates_handle() {
        let mut arena = Arena::<TestNode>::new();
        let handle = arena.acquire();
        arena[handle].data.push(1);

        arena.release(handle).unwrap();
        assert!(arena.get(handle).is_none());
        assert_eq!(arena.release(handle), Err(PoolError::StaleHandle));

        let reused = arena.acquire();
        assert_eq!(reused.index(), handle.index());
        assert_ne!(reused, handle);
        assert!(arena[reused].data.is_empty());
    }

    #[test]
    #[should_panic(expected = "stale arena handle")]
    fn test_arena_index_stale_panics() {
        let mut arena = Arena::<TestNode>::new();
        let handle = arena.acquire();
        arena.release(handle).unwrap();
        let _ = &arena[handle];
    }

    #[test]
    fn test_arena_iter_only_active() {
        let mut arena = Arena::<TestNode>::with_capacity(2);
        let a = arena.acquire();
        let b = arena.acquire();
        arena.release(a).unwrap();
        let handles: Vec<_> = arena.iter().map(|(h, _)| h).collect();
        assert_eq!(handles, vec![b]);
    }
}
