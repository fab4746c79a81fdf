//! Generation-checked, reference-counted object arena.
//!
//! GPU objects that several owners share (a decoded texture referenced by more
//! than one material, for example) live in an [`Arena`]. Owners hold a
//! [`Handle`] instead of a pointer. Each slot stores a reference count next to
//! the value; [`Arena::release`] hands the value back to the caller only when
//! the count reaches zero, so the last holder is the one that frees the
//! device resource.
//!
//! Releasing bumps the slot generation, which makes every outstanding copy of
//! the old handle fail lookups instead of aliasing whatever is inserted into
//! the reused slot next.
//!
//! # Example
//!
//! ```
//! use lumen_core::Arena;
//!
//! let mut arena = Arena::new();
//! let a = arena.insert("texture");
//! let b = arena.retain(a).unwrap();
//!
//! assert!(arena.release(a).unwrap().is_none());
//! assert_eq!(arena.release(b).unwrap(), Some("texture"));
//! assert!(arena.get(a).is_none());
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{Error, Result};

/// Typed index into an [`Arena`].
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
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the slot had when this handle was issued.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    fn stale(&self) -> Error {
        Error::StaleHandle {
            index: self.index,
            generation: self.generation,
        }
    }
}

// Manual impls: deriving would put bounds on `T`.
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

struct Slot<T> {
    generation: u32,
    ref_count: u32,
    value: Option<T>,
}

/// Slot storage with generation-checked handles and per-slot reference counts.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Stores `value` with a reference count of one.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.ref_count = 1;
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            ref_count: 1,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    /// Returns the value if the handle is still live.
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.value.as_ref())
    }

    /// Returns the value mutably if the handle is still live.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slot_mut(handle).and_then(|slot| slot.value.as_mut())
    }

    /// Whether the handle still refers to a live value.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    /// Adds a holder and returns the same handle for convenience.
    pub fn retain(&mut self, handle: Handle<T>) -> Result<Handle<T>> {
        let slot = self.slot_mut(handle).ok_or_else(|| handle.stale())?;
        slot.ref_count += 1;
        Ok(handle)
    }

    /// Drops one holder.
    ///
    /// Returns `Some(value)` when this was the last holder; the caller owns the
    /// value from then on and dropping it frees the underlying resource.
    pub fn release(&mut self, handle: Handle<T>) -> Result<Option<T>> {
        let slot = self.slot_mut(handle).ok_or_else(|| handle.stale())?;
        slot.ref_count -= 1;
        if slot.ref_count > 0 {
            return Ok(None);
        }

        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Ok(value)
    }

    /// Current holder count, or `None` for a stale handle.
    pub fn ref_count(&self, handle: Handle<T>) -> Option<u32> {
        self.slot(handle).map(|slot| slot.ref_count)
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the arena holds no live values.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterates over live values with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Removes every value regardless of reference counts.
    ///
    /// Used at teardown, where outstanding holders are about to disappear too.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                slot.ref_count = 0;
                self.free.push(index as u32);
                values.push(value);
            }
        }
        self.live = 0;
        values
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let handle = arena.insert(7u32);
        assert_eq!(arena.get(handle), Some(&7));
        assert_eq!(arena.ref_count(handle), Some(1));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_last_release_returns_value() {
        let mut arena = Arena::new();
        let handle = arena.insert(String::from("image"));
        arena.retain(handle).unwrap();
        arena.retain(handle).unwrap();

        assert!(arena.release(handle).unwrap().is_none());
        assert!(arena.release(handle).unwrap().is_none());
        assert_eq!(arena.release(handle).unwrap().as_deref(), Some("image"));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_value_dropped_only_at_zero() {
        let tracker = Rc::new(());
        let mut arena = Arena::new();
        let handle = arena.insert(Rc::clone(&tracker));
        arena.retain(handle).unwrap();

        drop(arena.release(handle).unwrap());
        assert_eq!(Rc::strong_count(&tracker), 2);

        drop(arena.release(handle).unwrap());
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut arena = Arena::new();
        let old = arena.insert(1u32);
        arena.release(old).unwrap();

        let new = arena.insert(2u32);
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());

        assert!(arena.get(old).is_none());
        assert!(matches!(
            arena.retain(old),
            Err(Error::StaleHandle { index: 0, generation: 0 })
        ));
        assert!(arena.release(old).is_err());
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn test_iter_skips_released() {
        let mut arena = Arena::new();
        let a = arena.insert('a');
        let b = arena.insert('b');
        arena.release(a).unwrap();

        let live: Vec<_> = arena.iter().collect();
        assert_eq!(live, vec![(b, &'b')]);
    }

    #[test]
    fn test_drain_empties_and_invalidates() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.retain(a).unwrap();
        arena.insert(2);

        let mut values = arena.drain();
        values.sort();
        assert_eq!(values, vec![1, 2]);
        assert!(arena.is_empty());
        assert!(!arena.contains(a));
    }
}
