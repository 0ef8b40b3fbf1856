//! Fixed-capacity, open-addressed peer table.
//!
//! Each process keeps one table per direction mapping a terminal id to the
//! pipe it has attached. Lookups probe linearly from `id mod capacity`.
//! Removal leaves a tombstone so probe chains through the slot stay intact.

use std::ops::ControlFlow;

use crate::error::CacheError;

#[derive(Debug)]
enum Slot<T> {
    /// Never used; terminates probe sequences.
    Empty,
    /// Previously occupied; probing continues past it.
    Tombstone,
    Occupied { id: u32, value: T },
}

/// Open-addressed `id -> T` table with a fixed number of slots.
#[derive(Debug)]
pub struct PeerCache<T> {
    slots: Box<[Slot<T>]>,
    len: usize,
}

impl<T> PeerCache<T> {
    /// Create a table with `capacity` slots (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| Slot::Empty).collect();
        Self { slots, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn home(&self, id: u32) -> usize {
        id as usize % self.slots.len()
    }

    /// Slot index holding `id`, if present.
    fn position(&self, id: u32) -> Option<usize> {
        let capacity = self.slots.len();
        let home = self.home(id);
        for step in 0..capacity {
            let index = (home + step) % capacity;
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Occupied { id: current, .. } if *current == id => return Some(index),
                _ => {}
            }
        }
        None
    }

    /// Insert `value` under `id`.
    ///
    /// Fails with [`CacheError::Full`] when the probe wraps around without
    /// finding a free slot, and with [`CacheError::Duplicate`] if `id` is
    /// already present.
    pub fn add(&mut self, id: u32, value: T) -> Result<(), CacheError> {
        let capacity = self.slots.len();
        let home = self.home(id);
        let mut free = None;

        for step in 0..capacity {
            let index = (home + step) % capacity;
            match &self.slots[index] {
                Slot::Empty => {
                    free.get_or_insert(index);
                    break;
                }
                Slot::Tombstone => {
                    free.get_or_insert(index);
                }
                Slot::Occupied { id: current, .. } if *current == id => {
                    return Err(CacheError::Duplicate { id });
                }
                Slot::Occupied { .. } => {}
            }
        }

        let index = free.ok_or(CacheError::Full { capacity })?;
        self.slots[index] = Slot::Occupied { id, value };
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        let index = self.position(id)?;
        match &self.slots[index] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.position(id).is_some()
    }

    /// Remove `id`, leaving a tombstone behind.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let index = self.position(id)?;
        match std::mem::replace(&mut self.slots[index], Slot::Tombstone) {
            Slot::Occupied { value, .. } => {
                self.len -= 1;
                Some(value)
            }
            other => {
                self.slots[index] = other;
                None
            }
        }
    }

    /// Visit every occupied slot once, starting at `start mod capacity` and
    /// wrapping. The callback receives the slot index, id and value; a
    /// `Break` stops the scan and is returned.
    pub fn for_each_from<B>(
        &self,
        start: usize,
        mut f: impl FnMut(usize, u32, &T) -> ControlFlow<B>,
    ) -> Option<B> {
        let capacity = self.slots.len();
        for step in 0..capacity {
            let index = (start + step) % capacity;
            if let Slot::Occupied { id, value } = &self.slots[index] {
                if let ControlFlow::Break(result) = f(index, *id, value) {
                    return Some(result);
                }
            }
        }
        None
    }

    /// Iterate over occupied entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { id, value } => Some((*id, value)),
            _ => None,
        })
    }
}
