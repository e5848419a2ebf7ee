// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use core::{cmp, fmt, marker::PhantomData};

/// Errors returned by the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Growing the backing storage failed.
    AllocFailed,
}

/// Holds the result of arena operations.
pub type Result<T> = core::result::Result<T, Error>;

/// A slot in the arena. Vacant slots are threaded onto a free list and remember the generation
/// of their last occupant.
enum Slot<T> {
    Occupied { generation: u32, val: T },
    Vacant { generation: u32, next_free: Option<usize> },
}

/// A simple type-safe arena. Can be used to implement index-based data-structures like trees or
/// linked lists. Freed slots are reused; each reuse bumps the slot's generation so that IDs of
/// removed objects never resolve to the object that replaced them.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
}

/// An index used to retrieve an object from the arena. Type-safe in order to prevent potential
/// mis-use of the index.
pub struct ArenaId<T> {
    index: usize,
    generation: u32,
    phantom: PhantomData<*const T>,
}

// ArenaId<T> is trivially Send/Sync since it's just a pair of integers. Access to the T it refers
// to must be done through the Arena<T> interface, which itself is only Send/Sync if T is Send/Sync.
unsafe impl<T> Send for ArenaId<T> {}
unsafe impl<T> Sync for ArenaId<T> {}

impl<T> ArenaId<T> {
    /// Returns the slot index of this ID.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for ArenaId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaId<T> {}

impl<T> PartialEq for ArenaId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for ArenaId<T> {}

impl<T> PartialOrd for ArenaId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ArenaId<T> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> fmt::Display for ArenaId<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> core::result::Result<(), fmt::Error> {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

impl<T> fmt::Debug for ArenaId<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> core::result::Result<(), fmt::Error> {
        f.debug_struct("ArenaId")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates a new, empty arena.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Creates a new arena with room for `capacity` objects.
    pub fn new_with_capacity(capacity: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve(capacity)
            .map_err(|_| Error::AllocFailed)?;
        Ok(Self {
            slots,
            free_head: None,
            len: 0,
        })
    }

    /// Inserts the given value in the arena returning its ID, or an error if the allocation failed.
    pub fn try_insert(&mut self, val: T) -> Result<ArenaId<T>> {
        let (index, generation) = match self.free_head {
            Some(index) => {
                let generation = match self.slots[index] {
                    Slot::Vacant {
                        generation,
                        next_free,
                    } => {
                        self.free_head = next_free;
                        generation.wrapping_add(1)
                    }
                    Slot::Occupied { .. } => unreachable!("occupied slot on the free list"),
                };
                self.slots[index] = Slot::Occupied { generation, val };
                (index, generation)
            }
            None => {
                self.slots.try_reserve(1).map_err(|_| Error::AllocFailed)?;
                self.slots.push(Slot::Occupied { generation: 0, val });
                (self.slots.len() - 1, 0)
            }
        };
        self.len += 1;
        Ok(ArenaId {
            index,
            generation,
            phantom: PhantomData,
        })
    }

    /// Removes the object with the given ID from the arena, returning it. Subsequent calls to
    /// `get()` or `get_mut()` with the same ID will return `None`.
    pub fn remove(&mut self, id: ArenaId<T>) -> Option<T> {
        let slot = self.slots.get_mut(id.index)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            generation: id.generation,
            next_free: self.free_head,
        };
        let old = core::mem::replace(slot, vacant);
        self.free_head = Some(id.index);
        self.len -= 1;
        match old {
            Slot::Occupied { val, .. } => Some(val),
            Slot::Vacant { .. } => None,
        }
    }

    /// Returns a reference to the object in the arena with the given ID, if it exists.
    pub fn get(&self, id: ArenaId<T>) -> Option<&T> {
        match self.slots.get(id.index)? {
            Slot::Occupied { generation, val } if *generation == id.generation => Some(val),
            _ => None,
        }
    }

    /// Returns a mutable reference to the object in the arena with the given ID, if it exists.
    pub fn get_mut(&mut self, id: ArenaId<T>) -> Option<&mut T> {
        match self.slots.get_mut(id.index)? {
            Slot::Occupied { generation, val } if *generation == id.generation => Some(val),
            _ => None,
        }
    }

    /// Returns the number of live objects in the arena.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the arena holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over the live objects and their IDs.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaId<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, val } => Some((
                    ArenaId {
                        index,
                        generation: *generation,
                        phantom: PhantomData,
                    },
                    val,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}
