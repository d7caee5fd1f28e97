//! Generation-checked slot arena with a free list and an optional hard limit.
//!
//! Values live in a `Vec` of slots; removed slots go onto a free list and are
//! reused by later inserts. Every removal bumps the slot's generation, so a
//! [`SlotId`] taken before the removal no longer resolves afterwards:
//!
//! ```text
//!   insert("a") ──► SlotId { index: 0, generation: 0 }
//!   remove(id)  ──► slot 0 generation = 1, pushed on free_list
//!   insert("b") ──► SlotId { index: 0, generation: 1 }   (slot reused)
//!   get(old id) ──► None                                  (stale generation)
//! ```
//!
//! ## Example Usage
//!
//! ```
//! use cachedir::ds::SlotArena;
//!
//! let mut arena = SlotArena::with_limit(2);
//! let a = arena.try_insert("a").unwrap();
//! let _b = arena.try_insert("b").unwrap();
//! assert!(arena.try_insert("c").is_err());
//!
//! assert_eq!(arena.remove(a), Some("a"));
//! assert_eq!(arena.remove(a), None); // double free is a miss, not corruption
//! assert!(arena.try_insert("c").is_ok());
//! ```

/// Stable handle into a [`SlotArena`].
///
/// Carries the generation of the slot at insertion time; lookups with an id
/// whose generation no longer matches resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SlotId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Returned by [`SlotArena::try_insert`] when the arena is at its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaFull {
    pub limit: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    len: usize,
    limit: Option<usize>,
}

impl<T> SlotArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
            limit: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            len: 0,
            limit: None,
        }
    }

    /// Creates an arena that refuses to hold more than `limit` live values.
    ///
    /// Slot storage is reserved up front so allocation cost stays flat.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::with_capacity(limit),
            free_list: Vec::new(),
            len: 0,
            limit: Some(limit),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Inserts `value`, reusing a free slot when one exists.
    ///
    /// Fails with [`ArenaFull`] when a limit is configured and reached.
    pub fn try_insert(&mut self, value: T) -> Result<SlotId, ArenaFull> {
        match self.limit {
            Some(limit) if self.len >= limit => Err(ArenaFull { limit }),
            _ => Ok(self.insert_unchecked(value)),
        }
    }

    /// Inserts `value` ignoring any configured limit.
    pub fn insert(&mut self, value: T) -> SlotId {
        self.insert_unchecked(value)
    }

    fn insert_unchecked(&mut self, value: T) -> SlotId {
        let id = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none());
            slot.value = Some(value);
            SlotId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            SlotId {
                index,
                generation: 0,
            }
        };
        self.len += 1;
        id
    }

    /// Removes and returns the value at `id`.
    ///
    /// Returns `None` for free slots and stale ids; the arena is unchanged.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Drops every live value. Outstanding ids all become stale.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
            }
        }
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    /// Validates free-list and length bookkeeping (debug/test builds only).
    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        let live = self.slots.iter().filter(|slot| slot.value.is_some()).count();
        assert_eq!(live, self.len);
        assert_eq!(self.free_list.len() + self.len, self.slots.len());
        for &index in &self.free_list {
            assert!(self.slots[index as usize].value.is_none());
        }
        if let Some(limit) = self.limit {
            assert!(self.len <= limit);
        }
    }
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
