//! Stable-handle resource registry.
//!
//! [`Registry`] is a slot-map: resources live contiguously in a dense array
//! and are addressed by [`Rid`] handles. A sparse table maps each handle index
//! to its current dense slot, and a reverse table parallel to the dense array
//! maps each slot back to its owning handle so that removal can swap the last
//! element into the hole in O(1).
//!
//! Released indices go onto a free list and are handed out again by the next
//! [`Registry::allocate`]. Every release bumps the index's generation, so a
//! handle kept past its release fails validation instead of aliasing whatever
//! resource later reuses the index.
//!
//! Accessing a registry with an invalid, released or stale handle is a
//! programmer error and panics.

use std::fmt;

/// Resources that own external state needing explicit teardown.
///
/// [`Registry::clear`] calls [`Release::release`] on every live resource
/// before dropping storage. Implementations panic on a second release.
pub trait Release {
    /// Tear down the resource's external state.
    fn release(&mut self);

    /// Whether [`Release::release`] has already run.
    fn is_released(&self) -> bool;
}

/// Handle to a resource stored in a [`Registry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rid {
    index: u32,
    generation: u32,
}

impl Rid {
    /// Reserved sentinel that never names a resource.
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    /// Index component of the handle.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation component of the handle.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Returns `false` for [`Rid::INVALID`].
    #[inline]
    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for Rid {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}v{}", self.index, self.generation)
        } else {
            f.write_str("INVALID")
        }
    }
}

/// Slot marker for indices that currently name no resource.
const VACANT: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
struct SparseEntry {
    /// Dense slot holding the resource, or [`VACANT`].
    dense: u32,
    generation: u32,
}

/// Slot-map owning resources of type `T`.
#[derive(Debug)]
pub struct Registry<T> {
    // -- Dense storage --
    resources: Vec<T>,
    owners: Vec<Rid>,

    // -- Handle bookkeeping --
    sparse: Vec<SparseEntry>,
    free_list: Vec<u32>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            resources: Vec::new(),
            owners: Vec::new(),
            sparse: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Create an empty registry with room for `capacity` resources.
    ///
    /// The capacity is a hint; the registry grows past it as needed.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            resources: Vec::with_capacity(capacity),
            owners: Vec::with_capacity(capacity),
            sparse: Vec::with_capacity(capacity),
            free_list: Vec::new(),
        }
    }

    /// Number of live resources.
    #[inline]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns `true` if no resources are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Number of distinct handle indices ever issued.
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.sparse.len()
    }

    /// Store `value` and return its handle.
    ///
    /// Recycles a released index when one is available, otherwise mints the
    /// next index. Existing handles stay valid, but references into the
    /// registry must be re-resolved afterwards.
    pub fn allocate(&mut self, value: T) -> Rid {
        let dense = u32::try_from(self.resources.len())
            .ok()
            .filter(|&slot| slot != VACANT)
            .unwrap_or_else(|| panic!("Registry::allocate: slot count exceeds u32 range"));

        let rid = if let Some(index) = self.free_list.pop() {
            let entry = &mut self.sparse[index as usize];
            debug_assert_eq!(entry.dense, VACANT, "free index {index} names a live slot");
            entry.dense = dense;
            Rid {
                index,
                generation: entry.generation,
            }
        } else {
            let index = u32::try_from(self.sparse.len())
                .ok()
                .filter(|&index| index != u32::MAX)
                .unwrap_or_else(|| panic!("Registry::allocate: handle space exhausted"));
            self.sparse.push(SparseEntry {
                dense,
                generation: 0,
            });
            Rid {
                index,
                generation: 0,
            }
        };

        self.resources.push(value);
        self.owners.push(rid);
        rid
    }

    /// Returns `true` if `rid` names a live resource.
    pub fn contains(&self, rid: Rid) -> bool {
        self.dense_slot(rid).is_some()
    }

    /// Resolve `rid` without panicking.
    pub fn try_get(&self, rid: Rid) -> Option<&T> {
        self.dense_slot(rid).map(|slot| &self.resources[slot])
    }

    /// Resolve `rid` mutably without panicking.
    pub fn try_get_mut(&mut self, rid: Rid) -> Option<&mut T> {
        self.dense_slot(rid).map(|slot| &mut self.resources[slot])
    }

    /// Resolve `rid`.
    ///
    /// # Panics
    ///
    /// Panics if `rid` is invalid, was never issued, or has been released.
    #[track_caller]
    pub fn get(&self, rid: Rid) -> &T {
        let slot = self.validate("get", rid);
        &self.resources[slot]
    }

    /// Resolve `rid` mutably.
    ///
    /// # Panics
    ///
    /// Panics if `rid` is invalid, was never issued, or has been released.
    #[track_caller]
    pub fn get_mut(&mut self, rid: Rid) -> &mut T {
        let slot = self.validate("get_mut", rid);
        &mut self.resources[slot]
    }

    /// Remove the resource named by `rid` and return it.
    ///
    /// The last resource is moved into the vacated slot. The index goes onto
    /// the free list with a bumped generation, so `rid` and any copies of it
    /// are stale from here on.
    ///
    /// # Panics
    ///
    /// Panics if `rid` is invalid, was never issued, or has been released.
    #[track_caller]
    pub fn release(&mut self, rid: Rid) -> T {
        let slot = self.validate("release", rid);

        let value = self.resources.swap_remove(slot);
        self.owners.swap_remove(slot);

        // Patch the sparse entry of whichever resource filled the hole.
        if let Some(moved) = self.owners.get(slot) {
            self.sparse[moved.index as usize].dense = slot as u32;
        }

        let entry = &mut self.sparse[rid.index as usize];
        entry.dense = VACANT;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_list.push(rid.index);

        value
    }

    /// Dense slot currently holding `rid`.
    ///
    /// # Panics
    ///
    /// Panics if `rid` does not name a live resource.
    #[track_caller]
    pub fn slot_index_of(&self, rid: Rid) -> usize {
        self.validate("slot_index_of", rid)
    }

    /// Handle owning dense slot `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= self.len()`.
    #[track_caller]
    pub fn handle_at(&self, slot: usize) -> Rid {
        match self.owners.get(slot) {
            Some(&rid) => rid,
            None => panic!(
                "Registry::handle_at: slot {slot} out of range (len {})",
                self.owners.len()
            ),
        }
    }

    /// Iterate live resources with their handles, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (Rid, &T)> {
        self.owners.iter().copied().zip(self.resources.iter())
    }

    /// Iterate live resources mutably with their handles, in unspecified order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Rid, &mut T)> {
        self.owners.iter().copied().zip(self.resources.iter_mut())
    }

    fn dense_slot(&self, rid: Rid) -> Option<usize> {
        let entry = self.sparse.get(rid.index as usize)?;
        (entry.dense != VACANT && entry.generation == rid.generation).then_some(entry.dense as usize)
    }

    #[track_caller]
    fn validate(&self, op: &str, rid: Rid) -> usize {
        if !rid.is_valid() {
            panic!("Registry::{op}: invalid handle");
        }
        let Some(entry) = self.sparse.get(rid.index as usize) else {
            panic!(
                "Registry::{op}: handle {rid} was never issued (high-water mark {})",
                self.sparse.len()
            );
        };
        if entry.dense == VACANT || entry.generation != rid.generation {
            panic!("Registry::{op}: stale handle {rid} (current generation {})", entry.generation);
        }
        entry.dense as usize
    }
}

impl<T: Release> Registry<T> {
    /// Release every live resource, then drop all storage.
    ///
    /// Intended for shutdown: all handles, including recycled indices and
    /// their generations, are forgotten.
    pub fn clear(&mut self) {
        let count = self.resources.len();
        for resource in &mut self.resources {
            resource.release();
        }
        self.resources.clear();
        self.owners.clear();
        self.sparse.clear();
        self.free_list.clear();
        tracing::debug!("Registry cleared ({} resources released)", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::rc::Rc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assert_consistent<T>(registry: &Registry<T>, live: &[Rid]) {
        assert_eq!(registry.len(), live.len());
        assert_eq!(registry.resources.len(), registry.owners.len());
        for &rid in live {
            let slot = registry.slot_index_of(rid);
            assert!(slot < registry.len());
            assert_eq!(registry.handle_at(slot), rid);
        }
        for &index in &registry.free_list {
            assert!(live.iter().all(|rid| rid.index() != index));
        }
    }

    #[test]
    fn test_allocate_distinct_handles() {
        let mut registry = Registry::new();
        let handles: Vec<Rid> = (0..64).map(|i| registry.allocate(i)).collect();

        assert_eq!(registry.len(), 64);
        let unique: HashSet<Rid> = handles.iter().copied().collect();
        assert_eq!(unique.len(), 64);
        assert!(handles.iter().all(|rid| rid.is_valid()));
        assert!(!handles.contains(&Rid::INVALID));
        for (i, &rid) in handles.iter().enumerate() {
            assert_eq!(*registry.get(rid), i);
        }
    }

    #[test]
    fn test_released_index_is_reused() {
        let mut registry = Registry::new();
        let a = registry.allocate("a");
        let b = registry.allocate("b");
        let c = registry.allocate("c");
        assert_eq!([a.index(), b.index(), c.index()], [0, 1, 2]);
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.release(b), "b");
        assert_eq!(registry.len(), 2);

        let d = registry.allocate("d");
        assert_eq!(d.index(), 1);
        assert_ne!(d, b);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.high_water_mark(), 3);

        assert_eq!(*registry.get(a), "a");
        assert_eq!(*registry.get(c), "c");
        assert_eq!(*registry.get(d), "d");
        assert_consistent(&registry, &[a, c, d]);
    }

    #[test]
    fn test_release_fixes_moved_slot() {
        let mut registry = Registry::new();
        let a = registry.allocate(10);
        let b = registry.allocate(20);
        let c = registry.allocate(30);

        registry.release(a);

        // `c` was swapped into slot 0.
        assert_eq!(registry.slot_index_of(c), 0);
        assert_eq!(registry.handle_at(0), c);
        assert_eq!(*registry.get(b), 20);
        assert_eq!(*registry.get(c), 30);
    }

    #[test]
    fn test_release_last_slot() {
        let mut registry = Registry::new();
        let a = registry.allocate(1);
        let b = registry.allocate(2);

        registry.release(b);
        assert_consistent(&registry, &[a]);

        registry.release(a);
        assert!(registry.is_empty());
        assert_consistent(&registry, &[]);
    }

    #[test]
    fn test_get_mut_updates_value() {
        let mut registry = Registry::new();
        let rid = registry.allocate(vec![1, 2]);
        registry.get_mut(rid).push(3);
        assert_eq!(registry.get(rid), &vec![1, 2, 3]);
    }

    #[test]
    fn test_try_get_on_stale_handle() {
        let mut registry = Registry::new();
        let rid = registry.allocate(5u32);
        registry.release(rid);

        assert!(registry.try_get(rid).is_none());
        assert!(!registry.contains(rid));
        assert!(registry.try_get(Rid::INVALID).is_none());

        let reused = registry.allocate(6);
        assert_eq!(reused.index(), rid.index());
        assert!(registry.try_get(rid).is_none());
        assert_eq!(registry.try_get(reused), Some(&6));
        assert!(registry.try_get_mut(rid).is_none());
        if let Some(value) = registry.try_get_mut(reused) {
            *value = 7;
        }
        assert_eq!(registry.get(reused), &7);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_get_released_handle_panics() {
        let mut registry = Registry::new();
        let rid = registry.allocate(1u8);
        registry.release(rid);
        registry.get(rid);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_get_recycled_handle_panics() {
        let mut registry = Registry::new();
        let old = registry.allocate(1u8);
        registry.release(old);
        let _new = registry.allocate(2u8);
        registry.get(old);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_double_release_panics() {
        let mut registry = Registry::new();
        let rid = registry.allocate(1u8);
        registry.release(rid);
        registry.release(rid);
    }

    #[test]
    #[should_panic(expected = "invalid handle")]
    fn test_get_invalid_handle_panics() {
        let registry: Registry<u8> = Registry::new();
        registry.get(Rid::INVALID);
    }

    #[test]
    #[should_panic(expected = "never issued")]
    fn test_get_unissued_handle_panics() {
        let mut registry = Registry::new();
        registry.allocate(1u8);
        registry.get(Rid {
            index: 7,
            generation: 0,
        });
    }

    struct Tracked {
        hooks: Rc<Cell<u32>>,
        released: bool,
    }

    impl Release for Tracked {
        fn release(&mut self) {
            assert!(!self.released, "double release");
            self.released = true;
            self.hooks.set(self.hooks.get() + 1);
        }

        fn is_released(&self) -> bool {
            self.released
        }
    }

    #[test]
    fn test_clear_releases_each_resource_once() {
        let hooks = Rc::new(Cell::new(0));
        let mut registry = Registry::with_capacity(4);
        let handles: Vec<Rid> = (0..5)
            .map(|_| {
                registry.allocate(Tracked {
                    hooks: hooks.clone(),
                    released: false,
                })
            })
            .collect();

        // A resource removed before shutdown is not part of the clear.
        let mut removed = registry.release(handles[2]);
        removed.release();
        assert_eq!(hooks.get(), 1);

        registry.clear();
        assert_eq!(hooks.get(), 5);
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
        assert_eq!(registry.high_water_mark(), 0);
        assert!(!registry.contains(handles[0]));
    }

    #[test]
    fn test_rid_display() {
        let rid = Rid {
            index: 3,
            generation: 2,
        };
        assert_eq!(rid.to_string(), "3v2");
        assert_eq!(Rid::INVALID.to_string(), "INVALID");
        assert_eq!(Rid::default(), Rid::INVALID);
    }

    #[test]
    fn test_random_interleavings_keep_mapping_consistent() {
        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut registry = Registry::new();
            let mut live: Vec<(Rid, u64)> = Vec::new();
            let mut dead: Vec<Rid> = Vec::new();

            for step in 0..500 {
                let roll = rng.gen_range(0..100);
                if live.is_empty() || roll < 55 {
                    let value: u64 = rng.gen_range(0..u64::MAX);
                    let rid = registry.allocate(value);
                    assert!(!live.iter().any(|(other, _)| *other == rid));
                    live.push((rid, value));
                } else {
                    let victim = rng.gen_range(0..live.len());
                    let (rid, value) = live.swap_remove(victim);
                    assert_eq!(registry.release(rid), value);
                    dead.push(rid);
                }

                let handles: Vec<Rid> = live.iter().map(|(rid, _)| *rid).collect();
                assert_consistent(&registry, &handles);
                for (rid, value) in &live {
                    assert_eq!(registry.get(*rid), value, "seed {seed} step {step}");
                }
                for rid in &dead {
                    assert!(!registry.contains(*rid), "stale {rid} resolved at step {step}");
                }
            }

            // Indices never exceed what the live set ever needed.
            assert!(registry.high_water_mark() <= 500);
        }
    }
}
