//! Global slot accounting.
//!
//! [`GlobalResourceManager`] tracks how many subtask slots each band still
//! has free.  `acquire` is non-blocking: the submit loop polls it while
//! draining queues and simply stops when a band is full.
//!
//! Each band has its own lock; there is no cross-band coordination, so
//! acquiring on one band never contends with releases on another.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::band::Band;

#[derive(Debug, Default)]
struct SlotState {
    capacity: usize,
    free: usize,
}

/// Per-band free-slot bookkeeping for one session.
#[derive(Default)]
pub struct GlobalResourceManager {
    bands: RwLock<HashMap<Band, Arc<Mutex<SlotState>>>>,
}

impl GlobalResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `band` with `capacity` slots, or adjust it if already known.
    pub fn register_band(&self, band: Band, capacity: usize) {
        let existing = self.bands.read().get(&band).cloned();
        match existing {
            Some(state) => {
                Self::adjust_capacity(&state, capacity);
            }
            None => {
                debug!(band = %band, capacity, "band registered");
                self.bands.write().entry(band).or_insert_with(|| {
                    Arc::new(Mutex::new(SlotState {
                        capacity,
                        free: capacity,
                    }))
                });
            }
        }
    }

    /// Forget `band` entirely.  Outstanding reservations against it become
    /// no-ops on release.
    pub fn remove_band(&self, band: &Band) {
        if self.bands.write().remove(band).is_some() {
            debug!(band = %band, "band removed from slot accounting");
        }
    }

    /// Try to reserve `n` slots on `band`.  Atomic: either all `n` are
    /// reserved or none.  Unknown bands never grant.
    pub fn acquire(&self, band: &Band, n: usize) -> bool {
        let Some(state) = self.bands.read().get(band).cloned() else {
            return false;
        };
        let mut state = state.lock();
        if state.free >= n {
            state.free -= n;
            true
        } else {
            false
        }
    }

    /// Return `n` slots to `band`, capped at its capacity.  Idempotent with
    /// respect to bands that have been removed.
    pub fn release(&self, band: &Band, n: usize) {
        if let Some(state) = self.bands.read().get(band).cloned() {
            let mut state = state.lock();
            state.free = (state.free + n).min(state.capacity);
        }
    }

    /// Adjust a band's capacity; free slots move by the same delta, never
    /// below zero.
    pub fn capacity_changed(&self, band: &Band, new_capacity: usize) {
        if let Some(state) = self.bands.read().get(band).cloned() {
            Self::adjust_capacity(&state, new_capacity);
        }
    }

    fn adjust_capacity(state: &Mutex<SlotState>, new_capacity: usize) {
        let mut state = state.lock();
        if new_capacity >= state.capacity {
            state.free += new_capacity - state.capacity;
        } else {
            let shrink = state.capacity - new_capacity;
            state.free = state.free.saturating_sub(shrink);
        }
        state.capacity = new_capacity;
    }

    /// Free slots on `band`, if known.
    pub fn free_slots(&self, band: &Band) -> Option<usize> {
        self.bands
            .read()
            .get(band)
            .map(|state| state.lock().free)
    }

    /// Capacity of `band`, if known.
    pub fn capacity(&self, band: &Band) -> Option<usize> {
        self.bands
            .read()
            .get(band)
            .map(|state| state.lock().capacity)
    }

    /// `(free, capacity)` for every known band.
    pub fn snapshot(&self) -> HashMap<Band, (usize, usize)> {
        self.bands
            .read()
            .iter()
            .map(|(band, state)| {
                let state = state.lock();
                (band.clone(), (state.free, state.capacity))
            })
            .collect()
    }

    /// All bands currently known to the accounting.
    pub fn bands(&self) -> Vec<Band> {
        self.bands.read().keys().cloned().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn band(n: &str) -> Band {
        Band::new("w:1234", n)
    }

    #[test]
    fn acquire_decrements_until_exhausted() {
        let mgr = GlobalResourceManager::new();
        mgr.register_band(band("numa-0"), 2);

        assert!(mgr.acquire(&band("numa-0"), 1));
        assert!(mgr.acquire(&band("numa-0"), 1));
        assert!(!mgr.acquire(&band("numa-0"), 1));
        assert_eq!(mgr.free_slots(&band("numa-0")), Some(0));
    }

    #[test]
    fn acquire_is_all_or_nothing() {
        let mgr = GlobalResourceManager::new();
        mgr.register_band(band("numa-0"), 3);

        assert!(!mgr.acquire(&band("numa-0"), 4));
        assert_eq!(mgr.free_slots(&band("numa-0")), Some(3));
        assert!(mgr.acquire(&band("numa-0"), 3));
    }

    #[test]
    fn release_is_capped_at_capacity() {
        let mgr = GlobalResourceManager::new();
        mgr.register_band(band("numa-0"), 2);

        assert!(mgr.acquire(&band("numa-0"), 1));
        mgr.release(&band("numa-0"), 1);
        // double release must not create slots out of thin air
        mgr.release(&band("numa-0"), 1);
        assert_eq!(mgr.free_slots(&band("numa-0")), Some(2));
    }

    #[test]
    fn unknown_band_never_grants() {
        let mgr = GlobalResourceManager::new();
        assert!(!mgr.acquire(&band("numa-9"), 1));
        // and releasing against it is a no-op
        mgr.release(&band("numa-9"), 1);
    }

    #[test]
    fn growing_capacity_adds_free_slots() {
        let mgr = GlobalResourceManager::new();
        mgr.register_band(band("numa-0"), 2);
        assert!(mgr.acquire(&band("numa-0"), 2));

        mgr.capacity_changed(&band("numa-0"), 4);
        assert_eq!(mgr.free_slots(&band("numa-0")), Some(2));
        assert_eq!(mgr.capacity(&band("numa-0")), Some(4));
    }

    #[test]
    fn shrinking_capacity_never_drives_free_below_zero() {
        let mgr = GlobalResourceManager::new();
        mgr.register_band(band("numa-0"), 4);
        assert!(mgr.acquire(&band("numa-0"), 3)); // free = 1

        mgr.capacity_changed(&band("numa-0"), 1); // shrink by 3 > free
        assert_eq!(mgr.free_slots(&band("numa-0")), Some(0));
        assert_eq!(mgr.capacity(&band("numa-0")), Some(1));
    }

    #[test]
    fn removed_band_disappears_from_snapshot() {
        let mgr = GlobalResourceManager::new();
        mgr.register_band(band("numa-0"), 2);
        mgr.register_band(band("gpu-0"), 1);

        mgr.remove_band(&band("numa-0"));
        let snap = mgr.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap.contains_key(&band("gpu-0")));
    }
}
