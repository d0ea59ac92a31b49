// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Offset pointer: a signed byte delta relative to a holder address, and
// a process-local registry of mapped region bounds used to audit that
// a resolved offset still lands inside a live region.
//
// Port of the offset-pointer idiom in
// score/analysis/tracing/common/shared_list/shared_list.h
// (ResolveOffset/CalculateOffset), generalised into a standalone type.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{OnceLock, RwLock};

/// A signed byte delta from a holder address to a target address.
///
/// `0` is the null sentinel: `resolve` on a null offset always returns
/// `None` rather than `Some(holder_addr)`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset<T> {
    delta: isize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Offset<T> {
    /// The null offset.
    pub const NULL: Offset<T> = Offset {
        delta: 0,
        _marker: PhantomData,
    };

    /// Whether this offset is the null sentinel.
    pub fn is_null(&self) -> bool {
        self.delta == 0
    }

    /// Compute the offset from `holder` to `target`. Returns `NULL` if the
    /// two addresses coincide (a node pointing at itself is nonsensical,
    /// and mirrors the C++ convention that `0` means "no target").
    pub fn from_ptr_pair(holder: *const u8, target: *const T) -> Self {
        if target.is_null() {
            return Self::NULL;
        }
        let delta = (target as isize) - (holder as isize);
        Offset {
            delta,
            _marker: PhantomData,
        }
    }

    /// Resolve this offset back to a pointer given the holder address.
    /// Returns `None` for the null offset.
    pub fn resolve(&self, holder: *const u8) -> Option<*mut T> {
        if self.is_null() {
            return None;
        }
        let addr = (holder as isize).wrapping_add(self.delta);
        Some(addr as *mut T)
    }
}

impl<T> Default for Offset<T> {
    fn default() -> Self {
        Self::NULL
    }
}

// Offset is a plain value type; Send/Sync are safe regardless of T since
// it never actually holds a T, only a displacement used to recompute one.
unsafe impl<T> Send for Offset<T> {}
unsafe impl<T> Sync for Offset<T> {}

/// Identifies a mapped region for the purposes of the bounds registry.
/// Callers typically use the region's base address (as `usize`) or a
/// small integer handle assigned by whoever opened the shared memory.
pub type RegionId = usize;

/// Process-local registry mapping region identifiers to `[base, end)`
/// ranges. Populated by whichever collaborator mapped the region;
/// offset-pointer dereferences consult it only to audit that a resolved
/// address still lies in a live mapping.
///
/// Grounded on the `OnceLock<Mutex<HashMap<...>>>` shm-handle cache
/// pattern in `platform/posix.rs`; `RwLock` is used here since lookups
/// vastly outnumber inserts once a process has mapped its regions.
pub struct BoundsRegistry;

type RegistryMap = HashMap<RegionId, (*const u8, *const u8)>;

fn registry() -> &'static RwLock<RegistryMap> {
    static REGISTRY: OnceLock<RwLock<RegistryMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

// The registry only ever stores raw bounds (no aliasing, no interior
// mutability through the pointers themselves), so sharing it across
// threads is sound.
unsafe impl Send for BoundsRegistry {}
unsafe impl Sync for BoundsRegistry {}

impl BoundsRegistry {
    /// Record that `id` spans `[base, base + len)`. Overwrites any prior
    /// registration for the same id (re-mapping case).
    pub fn register(id: RegionId, base: *const u8, len: usize) {
        let end = unsafe { base.add(len) };
        registry()
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (base, end));
    }

    /// Remove a region's bounds, e.g. at `munmap` time.
    pub fn unregister(id: RegionId) {
        registry()
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Whether `ptr` (for `len` bytes) lies entirely within the registered
    /// bounds of `id`. Returns `false` if `id` is not registered.
    pub fn contains(id: RegionId, ptr: *const u8, len: usize) -> bool {
        let guard = registry().read().unwrap_or_else(|e| e.into_inner());
        match guard.get(&id) {
            Some(&(base, end)) => {
                let start = ptr as usize;
                let last = start.saturating_add(len);
                (base as usize) <= start && last <= (end as usize)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_offset_resolves_to_none() {
        let off: Offset<u32> = Offset::NULL;
        assert!(off.is_null());
        assert!(off.resolve(0x1000 as *const u8).is_none());
    }

    #[test]
    fn round_trips_through_holder() {
        let mut buf = [0u32; 4];
        let holder = buf.as_ptr() as *const u8;
        let target = &mut buf[2] as *mut u32;
        let off = Offset::from_ptr_pair(holder, target as *const u32);
        assert!(!off.is_null());
        let resolved = off.resolve(holder).unwrap();
        assert_eq!(resolved, target);
    }

    #[test]
    fn bounds_registry_insert_lookup() {
        let region = vec![0u8; 64];
        let id = region.as_ptr() as usize;
        BoundsRegistry::register(id, region.as_ptr(), region.len());
        assert!(BoundsRegistry::contains(id, region.as_ptr(), 16));
        assert!(!BoundsRegistry::contains(id, unsafe { region.as_ptr().add(60) }, 16));
        BoundsRegistry::unregister(id);
        assert!(!BoundsRegistry::contains(id, region.as_ptr(), 1));
    }
}
