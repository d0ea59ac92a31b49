// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-capacity daemon-facing ring of trace-job slots.
//
// spec.md's OVERVIEW and trace-job sections refer to "the daemon ring
// buffer" and "reserve a slot" without specifying its storage. Grounded
// on the spinlock-protected free list in `chunk_storage.rs` (`ChunkInfo`:
// `lock` + `cursor` + `next[]`) for slot bookkeeping, generalised from a
// fixed `u8` index range to a runtime-sized `u32` one since the real
// daemon ring's capacity is a deployment-time constant, not something
// this crate can fix at compile time the way `proto/shm_ring.rs`'s
// `ShmRing<T, const N: usize>` does.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::chunk_list::SharedMemoryLocation;
use crate::error::{TraceError, TraceResult};
use crate::spin_lock::adaptive_yield_pub as adaptive_yield;

/// `(client_id, monotonic context id)` pair published alongside a chunk
/// list so the daemon can disambiguate wrap-around context ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalContextId {
    pub client_id: u32,
    pub context_id: u32,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Empty = 0,
    Ready = 1,
}

struct Slot {
    // Only written while the slot is exclusively held by the reserving
    // producer (between `reserve_empty` and `publish`), and read only
    // after `status` has been observed `Ready` with `Acquire` — `status`
    // is the publish fence, matching spec.md's release/acquire rule.
    chunk_list: UnsafeCell<SharedMemoryLocation>,
    global_context_id: UnsafeCell<GlobalContextId>,
    status: AtomicU8,
}

unsafe impl Sync for Slot {}

impl Slot {
    fn empty() -> Self {
        Slot {
            chunk_list: UnsafeCell::new(SharedMemoryLocation::default()),
            global_context_id: UnsafeCell::new(GlobalContextId::default()),
            status: AtomicU8::new(SlotStatus::Empty as u8),
        }
    }
}

struct FreeList {
    cursor: u32,
    next: Vec<u32>,
}

/// Fixed-capacity pool of trace-job slots shared between trace-job
/// producers and the (out of scope) daemon consumer.
pub struct RingBuffer {
    slots: Vec<Slot>,
    lock: AtomicU32,
    free: UnsafeCell<FreeList>,
    opened: AtomicBool,
}

unsafe impl Sync for RingBuffer {}

const FREE_LIST_END: u32 = u32::MAX;

impl RingBuffer {
    /// Construct a ring with `capacity` slots, all initially free and the
    /// ring open for business.
    pub fn new(capacity: usize) -> Self {
        let mut next = vec![0u32; capacity];
        for (i, slot) in next.iter_mut().enumerate() {
            *slot = if i + 1 < capacity {
                (i + 1) as u32
            } else {
                FREE_LIST_END
            };
        }
        RingBuffer {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            lock: AtomicU32::new(0),
            free: UnsafeCell::new(FreeList {
                cursor: if capacity == 0 { FREE_LIST_END } else { 0 },
                next,
            }),
            opened: AtomicBool::new(true),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn lock(&self) {
        let mut k = 0u32;
        while self
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            adaptive_yield(&mut k);
        }
    }

    fn unlock(&self) {
        self.lock.store(0, Ordering::Release);
    }

    /// Re-open the ring for reservations. Mirrors `Open()`.
    pub fn open(&self) {
        self.opened.store(true, Ordering::Release);
    }

    /// Close the ring: further reservations fail until [`open`] is
    /// called again. Mirrors `CloseRingBuffer()`.
    pub fn close(&self) {
        self.opened.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Mark every slot empty and rebuild the free list. Mirrors
    /// `ResetRingBuffer()`. Does not change the open/closed state.
    pub fn reset(&self) {
        self.lock();
        let capacity = self.slots.len();
        let free = unsafe { &mut *self.free.get() };
        for (i, slot) in self.slots.iter().enumerate() {
            slot.status.store(SlotStatus::Empty as u8, Ordering::Release);
            free.next[i] = if i + 1 < capacity {
                (i + 1) as u32
            } else {
                FREE_LIST_END
            };
        }
        free.cursor = if capacity == 0 { FREE_LIST_END } else { 0 };
        self.unlock();
    }

    /// Reserve a free slot. Fails with [`TraceError::RingBufferNotInitialised`]
    /// when the ring is closed or has no free slot.
    pub fn reserve_empty(&self) -> TraceResult<usize> {
        if !self.is_open() {
            return Err(TraceError::RingBufferNotInitialised);
        }
        self.lock();
        let free = unsafe { &mut *self.free.get() };
        let id = free.cursor;
        let result = if id == FREE_LIST_END {
            None
        } else {
            free.cursor = free.next[id as usize];
            Some(id as usize)
        };
        self.unlock();
        result.ok_or(TraceError::RingBufferNotInitialised)
    }

    /// Return a reserved-but-unpublished slot to the free list without
    /// publishing it (used to unwind a failed job allocation).
    pub fn release_unpublished(&self, index: usize) {
        self.free_index(index);
    }

    fn free_index(&self, index: usize) {
        self.lock();
        let free = unsafe { &mut *self.free.get() };
        free.next[index] = free.cursor;
        free.cursor = index as u32;
        self.unlock();
    }

    /// Write the slot's payload and publish it with a `Release` store on
    /// `status` — the fence a consumer's `Acquire` load on `status`
    /// synchronises with.
    pub fn publish(&self, index: usize, chunk_list: SharedMemoryLocation, context: GlobalContextId) {
        let slot = &self.slots[index];
        unsafe {
            *slot.chunk_list.get() = chunk_list;
            *slot.global_context_id.get() = context;
        }
        slot.status.store(SlotStatus::Ready as u8, Ordering::Release);
    }

    /// Read a published slot's payload. `None` if the slot is not
    /// currently `Ready`.
    pub fn get_ready(&self, index: usize) -> Option<(SharedMemoryLocation, GlobalContextId)> {
        let slot = &self.slots[index];
        if slot.status.load(Ordering::Acquire) != SlotStatus::Ready as u8 {
            return None;
        }
        let chunk_list = unsafe { *slot.chunk_list.get() };
        let context = unsafe { *slot.global_context_id.get() };
        Some((chunk_list, context))
    }

    /// Mark a published slot empty again and return it to the free list.
    /// Mirrors the daemon marking an element consumed.
    pub fn release(&self, index: usize) {
        self.slots[index]
            .status
            .store(SlotStatus::Empty as u8, Ordering::Release);
        self.free_index(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_publish_and_consume_round_trip() {
        let ring = RingBuffer::new(4);
        let idx = ring.reserve_empty().unwrap();
        assert!(ring.get_ready(idx).is_none());
        let loc = SharedMemoryLocation { shm_object_handle: 1, offset: 64 };
        let ctx = GlobalContextId { client_id: 9, context_id: 0 };
        ring.publish(idx, loc, ctx);
        let (got_loc, got_ctx) = ring.get_ready(idx).unwrap();
        assert_eq!(got_loc, loc);
        assert_eq!(got_ctx, ctx);
    }

    #[test]
    fn reserving_past_capacity_fails() {
        let ring = RingBuffer::new(2);
        let _a = ring.reserve_empty().unwrap();
        let _b = ring.reserve_empty().unwrap();
        assert_eq!(
            ring.reserve_empty().unwrap_err(),
            TraceError::RingBufferNotInitialised
        );
    }

    #[test]
    fn released_slot_is_reusable() {
        let ring = RingBuffer::new(1);
        let idx = ring.reserve_empty().unwrap();
        ring.publish(idx, SharedMemoryLocation::default(), GlobalContextId::default());
        ring.release(idx);
        assert!(ring.get_ready(idx).is_none());
        let idx2 = ring.reserve_empty().unwrap();
        assert_eq!(idx2, idx);
    }

    #[test]
    fn closed_ring_rejects_reservations() {
        let ring = RingBuffer::new(2);
        ring.close();
        assert_eq!(
            ring.reserve_empty().unwrap_err(),
            TraceError::RingBufferNotInitialised
        );
        ring.open();
        assert!(ring.reserve_empty().is_ok());
    }

    #[test]
    fn reset_clears_published_slots_and_free_list() {
        let ring = RingBuffer::new(2);
        let idx = ring.reserve_empty().unwrap();
        ring.publish(idx, SharedMemoryLocation::default(), GlobalContextId::default());
        ring.reset();
        assert!(ring.get_ready(idx).is_none());
        assert!(ring.reserve_empty().is_ok());
        assert!(ring.reserve_empty().is_ok());
        assert_eq!(
            ring.reserve_empty().unwrap_err(),
            TraceError::RingBufferNotInitialised
        );
    }
}
