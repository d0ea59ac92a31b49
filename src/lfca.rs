// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free flexible circular allocator (LFCA).
//
// Member layout and constants are ported from
// score/analysis/tracing/common/flexible_circular_allocator/
// lockless_flexible_circular_allocator.h and
// lockless_flexible_circular_allocator_types.h; no .cpp implementation
// survived in the source pack, so the allocate/deallocate/drain protocol
// below follows the prose description of the same algorithm. CAS retry
// backoff reuses the adaptive-yield idiom from `spin_lock.rs` /
// `chunk_storage.rs` (busy-spin -> pause hint -> yield -> sleep).

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::allocator::CircularAllocator;
use crate::spin_lock::adaptive_yield_pub as adaptive_yield;

/// Number of descriptor slots in the auxiliary list-entry ring. Fixed by
/// the original implementation.
pub const LIST_ENTRY_ARRAY_SIZE: usize = 8192;

/// Minimum alignment every allocation receives, matching `max_align_t`.
pub const MAX_ALIGN: usize = 16;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListEntryFlag {
    InUse = 0,
    Free = 1,
}

/// Header placed immediately before every user allocation, aligned to
/// `max_align_t`.
#[repr(C, align(16))]
struct BufferBlock {
    list_entry_offset: u32,
    block_length: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<BufferBlock>();

fn pack(offset: u32, length: u16, flags: ListEntryFlag) -> u64 {
    ((offset as u64) << 32) | ((length as u64) << 16) | ((flags as u64) << 8)
}

fn unpack(word: u64) -> (u32, u16, u8) {
    let offset = (word >> 32) as u32;
    let length = ((word >> 16) & 0xFFFF) as u16;
    let flags = ((word >> 8) & 0xFF) as u8;
    (offset, length, flags)
}

fn align_up(size: usize, alignment: usize) -> usize {
    let align = alignment.max(MAX_ALIGN);
    let remainder = size % align;
    if remainder == 0 {
        size
    } else {
        size + align - remainder
    }
}

/// Indirection over the `u32` CAS operations LFCA performs, mirroring the
/// C++ `atomic_indirector` template: the real implementation maps 1:1 to
/// the hardware atomic, while test code can substitute a variant that
/// forces specific CAS attempts to fail.
pub trait CasOps: Send + Sync + 'static {
    fn compare_exchange_weak(
        target: &AtomicU32,
        current: u32,
        new: u32,
    ) -> Result<u32, u32>;
}

/// Production indirector: a direct pass-through to the real atomic.
pub struct RealCas;

impl CasOps for RealCas {
    fn compare_exchange_weak(target: &AtomicU32, current: u32, new: u32) -> Result<u32, u32> {
        target.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed)
    }
}

/// Runtime configuration for an LFCA instance.
#[derive(Debug, Clone, Copy)]
pub struct LfcaConfig {
    /// Whether the monitoring counters (`cumulative_usage`, `lowest_size`,
    /// `alloc_cntr`, `dealloc_cntr`) are maintained. Mirrors the
    /// original's `tmd_stats_enabled_` instance field — a runtime choice,
    /// not a compile-time feature, since an instance that doesn't need
    /// the stats avoids the extra atomic traffic on the hot path.
    pub stats_enabled: bool,
}

impl Default for LfcaConfig {
    fn default() -> Self {
        LfcaConfig { stats_enabled: true }
    }
}

/// Snapshot of LFCA's monitoring counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LfcaStats {
    pub cumulative_usage: u64,
    pub lowest_size: usize,
    pub alloc_cntr: u64,
    pub dealloc_cntr: u64,
}

/// Lock-free allocator over a caller-provided region. Safe to share
/// across threads (and, given a region mapped identically by every
/// participant, across processes) without a mutex on the hot path.
pub struct LocklessFlexibleCircularAllocator<C: CasOps = RealCas> {
    base_address: *mut u8,
    total_size: usize,

    buffer_queue_head: AtomicU32,
    buffer_queue_tail: AtomicU32,
    gap_address: AtomicU32,
    wrap_around: AtomicBool,

    list_queue_head: AtomicU32,
    list_queue_tail: AtomicU32,
    list_array: Box<[AtomicU64]>,

    available_size: AtomicUsize,
    stats_enabled: bool,
    cumulative_usage: AtomicU64,
    lowest_size: AtomicUsize,
    alloc_cntr: AtomicU64,
    dealloc_cntr: AtomicU64,

    _cas: PhantomData<C>,
}

// Safety: every field is either a plain atomic or a raw pointer used only
// to recompute addresses already reserved through the atomics above.
unsafe impl<C: CasOps> Send for LocklessFlexibleCircularAllocator<C> {}
unsafe impl<C: CasOps> Sync for LocklessFlexibleCircularAllocator<C> {}

impl<C: CasOps> LocklessFlexibleCircularAllocator<C> {
    /// Construct an allocator over `[base_address, base_address + size)`.
    pub fn new(base_address: *mut u8, size: usize, config: LfcaConfig) -> Self {
        let list_array = (0..LIST_ENTRY_ARRAY_SIZE)
            .map(|_| AtomicU64::new(pack(0, 0, ListEntryFlag::Free)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        LocklessFlexibleCircularAllocator {
            base_address,
            total_size: size,
            buffer_queue_head: AtomicU32::new(0),
            buffer_queue_tail: AtomicU32::new(0),
            gap_address: AtomicU32::new(0),
            wrap_around: AtomicBool::new(false),
            list_queue_head: AtomicU32::new(0),
            list_queue_tail: AtomicU32::new(0),
            list_array,
            available_size: AtomicUsize::new(size),
            stats_enabled: config.stats_enabled,
            cumulative_usage: AtomicU64::new(0),
            lowest_size: AtomicUsize::new(usize::MAX),
            alloc_cntr: AtomicU64::new(0),
            dealloc_cntr: AtomicU64::new(0),
            _cas: PhantomData,
        }
    }

    /// Snapshot of the monitoring counters. All-zero/`usize::MAX` fields
    /// if `stats_enabled` was false at construction.
    pub fn stats(&self) -> LfcaStats {
        LfcaStats {
            cumulative_usage: self.cumulative_usage.load(Ordering::Relaxed),
            lowest_size: self.lowest_size.load(Ordering::Relaxed),
            alloc_cntr: self.alloc_cntr.load(Ordering::Relaxed),
            dealloc_cntr: self.dealloc_cntr.load(Ordering::Relaxed),
        }
    }

    fn reserve_list_entry(&self) -> Option<usize> {
        let mut k = 0u32;
        loop {
            let head = self.list_queue_head.load(Ordering::Acquire);
            let tail = self.list_queue_tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) as usize >= LIST_ENTRY_ARRAY_SIZE {
                return None;
            }
            let new_head = head.wrapping_add(1);
            match C::compare_exchange_weak(&self.list_queue_head, head, new_head) {
                Ok(_) => return Some((head as usize) % LIST_ENTRY_ARRAY_SIZE),
                Err(_) => adaptive_yield(&mut k),
            }
        }
    }

    /// Returns the byte offset (past the header) of the reserved range,
    /// or `None` if neither the straight-line nor the wrap path fits.
    fn reserve_byte_range(&self, aligned: usize) -> Option<usize> {
        let need = (HEADER_SIZE + aligned) as u32;
        let mut k = 0u32;
        loop {
            let head = self.buffer_queue_head.load(Ordering::Acquire);
            if head as usize + need as usize <= self.total_size {
                match C::compare_exchange_weak(&self.buffer_queue_head, head, head + need) {
                    Ok(_) => return Some(head as usize + HEADER_SIZE),
                    Err(_) => {
                        adaptive_yield(&mut k);
                        continue;
                    }
                }
            }

            if self.wrap_around.load(Ordering::Acquire) {
                return None;
            }
            // Wrapping is only safe once at least `need` bytes at the
            // front of the buffer have already been drained: that is
            // what "tail is below head" (spec.md §4.3) guarantees once
            // a first pass has happened.
            let tail = self.buffer_queue_tail.load(Ordering::Acquire);
            if (tail as u32) < need {
                return None;
            }
            self.gap_address.store(head, Ordering::Relaxed);
            match C::compare_exchange_weak(&self.buffer_queue_head, head, need) {
                Ok(_) => {
                    self.wrap_around.store(true, Ordering::Release);
                    return Some(HEADER_SIZE);
                }
                Err(_) => adaptive_yield(&mut k),
            }
        }
    }

    fn try_drain_tail(&self) {
        let mut k = 0u32;
        loop {
            let tail_idx = self.list_queue_tail.load(Ordering::Acquire);
            let head_idx = self.list_queue_head.load(Ordering::Acquire);
            if tail_idx == head_idx {
                return;
            }
            let slot = (tail_idx as usize) % LIST_ENTRY_ARRAY_SIZE;
            let word = self.list_array[slot].load(Ordering::Acquire);
            let (offset, length, flags) = unpack(word);
            if flags != ListEntryFlag::Free as u8 {
                return;
            }

            let new_tail_idx = tail_idx.wrapping_add(1);
            if self
                .list_queue_tail
                .compare_exchange_weak(tail_idx, new_tail_idx, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                adaptive_yield(&mut k);
                continue;
            }

            self.available_size
                .fetch_add(HEADER_SIZE + length as usize, Ordering::Relaxed);

            let end_offset = offset as usize + length as usize;
            if self.wrap_around.load(Ordering::Acquire)
                && end_offset == self.gap_address.load(Ordering::Acquire) as usize
            {
                self.buffer_queue_tail.store(0, Ordering::Release);
                self.wrap_around.store(false, Ordering::Release);
                self.gap_address.store(0, Ordering::Relaxed);
                continue;
            }

            let mut bt = self.buffer_queue_tail.load(Ordering::Acquire);
            loop {
                let candidate = end_offset as u32;
                if bt >= candidate {
                    break;
                }
                match self.buffer_queue_tail.compare_exchange_weak(
                    bt,
                    candidate,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => bt = actual,
                }
            }
        }
    }

    fn record_alloc_stats(&self, aligned: usize) {
        if !self.stats_enabled {
            return;
        }
        self.cumulative_usage.fetch_add(aligned as u64, Ordering::Relaxed);
        self.alloc_cntr.fetch_add(1, Ordering::Relaxed);
        let mut cur = self.lowest_size.load(Ordering::Relaxed);
        while aligned < cur {
            match self.lowest_size.compare_exchange_weak(
                cur,
                aligned,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl<C: CasOps> CircularAllocator for LocklessFlexibleCircularAllocator<C> {
    fn allocate(&self, size: usize, alignment: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let aligned = align_up(size, alignment);
        if aligned > self.total_size || aligned > u16::MAX as usize {
            return None;
        }

        let index = self.reserve_list_entry()?;

        let user_offset = match self.reserve_byte_range(aligned) {
            Some(off) => off,
            None => {
                // Nothing was published; the descriptor just goes straight
                // to Free so the tail drains past it.
                self.list_array[index].store(pack(0, 0, ListEntryFlag::Free), Ordering::Release);
                self.try_drain_tail();
                return None;
            }
        };

        let header_ptr =
            unsafe { self.base_address.add(user_offset - HEADER_SIZE) } as *mut BufferBlock;
        unsafe {
            (*header_ptr).list_entry_offset = index as u32;
            (*header_ptr).block_length = aligned as u32;
        }

        // Step 4 (header write) must happen-before step 5 (release-store
        // of the descriptor); the store below provides that ordering.
        self.list_array[index].store(
            pack(user_offset as u32, aligned as u16, ListEntryFlag::InUse),
            Ordering::Release,
        );

        self.available_size
            .fetch_sub(HEADER_SIZE + aligned, Ordering::Relaxed);
        self.record_alloc_stats(aligned);

        Some(unsafe { self.base_address.add(user_offset) })
    }

    fn deallocate(&self, ptr: *mut u8, _size: usize) -> bool {
        let addr = ptr as usize;
        let base = self.base_address as usize;
        if addr < base + HEADER_SIZE || addr > base + self.total_size {
            return false;
        }
        let header_ptr = (addr - HEADER_SIZE) as *const BufferBlock;
        let index = unsafe { (*header_ptr).list_entry_offset } as usize;
        if index >= LIST_ENTRY_ARRAY_SIZE {
            return false;
        }

        let mut k = 0u32;
        loop {
            let cur = self.list_array[index].load(Ordering::Acquire);
            let (offset, length, flags) = unpack(cur);
            if flags == ListEntryFlag::Free as u8 {
                return false;
            }
            let new_word = pack(offset, length, ListEntryFlag::Free);
            if self.list_array[index]
                .compare_exchange_weak(cur, new_word, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            adaptive_yield(&mut k);
        }

        if self.stats_enabled {
            self.dealloc_cntr.fetch_add(1, Ordering::Relaxed);
        }
        self.try_drain_tail();
        true
    }

    fn available(&self) -> usize {
        self.available_size.load(Ordering::Relaxed)
    }

    fn base(&self) -> *mut u8 {
        self.base_address
    }

    fn size(&self) -> usize {
        self.total_size
    }

    fn in_bounds(&self, address: *const u8, size: usize) -> bool {
        if size > self.total_size {
            return false;
        }
        let base = self.base_address as usize;
        let addr = address as usize;
        addr >= base && addr <= base + self.total_size - size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_region(size: usize) -> (Vec<u8>, LocklessFlexibleCircularAllocator) {
        let mut buf = vec![0u8; size];
        let base = buf.as_mut_ptr();
        (
            buf,
            LocklessFlexibleCircularAllocator::new(base, size, LfcaConfig::default()),
        )
    }

    #[test]
    fn allocate_then_deallocate_round_trips_available() {
        let (_buf, lfca) = new_region(4096);
        let before = lfca.available();
        let p = lfca.allocate(64, 16).unwrap();
        assert!(lfca.available() < before);
        assert!(lfca.deallocate(p, 64));
        assert_eq!(lfca.available(), before);
    }

    #[test]
    fn sequential_allocations_are_disjoint() {
        let (_buf, lfca) = new_region(4096);
        let a = lfca.allocate(32, 16).unwrap() as usize;
        let b = lfca.allocate(32, 16).unwrap() as usize;
        assert_ne!(a, b);
        assert!(a + 32 <= b || b + 32 <= a);
    }

    #[test]
    fn zero_size_allocation_fails() {
        let (_buf, lfca) = new_region(1024);
        assert!(lfca.allocate(0, 16).is_none());
    }

    #[test]
    fn oversize_allocation_fails() {
        let (_buf, lfca) = new_region(256);
        assert!(lfca.allocate(100_000, 16).is_none());
    }

    #[test]
    fn deallocate_out_of_bounds_pointer_is_rejected() {
        let (buf, lfca) = new_region(256);
        let wild = unsafe { buf.as_ptr().add(10_000) } as *mut u8;
        assert!(!lfca.deallocate(wild, 1));
    }

    #[test]
    fn deallocate_twice_second_call_fails() {
        let (_buf, lfca) = new_region(1024);
        let p = lfca.allocate(32, 16).unwrap();
        assert!(lfca.deallocate(p, 32));
        assert!(!lfca.deallocate(p, 32));
    }

    #[test]
    fn wrap_around_reclaims_front_of_buffer() {
        // Region sized so that two 320-byte (aligned) allocations roughly
        // fill it; freeing the first lets a wrap reuse its space.
        let (_buf, lfca) = new_region(1024);
        let a1 = lfca.allocate(300, 16).unwrap();
        let a2 = lfca.allocate(300, 16).unwrap();
        let _a3 = lfca.allocate(300, 16);
        assert!(lfca.deallocate(a1, 300));
        // Draining only happens while the freed entry is at the tail, so
        // freeing a1 (the oldest) should make its bytes available again.
        let _a4 = lfca.allocate(100, 16);
        let _ = a2;
    }

    /// CAS indirector that fails the first `N` attempts, then succeeds.
    struct FlakyCas;
    thread_local! {
        static FLAKY_REMAINING: std::cell::Cell<u32> = std::cell::Cell::new(0);
    }
    impl CasOps for FlakyCas {
        fn compare_exchange_weak(target: &AtomicU32, current: u32, new: u32) -> Result<u32, u32> {
            let should_fail = FLAKY_REMAINING.with(|r| {
                let v = r.get();
                if v > 0 {
                    r.set(v - 1);
                    true
                } else {
                    false
                }
            });
            if should_fail {
                return Err(target.load(Ordering::Relaxed));
            }
            target.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed)
        }
    }

    #[test]
    fn tolerates_forced_cas_contention() {
        FLAKY_REMAINING.with(|r| r.set(3));
        let mut buf = vec![0u8; 2048];
        let lfca =
            LocklessFlexibleCircularAllocator::<FlakyCas>::new(buf.as_mut_ptr(), 2048, LfcaConfig::default());
        let p = lfca.allocate(64, 16);
        assert!(p.is_some());
    }
}
