// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Trace-job allocator: binds a ring buffer, a circular allocator and a
// job container together into the `allocate_{local,shm}_job` /
// `deallocate_job` publish protocol.
//
// API surface and per-path error codes are grounded on
// `trace_job_allocator_test.cpp` (the only surviving ground truth for
// this component — no header/source for `TraceJobAllocator` or
// `TraceJobContainer` exists in `original_source/`). The fixed-capacity
// keyed container is grounded on `src/proto/service_registry.rs`'s
// `RegistryData{spinlock, count, entries: [T; N]}` linear-scan shape.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::allocator::CircularAllocator;
use crate::chunk_list::{
    LocalDataChunk, LocalDataChunkList, ShmChunkVector, ShmDataChunkList, ShmObjectHandle,
    SharedMemoryChunk, SharedMemoryLocation, INVALID_SHM_HANDLE,
};
use crate::error::{TraceError, TraceResult};
use crate::ring_buffer::{GlobalContextId, RingBuffer};

/// Maximum length of an application identifier, stored inline.
pub const APP_ID_MAX_LEN: usize = 32;

/// An application identifier (mirrors `AppIdType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppId {
    bytes: [u8; APP_ID_MAX_LEN],
    len: u8,
}

impl AppId {
    pub fn new(value: &str) -> Self {
        let mut bytes = [0u8; APP_ID_MAX_LEN];
        let len = value.len().min(APP_ID_MAX_LEN);
        bytes[..len].copy_from_slice(&value.as_bytes()[..len]);
        AppId { bytes, len: len as u8 }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        AppId::new(value)
    }
}

/// Transport binding a trace job originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    Vector,
    Dlt,
    Other,
}

/// Opaque, fixed-size meta-info payload (stands in for
/// `AraComMetaInfoTraceFormat`, which lives in a plugin this crate's
/// scope doesn't include).
pub const META_INFO_PAYLOAD_SIZE: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct AraComMetaInfoTraceFormat {
    pub binding_type: BindingType,
    pub app_id: AppId,
    pub payload: [u8; META_INFO_PAYLOAD_SIZE],
}

/// The meta-info a caller attaches to a trace job. Only the AraCom
/// variant is accepted by this allocator; anything else fails with
/// [`TraceError::NoMetaInfoProvided`], mirroring the original rejecting
/// a `DltMetaInfo` variant passed to an AraCom-bound allocator.
#[derive(Debug, Clone, Copy)]
pub enum MetaInfo {
    AraCom(AraComMetaInfoTraceFormat),
    Unsupported,
}

/// Which chunk-list flavour produced a published job, needed to decide
/// `deallocate_job`'s ownership rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceJobType {
    LocalJob,
    ShmJob,
}

/// A container entry: the job's original context id, its flavour, and
/// the shared-memory location of its chunk vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceJobContainerElement {
    pub original_trace_context_id: GlobalContextId,
    pub job_type: TraceJobType,
    pub chunk_list: SharedMemoryLocation,
    pub ring_slot: usize,
}

/// Fixed-capacity container keyed by `(client_id, context_id)`.
/// Insertion fails once at capacity; lookup/remove are deterministic.
/// Not thread-safe on its own — each instance is owned by one
/// [`TraceJobAllocator`] behind a mutex.
pub struct TraceJobContainer {
    entries: Vec<Option<((u32, u32), TraceJobContainerElement)>>,
}

impl TraceJobContainer {
    pub fn new(capacity: usize) -> Self {
        TraceJobContainer {
            entries: vec![None; capacity.max(1)]
                .into_iter()
                .map(|_: Option<((u32, u32), TraceJobContainerElement)>| None)
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.entries.iter().all(|e| e.is_some())
    }

    pub fn insert(&mut self, key: (u32, u32), element: TraceJobContainerElement) -> TraceResult<()> {
        let slot = self.entries.iter_mut().find(|e| e.is_none());
        match slot {
            Some(slot) => {
                *slot = Some((key, element));
                Ok(())
            }
            None => Err(TraceError::NotEnoughMemory),
        }
    }

    pub fn get(&self, key: (u32, u32)) -> Option<TraceJobContainerElement> {
        self.entries
            .iter()
            .flatten()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    pub fn remove(&mut self, key: (u32, u32)) -> Option<TraceJobContainerElement> {
        let slot = self.entries.iter_mut().find(|e| matches!(e, Some((k, _)) if *k == key));
        slot.and_then(|s| s.take()).map(|(_, v)| v)
    }
}

fn monotonic_timestamp(source: &Option<Arc<dyn Fn() -> Duration + Send + Sync>>) -> Duration {
    match source {
        Some(f) => f(),
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
    }
}

fn copy_into_shm<T: Copy>(
    allocator: &dyn CircularAllocator,
    handle: ShmObjectHandle,
    value: &T,
) -> TraceResult<(SharedMemoryChunk, *mut u8)> {
    let raw = allocator
        .allocate(size_of::<T>(), std::mem::align_of::<T>())
        .ok_or(TraceError::NotEnoughMemory)?;
    unsafe {
        std::ptr::copy_nonoverlapping(value as *const T as *const u8, raw, size_of::<T>());
    }
    let location = SharedMemoryLocation {
        shm_object_handle: handle,
        offset: raw as usize - allocator.base() as usize,
    };
    Ok((SharedMemoryChunk::new(location, size_of::<T>()), raw))
}

/// Binds a ring buffer, a circular allocator and a job container into
/// the allocate/deallocate publish protocol spec.md describes.
pub struct TraceJobAllocator {
    container: Mutex<TraceJobContainer>,
    allocator: Arc<dyn CircularAllocator>,
    ring: RingBuffer,
    shm_handle: AtomicI32,
    monotonic_counter: AtomicU32,
    logger_time: Option<Arc<dyn Fn() -> Duration + Send + Sync>>,
}

impl TraceJobAllocator {
    pub fn new(
        container_capacity: usize,
        allocator: Arc<dyn CircularAllocator>,
        ring_capacity: usize,
    ) -> Self {
        TraceJobAllocator {
            container: Mutex::new(TraceJobContainer::new(container_capacity)),
            allocator,
            ring: RingBuffer::new(ring_capacity),
            shm_handle: AtomicI32::new(INVALID_SHM_HANDLE),
            monotonic_counter: AtomicU32::new(0),
            logger_time: None,
        }
    }

    /// Construct with an injected time source (used in place of the
    /// system clock for every synthetic timestamp chunk).
    pub fn with_logger_time(
        container_capacity: usize,
        allocator: Arc<dyn CircularAllocator>,
        ring_capacity: usize,
        logger_time: Arc<dyn Fn() -> Duration + Send + Sync>,
    ) -> Self {
        let mut allocator_instance = Self::new(container_capacity, allocator, ring_capacity);
        allocator_instance.logger_time = Some(logger_time);
        allocator_instance
    }

    pub fn is_logger_time_available(&self) -> bool {
        self.logger_time.is_some()
    }

    /// Bind the shared-memory object handle every published job's
    /// `chunk_list` location will report. Required before any
    /// `allocate_*_job` call can succeed.
    pub fn set_trace_meta_data_shm_object_handle(&self, handle: ShmObjectHandle) {
        self.shm_handle.store(handle, Ordering::Release);
    }

    pub fn reset_ring_buffer(&self) {
        self.ring.reset();
    }

    pub fn close_ring_buffer(&self) {
        self.ring.close();
    }

    pub fn open_ring_buffer(&self) {
        self.ring.open();
    }

    fn handle(&self) -> TraceResult<ShmObjectHandle> {
        let handle = self.shm_handle.load(Ordering::Acquire);
        if handle == INVALID_SHM_HANDLE {
            Err(TraceError::InvalidArgument)
        } else {
            Ok(handle)
        }
    }

    /// Allocate a job backed by process-local chunks: copies every
    /// payload byte into shared memory. Assigns the next monotonic
    /// context id (the caller does not supply one for local jobs).
    pub fn allocate_local_job(
        &self,
        client_id: u32,
        meta_info: MetaInfo,
        app_id: AppId,
        local_chunks: &LocalDataChunkList,
    ) -> TraceResult<()> {
        let meta = match meta_info {
            MetaInfo::AraCom(m) => m,
            MetaInfo::Unsupported => return Err(TraceError::NoMetaInfoProvided),
        };
        let _ = app_id;
        let handle = self.handle()?;

        let slot = self.ring.reserve_empty()?;
        let context_id = self.monotonic_counter.fetch_add(1, Ordering::Relaxed);
        let now = monotonic_timestamp(&self.logger_time);

        // Pushed straight into the unbounded `ShmChunkVector` alongside
        // the caller's chunks rather than packed back into a fixed-8
        // `LocalDataChunkList`: the latter would silently drop payload
        // chunks once the 2 synthetic entries plus a full 8-element
        // caller list exceed `MAX_CHUNKS_PER_TRACE_REQUEST`.
        let prefix = [
            LocalDataChunk {
                start: &now as *const Duration as *const u8,
                size: size_of::<Duration>(),
            },
            LocalDataChunk {
                start: &meta as *const AraComMetaInfoTraceFormat as *const u8,
                size: size_of::<AraComMetaInfoTraceFormat>(),
            },
        ];
        let elements = prefix.into_iter().chain(
            local_chunks
                .as_slice()
                .iter()
                .take(local_chunks.size())
                .copied(),
        );

        let location = match crate::chunk_list::save_local_elements_to_shared_memory(
            elements,
            handle,
            self.allocator.clone(),
        ) {
            Ok(location) => location,
            Err(err) => {
                self.ring.release_unpublished(slot);
                return Err(err);
            }
        };

        self.publish_and_record(
            slot,
            client_id,
            context_id,
            location,
            TraceJobType::LocalJob,
        )
    }

    /// Allocate a job backed by chunks already resident in shared
    /// memory: only the two synthetic prefix chunks are copied (they
    /// originate as process-local values); payload chunks are
    /// referenced, never copied.
    pub fn allocate_shm_job(
        &self,
        client_id: u32,
        meta_info: MetaInfo,
        app_id: AppId,
        shm_chunks: &ShmDataChunkList,
        context_id: u32,
    ) -> TraceResult<()> {
        let meta = match meta_info {
            MetaInfo::AraCom(m) => m,
            MetaInfo::Unsupported => return Err(TraceError::NoMetaInfoProvided),
        };
        let _ = app_id;
        let handle = self.handle()?;

        let slot = self.ring.reserve_empty()?;
        let now = monotonic_timestamp(&self.logger_time);

        let (ts_chunk, ts_ptr) = match copy_into_shm(self.allocator.as_ref(), handle, &now) {
            Ok(v) => v,
            Err(err) => {
                self.ring.release_unpublished(slot);
                return Err(err);
            }
        };
        let (meta_chunk, meta_ptr) = match copy_into_shm(self.allocator.as_ref(), handle, &meta) {
            Ok(v) => v,
            Err(err) => {
                self.allocator.deallocate(ts_ptr, size_of::<Duration>());
                self.ring.release_unpublished(slot);
                return Err(err);
            }
        };

        // See `allocate_local_job`: pushed directly into the unbounded
        // `ShmChunkVector` so a full 8-chunk caller list plus the 2
        // synthetic entries isn't truncated by a fixed-8 list.
        let prefix = [ts_chunk, meta_chunk];
        let elements = prefix.into_iter().chain(
            shm_chunks.as_slice().iter().take(shm_chunks.size()).copied(),
        );

        let location = match crate::chunk_list::save_shm_elements_to_shared_memory(
            elements,
            handle,
            self.allocator.clone(),
        ) {
            Ok(location) => location,
            Err(err) => {
                self.allocator.deallocate(meta_ptr, size_of::<AraComMetaInfoTraceFormat>());
                self.allocator.deallocate(ts_ptr, size_of::<Duration>());
                self.ring.release_unpublished(slot);
                return Err(err);
            }
        };

        self.publish_and_record(slot, client_id, context_id, location, TraceJobType::ShmJob)
    }

    fn publish_and_record(
        &self,
        slot: usize,
        client_id: u32,
        context_id: u32,
        location: SharedMemoryLocation,
        job_type: TraceJobType,
    ) -> TraceResult<()> {
        let context = GlobalContextId { client_id, context_id };
        self.ring.publish(slot, location, context);

        let element = TraceJobContainerElement {
            original_trace_context_id: context,
            job_type,
            chunk_list: location,
            ring_slot: slot,
        };

        let mut container = self.container.lock().unwrap_or_else(|e| e.into_inner());
        if container.insert((client_id, context_id), element).is_err() {
            drop(container);
            self.ring.release(slot);
            self.deallocate_chunk_vector(location, job_type);
            return Err(TraceError::NotEnoughMemory);
        }
        Ok(())
    }

    fn deallocate_chunk_vector(&self, location: SharedMemoryLocation, job_type: TraceJobType) {
        let vector_ptr =
            unsafe { self.allocator.base().add(location.offset) } as *const ShmChunkVector;
        let vector = unsafe { &*vector_ptr };
        let upper = match job_type {
            TraceJobType::LocalJob => vector.size(),
            TraceJobType::ShmJob => 2.min(vector.size()),
        };
        for i in 0..upper {
            if let Ok(chunk) = vector.at(i) {
                let ptr = unsafe { self.allocator.base().add(chunk.start.offset) };
                self.allocator.deallocate(ptr, chunk.size);
            }
        }
        unsafe {
            std::ptr::drop_in_place(vector_ptr as *mut ShmChunkVector);
        }
        self.allocator.deallocate(
            vector_ptr as *mut u8,
            size_of::<ShmChunkVector>(),
        );
    }

    /// Free a published job's payload and vector node. Entries `0` and
    /// `1` (the synthetic timestamp/meta-info chunks) are always freed,
    /// since this allocator itself put them there. For a local job the
    /// payload chunks were copied by this allocator too, so they are
    /// freed as well; for a shm job the payload chunks reference bytes
    /// the producer already owns and are left untouched.
    pub fn deallocate_job(&self, location: SharedMemoryLocation, job_type: TraceJobType) -> TraceResult<()> {
        let handle = self.shm_handle.load(Ordering::Acquire);
        if location.shm_object_handle != handle {
            return Err(TraceError::WrongHandle);
        }
        if !self.allocator.in_bounds(
            unsafe { self.allocator.base().add(location.offset) },
            size_of::<ShmChunkVector>(),
        ) {
            return Err(TraceError::InvalidArgument);
        }

        let mut container = self.container.lock().unwrap_or_else(|e| e.into_inner());
        let key = container
            .entries
            .iter()
            .flatten()
            .find(|(_, element)| element.chunk_list == location)
            .map(|(k, _)| *k);
        if let Some(key) = key {
            container.remove(key);
        }
        drop(container);

        self.deallocate_chunk_vector(location, job_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{create_allocator, AllocatorKind};
    use crate::chunk_list::SharedMemoryChunk as Chunk;

    fn new_job_allocator(region_size: usize) -> (Vec<u8>, TraceJobAllocator) {
        let mut buf = vec![0u8; region_size];
        let allocator = create_allocator(AllocatorKind::Flexible, buf.as_mut_ptr(), region_size).unwrap();
        let job_allocator = TraceJobAllocator::new(8, allocator, 4);
        job_allocator.set_trace_meta_data_shm_object_handle(1);
        (buf, job_allocator)
    }

    fn some_meta_info() -> MetaInfo {
        MetaInfo::AraCom(AraComMetaInfoTraceFormat {
            binding_type: BindingType::Vector,
            app_id: AppId::new("app"),
            payload: [0u8; META_INFO_PAYLOAD_SIZE],
        })
    }

    #[test]
    fn allocate_local_job_publishes_and_records() {
        let (_buf, ja) = new_job_allocator(8192);
        let payload = [1u8, 2, 3];
        let mut chunks = LocalDataChunkList::new();
        chunks.append(LocalDataChunk { start: payload.as_ptr(), size: payload.len() });

        ja.allocate_local_job(0x55, some_meta_info(), AppId::new("app"), &chunks)
            .unwrap();

        let container = ja.container.lock().unwrap();
        let element = container.get((0x55, 0)).unwrap();
        assert_eq!(element.job_type, TraceJobType::LocalJob);
        let (location, context) = ja.ring.get_ready(element.ring_slot).unwrap();
        assert_eq!(location, element.chunk_list);
        assert_eq!(context.client_id, 0x55);
    }

    #[test]
    fn allocate_local_job_without_ara_com_meta_fails() {
        let (_buf, ja) = new_job_allocator(4096);
        let chunks = LocalDataChunkList::new();
        let err = ja
            .allocate_local_job(1, MetaInfo::Unsupported, AppId::new("app"), &chunks)
            .unwrap_err();
        assert_eq!(err, TraceError::NoMetaInfoProvided);
    }

    #[test]
    fn allocate_shm_job_uses_supplied_context_id() {
        let (_buf, ja) = new_job_allocator(8192);
        let mut chunks = ShmDataChunkList::new();
        chunks.append(Chunk::new(SharedMemoryLocation { shm_object_handle: 1, offset: 16 }, 10));

        ja.allocate_shm_job(0x55, some_meta_info(), AppId::new("app"), &chunks, 0x1234)
            .unwrap();

        let container = ja.container.lock().unwrap();
        let element = container.get((0x55, 0x1234)).unwrap();
        assert_eq!(element.job_type, TraceJobType::ShmJob);
        assert_eq!(element.original_trace_context_id.context_id, 0x1234);
    }

    #[test]
    fn deallocate_job_rejects_wrong_handle() {
        let (_buf, ja) = new_job_allocator(4096);
        let err = ja
            .deallocate_job(
                SharedMemoryLocation { shm_object_handle: 99, offset: 0 },
                TraceJobType::LocalJob,
            )
            .unwrap_err();
        assert_eq!(err, TraceError::WrongHandle);
    }

    #[test]
    fn deallocate_job_round_trips_local_job() {
        let (_buf, ja) = new_job_allocator(8192);
        let payload = [9u8; 5];
        let mut chunks = LocalDataChunkList::new();
        chunks.append(LocalDataChunk { start: payload.as_ptr(), size: payload.len() });
        ja.allocate_local_job(1, some_meta_info(), AppId::new("app"), &chunks)
            .unwrap();

        let location = {
            let container = ja.container.lock().unwrap();
            container.get((1, 0)).unwrap().chunk_list
        };
        ja.deallocate_job(location, TraceJobType::LocalJob).unwrap();
        assert!(ja.container.lock().unwrap().get((1, 0)).is_none());
    }

    #[test]
    fn allocate_fails_when_ring_buffer_closed() {
        let (_buf, ja) = new_job_allocator(4096);
        ja.close_ring_buffer();
        let chunks = LocalDataChunkList::new();
        let err = ja
            .allocate_local_job(1, some_meta_info(), AppId::new("app"), &chunks)
            .unwrap_err();
        assert_eq!(err, TraceError::RingBufferNotInitialised);
    }

    #[test]
    fn allocate_fails_when_container_is_full() {
        let (_buf, ja) = new_job_allocator(1 << 20);
        {
            let mut container = ja.container.lock().unwrap();
            while container
                .insert(
                    (0, container.len() as u32 + 1000),
                    TraceJobContainerElement {
                        original_trace_context_id: GlobalContextId::default(),
                        job_type: TraceJobType::LocalJob,
                        chunk_list: SharedMemoryLocation::default(),
                        ring_slot: 0,
                    },
                )
                .is_ok()
            {}
        }
        let chunks = LocalDataChunkList::new();
        let err = ja
            .allocate_local_job(1, some_meta_info(), AppId::new("app"), &chunks)
            .unwrap_err();
        assert_eq!(err, TraceError::NotEnoughMemory);
    }
}
