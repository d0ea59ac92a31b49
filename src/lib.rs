// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory tracing substrate: flexible circular allocators, an
// offset-addressed shared list, chunk-list transfer types, and a
// trace-job allocator that publishes jobs to a daemon-facing ring
// buffer. All cross-process references are signed byte offsets rather
// than absolute pointers, so the region can be mapped at a different
// virtual address in every participant.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod spin_lock;
pub use spin_lock::SpinLock;

pub mod error;
pub use error::{TraceError, TraceResult};

pub mod offset_ptr;
pub use offset_ptr::{BoundsRegistry, Offset, RegionId};

pub mod allocator;
pub use allocator::{create_allocator, AllocatorKind, CircularAllocator};

pub mod fca;
pub use fca::{FcaStats, FlexibleCircularAllocator};

pub mod lfca;
pub use lfca::{CasOps, LfcaConfig, LfcaStats, LocklessFlexibleCircularAllocator};

pub mod shared_list;
pub use shared_list::List;

pub mod chunk_list;
pub use chunk_list::{
    LocalDataChunk, LocalDataChunkList, ShmChunkVector, ShmDataChunkList, ShmObjectHandle,
    SharedMemoryChunk, SharedMemoryLocation, INVALID_SHM_HANDLE, MAX_CHUNKS_PER_TRACE_REQUEST,
};

pub mod ring_buffer;
pub use ring_buffer::{GlobalContextId, RingBuffer};

pub mod trace_job;
pub use trace_job::{
    AppId, AraComMetaInfoTraceFormat, BindingType, MetaInfo, TraceJobAllocator, TraceJobContainer,
    TraceJobContainerElement, TraceJobType, APP_ID_MAX_LEN, META_INFO_PAYLOAD_SIZE,
};
