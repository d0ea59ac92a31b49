// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Chunk descriptors and fixed-capacity chunk lists, local and
// shared-memory flavours.
//
// Port of
// score/analysis/tracing/common/interface_types/{shared_memory_location,shared_memory_chunk}.{h,cpp}
// and
// score/analysis/tracing/generic_trace_library/interface_types/chunk_list/{local_data_chunk_list,shm_data_chunk_list}.{h,cpp}.

use std::sync::Arc;

use crate::allocator::CircularAllocator;
use crate::error::{TraceError, TraceResult};
use crate::shared_list::List;

/// Handle to a shared-memory object assigned by the daemon during region
/// registration. `-1` denotes "no handle" (the C++ side's sentinel).
pub type ShmObjectHandle = i32;

/// Sentinel for an unassigned shared-memory handle.
pub const INVALID_SHM_HANDLE: ShmObjectHandle = -1;

/// Maximum chunks carried by one trace request's chunk list.
pub const MAX_CHUNKS_PER_TRACE_REQUEST: usize = 8;

/// A locator for data inside a shared-memory object: the object's handle
/// plus a byte offset from that object's base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedMemoryLocation {
    pub shm_object_handle: ShmObjectHandle,
    pub offset: usize,
}

/// A chunk of data residing in shared memory: its location and size,
/// bracketed by canary words for corruption detection.
#[derive(Debug, Clone, Copy)]
pub struct SharedMemoryChunk {
    pub canary_start: u32,
    pub start: SharedMemoryLocation,
    pub size: usize,
    pub canary_end: u32,
}

impl SharedMemoryChunk {
    pub const CANARY_START: u32 = 0xDEAD_BEEF;
    pub const CANARY_END: u32 = 0xCAFE_BABE;

    pub fn new(start: SharedMemoryLocation, size: usize) -> Self {
        SharedMemoryChunk {
            canary_start: Self::CANARY_START,
            start,
            size,
            canary_end: Self::CANARY_END,
        }
    }

    /// Whether either canary has been overwritten.
    pub fn is_corrupted(&self) -> bool {
        self.canary_start != Self::CANARY_START || self.canary_end != Self::CANARY_END
    }
}

impl Default for SharedMemoryChunk {
    fn default() -> Self {
        SharedMemoryChunk::new(SharedMemoryLocation::default(), 0)
    }
}

/// Corrupted chunks compare unequal to everything, including themselves.
impl PartialEq for SharedMemoryChunk {
    fn eq(&self, other: &Self) -> bool {
        if self.is_corrupted() || other.is_corrupted() {
            return false;
        }
        self.size == other.size && self.start == other.start
    }
}

/// Vector type the shared-memory chunk list is serialized into.
pub type ShmChunkVector = List<SharedMemoryChunk>;

/// A chunk of data residing in process-local memory: a pointer and its
/// length. Only meaningful to the process that produced it.
#[derive(Debug, Clone, Copy)]
pub struct LocalDataChunk {
    pub start: *const u8,
    pub size: usize,
}

impl Default for LocalDataChunk {
    fn default() -> Self {
        LocalDataChunk {
            start: std::ptr::null(),
            size: 0,
        }
    }
}

impl PartialEq for LocalDataChunk {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.size == other.size
    }
}

// LocalDataChunk is a plain (pointer, length) descriptor; the crate never
// dereferences it on any thread but the one that built it.
unsafe impl Send for LocalDataChunk {}
unsafe impl Sync for LocalDataChunk {}

macro_rules! fixed_chunk_list {
    ($name:ident, $elem:ty) => {
        /// Fixed-capacity (`MAX_CHUNKS_PER_TRACE_REQUEST`) array of chunks
        /// plus a fill count. `append_front` shifts right, dropping the
        /// last element if full; `append` silently drops writes past
        /// capacity.
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            list: [$elem; MAX_CHUNKS_PER_TRACE_REQUEST],
            number_of_chunks: u8,
        }

        impl $name {
            /// An empty list.
            pub fn new() -> Self {
                $name {
                    list: [<$elem>::default(); MAX_CHUNKS_PER_TRACE_REQUEST],
                    number_of_chunks: 0,
                }
            }

            /// A list containing a single root element.
            pub fn with_root(root: $elem) -> Self {
                let mut list = [<$elem>::default(); MAX_CHUNKS_PER_TRACE_REQUEST];
                list[0] = root;
                $name {
                    list,
                    number_of_chunks: 1,
                }
            }

            /// Prepend `chunk`, shifting existing elements right (the
            /// last element is dropped once the list is full).
            pub fn append_front(&mut self, chunk: $elem) {
                if (self.number_of_chunks as usize) < MAX_CHUNKS_PER_TRACE_REQUEST {
                    self.number_of_chunks += 1;
                }
                for i in (1..MAX_CHUNKS_PER_TRACE_REQUEST).rev() {
                    self.list[i] = self.list[i - 1];
                }
                self.list[0] = chunk;
            }

            /// Append `chunk` at the current fill position. No-op once full.
            pub fn append(&mut self, chunk: $elem) {
                if (self.number_of_chunks as usize) < MAX_CHUNKS_PER_TRACE_REQUEST {
                    self.list[self.number_of_chunks as usize] = chunk;
                    self.number_of_chunks += 1;
                }
            }

            /// Count of filled slots.
            pub fn size(&self) -> usize {
                self.number_of_chunks as usize
            }

            /// Zero-fill every slot and reset the count.
            pub fn clear(&mut self) {
                self.list = [<$elem>::default(); MAX_CHUNKS_PER_TRACE_REQUEST];
                self.number_of_chunks = 0;
            }

            /// The underlying fixed array, including unused (zeroed) slots.
            pub fn as_slice(&self) -> &[$elem; MAX_CHUNKS_PER_TRACE_REQUEST] {
                &self.list
            }

            /// Mutable access to the underlying fixed array.
            pub fn as_mut_slice(&mut self) -> &mut [$elem; MAX_CHUNKS_PER_TRACE_REQUEST] {
                &mut self.list
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                if self.number_of_chunks != other.number_of_chunks {
                    return false;
                }
                self.list
                    .iter()
                    .zip(other.list.iter())
                    .all(|(a, b)| a == b)
            }
        }
    };
}

fixed_chunk_list!(LocalDataChunkList, LocalDataChunk);
fixed_chunk_list!(ShmDataChunkList, SharedMemoryChunk);

fn offset_from_base(allocator: &dyn CircularAllocator, ptr: *const u8) -> usize {
    ptr as usize - allocator.base() as usize
}

fn is_valid_local_element(element: &LocalDataChunk) -> bool {
    element.size != 0 && !element.start.is_null()
}

fn validate_save_preconditions(
    allocator: &dyn CircularAllocator,
    handle: ShmObjectHandle,
) -> TraceResult<()> {
    if allocator.base().is_null() || handle == INVALID_SHM_HANDLE {
        return Err(TraceError::InvalidArgument);
    }
    Ok(())
}

fn allocate_and_construct_vector(
    allocator: &Arc<dyn CircularAllocator>,
) -> TraceResult<(*mut u8, *mut ShmChunkVector)> {
    let vector_raw = allocator
        .allocate(
            std::mem::size_of::<ShmChunkVector>(),
            std::mem::align_of::<ShmChunkVector>(),
        )
        .ok_or(TraceError::NotEnoughMemory)?;
    let vector_ptr = vector_raw as *mut ShmChunkVector;
    unsafe {
        ShmChunkVector::construct_in_place(vector_ptr, allocator.clone());
    }
    Ok((vector_raw, vector_ptr))
}

/// Serialize `elements` (an unbounded sequence — not capped at
/// `MAX_CHUNKS_PER_TRACE_REQUEST`, since callers such as
/// [`crate::trace_job::TraceJobAllocator`] prepend synthetic chunks ahead
/// of a full 8-element chunk list) into `allocator`'s region: allocate a
/// [`ShmChunkVector`], copy every valid element's bytes into fresh
/// shared-memory storage, and push a [`SharedMemoryChunk`] describing
/// each. Rolls back every allocation made so far on any mid-way failure.
pub(crate) fn save_local_elements_to_shared_memory(
    elements: impl IntoIterator<Item = LocalDataChunk>,
    handle: ShmObjectHandle,
    allocator: Arc<dyn CircularAllocator>,
) -> TraceResult<SharedMemoryLocation> {
    validate_save_preconditions(allocator.as_ref(), handle)?;
    let (vector_raw, vector_ptr) = allocate_and_construct_vector(&allocator)?;
    let vector = unsafe { &*vector_ptr };

    let mut allocated: Vec<(*mut u8, usize)> = Vec::new();
    let result = (|| -> TraceResult<()> {
        for element in elements.into_iter().filter(is_valid_local_element) {
            let shm_ptr = allocator
                .allocate(element.size, 1)
                .ok_or(TraceError::NotEnoughMemory)?;
            allocated.push((shm_ptr, element.size));
            unsafe {
                std::ptr::copy_nonoverlapping(element.start, shm_ptr, element.size);
            }
            let location = SharedMemoryLocation {
                shm_object_handle: handle,
                offset: offset_from_base(allocator.as_ref(), shm_ptr),
            };
            vector.push_back(SharedMemoryChunk::new(location, element.size))?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(SharedMemoryLocation {
            shm_object_handle: handle,
            offset: offset_from_base(allocator.as_ref(), vector_raw),
        }),
        Err(err) => {
            for (ptr, size) in allocated {
                allocator.deallocate(ptr, size);
            }
            unsafe {
                std::ptr::drop_in_place(vector_ptr);
            }
            allocator.deallocate(vector_raw, std::mem::size_of::<ShmChunkVector>());
            Err(err)
        }
    }
}

/// Serialize `elements` (unbounded, see
/// [`save_local_elements_to_shared_memory`]) into `allocator`'s region.
/// Unlike the local variant, no payload copy is needed: every element
/// already references bytes living in shared memory, so only the vector
/// itself is allocated.
pub(crate) fn save_shm_elements_to_shared_memory(
    elements: impl IntoIterator<Item = SharedMemoryChunk>,
    handle: ShmObjectHandle,
    allocator: Arc<dyn CircularAllocator>,
) -> TraceResult<SharedMemoryLocation> {
    validate_save_preconditions(allocator.as_ref(), handle)?;
    let (vector_raw, vector_ptr) = allocate_and_construct_vector(&allocator)?;
    let vector = unsafe { &*vector_ptr };

    let result = (|| -> TraceResult<()> {
        for element in elements
            .into_iter()
            .filter(|e| e.size != 0 && !e.is_corrupted())
        {
            vector.push_back(element)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(SharedMemoryLocation {
            shm_object_handle: handle,
            offset: offset_from_base(allocator.as_ref(), vector_raw),
        }),
        Err(err) => {
            unsafe {
                std::ptr::drop_in_place(vector_ptr);
            }
            allocator.deallocate(vector_raw, std::mem::size_of::<ShmChunkVector>());
            Err(err)
        }
    }
}

impl LocalDataChunkList {
    /// Serialize this list's valid elements into `allocator`'s region.
    /// See [`save_local_elements_to_shared_memory`].
    pub fn save_to_shared_memory(
        &self,
        handle: ShmObjectHandle,
        allocator: Arc<dyn CircularAllocator>,
    ) -> TraceResult<SharedMemoryLocation> {
        save_local_elements_to_shared_memory(
            self.list.into_iter().take(self.number_of_chunks as usize),
            handle,
            allocator,
        )
    }
}

impl ShmDataChunkList {
    /// Serialize this list's valid elements into `allocator`'s region.
    /// See [`save_shm_elements_to_shared_memory`].
    pub fn save_to_shared_memory(
        &self,
        handle: ShmObjectHandle,
        allocator: Arc<dyn CircularAllocator>,
    ) -> TraceResult<SharedMemoryLocation> {
        save_shm_elements_to_shared_memory(
            self.list.into_iter().take(self.number_of_chunks as usize),
            handle,
            allocator,
        )
    }
}
