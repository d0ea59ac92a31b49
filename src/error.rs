// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the tracing substrate: recoverable conditions a
// caller can retry or route around, and fatal conditions that indicate
// a precondition was violated by the caller.

use std::fmt;

/// Failure outcome of a tracing-substrate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceError {
    /// Allocator has no contiguous (or, for LFCA, no reservable) space left.
    NotEnoughMemory,
    /// The daemon ring buffer has no free slot, or has not been opened yet.
    RingBufferNotInitialised,
    /// `SharedList::at` was called with an index past the end of the list.
    IndexOutOfBoundsInSharedList,
    /// A shared-list node or vector could not be allocated.
    NoSpaceLeftForAllocation,
    /// A job was requested without the required meta-info variant.
    NoMetaInfoProvided,
    /// A deallocation referenced a shared-memory handle the allocator does not own.
    WrongHandle,
    /// A callback was already registered for this slot/context.
    CallbackAlreadyRegistered,
    /// The daemon side of the channel is not connected.
    DaemonNotConnected,
    /// A null resource, invalid handle, or other caller-supplied invariant violation.
    InvalidArgument,
    /// Factory precondition: base address was null.
    BaseAddressVoid,
    /// Factory precondition: requested size was zero.
    SizeIsZero,
}

impl TraceError {
    /// Whether the caller may retry (possibly after another party frees memory)
    /// or must treat this as a programming error.
    pub fn recoverable(self) -> bool {
        !matches!(
            self,
            TraceError::InvalidArgument | TraceError::BaseAddressVoid | TraceError::SizeIsZero
        )
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TraceError::NotEnoughMemory => "not enough memory available for allocation",
            TraceError::RingBufferNotInitialised => "daemon ring buffer is not initialised",
            TraceError::IndexOutOfBoundsInSharedList => "index out of bounds in shared list",
            TraceError::NoSpaceLeftForAllocation => "no space left for allocation",
            TraceError::NoMetaInfoProvided => "no meta-info provided (wrong variant)",
            TraceError::WrongHandle => "shared memory handle does not match this allocator",
            TraceError::CallbackAlreadyRegistered => "callback already registered",
            TraceError::DaemonNotConnected => "daemon is not connected",
            TraceError::InvalidArgument => "invalid argument",
            TraceError::BaseAddressVoid => "base address is null",
            TraceError::SizeIsZero => "requested size is zero",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for TraceError {}

/// Shorthand used throughout the crate.
pub type TraceResult<T> = Result<T, TraceError>;
