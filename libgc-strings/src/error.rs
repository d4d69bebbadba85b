// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use allocator_api2::collections::TryReserveError;
use libgc_alloc::{AllocError, LayoutError};

/// Represents errors that occur in the string table and foreign data list.
///
/// None of these are meant to be recovered from close to where they happen.
/// Callers a couple of layers up abort the whole runtime operation, since an
/// exhausted or corrupted heap invalidates every outstanding reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// Failed to allocate memory for a new object or bucket array.
    #[error("out of memory")]
    OutOfMemory,
    /// The size of an object or array cannot be represented.
    #[error("capacity overflow")]
    CapacityOverflow,
    /// A bucket count which is not a power of two, or falls outside
    /// `min..=max`. Resizing never goes below the current bucket count.
    #[error("invalid bucket count {requested}: expected a power of two between {min} and {max}")]
    InvalidBucketCount {
        requested: usize,
        min: usize,
        max: usize,
    },
    /// The string table was torn down while it still held entries, meaning
    /// the collector did not reclaim every string first.
    #[error("string table released with {live} live entries")]
    LiveEntriesAtTeardown { live: usize },
}

impl HeapError {
    /// Returns true for contract violations by the caller or the collector,
    /// as opposed to running out of memory.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            HeapError::InvalidBucketCount { .. } | HeapError::LiveEntriesAtTeardown { .. }
        )
    }
}

impl From<AllocError> for HeapError {
    #[cold]
    fn from(_: AllocError) -> Self {
        HeapError::OutOfMemory
    }
}

impl From<LayoutError> for HeapError {
    #[cold]
    fn from(_: LayoutError) -> Self {
        HeapError::CapacityOverflow
    }
}

impl From<TryReserveError> for HeapError {
    #[cold]
    fn from(_: TryReserveError) -> Self {
        HeapError::OutOfMemory
    }
}
