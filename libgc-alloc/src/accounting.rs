// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{AllocError, Allocator};
use alloc::rc::Rc;
use core::alloc::Layout;
use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;

#[derive(Default)]
struct Counters {
    used_bytes: Cell<usize>,
    live_blocks: Cell<usize>,
    failed_allocations: Cell<usize>,
    limit: Cell<Option<usize>>,
}

/// [AccountingAllocator] forwards every request to an underlying allocator
/// and keeps track of how many bytes and blocks are currently live. The
/// counters are shared by every clone, so a runtime can hand clones to each
/// of its heap structures and still read a single total.
///
/// An optional byte limit turns the allocator into a bounded heap: a request
/// which would push [Self::used_bytes] past the limit fails with
/// [AllocError] without reaching the underlying allocator. Collectors read
/// [Self::used_bytes] to decide when a cycle is due.
///
/// The counters use [Cell], so the allocator is not [Sync]. It is meant to
/// be driven by a single thread of control.
pub struct AccountingAllocator<A: Allocator> {
    counters: Rc<Counters>,
    allocator: A,
}

impl<A: Allocator + Clone> Clone for AccountingAllocator<A> {
    fn clone(&self) -> Self {
        Self {
            counters: Rc::clone(&self.counters),
            allocator: self.allocator.clone(),
        }
    }
}

impl<A: Allocator> fmt::Debug for AccountingAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountingAllocator")
            .field("used_bytes", &self.used_bytes())
            .field("live_blocks", &self.live_blocks())
            .field("failed_allocations", &self.failed_allocations())
            .field("limit", &self.limit())
            .finish()
    }
}

impl<A: Allocator> AccountingAllocator<A> {
    /// Creates an unbounded [AccountingAllocator] on top of `allocator`.
    pub fn new_in(allocator: A) -> Self {
        Self {
            counters: Rc::new(Counters::default()),
            allocator,
        }
    }

    /// Creates an [AccountingAllocator] which refuses to hold more than
    /// `limit` bytes at once.
    pub fn with_limit_in(limit: usize, allocator: A) -> Self {
        let this = Self::new_in(allocator);
        this.counters.limit.set(Some(limit));
        this
    }

    /// Get the number of bytes currently allocated through this allocator
    /// and all of its clones. This counts requested sizes, not whatever the
    /// underlying allocator may have rounded them up to.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.counters.used_bytes.get()
    }

    /// Get the number of blocks which have been allocated and not yet
    /// deallocated.
    #[inline]
    pub fn live_blocks(&self) -> usize {
        self.counters.live_blocks.get()
    }

    /// Get the number of requests which were refused, either by the limit
    /// or by the underlying allocator.
    #[inline]
    pub fn failed_allocations(&self) -> usize {
        self.counters.failed_allocations.get()
    }

    #[inline]
    pub fn limit(&self) -> Option<usize> {
        self.counters.limit.get()
    }

    /// Changes the limit. Lowering it below [Self::used_bytes] doesn't free
    /// anything, it only makes every following allocation fail until enough
    /// memory is returned.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.counters.limit.set(limit);
    }

    /// Gets the number of bytes that can be allocated before the limit is
    /// hit, or `None` if there is no limit.
    pub fn remaining_capacity(&self) -> Option<usize> {
        self.limit()
            .map(|limit| limit.saturating_sub(self.used_bytes()))
    }

    /// Determine if the given layout would be admitted by the limit. The
    /// underlying allocator may still refuse it.
    pub fn has_capacity_for(&self, layout: Layout) -> bool {
        match self.remaining_capacity() {
            Some(remaining) => remaining >= layout.size(),
            None => self.used_bytes().checked_add(layout.size()).is_some(),
        }
    }

    #[cold]
    #[inline(never)]
    fn refuse(&self) -> AllocError {
        let failed = &self.counters.failed_allocations;
        failed.set(failed.get().saturating_add(1));
        AllocError
    }
}

unsafe impl<A: Allocator> Allocator for AccountingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if !self.has_capacity_for(layout) {
            return Err(self.refuse());
        }

        let Ok(allocation) = self.allocator.allocate(layout) else {
            return Err(self.refuse());
        };

        let counters = &self.counters;
        counters.used_bytes.set(counters.used_bytes.get() + layout.size());
        counters.live_blocks.set(counters.live_blocks.get() + 1);
        Ok(allocation)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the caller upholds the contract for the underlying
        // allocator, since every block came from it.
        unsafe { self.allocator.deallocate(ptr, layout) };

        let counters = &self.counters;
        debug_assert!(counters.used_bytes.get() >= layout.size());
        debug_assert!(counters.live_blocks.get() > 0);
        counters
            .used_bytes
            .set(counters.used_bytes.get().saturating_sub(layout.size()));
        counters
            .live_blocks
            .set(counters.live_blocks.get().saturating_sub(1));
    }
}
