// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::gc::{GcHeader, LivenessOracle, ObjectKind};
use crate::HeapError;
use libgc_alloc::{Allocator, Global};
use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::{fmt, mem, ptr, slice};
use tracing::debug;

/// Payloads are aligned for any primitive type a host might store.
pub const FOREIGN_PAYLOAD_ALIGN: usize = 16;

/// An opaque reference to the table of operations (finalizer, indexing, and
/// so on) the scripting engine applies to a foreign data object.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CapabilityRef(pub u32);

impl CapabilityRef {
    pub const DEFAULT: CapabilityRef = CapabilityRef(0);
}

#[repr(C)]
struct ForeignHeader {
    gc: GcHeader,
    capabilities: Cell<CapabilityRef>,
    len: usize,
    next: Cell<Option<NonNull<ForeignHeader>>>,
}

const PAYLOAD_OFFSET: usize =
    (mem::size_of::<ForeignHeader>() + FOREIGN_PAYLOAD_ALIGN - 1) & !(FOREIGN_PAYLOAD_ALIGN - 1);

const OBJECT_ALIGN: usize = if mem::align_of::<ForeignHeader>() > FOREIGN_PAYLOAD_ALIGN {
    mem::align_of::<ForeignHeader>()
} else {
    FOREIGN_PAYLOAD_ALIGN
};

impl ForeignHeader {
    fn layout_for(len: usize) -> Result<Layout, HeapError> {
        let size = PAYLOAD_OFFSET
            .checked_add(len)
            .ok_or(HeapError::CapacityOverflow)?;
        Ok(Layout::from_size_align(size, OBJECT_ALIGN)?.pad_to_align())
    }
}

/// A reference to a block of host data the collector can see. The payload
/// is never interpreted here.
#[derive(Clone, Copy)]
pub struct ForeignData<'l> {
    ptr: NonNull<ForeignHeader>,
    _marker: PhantomData<&'l ForeignHeader>,
}

impl<'l> ForeignData<'l> {
    #[inline]
    fn header(&self) -> &'l ForeignHeader {
        // SAFETY: the object lives at least as long as 'l.
        unsafe { self.ptr.as_ref() }
    }

    /// Size of the payload in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.header().len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finalized(&self) -> bool {
        self.gc_header().is_finalized()
    }

    pub fn set_finalized(&self, finalized: bool) {
        self.gc_header().set_finalized(finalized);
    }

    pub fn capabilities(&self) -> CapabilityRef {
        self.header().capabilities.get()
    }

    pub fn set_capabilities(&self, capabilities: CapabilityRef) {
        self.header().capabilities.set(capabilities);
    }

    #[inline]
    pub fn gc_header(&self) -> &'l GcHeader {
        &self.header().gc
    }

    /// Pointer to the first payload byte, aligned to
    /// [FOREIGN_PAYLOAD_ALIGN].
    #[inline]
    pub fn payload_ptr(&self) -> NonNull<u8> {
        // SAFETY: the payload starts PAYLOAD_OFFSET bytes into the
        // allocation, which is at most one past its end for empty payloads.
        unsafe { NonNull::new_unchecked(self.ptr.cast::<u8>().as_ptr().add(PAYLOAD_OFFSET)) }
    }

    /// # Safety
    /// No mutable reference to the payload may exist while the returned
    /// slice is alive.
    pub unsafe fn payload(&self) -> &'l [u8] {
        // SAFETY: the payload was zeroed on creation, so it's initialized.
        unsafe { slice::from_raw_parts(self.payload_ptr().as_ptr(), self.len()) }
    }

    /// # Safety
    /// No other reference to the payload may exist while the returned slice
    /// is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self) -> &'l mut [u8] {
        // SAFETY: the caller guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.payload_ptr().as_ptr(), self.len()) }
    }

    #[inline]
    pub fn ptr_eq(&self, other: &ForeignData<'_>) -> bool {
        self.ptr == other.ptr
    }
}

impl fmt::Debug for ForeignData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignData")
            .field("len", &self.len())
            .field("capabilities", &self.capabilities())
            .field("gc", self.gc_header())
            .finish()
    }
}

/// The root list of every foreign data object, newest first. Objects are
/// only removed by [ForeignDataList::sweep] or when the list is dropped.
pub struct ForeignDataList<A: Allocator = Global> {
    head: Cell<Option<NonNull<ForeignHeader>>>,
    len: Cell<usize>,
    allocator: A,
}

impl Default for ForeignDataList<Global> {
    fn default() -> Self {
        Self::new_in(Global)
    }
}

impl<A: Allocator> ForeignDataList<A> {
    pub const fn new_in(allocator: A) -> Self {
        Self {
            head: Cell::new(None),
            len: Cell::new(0),
            allocator,
        }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a new object with `size` zeroed payload bytes and links it at
    /// the front of the list. Every call creates a distinct object.
    pub fn allocate<O: LivenessOracle + ?Sized>(
        &self,
        size: usize,
        capabilities: CapabilityRef,
        oracle: &O,
    ) -> Result<ForeignData<'_>, HeapError> {
        let layout = ForeignHeader::layout_for(size)?;
        let allocation = self.allocator.allocate(layout)?.cast::<u8>();
        let header = ForeignHeader {
            // Not finalized yet.
            gc: GcHeader::new(ObjectKind::ForeignData),
            capabilities: Cell::new(capabilities),
            len: size,
            next: Cell::new(self.head.get()),
        };

        // SAFETY: the allocation is aligned for the header and large enough
        // for the header and the payload after PAYLOAD_OFFSET.
        unsafe {
            allocation.cast::<ForeignHeader>().as_ptr().write(header);
            ptr::write_bytes(allocation.as_ptr().add(PAYLOAD_OFFSET), 0, size);
        }

        let ptr = allocation.cast::<ForeignHeader>();
        let data = ForeignData {
            ptr,
            _marker: PhantomData,
        };
        oracle.on_allocate(data.gc_header());
        self.head.set(Some(ptr));
        self.len.set(self.len() + 1);
        Ok(data)
    }

    pub fn iter(&self) -> impl Iterator<Item = ForeignData<'_>> + '_ {
        let mut cursor = self.head.get();
        std::iter::from_fn(move || {
            let ptr = cursor?;
            let data = ForeignData {
                ptr,
                _marker: PhantomData,
            };
            cursor = data.header().next.get();
            Some(data)
        })
    }

    /// Frees every object for which `is_garbage` returns true and returns
    /// how many were freed.
    pub fn sweep<F>(&mut self, mut is_garbage: F) -> usize
    where
        F: FnMut(ForeignData<'_>) -> bool,
    {
        let mut freed = 0;
        let mut prev: Option<NonNull<ForeignHeader>> = None;
        let mut cursor = self.head.get();
        while let Some(ptr) = cursor {
            let data = ForeignData {
                ptr,
                _marker: PhantomData,
            };
            cursor = data.header().next.get();
            if !is_garbage(data) {
                prev = Some(ptr);
                continue;
            }

            match prev {
                // SAFETY: prev is a live object still on the list.
                Some(prev) => unsafe { prev.as_ref() }.next.set(cursor),
                None => self.head.set(cursor),
            }
            // SAFETY: unlinked above, and &mut self means no ForeignData is
            // borrowed from the list.
            unsafe { self.deallocate(ptr) };
            freed += 1;
        }
        self.len.set(self.len() - freed);
        if freed > 0 {
            debug!(freed, remaining = self.len(), "swept foreign data");
        }
        freed
    }

    /// # Safety
    /// `ptr` must be an unlinked object of this list, not used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<ForeignHeader>) {
        // SAFETY: the header is alive until the deallocation below.
        let len = unsafe { ptr.as_ref() }.len;
        if let Ok(layout) = ForeignHeader::layout_for(len) {
            // SAFETY: same pointer and layout as the allocation.
            unsafe { self.allocator.deallocate(ptr.cast(), layout) };
        }
    }
}

impl<A: Allocator> Drop for ForeignDataList<A> {
    fn drop(&mut self) {
        let mut cursor = self.head.take();
        while let Some(ptr) = cursor {
            // SAFETY: every object on the list is alive until freed here.
            cursor = unsafe { ptr.as_ref() }.next.get();
            // SAFETY: &mut self, nothing borrows the list any more.
            unsafe { self.deallocate(ptr) };
        }
    }
}

impl<A: Allocator> fmt::Debug for ForeignDataList<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Collector;
    use libgc_alloc::AccountingAllocator;

    #[test]
    fn test_allocate() {
        let gc = Collector::new();
        let list = ForeignDataList::default();
        let blob = list.allocate(100, CapabilityRef::DEFAULT, &gc).unwrap();
        assert_eq!(100, blob.len());
        assert!(!blob.is_finalized());
        assert_eq!(CapabilityRef::DEFAULT, blob.capabilities());
        assert_eq!(ObjectKind::ForeignData, blob.gc_header().kind());
        assert!(!gc.is_dead(blob.gc_header()));
        assert_eq!(
            0,
            blob.payload_ptr().as_ptr() as usize % FOREIGN_PAYLOAD_ALIGN
        );
        assert!(unsafe { blob.payload() }.iter().all(|b| *b == 0));

        unsafe { blob.payload_mut() }.copy_from_slice(&[7; 100]);
        assert_eq!(&[7; 100], unsafe { blob.payload() });

        blob.set_finalized(true);
        blob.set_capabilities(CapabilityRef(9));
        assert!(blob.is_finalized());
        assert_eq!(CapabilityRef(9), blob.capabilities());
    }

    #[test]
    fn test_never_deduplicated() {
        let list = ForeignDataList::default();
        let a = list.allocate(4, CapabilityRef::DEFAULT, &Collector::new()).unwrap();
        let b = list.allocate(4, CapabilityRef::DEFAULT, &Collector::new()).unwrap();
        assert!(!a.ptr_eq(&b));
        assert_eq!(2, list.len());

        // Newest first.
        let order: Vec<_> = list.iter().collect();
        assert!(order[0].ptr_eq(&b));
        assert!(order[1].ptr_eq(&a));
    }

    #[test]
    fn test_empty_payload() {
        let list = ForeignDataList::default();
        let empty = list.allocate(0, CapabilityRef::DEFAULT, &Collector::new()).unwrap();
        assert!(empty.is_empty());
        assert!(unsafe { empty.payload() }.is_empty());
    }

    #[test]
    fn test_sweep_and_drop_free_everything() {
        let alloc = AccountingAllocator::new_in(Global);
        let gc = Collector::new();
        let mut list = ForeignDataList::new_in(alloc.clone());
        for size in 0..10 {
            list.allocate(size, CapabilityRef(size as u32), &gc).unwrap();
        }
        assert_eq!(10, alloc.live_blocks());

        let odd = |data: ForeignData<'_>| data.len() % 2 == 1;
        assert_eq!(5, list.sweep(odd));
        assert_eq!(5, list.len());
        assert!(list.iter().all(|data| data.len() % 2 == 0));
        assert!(list
            .iter()
            .all(|data| data.capabilities() == CapabilityRef(data.len() as u32)));
        assert_eq!(5, alloc.live_blocks());

        drop(list);
        assert_eq!(0, alloc.used_bytes());
    }

    #[test]
    fn test_out_of_memory() {
        let alloc = AccountingAllocator::with_limit_in(64, Global);
        let list = ForeignDataList::new_in(alloc);
        assert_eq!(
            Err(HeapError::OutOfMemory),
            list.allocate(1024, CapabilityRef::DEFAULT, &Collector::new())
                .map(|_| ())
        );
        assert!(list.is_empty());
        assert_eq!(
            Err(HeapError::CapacityOverflow),
            list.allocate(usize::MAX, CapabilityRef::DEFAULT, &Collector::new())
                .map(|_| ())
        );
    }
}
