// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::gc::{GcHeader, ObjectKind};
use crate::HeapError;
use libgc_alloc::Allocator;
use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::{fmt, hash, mem, ptr, slice, str};

/// The fixed part of a string object. The bytes of the string follow it
/// directly in the same allocation, then one zero byte.
#[repr(C)]
pub(crate) struct StrHeader {
    gc: GcHeader,
    /// Free for tagging, e.g. marking reserved words of the language.
    reserved: Cell<u8>,
    hash: u32,
    len: usize,
}

const HEADER_SIZE: usize = mem::size_of::<StrHeader>();

impl StrHeader {
    /// Computes the layout of a string object holding `len` bytes.
    pub(crate) fn layout_for(len: usize) -> Result<Layout, HeapError> {
        let payload = len.checked_add(1).ok_or(HeapError::CapacityOverflow)?;
        let (layout, offset) = Layout::new::<StrHeader>().extend(Layout::array::<u8>(payload)?)?;
        debug_assert_eq!(HEADER_SIZE, offset);
        Ok(layout.pad_to_align())
    }

    /// Allocates a new object from `alloc` and copies `bytes` into it.
    pub(crate) fn try_new_in<A: Allocator>(
        bytes: &[u8],
        hash: u32,
        alloc: &A,
    ) -> Result<NonNull<StrHeader>, HeapError> {
        let len = bytes.len();
        let layout = Self::layout_for(len)?;
        let allocation = alloc.allocate(layout)?.cast::<u8>();
        let header = StrHeader {
            gc: GcHeader::new(ObjectKind::String),
            reserved: Cell::new(0),
            hash,
            len,
        };

        // SAFETY: the allocation fits the header followed by len + 1 bytes,
        // and is aligned for the header. The source bytes cannot overlap
        // memory which was just allocated.
        unsafe {
            allocation.cast::<StrHeader>().as_ptr().write(header);
            let data = allocation.as_ptr().add(HEADER_SIZE);
            ptr::copy_nonoverlapping(bytes.as_ptr(), data, len);
            data.add(len).write(0);
        }
        Ok(allocation.cast())
    }

    /// Gives the memory of the object back to `alloc`.
    ///
    /// # Safety
    /// `this` must have been created by [StrHeader::try_new_in] with an
    /// allocator compatible with `alloc`, and must not be used afterwards.
    pub(crate) unsafe fn deallocate_in<A: Allocator>(this: NonNull<StrHeader>, alloc: &A) {
        // SAFETY: the header is alive until the deallocation below.
        let len = unsafe { this.as_ref() }.len;
        // The layout was computed successfully for the same len on creation.
        if let Ok(layout) = Self::layout_for(len) {
            // SAFETY: same pointer and layout as the allocation.
            unsafe { alloc.deallocate(this.cast(), layout) };
        }
    }

    #[inline]
    pub(crate) fn hash(&self) -> u32 {
        self.hash
    }
}

/// A reference to an interned string, valid as long as the table it came
/// from is borrowed.
///
/// Interned strings are deduplicated, so two [InternedStr] from the same
/// table hold equal bytes if and only if they point to the same object, and
/// equality is a pointer comparison. The bytes may contain zeros; the length
/// is stored separately and a terminating zero follows the bytes for
/// interop with C.
#[derive(Clone, Copy)]
pub struct InternedStr<'t> {
    ptr: NonNull<StrHeader>,
    _marker: PhantomData<&'t StrHeader>,
}

impl<'t> InternedStr<'t> {
    /// # Safety
    /// `ptr` must point to a live string object which outlives `'t`.
    #[inline]
    pub(crate) unsafe fn from_ptr(ptr: NonNull<StrHeader>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn header(&self) -> &'t StrHeader {
        // SAFETY: the object lives at least as long as 't.
        unsafe { self.ptr.as_ref() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.header().len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The hash computed by [crate::hash_bytes] when the string was created.
    #[inline]
    pub fn hash(&self) -> u32 {
        self.header().hash
    }

    #[inline]
    pub fn as_bytes(&self) -> &'t [u8] {
        // SAFETY: the bytes were initialized on creation and are never
        // written again. The pointer carries the provenance of the whole
        // allocation.
        unsafe {
            let data = self.ptr.cast::<u8>().as_ptr().add(HEADER_SIZE);
            slice::from_raw_parts(data, self.len())
        }
    }

    /// The bytes including the terminating zero.
    #[inline]
    pub fn as_bytes_with_nul(&self) -> &'t [u8] {
        // SAFETY: see as_bytes, the allocation has one more byte.
        unsafe {
            let data = self.ptr.cast::<u8>().as_ptr().add(HEADER_SIZE);
            slice::from_raw_parts(data, self.len() + 1)
        }
    }

    pub fn to_str(&self) -> Result<&'t str, str::Utf8Error> {
        str::from_utf8(self.as_bytes())
    }

    pub fn reserved(&self) -> u8 {
        self.header().reserved.get()
    }

    pub fn set_reserved(&self, reserved: u8) {
        self.header().reserved.set(reserved);
    }

    #[inline]
    pub fn gc_header(&self) -> &'t GcHeader {
        &self.header().gc
    }

    #[inline]
    pub fn ptr_eq(&self, other: &InternedStr<'_>) -> bool {
        self.ptr == other.ptr
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.as_bytes().as_ptr()
    }
}

impl Deref for InternedStr<'_> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl PartialEq for InternedStr<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for InternedStr<'_> {}

impl hash::Hash for InternedStr<'_> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state)
    }
}

impl fmt::Debug for InternedStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.as_bytes().escape_ascii())
    }
}
