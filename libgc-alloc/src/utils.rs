// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// https://doc.rust-lang.org/beta/std/primitive.pointer.html#method.is_aligned_to
/// Convenience function until the std lib standardizes this.
#[cfg(test)]
#[track_caller]
pub(crate) fn is_aligned_to<T>(p: *const T, align: usize) -> bool {
    p.align_offset(align) == 0
}

/// Makes one allocation through `allocator`, checks that it is usable and
/// that it shows up in the counters, then gives it back.
#[cfg(test)]
pub(crate) fn fuzzer_inner_loop<A: crate::Allocator>(
    allocator: &crate::AccountingAllocator<A>,
    size: usize,
    align_bits: u32,
    idx: usize,
    val: u8,
    max_size: usize,
) {
    use crate::Allocator;
    use core::alloc::Layout;
    let idx = if size > 0 { idx % size } else { 0 };
    let align = 1usize << align_bits;
    let Ok(layout) = Layout::from_size_align(size, align) else {
        return;
    };

    if layout.pad_to_align().size() > max_size {
        return;
    };

    let before = allocator.used_bytes();
    let admitted = allocator.has_capacity_for(layout);
    match allocator.allocate(layout) {
        Ok(mut ptr) => {
            assert!(admitted, "allocation past the limit succeeded");
            assert!(is_aligned_to(ptr.cast::<u8>().as_ptr(), align));
            assert_eq!(before + size, allocator.used_bytes());

            let obj = unsafe { ptr.as_mut() };
            assert!(obj.len() >= size);
            if size > 0 {
                obj[idx] = val;
                assert_eq!(obj[idx], val);
            }

            unsafe { allocator.deallocate(ptr.cast(), layout) };
            assert_eq!(before, allocator.used_bytes());
        }
        Err(_) => assert_eq!(before, allocator.used_bytes()),
    }
}
