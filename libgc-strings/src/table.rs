// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::gc::LivenessOracle;
use crate::hash::hash_bytes;
use crate::object::{InternedStr, StrHeader};
use crate::HeapError;
use allocator_api2::vec::Vec;
use libgc_alloc::{Allocator, Global};
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use tracing::{debug, error, trace};

/// The bucket count a table starts with unless told otherwise.
pub const DEFAULT_BUCKET_COUNT: usize = 32;

/// The largest bucket count. The table stops growing once it gets here,
/// chains just get longer.
pub const MAX_BUCKET_COUNT: usize = 1 << 30;

type SlotId = u32;

#[derive(Clone, Copy)]
struct Slot {
    /// None while the slot is on the free list.
    object: Option<NonNull<StrHeader>>,
    /// The next slot of the bucket chain, or of the free list.
    next: Option<SlotId>,
}

/// The chains of the table. Each bucket holds the id of the first slot of
/// its chain, and each slot holds the id of the next one, so rebuilding the
/// buckets only rewrites ids and never touches the string objects.
struct BucketArray<A: Allocator> {
    heads: Vec<Option<SlotId>, A>,
    slots: Vec<Slot, A>,
    free: Option<SlotId>,
    live_entries: usize,
    resizes: usize,
}

impl<A: Allocator + Clone> BucketArray<A> {
    fn try_new_heads(bucket_count: usize, alloc: A) -> Result<Vec<Option<SlotId>, A>, HeapError> {
        let mut heads = Vec::new_in(alloc);
        heads.try_reserve_exact(bucket_count)?;
        heads.resize(bucket_count, None);
        Ok(heads)
    }

    fn try_with_bucket_count_in(bucket_count: usize, alloc: A) -> Result<Self, HeapError> {
        Ok(Self {
            heads: Self::try_new_heads(bucket_count, alloc.clone())?,
            slots: Vec::new_in(alloc),
            free: None,
            live_entries: 0,
            resizes: 0,
        })
    }

    #[inline]
    fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    #[inline]
    fn bucket_for(hash: u32, bucket_count: usize) -> usize {
        let bucket = hash as usize & (bucket_count - 1);
        debug_assert_eq!(hash as usize % bucket_count, bucket);
        bucket
    }

    /// Walks the chain starting at `head`.
    fn chain(&self, head: Option<SlotId>) -> impl Iterator<Item = &Slot> + '_ {
        let mut cursor = head;
        std::iter::from_fn(move || {
            let slot = self.slots.get(cursor? as usize)?;
            cursor = slot.next;
            Some(slot)
        })
    }

    fn find(&self, hash: u32, bytes: &[u8]) -> Option<NonNull<StrHeader>> {
        let bucket = Self::bucket_for(hash, self.bucket_count());
        self.chain(self.heads[bucket])
            .filter_map(|slot| slot.object)
            .find(|object| {
                // SAFETY: occupied slots point to live objects.
                let candidate = unsafe { InternedStr::from_ptr(*object) };
                candidate.len() == bytes.len() && candidate.as_bytes() == bytes
            })
    }

    /// Makes sure [Self::link] won't need to allocate.
    fn reserve_slot(&mut self) -> Result<(), HeapError> {
        if self.free.is_some() {
            return Ok(());
        }
        SlotId::try_from(self.slots.len()).map_err(|_| HeapError::CapacityOverflow)?;
        self.slots.try_reserve(1)?;
        Ok(())
    }

    /// Pushes `object` on the front of its chain.
    fn link(&mut self, object: NonNull<StrHeader>) {
        // SAFETY: the object was just created and is alive.
        let hash = unsafe { object.as_ref() }.hash();
        let bucket = Self::bucket_for(hash, self.bucket_count());
        let slot = Slot {
            object: Some(object),
            next: self.heads[bucket],
        };
        let id = match self.free {
            Some(id) => {
                self.free = self.slots[id as usize].next;
                self.slots[id as usize] = slot;
                id
            }
            None => {
                // Checked to fit by reserve_slot.
                let id = self.slots.len() as SlotId;
                self.slots.push(slot);
                id
            }
        };
        self.heads[bucket] = Some(id);
        self.live_entries += 1;
    }

    /// Rebuilds the heads for `new_bucket_count` buckets, relinking every
    /// slot by the hash stored in its object.
    fn resize(&mut self, new_bucket_count: usize) -> Result<(), HeapError> {
        let mut new_heads = Self::try_new_heads(new_bucket_count, self.heads.allocator().clone())?;

        for bucket in 0..self.heads.len() {
            let mut cursor = self.heads[bucket].take();
            while let Some(id) = cursor {
                let slot = &mut self.slots[id as usize];
                cursor = slot.next;
                let Some(object) = slot.object else {
                    continue;
                };
                // SAFETY: occupied slots point to live objects.
                let hash = unsafe { object.as_ref() }.hash();
                let new_bucket = Self::bucket_for(hash, new_bucket_count);
                slot.next = new_heads[new_bucket];
                new_heads[new_bucket] = Some(id);
            }
        }

        self.heads = new_heads;
        self.resizes += 1;
        Ok(())
    }

    fn longest_chain(&self) -> usize {
        self.heads
            .iter()
            .map(|head| self.chain(*head).count())
            .max()
            .unwrap_or(0)
    }
}

/// Counters the collector and tests read off a [StringTable].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub bucket_count: usize,
    pub live_entries: usize,
    pub resizes: usize,
    pub longest_chain: usize,
}

/// Holds the unique copy of every string.
///
/// [StringTable::intern] takes `&self`, so any number of [InternedStr] can
/// be held at once. Freeing strings requires `&mut self`, which guarantees
/// no reference to them is still around.
///
/// The table grows by doubling whenever it holds more entries than buckets.
/// It never shrinks.
pub struct StringTable<A: Allocator + Clone = Global> {
    buckets: RefCell<BucketArray<A>>,
    allocator: A,
}

impl StringTable<Global> {
    pub fn try_new() -> Result<Self, HeapError> {
        Self::try_with_bucket_count_in(DEFAULT_BUCKET_COUNT, Global)
    }
}

impl<A: Allocator + Clone> StringTable<A> {
    /// Creates an empty table. `bucket_count` must be a power of two no
    /// larger than [MAX_BUCKET_COUNT].
    pub fn try_with_bucket_count_in(bucket_count: usize, allocator: A) -> Result<Self, HeapError> {
        Self::check_bucket_count(bucket_count, 1)?;
        Ok(Self {
            buckets: RefCell::new(BucketArray::try_with_bucket_count_in(
                bucket_count,
                allocator.clone(),
            )?),
            allocator,
        })
    }

    fn check_bucket_count(bucket_count: usize, min: usize) -> Result<(), HeapError> {
        if bucket_count.is_power_of_two() && (min..=MAX_BUCKET_COUNT).contains(&bucket_count) {
            Ok(())
        } else {
            Err(HeapError::InvalidBucketCount {
                requested: bucket_count,
                min,
                max: MAX_BUCKET_COUNT,
            })
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.borrow().bucket_count()
    }

    /// Returns the number of strings currently held in the table.
    pub fn live_entries(&self) -> usize {
        self.buckets.borrow().live_entries
    }

    pub fn is_empty(&self) -> bool {
        self.live_entries() == 0
    }

    pub fn stats(&self) -> TableStats {
        let buckets = self.buckets.borrow();
        TableStats {
            bucket_count: buckets.bucket_count(),
            live_entries: buckets.live_entries,
            resizes: buckets.resizes,
            longest_chain: buckets.longest_chain(),
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Looks up `bytes` without inserting and without reviving.
    pub fn get(&self, bytes: &[u8]) -> Option<InternedStr<'_>> {
        let found = self.buckets.borrow().find(hash_bytes(bytes), bytes)?;
        // SAFETY: the object is alive while the table is borrowed.
        Some(unsafe { InternedStr::from_ptr(found) })
    }

    /// Returns the string object holding `bytes`, creating it if needed.
    ///
    /// If the object exists but `oracle` says it is dead, it is revived
    /// first. A new object is passed to [LivenessOracle::on_allocate] before
    /// it is linked.
    ///
    /// # Errors
    /// Fails if the object or a grown bucket array can't be allocated. When
    /// growing fails the new string is already in the table, and the table
    /// is still consistent, only more crowded.
    pub fn intern<O: LivenessOracle + ?Sized>(
        &self,
        bytes: &[u8],
        oracle: &O,
    ) -> Result<InternedStr<'_>, HeapError> {
        let hash = hash_bytes(bytes);

        // The borrow ends before calling into the oracle.
        let found = self.buckets.borrow().find(hash, bytes);
        if let Some(found) = found {
            // SAFETY: the object is alive while the table is borrowed.
            let found = unsafe { InternedStr::from_ptr(found) };
            if oracle.is_dead(found.gc_header()) {
                trace!(len = found.len(), hash, "reviving dead string");
                oracle.revive(found.gc_header());
            }
            return Ok(found);
        }

        self.buckets.borrow_mut().reserve_slot()?;
        let object = StrHeader::try_new_in(bytes, hash, &self.allocator)?;
        // SAFETY: the object was just created.
        let created = unsafe { InternedStr::from_ptr(object) };
        oracle.on_allocate(created.gc_header());

        let mut buckets = self.buckets.borrow_mut();
        buckets.link(object);

        let bucket_count = buckets.bucket_count();
        if buckets.live_entries > bucket_count && bucket_count <= MAX_BUCKET_COUNT / 2 {
            let new_bucket_count = bucket_count * 2;
            debug!(
                live_entries = buckets.live_entries,
                bucket_count, new_bucket_count, "growing string table"
            );
            buckets.resize(new_bucket_count)?;
        }
        Ok(created)
    }

    /// Rebuilds the table with `new_bucket_count` buckets. Strings are not
    /// moved or copied.
    ///
    /// # Errors
    /// The table only grows: a bucket count below the current one is
    /// rejected with [HeapError::InvalidBucketCount], as is anything that is
    /// not a power of two or exceeds [MAX_BUCKET_COUNT].
    pub fn resize(&self, new_bucket_count: usize) -> Result<(), HeapError> {
        let mut buckets = self.buckets.borrow_mut();
        Self::check_bucket_count(new_bucket_count, buckets.bucket_count())?;
        buckets.resize(new_bucket_count)
    }

    /// Frees every string for which `is_garbage` returns true and returns
    /// how many were freed.
    pub fn sweep<F>(&mut self, mut is_garbage: F) -> usize
    where
        F: FnMut(InternedStr<'_>) -> bool,
    {
        let buckets = self.buckets.get_mut();
        let mut freed = 0;
        for bucket in 0..buckets.heads.len() {
            let mut prev: Option<SlotId> = None;
            let mut cursor = buckets.heads[bucket];
            while let Some(id) = cursor {
                let slot = &mut buckets.slots[id as usize];
                cursor = slot.next;
                let Some(object) = slot.object else {
                    continue;
                };
                // SAFETY: occupied slots point to live objects.
                if !is_garbage(unsafe { InternedStr::from_ptr(object) }) {
                    prev = Some(id);
                    continue;
                }

                match prev {
                    Some(prev) => buckets.slots[prev as usize].next = cursor,
                    None => buckets.heads[bucket] = cursor,
                }
                buckets.slots[id as usize] = Slot {
                    object: None,
                    next: buckets.free,
                };
                buckets.free = Some(id);
                buckets.live_entries -= 1;

                // SAFETY: unlinked above, and &mut self means no InternedStr
                // is borrowed from the table.
                unsafe { StrHeader::deallocate_in(object, &self.allocator) };
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(freed, live_entries = buckets.live_entries, "swept string table");
        }
        freed
    }

    /// Checks that every entry sits in the bucket its hash selects, and that
    /// the entry count matches the chains.
    pub fn verify(&self) -> bool {
        let buckets = self.buckets.borrow();
        let bucket_count = buckets.bucket_count();
        let mut reachable = 0;
        for (bucket, head) in buckets.heads.iter().enumerate() {
            for slot in buckets.chain(*head) {
                let Some(object) = slot.object else {
                    return false;
                };
                // SAFETY: occupied slots point to live objects.
                let hash = unsafe { object.as_ref() }.hash();
                if BucketArray::<A>::bucket_for(hash, bucket_count) != bucket {
                    return false;
                }
                reachable += 1;
            }
        }
        reachable == buckets.live_entries
    }

    /// Tears the table down. Every string should have been swept already.
    ///
    /// # Errors
    /// Returns [HeapError::LiveEntriesAtTeardown] if entries remain. Their
    /// memory is released anyway.
    pub fn release_all(self) -> Result<(), HeapError> {
        let live = self.live_entries();
        // Dropping frees whatever is left along with the buckets.
        drop(self);
        if live == 0 {
            Ok(())
        } else {
            error!(live, "string table released with live entries");
            Err(HeapError::LiveEntriesAtTeardown { live })
        }
    }
}

impl<A: Allocator + Clone> Drop for StringTable<A> {
    fn drop(&mut self) {
        let buckets = self.buckets.get_mut();
        for slot in buckets.slots.iter_mut() {
            if let Some(object) = slot.object.take() {
                // SAFETY: &mut self, nothing borrows the table any more.
                unsafe { StrHeader::deallocate_in(object, &self.allocator) };
            }
        }
    }
}

impl<A: Allocator + Clone> fmt::Debug for StringTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringTable")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Collector;
    use libgc_alloc::AccountingAllocator;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::vec::Vec;

    /// An oracle for tests which don't care about liveness.
    struct AlwaysAlive;

    impl LivenessOracle for AlwaysAlive {
        fn is_dead(&self, _: &crate::GcHeader) -> bool {
            false
        }
        fn revive(&self, _: &crate::GcHeader) {
            unreachable!("nothing is ever dead")
        }
    }

    #[test]
    fn test_basics() {
        let table = StringTable::try_new().unwrap();
        assert!(table.is_empty());
        assert_eq!(DEFAULT_BUCKET_COUNT, table.bucket_count());

        let a = table.intern(b"datadog", &AlwaysAlive).unwrap();
        let b = table.intern(b"datadog", &AlwaysAlive).unwrap();
        assert_eq!(a, b);
        assert_eq!(1, table.live_entries());

        let c = table.intern(b"Datadog", &AlwaysAlive).unwrap();
        assert_ne!(a, c);
        assert_eq!(2, table.live_entries());
        assert_eq!(Some(a), table.get(b"datadog"));
        assert_eq!(None, table.get(b"data"));
        assert!(table.verify());
    }

    #[test]
    fn test_invalid_bucket_counts() {
        for bad in [0, 3, 24, MAX_BUCKET_COUNT * 2] {
            let err = StringTable::try_with_bucket_count_in(bad, Global).unwrap_err();
            assert!(err.is_integrity_violation(), "{bad}: {err}");
        }
        let table = StringTable::try_with_bucket_count_in(1, Global).unwrap();
        assert_eq!(
            Err(HeapError::InvalidBucketCount {
                requested: 6,
                min: 1,
                max: MAX_BUCKET_COUNT
            }),
            table.resize(6)
        );
    }

    #[test]
    fn test_growth() {
        let table = StringTable::try_with_bucket_count_in(4, Global).unwrap();
        for i in 0..4 {
            table.intern(format!("s{i}").as_bytes(), &AlwaysAlive).unwrap();
        }
        // Equal to the bucket count is not crowded yet.
        assert_eq!(4, table.bucket_count());
        table.intern(b"s4", &AlwaysAlive).unwrap();
        assert_eq!(8, table.bucket_count());
        assert_eq!(1, table.stats().resizes);

        // Hits never resize.
        for _ in 0..100 {
            table.intern(b"s0", &AlwaysAlive).unwrap();
        }
        assert_eq!(1, table.stats().resizes);
        assert!(table.verify());
    }

    #[test]
    fn test_explicit_resize_keeps_entries() {
        let table = StringTable::try_with_bucket_count_in(64, Global).unwrap();
        let strings: Vec<String> = (0..50).map(|i| format!("entry {i}")).collect();
        let ptrs: Vec<_> = strings
            .iter()
            .map(|s| table.intern(s.as_bytes(), &AlwaysAlive).unwrap().as_ptr())
            .collect();

        table.resize(128).unwrap();
        assert!(table.verify());
        assert_eq!(128, table.bucket_count());
        // Resizing to the current size just rebuilds the chains.
        table.resize(128).unwrap();
        assert_eq!(2, table.stats().resizes);

        for (s, ptr) in strings.iter().zip(ptrs) {
            assert_eq!(ptr, table.get(s.as_bytes()).unwrap().as_ptr());
        }
        assert_eq!(50, table.live_entries());
    }

    #[test]
    fn test_resize_never_shrinks() {
        let table = StringTable::try_with_bucket_count_in(64, Global).unwrap();
        for i in 0..50 {
            table.intern(format!("entry {i}").as_bytes(), &AlwaysAlive).unwrap();
        }
        let before = table.stats();

        for smaller in [1, 2, 32] {
            let err = table.resize(smaller).unwrap_err();
            assert_eq!(
                HeapError::InvalidBucketCount {
                    requested: smaller,
                    min: 64,
                    max: MAX_BUCKET_COUNT
                },
                err
            );
            assert!(err.is_integrity_violation());
        }

        assert_eq!(before, table.stats());
        assert!(table.live_entries() <= 2 * table.bucket_count());
        assert!(table.verify());
    }

    #[test]
    fn test_colliding_hashes() {
        // Same length and same sampled bytes, different unsampled byte.
        let mut first = [b'x'; 64];
        let mut second = first;
        first[1] = b'a';
        second[1] = b'b';
        assert_eq!(hash_bytes(&first), hash_bytes(&second));

        let table = StringTable::try_new().unwrap();
        let a = table.intern(&first, &AlwaysAlive).unwrap();
        let b = table.intern(&second, &AlwaysAlive).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, table.intern(&first, &AlwaysAlive).unwrap());
        assert_eq!(b, table.intern(&second, &AlwaysAlive).unwrap());
    }

    #[test]
    fn test_revives_dead_strings() {
        let gc = Collector::new();
        let mut table = StringTable::try_new().unwrap();
        let ptr = table.intern(b"ghost", &gc).unwrap().as_ptr();
        gc.atomic();
        assert!(gc.is_dead(table.get(b"ghost").unwrap().gc_header()));

        let again = table.intern(b"ghost", &gc).unwrap();
        assert_eq!(ptr, again.as_ptr());
        assert!(!gc.is_dead(again.gc_header()));

        let freed = table.sweep(|s| gc.is_dead(s.gc_header()));
        assert_eq!(0, freed);
        assert_eq!(1, table.live_entries());
    }

    #[test]
    fn test_sweep_reuses_slots() {
        let alloc = AccountingAllocator::new_in(Global);
        let mut table = StringTable::try_with_bucket_count_in(8, alloc.clone()).unwrap();
        for i in 0..20 {
            table.intern(format!("{i}").as_bytes(), &AlwaysAlive).unwrap();
        }
        let even = |s: InternedStr<'_>| s.to_str().unwrap().parse::<u32>().unwrap() % 2 == 0;
        assert_eq!(10, table.sweep(even));
        assert_eq!(10, table.live_entries());
        assert!(table.verify());
        assert!(table.get(b"4").is_none());
        assert!(table.get(b"5").is_some());

        let bytes_before = alloc.used_bytes();
        for i in 0..10 {
            table.intern(format!("{}", i * 2).as_bytes(), &AlwaysAlive).unwrap();
        }
        assert!(alloc.used_bytes() > bytes_before);
        assert_eq!(20, table.live_entries());
        assert!(table.verify());

        assert_eq!(20, table.sweep(|_| true));
        table.release_all().unwrap();
        assert_eq!(0, alloc.used_bytes());
    }

    #[test]
    fn test_release_with_live_entries() {
        let alloc = AccountingAllocator::new_in(Global);
        let table = StringTable::try_with_bucket_count_in(4, alloc.clone()).unwrap();
        table.intern(b"leak", &AlwaysAlive).unwrap();
        assert_eq!(
            Err(HeapError::LiveEntriesAtTeardown { live: 1 }),
            table.release_all()
        );
        assert_eq!(0, alloc.used_bytes());
    }

    #[test]
    fn test_out_of_memory() {
        let alloc = AccountingAllocator::new_in(Global);
        let table = StringTable::try_with_bucket_count_in(4, alloc.clone()).unwrap();
        table.intern(b"fits", &AlwaysAlive).unwrap();

        alloc.set_limit(Some(alloc.used_bytes()));
        assert_eq!(
            Err(HeapError::OutOfMemory),
            table.intern(b"doesn't fit", &AlwaysAlive).map(|_| ())
        );
        assert_eq!(1, table.live_entries());

        // Hits don't allocate.
        assert!(table.intern(b"fits", &AlwaysAlive).is_ok());
        assert!(table.verify());
    }

    #[test]
    fn test_failed_resize_keeps_table_consistent() {
        let alloc = AccountingAllocator::new_in(Global);
        let table = StringTable::try_with_bucket_count_in(1, alloc.clone()).unwrap();
        let a = table.intern(b"a", &AlwaysAlive).unwrap().as_ptr();

        // Room for the object of "b" but not for two bucket heads.
        let object_size = StrHeader::layout_for(1).unwrap().size();
        alloc.set_limit(Some(alloc.used_bytes() + object_size + 1));
        assert_eq!(
            Err(HeapError::OutOfMemory),
            table.intern(b"b", &AlwaysAlive).map(|_| ())
        );

        assert_eq!(1, table.bucket_count());
        assert_eq!(2, table.live_entries());
        assert!(table.get(b"b").is_some());
        assert!(table.verify());

        alloc.set_limit(None);
        table.resize(2).unwrap();
        assert_eq!(a, table.get(b"a").unwrap().as_ptr());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            .. ProptestConfig::default()
        })]

        #[test]
        fn proptest_matches_std_hashmap(
            values in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..48),
                0..if cfg!(miri) { 32 } else { 512 },
            )
        ) {
            let table = StringTable::try_with_bucket_count_in(1, Global).unwrap();
            let mut shadow = HashMap::<Vec<u8>, *const u8>::new();

            for v in &values {
                let s = table.intern(v, &AlwaysAlive).unwrap();
                let ptr = *shadow.entry(v.clone()).or_insert(s.as_ptr());
                prop_assert_eq!(ptr, s.as_ptr());
                prop_assert_eq!(s.as_bytes(), &v[..]);
                prop_assert!(table.live_entries() <= 2 * table.bucket_count());
            }

            prop_assert_eq!(shadow.len(), table.live_entries());
            prop_assert!(table.verify());
        }
    }

    #[test]
    fn fuzz_string_table() {
        bolero::check!()
            .with_type::<Vec<Vec<u8>>>()
            .for_each(|strings| {
                let mut table = StringTable::try_with_bucket_count_in(2, Global).unwrap();
                let mut golden = std::collections::HashSet::new();
                for string in strings {
                    golden.insert(string.clone());
                    let s = table.intern(string, &AlwaysAlive).unwrap();
                    assert_eq!(&s[..], &string[..]);
                }
                assert_eq!(golden.len(), table.live_entries());
                assert!(table.verify());
                assert_eq!(golden.len(), table.sweep(|_| true));
                table.release_all().unwrap();
            })
    }
}
