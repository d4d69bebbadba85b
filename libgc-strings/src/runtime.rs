// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::RuntimeConfig;
use crate::foreign::{CapabilityRef, ForeignData, ForeignDataList};
use crate::gc::{Collector, GcHeader, LivenessOracle};
use crate::object::InternedStr;
use crate::table::StringTable;
use crate::HeapError;
use libgc_alloc::{AccountingAllocator, Allocator, Global};
use std::cell::Cell;
use tracing::debug;

/// What a call to [Runtime::sweep] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub strings_freed: usize,
    pub foreign_data_freed: usize,
    pub strings_live: usize,
    pub foreign_data_live: usize,
}

/// The heap state of one scripting runtime: its string table, its foreign
/// data, the collector deciding what is alive, and the allocator they all
/// share. Independent runtimes share nothing.
pub struct Runtime<A: Allocator + Clone = Global> {
    config: RuntimeConfig,
    collector: Collector,
    default_capabilities: Cell<CapabilityRef>,
    allocator: AccountingAllocator<A>,
    strings: StringTable<AccountingAllocator<A>>,
    foreign_data: ForeignDataList<AccountingAllocator<A>>,
}

impl Runtime<Global> {
    pub fn new(config: RuntimeConfig) -> Result<Self, HeapError> {
        Self::with_allocator(config, Global)
    }
}

impl<A: Allocator + Clone> Runtime<A> {
    pub fn with_allocator(config: RuntimeConfig, allocator: A) -> Result<Self, HeapError> {
        let allocator = match config.memory_limit {
            Some(limit) => AccountingAllocator::with_limit_in(limit, allocator),
            None => AccountingAllocator::new_in(allocator),
        };
        let bucket_count = config.bucket_count();
        let strings = StringTable::try_with_bucket_count_in(bucket_count, allocator.clone())?;
        let foreign_data = ForeignDataList::new_in(allocator.clone());
        debug!(
            bucket_count,
            memory_limit = config.memory_limit,
            "created runtime heap"
        );
        Ok(Self {
            config,
            collector: Collector::new(),
            default_capabilities: Cell::new(CapabilityRef::DEFAULT),
            allocator,
            strings,
            foreign_data,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn strings(&self) -> &StringTable<AccountingAllocator<A>> {
        &self.strings
    }

    pub fn foreign_data(&self) -> &ForeignDataList<AccountingAllocator<A>> {
        &self.foreign_data
    }

    /// Bytes currently held by strings, buckets and foreign data.
    pub fn used_bytes(&self) -> usize {
        self.allocator.used_bytes()
    }

    /// Returns the canonical string holding `bytes`.
    pub fn intern(&self, bytes: &[u8]) -> Result<InternedStr<'_>, HeapError> {
        self.strings.intern(bytes, &self.collector)
    }

    pub fn intern_str(&self, str: &str) -> Result<InternedStr<'_>, HeapError> {
        self.intern(str.as_bytes())
    }

    /// Creates a foreign data object of `size` bytes using the current
    /// default capabilities.
    pub fn new_foreign_data(&self, size: usize) -> Result<ForeignData<'_>, HeapError> {
        self.foreign_data
            .allocate(size, self.default_capabilities.get(), &self.collector)
    }

    pub fn default_capabilities(&self) -> CapabilityRef {
        self.default_capabilities.get()
    }

    pub fn set_default_capabilities(&self, capabilities: CapabilityRef) {
        self.default_capabilities.set(capabilities);
    }

    pub fn mark_string(&self, str: InternedStr<'_>) {
        self.collector.mark(str.gc_header());
    }

    pub fn mark_foreign_data(&self, data: ForeignData<'_>) {
        self.collector.mark(data.gc_header());
    }

    /// Ends the mark phase. Anything not marked since the previous sweep is
    /// dead from now on, unless a lookup revives it before [Runtime::sweep].
    pub fn begin_sweep(&self) {
        self.collector.atomic();
    }

    /// Frees every dead object and readies the survivors for the next cycle.
    pub fn sweep(&mut self) -> SweepReport {
        let collector = &self.collector;
        let strings_freed = self
            .strings
            .sweep(|str| Self::sweep_one(collector, str.gc_header()));
        let foreign_data_freed = self
            .foreign_data
            .sweep(|data| Self::sweep_one(collector, data.gc_header()));
        let report = SweepReport {
            strings_freed,
            foreign_data_freed,
            strings_live: self.strings.live_entries(),
            foreign_data_live: self.foreign_data.len(),
        };
        debug!(?report, used_bytes = self.used_bytes(), "sweep finished");
        report
    }

    fn sweep_one(collector: &Collector, header: &GcHeader) -> bool {
        if collector.is_dead(header) {
            true
        } else {
            collector.make_white(header);
            false
        }
    }

    /// Frees every object, then releases the string table.
    pub fn close(mut self) -> Result<(), HeapError> {
        let strings_freed = self.strings.sweep(|_| true);
        let foreign_data_freed = self.foreign_data.sweep(|_| true);
        debug!(strings_freed, foreign_data_freed, "closing runtime heap");
        let Runtime { strings, .. } = self;
        strings.release_all()
    }
}
