// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::cell::Cell;
use std::fmt;

/// The color and flag bits stored in [GcHeader::marked].
pub mod bits {
    pub const WHITE0: u8 = 1 << 0;
    pub const WHITE1: u8 = 1 << 1;
    pub const BLACK: u8 = 1 << 2;
    /// Set once a foreign data object's finalizer has run.
    pub const FINALIZED: u8 = 1 << 3;

    pub const WHITE_BITS: u8 = WHITE0 | WHITE1;
    pub const COLOR_BITS: u8 = WHITE_BITS | BLACK;
}

/// Tags which kind of object follows a [GcHeader].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    String = 4,
    ForeignData = 7,
}

/// Collector bookkeeping at the start of every heap object. Only the
/// collector and the owning container write to it.
#[repr(C)]
pub struct GcHeader {
    marked: Cell<u8>,
    kind: ObjectKind,
}

impl GcHeader {
    pub(crate) const fn new(kind: ObjectKind) -> Self {
        Self {
            marked: Cell::new(0),
            kind,
        }
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[inline]
    pub fn marked(&self) -> u8 {
        self.marked.get()
    }

    #[inline]
    pub fn set_marked(&self, marked: u8) {
        self.marked.set(marked);
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.marked() & bits::FINALIZED != 0
    }

    #[inline]
    pub fn set_finalized(&self, finalized: bool) {
        let marked = self.marked() & !bits::FINALIZED;
        self.set_marked(if finalized {
            marked | bits::FINALIZED
        } else {
            marked
        });
    }
}

impl fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeader")
            .field("marked", &format_args!("{:#06b}", self.marked()))
            .field("kind", &self.kind)
            .finish()
    }
}

/// What the string table needs from a collector.
///
/// A collector may decide an object is dead and then leave it in place until
/// its sweep gets around to freeing it. If the table finds such an object on
/// a lookup, it must call [LivenessOracle::revive] before handing it out,
/// otherwise the sweep frees memory a caller still references.
pub trait LivenessOracle {
    /// Returns true if the object has been judged unreachable but not yet
    /// freed.
    fn is_dead(&self, header: &GcHeader) -> bool;

    /// Makes a dead object alive again.
    fn revive(&self, header: &GcHeader);

    /// Called once for each newly created object, before it is reachable.
    fn on_allocate(&self, _header: &GcHeader) {}
}

/// A mark-and-sweep collector using two whites, so that objects created
/// after marking has finished are never confused with garbage.
///
/// A cycle goes:
///  1. Reachable objects are painted with [Collector::mark].
///  2. [Collector::atomic] flips the current white. Every object still
///     carrying the previous white is now dead, but stays in memory.
///  3. The owner of the objects sweeps, freeing the dead and calling
///     [Collector::make_white] on the survivors.
///
/// Between 2 and 3 the string table may revive dead strings.
#[derive(Debug)]
pub struct Collector {
    current_white: Cell<u8>,
    cycles: Cell<u64>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub const fn new() -> Self {
        Self {
            current_white: Cell::new(bits::WHITE0),
            cycles: Cell::new(0),
        }
    }

    #[inline]
    pub fn current_white(&self) -> u8 {
        self.current_white.get()
    }

    #[inline]
    fn other_white(&self) -> u8 {
        self.current_white() ^ bits::WHITE_BITS
    }

    /// Number of times [Collector::atomic] ran.
    pub fn cycles(&self) -> u64 {
        self.cycles.get()
    }

    pub fn mark(&self, header: &GcHeader) {
        let marked = header.marked() & !bits::COLOR_BITS;
        header.set_marked(marked | bits::BLACK);
    }

    pub fn is_marked(&self, header: &GcHeader) -> bool {
        header.marked() & bits::BLACK != 0
    }

    /// Ends the mark phase. Unmarked objects become dead.
    pub fn atomic(&self) {
        self.current_white.set(self.other_white());
        self.cycles.set(self.cycles.get() + 1);
    }

    /// Resets a surviving object so it takes part in the next cycle.
    pub fn make_white(&self, header: &GcHeader) {
        let marked = header.marked() & !bits::COLOR_BITS;
        header.set_marked(marked | self.current_white());
    }
}

impl LivenessOracle for Collector {
    fn is_dead(&self, header: &GcHeader) -> bool {
        header.marked() & self.other_white() & bits::WHITE_BITS != 0
    }

    fn revive(&self, header: &GcHeader) {
        header.set_marked(header.marked() ^ bits::WHITE_BITS);
    }

    fn on_allocate(&self, header: &GcHeader) {
        self.make_white(header);
    }
}
