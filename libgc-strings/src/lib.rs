// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Storage for the immutable strings of an embedded scripting runtime.
//!
//! Every distinct byte sequence is held by at most one heap object, which is
//! shared by every user of that string. The objects are owned by a
//! [StringTable] and reclaimed through a tracing collector, which the table
//! talks to only through the [LivenessOracle] trait. Host data blocks which
//! must be visible to the collector but never deduplicated live in a
//! [ForeignDataList].
//!
//! A [Runtime] bundles the table, the foreign data list, a reference
//! [Collector] and an [AccountingAllocator](libgc_alloc::AccountingAllocator)
//! into one context object.

pub mod config;
mod error;
mod foreign;
mod gc;
mod hash;
mod object;
mod runtime;
mod table;

pub use config::RuntimeConfig;
pub use error::*;
pub use foreign::*;
pub use gc::*;
pub use hash::*;
pub use object::*;
pub use runtime::*;
pub use table::*;
