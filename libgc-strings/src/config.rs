// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::table::{DEFAULT_BUCKET_COUNT, MAX_BUCKET_COUNT};
use serde::{Deserialize, Serialize};

pub mod parse_env {
    use std::{env, str::FromStr};

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.trim().parse::<T>().ok()
    }
}

/// Settings for a [crate::Runtime].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of string table buckets to start with. Rounded up to a power
    /// of two by [RuntimeConfig::bucket_count].
    pub initial_bucket_count: usize,
    /// Upper bound on the bytes held by the runtime's heap, or no bound.
    pub memory_limit: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            initial_bucket_count: DEFAULT_BUCKET_COUNT,
            memory_limit: None,
        }
    }
}

impl RuntimeConfig {
    const LIBGC_STRING_TABLE_SIZE: &'static str = "LIBGC_STRING_TABLE_SIZE";
    const LIBGC_MEMORY_LIMIT: &'static str = "LIBGC_MEMORY_LIMIT";

    /// Reads the configuration from the environment, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            initial_bucket_count: parse_env::int(Self::LIBGC_STRING_TABLE_SIZE)
                .unwrap_or(default.initial_bucket_count),
            memory_limit: parse_env::int(Self::LIBGC_MEMORY_LIMIT).or(default.memory_limit),
        }
    }

    /// The initial bucket count, as a power of two between 1 and
    /// [MAX_BUCKET_COUNT].
    pub fn bucket_count(&self) -> usize {
        self.initial_bucket_count
            .clamp(1, MAX_BUCKET_COUNT)
            .next_power_of_two()
    }
}
