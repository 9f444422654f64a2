// Copyright (c) The cgscope authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The per-family samplers. Each one owns its previous-snapshot state and
//! turns monotonic kernel counters into per-interval rates; the engine
//! calls them once per tick. A sampler failing affects only its own
//! section, never the tick.

pub mod cgroup_cpu;
pub mod cgroup_memory;
pub mod cgroup_net;
pub mod processes;
pub mod system;

use crate::config::DetailLevel;

/// What a sampler should emit this tick: nothing (bootstrap pass that only
/// primes the previous-snapshot state) or a detail level.
pub type EmitMode = Option<DetailLevel>;

/// Percentage deltas are meaningless over intervals this short.
pub const MIN_ELAPSED_SECS: f64 = 0.1;

/// Non-negative per-second rate from two monotonic counter readings.
/// Counter wraps and pid reuse clamp to zero instead of going negative.
pub fn rate(current: u64, previous: u64, elapsed: f64) -> f64 {
    current.saturating_sub(previous) as f64 / elapsed
}
