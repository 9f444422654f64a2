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

//! Process-wide constants and timestamp helpers.

use chrono::prelude::*;
use once_cell::sync::Lazy;

/// Scheduler clock ticks per second, from `sysconf(_SC_CLK_TCK)`.
/// 100 on every mainstream Linux configuration.
pub static TICKS_PER_SECOND: Lazy<u64> = Lazy::new(|| {
    match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
        -1 => panic!("Failed to query clock tick rate"),
        x => x as u64,
    }
});

/// Size of a page in bytes, from `sysconf(_SC_PAGESIZE)`.
pub static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => panic!("Failed to query page size"),
        x => x as u64,
    }
});

/// Local and UTC wall-clock timestamps in ISO-8601 `%Y-%m-%dT%H:%M:%S`
/// format, as embedded in each sample's `timestamp` section.
pub fn sample_timestamps() -> (String, String) {
    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
    let now = Local::now();
    (
        now.format(FORMAT).to_string(),
        now.with_timezone(&Utc).format(FORMAT).to_string(),
    )
}

/// Seconds east of UTC for the local timezone, for the header section.
pub fn gmt_offset_seconds() -> i64 {
    Local::now().offset().fix().local_minus_utc() as i64
}

/// Nanoseconds since the Unix epoch, for line-protocol timestamps.
pub fn epoch_nanos() -> u64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_per_second_sane() {
        // USER_HZ has been 100 on Linux for decades; at minimum it's nonzero.
        assert!(*TICKS_PER_SECOND > 0);
    }

    #[test]
    fn test_timestamp_format() {
        let (local, utc) = sample_timestamps();
        assert_eq!(local.len(), 19);
        assert_eq!(utc.len(), 19);
        assert_eq!(&local[4..5], "-");
        assert_eq!(&utc[10..11], "T");
    }

    #[test]
    fn test_epoch_nanos_monotonic_enough() {
        let a = epoch_nanos();
        let b = epoch_nanos();
        assert!(b >= a);
    }
}
