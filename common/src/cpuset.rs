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

//! CPU set representation and parsing.
//!
//! [`Cpuset`] models the kernel CPU list format (e.g. `0-3,7,10-11`) as found
//! in `cpuset.cpus` and friends. A malformed range anywhere in the input
//! rejects the whole string.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// A set of CPU IDs parsed from kernel CPU list format.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Cpuset {
    cpus: BTreeSet<u32>,
}

impl Cpuset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cpus(cpus: impl IntoIterator<Item = u32>) -> Self {
        Cpuset {
            cpus: cpus.into_iter().collect(),
        }
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.cpus.iter().copied()
    }
}

impl std::iter::FromIterator<u32> for Cpuset {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Cpuset {
            cpus: iter.into_iter().collect(),
        }
    }
}

fn parse_cpu(s: &str) -> std::result::Result<u32, String> {
    s.parse()
        .map_err(|_| format!("cpu id must be a non-negative int: {s}"))
}

fn parse_cpu_range(s: &str) -> std::result::Result<BTreeSet<u32>, String> {
    match s.split_once('-') {
        Some((first, last)) => {
            let first = parse_cpu(first)?;
            let last = parse_cpu(last)?;
            if first > last {
                return Err(format!("invalid cpu range: {s}"));
            }
            Ok((first..=last).collect())
        }
        None => Ok(BTreeSet::from([parse_cpu(s)?])),
    }
}

impl FromStr for Cpuset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let mut cpus = BTreeSet::new();
        if s.is_empty() {
            return Ok(Cpuset { cpus });
        }
        for range_str in s.split(',') {
            let mut parsed = parse_cpu_range(range_str)?;
            cpus.append(&mut parsed);
        }
        Ok(Cpuset { cpus })
    }
}

impl std::fmt::Display for Cpuset {
    /// Render back to kernel CPU list format, collapsing consecutive IDs
    /// into ranges.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn write_range(
            f: &mut std::fmt::Formatter<'_>,
            start: u32,
            end: u32,
        ) -> std::fmt::Result {
            if start == end {
                write!(f, "{start}")
            } else {
                write!(f, "{start}-{end}")
            }
        }

        let mut range_start = None;
        let mut range_end = 0;
        for cpu in self.cpus.iter().copied() {
            match range_start {
                None => {
                    range_start = Some(cpu);
                    range_end = cpu;
                }
                Some(start) => {
                    if cpu == range_end + 1 {
                        range_end = cpu;
                    } else {
                        write_range(f, start, range_end)?;
                        write!(f, ",")?;
                        range_start = Some(cpu);
                        range_end = cpu;
                    }
                }
            }
        }
        if let Some(start) = range_start {
            write_range(f, start, range_end)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpuset_from_str_empty() {
        assert_eq!(Cpuset::from_str("").unwrap(), Cpuset::new());
    }

    #[test]
    fn test_cpuset_from_str() {
        assert_eq!(Cpuset::from_str("5").unwrap(), Cpuset::from_cpus([5]));
        assert_eq!(
            Cpuset::from_str("0-3").unwrap(),
            Cpuset::from_cpus([0, 1, 2, 3])
        );
        assert_eq!(
            Cpuset::from_str("0-3,7,10-11").unwrap(),
            Cpuset::from_cpus([0, 1, 2, 3, 7, 10, 11])
        );
    }

    #[test]
    fn test_cpuset_from_str_invalid() {
        assert!(Cpuset::from_str("a").is_err());
        assert!(Cpuset::from_str("-1").is_err());
        assert!(Cpuset::from_str("-1-2").is_err());
        assert!(Cpuset::from_str("0--2").is_err());
        assert!(Cpuset::from_str("0-2-").is_err());
        // one bad range poisons the whole list
        assert!(Cpuset::from_str("0-3,x").is_err());
    }

    #[test]
    fn test_cpuset_display() {
        for s in ["0", "0-12", "0-1,3-4", "0,2-3,5-9999", "0-1,3,5-7,9,11-12"] {
            assert_eq!(Cpuset::from_str(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_cpuset_from_iter() {
        let cpuset: Cpuset = (0..=3).collect();
        assert_eq!(cpuset, Cpuset::from_cpus([0, 1, 2, 3]));
    }
}
