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

//! The in-memory tree one sample is accumulated into before it is flushed.
//!
//! The only hierarchy allowed is
//! `Sample -> Section -> Measurement` or
//! `Sample -> Section -> Subsection -> Measurement`:
//! a section holds either measurements or subsections, never both. Section
//! order is insertion order and is observable in the JSON output.

/// A single named value. `numeric` decides whether the stringified value is
/// emitted bare (JSON number, line-protocol number) or quoted.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Measurement {
    pub name: String,
    pub value: String,
    pub numeric: bool,
}

#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct Subsection {
    pub name: String,
    pub measurements: Vec<Measurement>,
}

#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct Section {
    pub name: String,
    pub measurements: Vec<Measurement>,
    pub subsections: Vec<Subsection>,
}

impl Section {
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.measurements
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value.as_str())
    }
}

impl Subsection {
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.measurements
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value.as_str())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Cursor {
    Closed,
    Section,
    Subsection,
}

/// Accumulator for the current sample. Samplers push sections, subsections
/// and measurements through the `p*` methods; the frontends render the
/// finished tree and [`clear`](Self::clear) it for the next tick.
#[derive(Debug)]
pub struct SampleTree {
    sections: Vec<Section>,
    cursor: Cursor,
}

impl Default for SampleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleTree {
    pub fn new() -> SampleTree {
        SampleTree {
            sections: Vec::with_capacity(16),
            cursor: Cursor::Closed,
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn section_start(&mut self, name: &str) {
        self.sections.push(Section {
            name: name.to_owned(),
            ..Default::default()
        });
        self.cursor = Cursor::Section;
    }

    pub fn section_end(&mut self) {
        self.cursor = Cursor::Closed;
    }

    pub fn subsection_start(&mut self, name: &str) {
        debug_assert!(!self.sections.is_empty(), "subsection outside any section");
        if let Some(section) = self.sections.last_mut() {
            debug_assert!(
                section.measurements.is_empty(),
                "section {} holds measurements and subsections",
                section.name
            );
            section.subsections.push(Subsection {
                name: name.to_owned(),
                ..Default::default()
            });
            self.cursor = Cursor::Subsection;
        }
    }

    pub fn subsection_end(&mut self) {
        self.cursor = Cursor::Section;
    }

    fn push(&mut self, measurement: Measurement) {
        let section = match self.sections.last_mut() {
            Some(s) => s,
            None => {
                debug_assert!(false, "measurement outside any section");
                return;
            }
        };
        match self.cursor {
            Cursor::Subsection => match section.subsections.last_mut() {
                Some(sub) => sub.measurements.push(measurement),
                None => debug_assert!(false, "no open subsection"),
            },
            Cursor::Section => {
                debug_assert!(
                    section.subsections.is_empty(),
                    "section {} holds measurements and subsections",
                    section.name
                );
                section.measurements.push(measurement);
            }
            Cursor::Closed => debug_assert!(false, "measurement outside any section"),
        }
    }

    pub fn pstring(&mut self, name: &str, value: &str) {
        self.push(Measurement {
            name: name.to_owned(),
            value: value.to_owned(),
            numeric: false,
        });
    }

    pub fn plong(&mut self, name: &str, value: i64) {
        self.push(Measurement {
            name: name.to_owned(),
            value: value.to_string(),
            numeric: true,
        });
    }

    pub fn pulong(&mut self, name: &str, value: u64) {
        self.push(Measurement {
            name: name.to_owned(),
            value: value.to_string(),
            numeric: true,
        });
    }

    /// Doubles are emitted with fixed three-decimal precision.
    pub fn pdouble(&mut self, name: &str, value: f64) {
        self.push(Measurement {
            name: name.to_owned(),
            value: format!("{value:.3}"),
            numeric: true,
        });
    }

    pub fn measurement_count(&self) -> usize {
        self.sections
            .iter()
            .map(|s| {
                if s.measurements.is_empty() {
                    s.subsections.iter().map(|ss| ss.measurements.len()).sum()
                } else {
                    s.measurements.len()
                }
            })
            .sum()
    }

    /// Drop the accumulated sections, keeping allocations for the next
    /// sample.
    pub fn clear(&mut self) {
        self.sections.clear();
        self.cursor = Cursor::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_shape_and_order() {
        let mut tree = SampleTree::new();
        tree.section_start("alpha");
        tree.plong("x", 1);
        tree.pstring("y", "two");
        tree.section_end();
        tree.section_start("beta");
        tree.subsection_start("b0");
        tree.pdouble("z", 1.5);
        tree.subsection_end();
        tree.subsection_start("b1");
        tree.pulong("w", u64::MAX);
        tree.subsection_end();
        tree.section_end();

        let sections = tree.sections();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "alpha");
        assert_eq!(sections[0].measurements.len(), 2);
        assert!(sections[0].subsections.is_empty());
        assert_eq!(sections[0].value_of("y"), Some("two"));
        assert_eq!(sections[1].subsections.len(), 2);
        assert!(sections[1].measurements.is_empty());
        assert_eq!(sections[1].subsections[0].value_of("z"), Some("1.500"));
        assert_eq!(
            sections[1].subsections[1].value_of("w"),
            Some("18446744073709551615")
        );
        assert_eq!(tree.measurement_count(), 4);

        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.measurement_count(), 0);
    }

    #[test]
    fn test_double_formatting() {
        let mut tree = SampleTree::new();
        tree.section_start("s");
        tree.pdouble("a", 0.0);
        tree.pdouble("b", 99.99999);
        tree.section_end();
        assert_eq!(tree.sections()[0].value_of("a"), Some("0.000"));
        assert_eq!(tree.sections()[0].value_of("b"), Some("100.000"));
    }
}
