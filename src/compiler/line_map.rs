//! Bidirectional mapping between generated lines and flow-lines.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::codegen::CodeLine;

/// Malformed `gen:flow` text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid line map entry `{0}`")]
pub struct LineMapParseError(pub String);

/// Generated-line ↔ flow-line mapping of one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineMap {
    forward: BTreeMap<usize, usize>,
    reverse: BTreeMap<usize, Vec<usize>>,
}

impl LineMap {
    /// Build the map from emitted code lines (generated lines are 1-based).
    pub fn from_code_lines(lines: &[CodeLine]) -> Self {
        let mut map = Self::default();
        for (index, line) in lines.iter().enumerate() {
            if line.origin_line > 0 {
                map.insert(index + 1, line.origin_line);
            }
        }
        map
    }

    fn insert(&mut self, generated: usize, flow: usize) {
        self.forward.insert(generated, flow);
        let slots = self.reverse.entry(flow).or_default();
        if let Err(pos) = slots.binary_search(&generated) {
            slots.insert(pos, generated);
        }
    }

    /// Flow-line of a generated line, if mapped.
    pub fn flow_line(&self, generated: usize) -> Option<usize> {
        self.forward.get(&generated).copied()
    }

    /// Generated lines of a flow-line in ascending order.
    pub fn generated_lines(&self, flow: usize) -> &[usize] {
        self.reverse.get(&flow).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First generated line of a flow-line; breakpoints attach here.
    pub fn first_generated(&self, flow: usize) -> Option<usize> {
        self.generated_lines(flow).first().copied()
    }

    /// Whether the generated line carries a mapping.
    pub fn is_mapped(&self, generated: usize) -> bool {
        self.forward.contains_key(&generated)
    }

    /// Lowest mapped flow-line.
    pub fn first_flow_line(&self) -> Option<usize> {
        self.reverse.keys().next().copied()
    }

    /// Number of mapped generated lines.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Mapped `(generated, flow)` pairs in generated order.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.forward.iter().map(|(g, f)| (*g, *f))
    }
}

impl fmt::Display for LineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (generated, flow) in self.entries() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{generated}:{flow}")?;
        }
        Ok(())
    }
}

impl FromStr for LineMap {
    type Err = LineMapParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut map = Self::default();
        for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parsed = entry
                .split_once(':')
                .and_then(|(g, f)| Some((g.trim().parse().ok()?, f.trim().parse().ok()?)));
            match parsed {
                Some((generated, flow)) if generated > 0 && flow > 0 => map.insert(generated, flow),
                _ => return Err(LineMapParseError(entry.to_string())),
            }
        }
        Ok(map)
    }
}

impl Serialize for LineMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LineMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
