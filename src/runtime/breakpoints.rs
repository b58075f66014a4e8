//! Breakpoint set of one execution, keyed by generated line.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::compiler::{CompiledProject, LineMap};

use super::error::{EngineError, EngineResult};

/// Breakpoints of every process unit. Modules have no line map and can
/// never hold a breakpoint.
#[derive(Debug)]
pub struct BreakpointTable {
    maps: HashMap<String, LineMap>,
    lines: Mutex<HashMap<String, BTreeSet<usize>>>,
}

impl BreakpointTable {
    /// Table for `project`, preloaded with design-time breakpoints.
    pub fn for_project(project: &CompiledProject) -> Self {
        let maps: HashMap<String, LineMap> = project
            .units
            .iter()
            .filter_map(|(id, unit)| unit.line_map.clone().map(|map| (id.clone(), map)))
            .collect();
        let table = Self {
            maps,
            lines: Mutex::new(HashMap::new()),
        };
        for (id, unit) in &project.units {
            for &line in &unit.unit.breakpoints {
                if let Err(err) = table.set(id, line) {
                    tracing::warn!(unit = %id, line, error = %err, "ignoring design-time breakpoint");
                }
            }
        }
        table
    }

    /// Line map of `unit`, if it has one.
    pub fn line_map(&self, unit: &str) -> Option<&LineMap> {
        self.maps.get(unit)
    }

    fn resolve(&self, unit: &str, flow_line: usize) -> EngineResult<usize> {
        let map = self
            .maps
            .get(unit)
            .ok_or_else(|| EngineError::UnknownUnit(unit.to_string()))?;
        map.first_generated(flow_line)
            .ok_or_else(|| EngineError::UnmappedLine {
                unit: unit.to_string(),
                line: flow_line,
            })
    }

    /// Break at `flow_line` of `unit`. Returns the generated line.
    pub fn set(&self, unit: &str, flow_line: usize) -> EngineResult<usize> {
        let generated = self.resolve(unit, flow_line)?;
        self.lines
            .lock()
            .entry(unit.to_string())
            .or_default()
            .insert(generated);
        Ok(generated)
    }

    /// Remove the breakpoint at `flow_line`. Returns whether one existed.
    pub fn clear(&self, unit: &str, flow_line: usize) -> EngineResult<bool> {
        let generated = self.resolve(unit, flow_line)?;
        Ok(self
            .lines
            .lock()
            .get_mut(unit)
            .is_some_and(|lines| lines.remove(&generated)))
    }

    /// Whether a breakpoint sits on generated `line` of `unit`.
    pub fn contains(&self, unit: &str, line: usize) -> bool {
        self.lines
            .lock()
            .get(unit)
            .is_some_and(|lines| lines.contains(&line))
    }

    /// Flow lines with a breakpoint in `unit`.
    pub fn flow_lines(&self, unit: &str) -> BTreeSet<usize> {
        let Some(map) = self.maps.get(unit) else {
            return BTreeSet::new();
        };
        self.lines
            .lock()
            .get(unit)
            .map(|lines| lines.iter().filter_map(|&g| map.flow_line(g)).collect())
            .unwrap_or_default()
    }
}
