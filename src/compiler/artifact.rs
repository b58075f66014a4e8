//! Compiled project artifacts and their on-disk layout.
//!
//! ```text
//! <dir>/package.json    manifest: units, globals, requirements, digests
//! <dir>/main.flow       entry unit
//! <dir>/main.map        its line map (`gen:flow,...`)
//! <dir>/process2.flow   other process units
//! <dir>/module1.flow    sub-modules (no map)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::flow::{UnitCategory, VariableDef};
use super::line_map::LineMap;
use super::{CompileError, CompileResult};
use crate::runtime::dependency::DependencySpec;

const MANIFEST: &str = "package.json";

/// One row of per-step metadata: `[line, id, label, key]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMeta {
    /// Flow-line of the step.
    pub line: usize,
    /// Step identifier.
    pub step_id: String,
    /// Alias or title.
    pub label: String,
    /// Operation key.
    pub key: String,
}

/// A compiled sub-flow or sub-module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessUnit {
    /// Unit identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Process or module.
    pub category: UnitCategory,
    /// Generated file stem (`main`, `process2`, `module1`).
    pub file_id: String,
    /// Declared parameters.
    pub params: Vec<VariableDef>,
    /// Design-time breakpoints in flow-lines.
    pub breakpoints: BTreeSet<usize>,
    /// Metadata of every compiled step.
    pub step_meta: Vec<StepMeta>,
}

/// Generated program of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledUnit {
    /// Unit description.
    #[serde(flatten)]
    pub unit: ProcessUnit,
    /// Generated program text.
    #[serde(skip)]
    pub source: String,
    /// Line map, present for process units only.
    #[serde(skip)]
    pub line_map: Option<LineMap>,
    /// blake3 digest of `source`.
    pub digest: String,
}

impl CompiledUnit {
    /// Bundle a unit with its program text.
    pub fn new(unit: ProcessUnit, source: String, line_map: Option<LineMap>) -> Self {
        let digest = digest(&source);
        Self {
            unit,
            source,
            line_map,
            digest,
        }
    }
}

/// Hex blake3 digest of generated text.
pub fn digest(source: &str) -> String {
    blake3::hash(source.as_bytes()).to_hex().to_string()
}

/// Everything the engine needs to run a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledProject {
    /// Project identifier.
    pub project_id: String,
    /// Display name.
    pub name: String,
    /// Unit id of the entry process.
    pub entry: String,
    /// Units by id.
    pub units: BTreeMap<String, CompiledUnit>,
    /// Global variables with their initial value expressions.
    pub globals: BTreeMap<String, String>,
    /// Flow-level and component package requirements.
    pub requirements: Vec<DependencySpec>,
    /// Argument names and titles seen per atomic key.
    pub atomic_info: BTreeMap<String, BTreeMap<String, String>>,
}

impl CompiledProject {
    /// Entry unit.
    pub fn entry_unit(&self) -> Option<&CompiledUnit> {
        self.units.get(&self.entry)
    }

    /// Write the manifest and every generated file into `dir`.
    pub fn write_to(&self, dir: &Path) -> CompileResult<()> {
        fs::create_dir_all(dir)?;
        for unit in self.units.values() {
            let stem = &unit.unit.file_id;
            fs::write(dir.join(format!("{stem}.flow")), &unit.source)?;
            if let Some(map) = &unit.line_map {
                fs::write(dir.join(format!("{stem}.map")), map.to_string())?;
            }
        }
        let manifest = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(MANIFEST), manifest)?;
        tracing::debug!(dir = %dir.display(), units = self.units.len(), "wrote compiled project");
        Ok(())
    }

    /// Load a project written by [`CompiledProject::write_to`], verifying digests.
    pub fn load_from(dir: &Path) -> CompileResult<Self> {
        let manifest = fs::read_to_string(dir.join(MANIFEST))?;
        let mut project: CompiledProject = serde_json::from_str(&manifest)?;
        for unit in project.units.values_mut() {
            let stem = unit.unit.file_id.clone();
            let source = fs::read_to_string(dir.join(format!("{stem}.flow")))?;
            if digest(&source) != unit.digest {
                return Err(CompileError::DigestMismatch { file: format!("{stem}.flow") });
            }
            unit.source = source;
            if unit.unit.category == UnitCategory::Process {
                let text = fs::read_to_string(dir.join(format!("{stem}.map")))?;
                let map = text.parse().map_err(|e| CompileError::InvalidFlow(format!("{stem}.map: {e}")))?;
                unit.line_map = Some(map);
            }
        }
        Ok(project)
    }
}
