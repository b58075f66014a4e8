//! Flow compiler: flow JSON → tokens → AST → generated program + line map.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod artifact;
pub mod ast;
pub mod codegen;
pub mod flow;
pub mod lexer;
pub mod line_map;
pub mod module;
pub mod params;
pub mod parser;
pub mod token;

pub use artifact::{CompiledProject, CompiledUnit, ProcessUnit, StepMeta};
pub use codegen::CodeLine;
pub use flow::{FlowStep, LineSlice, Project, UnitCategory};
pub use line_map::LineMap;
pub use parser::SyntaxIssue;

use flow::surviving_steps;
use params::{ParamCompiler, ParamError, value_code};
use token::LexerTables;

/// Errors raised while compiling a project.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Structural violations reported by the parser.
    #[error("syntax error: {}", join_issues(.0))]
    Syntax(Vec<SyntaxIssue>),

    /// A step without a key.
    #[error("step `{id}` at line {line} has no key")]
    MissingKey {
        /// Flow-line of the step.
        line: usize,
        /// Step identifier.
        id: String,
    },

    /// Literal coercion failed.
    #[error(transparent)]
    Param(#[from] ParamError),

    /// No process matched the requested entry.
    #[error("no entry process `{0}` in project")]
    NoEntryProcess(String),

    /// Malformed project data.
    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    /// A failure attributed to a specific unit.
    #[error("process `{unit}`: {source}")]
    Unit {
        /// Unit identifier.
        unit: String,
        /// Underlying error.
        #[source]
        source: Box<CompileError>,
    },

    /// Generated file does not match the manifest digest.
    #[error("generated file `{file}` does not match its recorded digest")]
    DigestMismatch {
        /// File name.
        file: String,
    },

    /// IO error while reading or writing artifacts.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialisation error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_issues(issues: &[SyntaxIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CompileError {
    /// Parser issues behind this error, looking through unit attribution.
    pub fn syntax_issues(&self) -> Option<&[SyntaxIssue]> {
        match self {
            CompileError::Syntax(issues) => Some(issues),
            CompileError::Unit { source, .. } => source.syntax_issues(),
            _ => None,
        }
    }
}

/// Convenience result alias for compilation.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Knobs for one compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Explicit entry unit id; otherwise chosen by `main_process_name`.
    pub entry_process: Option<String>,
    /// Name of the default entry process.
    pub main_process_name: String,
    /// Flow-line window applied to the entry process.
    pub slice: LineSlice,
    /// Debug builds skip the retry wrapper.
    pub debug_mode: bool,
    /// Spaces per indent level.
    pub indent_width: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            entry_process: None,
            main_process_name: "main".to_string(),
            slice: LineSlice::default(),
            debug_mode: false,
            indent_width: 4,
        }
    }
}

/// State accumulated while compiling one project.
#[derive(Debug, Clone, Default)]
pub struct CompilationContext {
    /// Options in effect.
    pub options: CompileOptions,
    /// Lexer reclassification tables.
    pub tables: LexerTables,
    /// Names of declared globals.
    pub globals: BTreeSet<String>,
    /// Argument names and titles seen per atomic key.
    pub atomic_info: BTreeMap<String, BTreeMap<String, String>>,
}

impl CompilationContext {
    /// Fresh context with the given options and default tables.
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }
}

/// Compile a project with default tables.
pub fn compile_project(project: &Project, options: CompileOptions) -> CompileResult<CompiledProject> {
    let mut ctx = CompilationContext::new(options);
    compile_with(project, &mut ctx)
}

fn select_entry(project: &Project, options: &CompileOptions) -> CompileResult<String> {
    if let Some(id) = &options.entry_process {
        return project
            .processes
            .iter()
            .find(|p| &p.id == id)
            .map(|p| p.id.clone())
            .ok_or_else(|| CompileError::NoEntryProcess(id.clone()));
    }
    let processes: Vec<_> = project
        .processes
        .iter()
        .filter(|p| p.category == UnitCategory::Process)
        .collect();
    processes
        .iter()
        .find(|p| p.name == options.main_process_name)
        .or(if processes.len() == 1 { processes.first() } else { None })
        .map(|p| p.id.clone())
        .ok_or_else(|| CompileError::NoEntryProcess(options.main_process_name.clone()))
}

/// Compile a project using an existing context.
pub fn compile_with(project: &Project, ctx: &mut CompilationContext) -> CompileResult<CompiledProject> {
    if project.processes.is_empty() {
        return Err(CompileError::InvalidFlow(format!(
            "project `{}` has no processes",
            project.id
        )));
    }
    ctx.globals = project.globals.iter().map(|g| g.var_name.clone()).collect();
    let entry = select_entry(project, &ctx.options)?;

    let mut units = BTreeMap::new();
    let mut process_index = 0;
    let mut module_index = 0;
    for process in &project.processes {
        let file_id = match process.category {
            UnitCategory::Process => {
                process_index += 1;
                if process.id == entry {
                    "main".to_string()
                } else {
                    format!("process{process_index}")
                }
            }
            UnitCategory::Module => {
                module_index += 1;
                if process.id == entry {
                    "main".to_string()
                } else {
                    format!("module{module_index}")
                }
            }
        };

        let compiled = compile_unit(process, file_id, process.id == entry, ctx).map_err(|source| {
            CompileError::Unit {
                unit: process.id.clone(),
                source: Box::new(source),
            }
        })?;
        if units.insert(process.id.clone(), compiled).is_some() {
            return Err(CompileError::InvalidFlow(format!(
                "duplicate process id `{}`",
                process.id
            )));
        }
    }

    let compiler = ParamCompiler::new(&ctx.globals);
    let globals = project
        .globals
        .iter()
        .map(|g| (g.var_name.clone(), value_code(&compiler.compile_default(g))))
        .collect();

    let mut requirements = Vec::new();
    let mut seen = BTreeSet::new();
    let component_reqs = project.components.iter().flat_map(|c| c.requirements.iter());
    for spec in project.requirements.iter().chain(component_reqs) {
        if seen.insert(spec.package_name.clone()) {
            requirements.push(spec.clone());
        }
    }

    tracing::info!(project = %project.id, units = units.len(), entry = %entry, "compiled project");
    Ok(CompiledProject {
        project_id: project.id.clone(),
        name: project.name.clone(),
        entry,
        units,
        globals,
        requirements,
        atomic_info: ctx.atomic_info.clone(),
    })
}

fn compile_unit(
    process: &flow::ProcessDef,
    file_id: String,
    is_entry: bool,
    ctx: &mut CompilationContext,
) -> CompileResult<CompiledUnit> {
    let mut unit = ProcessUnit {
        id: process.id.clone(),
        name: process.name.clone(),
        category: process.category,
        file_id,
        params: process.params.clone(),
        breakpoints: BTreeSet::new(),
        step_meta: Vec::new(),
    };

    if process.category == UnitCategory::Module {
        let compiler = ParamCompiler::new(&ctx.globals);
        let source =
            module::inject_params(&process.source, &process.params, &compiler, ctx.options.indent_width);
        return Ok(CompiledUnit::new(unit, source, None));
    }

    let slice = if is_entry { ctx.options.slice } else { LineSlice::default() };
    let steps = surviving_steps(&process.flow, slice)?;
    for step in &steps {
        if step.has_breakpoint {
            unit.breakpoints.insert(step.flow_line);
        }
        unit.step_meta.push(StepMeta {
            line: step.flow_line,
            step_id: step.id.clone(),
            label: step.label.clone(),
            key: step.key.clone(),
        });
    }

    let tokens = lexer::Lexer::new(steps, &ctx.tables).tokenize()?;
    let program = parser::parse(tokens)?;
    let lines = codegen::CodeGenerator::new(ctx, process.id.clone()).generate(&program, &process.params)?;
    let source = codegen::render(&lines, ctx.options.indent_width);
    let line_map = LineMap::from_code_lines(&lines);
    tracing::debug!(unit = %process.id, lines = lines.len(), mapped = line_map.len(), "generated unit");
    Ok(CompiledUnit::new(unit, source, Some(line_map)))
}
