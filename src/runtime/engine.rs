//! Debug/execution engine.
//!
//! Each execution runs its generated program on a dedicated thread. The
//! interpreter calls back into the execution host before every statement;
//! that callback is where breakpoints, stepping and force-stop take effect.
//! Debug commands reach the execution thread through a shared control
//! block guarded by a mutex and condition variable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};

use crate::compiler::flow::Direction;
use crate::compiler::{CompiledProject, Project, compile_project};
use crate::script::{
    AtomicCall, ErrorKind, Interpreter, Scope, Script, ScriptError, ScriptHost, ScriptResult, Value,
    parse_script,
};

use super::EngineConfig;
use super::atomic::{AtomicBackend, AtomicError, AtomicRequest};
use super::breakpoints::BreakpointTable;
use super::cancel::CancelToken;
use super::dependency::DependencyResolver;
use super::error::{EngineError, EngineResult};
use super::report::{EventKind, ReportLevel, ReportObserver, ReportSink};
use super::translate::translate;
use super::transport::TransportError;

/// Longest single sleep honoured by generated code.
const MAX_SLEEP_SECS: f64 = 86_400.0;

/// Unit name used while evaluating global initialisers.
const GLOBALS_UNIT: &str = "__globals__";

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Created, thread not yet running.
    Init,
    /// Executing statements.
    Running,
    /// Blocked on a breakpoint or step.
    Paused,
    /// Finished normally.
    Succeeded,
    /// Force-stopped.
    Cancelled,
    /// Finished with an unhandled failure.
    Failed,
}

impl ExecutionState {
    /// Whether the execution has ended.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Cancelled | ExecutionState::Failed
        )
    }
}

/// Why the execution paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    /// A breakpoint (or the implicit entry breakpoint).
    Breakpoint,
    /// Completion of a `next` step.
    Step,
}

/// One variable as seen at a pause.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableSnapshot {
    /// Value rendered as JSON.
    pub value: JsonValue,
    /// Type name.
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Where and why an execution is paused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseInfo {
    /// Unit id.
    pub unit: String,
    /// Flow line about to run.
    pub flow_line: usize,
    /// Generated line about to run.
    pub generated_line: usize,
    /// Breakpoint or step.
    pub reason: PauseReason,
    /// Globals merged with locals; internal names are omitted.
    pub variables: BTreeMap<String, VariableSnapshot>,
}

/// One frame of a failure trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureFrame {
    /// Unit id.
    pub unit: String,
    /// Generated line.
    pub line: usize,
    /// Flow line, when the generated line maps to one.
    pub flow_line: Option<usize>,
}

/// Description of an unhandled failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// Translated summary.
    pub reason: String,
    /// Unit of the innermost mapped frame.
    pub unit: Option<String>,
    /// Flow line of the innermost mapped frame.
    pub flow_line: Option<usize>,
    /// Frames from innermost to outermost.
    pub trace: Vec<FailureFrame>,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Output map of the entry process.
    Succeeded {
        /// Output values.
        outputs: BTreeMap<String, JsonValue>,
    },
    /// Force-stopped.
    Cancelled,
    /// Unhandled failure.
    Failed(Failure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Continue,
    Next,
}

struct ControlState {
    status: ExecutionState,
    command: Option<Command>,
    pause: Option<PauseInfo>,
    outcome: Option<Outcome>,
}

/// State shared between an execution thread and its handles.
struct Control {
    state: Mutex<ControlState>,
    changed: Condvar,
    stop: CancelToken,
    breakpoints: BreakpointTable,
}

impl Control {
    fn stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn set_status(&self, status: ExecutionState) {
        self.state.lock().status = status;
        self.changed.notify_all();
    }
}

/// Runs compiled projects.
pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn AtomicBackend>,
    resolver: Option<Arc<DependencyResolver>>,
    observers: Vec<Arc<dyn ReportObserver>>,
}

impl Engine {
    /// Engine sending atomic operations to `backend`.
    pub fn new(config: EngineConfig, backend: Arc<dyn AtomicBackend>) -> Self {
        Self {
            config,
            backend,
            resolver: None,
            observers: Vec::new(),
        }
    }

    /// Resolve package requirements before every run.
    pub fn with_resolver(mut self, resolver: Arc<DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Deliver report events of every execution to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn ReportObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile `project` with options derived from the configuration.
    pub fn compile(&self, project: &Project) -> EngineResult<CompiledProject> {
        Ok(compile_project(project, self.config.compile_options())?)
    }

    /// Compile and start `project`.
    pub fn run(&self, project: &Project, args: BTreeMap<String, Value>) -> EngineResult<ExecutionHandle> {
        let compiled = self.compile(project)?;
        self.start(compiled, args)
    }

    /// Start executing `project` on a new thread.
    pub fn start(
        &self,
        project: CompiledProject,
        args: BTreeMap<String, Value>,
    ) -> EngineResult<ExecutionHandle> {
        if project.entry_unit().is_none() {
            return Err(EngineError::UnknownUnit(project.entry.clone()));
        }
        let mut scripts = HashMap::new();
        for (id, unit) in &project.units {
            let script = parse_script(&unit.source).map_err(|source| EngineError::Load {
                unit: id.clone(),
                source,
            })?;
            scripts.insert(id.clone(), Arc::new(script));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let control = Arc::new(Control {
            state: Mutex::new(ControlState {
                status: ExecutionState::Init,
                command: None,
                pause: None,
                outcome: None,
            }),
            changed: Condvar::new(),
            stop: CancelToken::new(),
            breakpoints: BreakpointTable::for_project(&project),
        });
        let sink = ReportSink::new(
            execution_id.clone(),
            self.config.report_capacity,
            self.observers.clone(),
        );
        let ctx = RunContext {
            config: self.config.clone(),
            project,
            scripts,
            backend: Arc::clone(&self.backend),
            resolver: self.resolver.clone(),
            sink,
            control: Arc::clone(&control),
        };

        tracing::info!(execution = %execution_id, entry = %ctx.project.entry, "starting execution");
        let thread = std::thread::Builder::new()
            .name(format!("weft-exec-{}", &execution_id[..8]))
            .spawn(move || run_execution(ctx, args))?;

        Ok(ExecutionHandle {
            id: execution_id,
            control,
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// Control surface of one running execution. Callable from any thread.
///
/// Dropping the handle force-stops an execution that has not finished.
pub struct ExecutionHandle {
    id: String,
    control: Arc<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionHandle {
    /// Execution id, also stamped on every report event.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutionState {
        self.control.state.lock().status
    }

    /// Details of the current pause, if paused.
    pub fn pause_info(&self) -> Option<PauseInfo> {
        self.control.state.lock().pause.clone()
    }

    fn command(&self, command: Command) -> EngineResult<()> {
        let mut state = self.control.state.lock();
        match state.status {
            ExecutionState::Paused => {}
            status if status.is_terminal() => return Err(EngineError::Finished),
            _ => return Err(EngineError::NotPaused),
        }
        state.command = Some(command);
        state.status = ExecutionState::Running;
        state.pause = None;
        self.control.changed.notify_all();
        Ok(())
    }

    /// Continue until the next breakpoint.
    pub fn resume(&self) -> EngineResult<()> {
        self.command(Command::Continue)
    }

    /// Step over: pause at the next mapped line of the same or an outer unit.
    pub fn next(&self) -> EngineResult<()> {
        self.command(Command::Next)
    }

    /// Stop the execution as soon as possible. Idempotent. Also abandons
    /// an atomic operation that is waiting for its reply.
    pub fn force_stop(&self) {
        if self.control.stop.cancel() {
            tracing::info!(execution = %self.id, "force stop requested");
        }
        // Take the lock so a sleeper between its flag check and its wait
        // cannot miss the wakeup.
        let _state = self.control.state.lock();
        self.control.changed.notify_all();
    }

    /// Break at `flow_line` of `unit`. Returns the generated line.
    pub fn set_breakpoint(&self, unit: &str, flow_line: usize) -> EngineResult<usize> {
        self.control.breakpoints.set(unit, flow_line)
    }

    /// Remove a breakpoint. Returns whether one existed.
    pub fn clear_breakpoint(&self, unit: &str, flow_line: usize) -> EngineResult<bool> {
        self.control.breakpoints.clear(unit, flow_line)
    }

    /// Flow lines with a breakpoint in `unit`.
    pub fn breakpoints(&self, unit: &str) -> Vec<usize> {
        self.control.breakpoints.flow_lines(unit).into_iter().collect()
    }

    /// Wait until the execution pauses. Returns `None` if it ends or the
    /// timeout elapses first.
    pub fn wait_for_pause(&self, timeout: Duration) -> Option<PauseInfo> {
        let deadline = Instant::now() + timeout;
        let mut state = self.control.state.lock();
        loop {
            if state.status == ExecutionState::Paused {
                if let Some(pause) = &state.pause {
                    return Some(pause.clone());
                }
            }
            if state.outcome.is_some() {
                return None;
            }
            if self.control.changed.wait_until(&mut state, deadline).timed_out() {
                return state.pause.clone();
            }
        }
    }

    /// Wait up to `timeout` for the execution to end.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.control.state.lock();
        while state.outcome.is_none() {
            if self.control.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.outcome.clone()
    }

    /// Wait for the execution to end and return how it ended.
    pub fn wait(&self) -> Outcome {
        let outcome = {
            let mut state = self.control.state.lock();
            loop {
                if let Some(outcome) = &state.outcome {
                    break outcome.clone();
                }
                self.control.changed.wait(&mut state);
            }
        };
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!(execution = %self.id, "execution thread panicked");
            }
        }
        outcome
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            tracing::debug!(execution = %self.id, "handle dropped, stopping execution");
            self.force_stop();
        }
    }
}

struct RunContext {
    config: EngineConfig,
    project: CompiledProject,
    scripts: HashMap<String, Arc<Script>>,
    backend: Arc<dyn AtomicBackend>,
    resolver: Option<Arc<DependencyResolver>>,
    sink: ReportSink,
    control: Arc<Control>,
}

fn run_execution(ctx: RunContext, args: BTreeMap<String, Value>) {
    ctx.control.set_status(ExecutionState::Running);
    ctx.sink.emit(
        ReportLevel::Info,
        EventKind::TaskStart,
        json!({
            "project": ctx.project.project_id,
            "name": ctx.project.name,
            "entry": ctx.project.entry,
        }),
    );

    let outcome = execute(&ctx, args);
    let (status, level, kind, data) = match &outcome {
        Outcome::Succeeded { outputs } => (
            ExecutionState::Succeeded,
            ReportLevel::Info,
            EventKind::TaskEnd,
            json!({ "outputs": outputs }),
        ),
        Outcome::Cancelled => (
            ExecutionState::Cancelled,
            ReportLevel::Warn,
            EventKind::TaskCancelled,
            json!({}),
        ),
        Outcome::Failed(failure) => (
            ExecutionState::Failed,
            ReportLevel::Error,
            EventKind::TaskError,
            serde_json::to_value(failure).unwrap_or_default(),
        ),
    };
    tracing::info!(execution = %ctx.sink.execution_id(), ?status, "execution finished");
    ctx.sink.emit(level, kind, data);
    ctx.sink.close();

    let mut state = ctx.control.state.lock();
    state.status = status;
    state.pause = None;
    state.outcome = Some(outcome);
    ctx.control.changed.notify_all();
}

fn execute(ctx: &RunContext, args: BTreeMap<String, Value>) -> Outcome {
    if let Some(resolver) = &ctx.resolver {
        if let Err(err) = resolver.resolve_all(&ctx.project.requirements, Some(&ctx.sink)) {
            tracing::warn!(error = %err, "dependency resolution failed");
            return Outcome::Failed(Failure {
                reason: format!("Dependency error: {err}"),
                unit: None,
                flow_line: None,
                trace: Vec::new(),
            });
        }
    }

    let mut host = ExecutionHost::new(ctx);
    let entry = ctx.project.entry.clone();
    let result = host.load_globals().and_then(|()| {
        let script = ctx
            .scripts
            .get(&entry)
            .cloned()
            .ok_or_else(|| ScriptError::new(ErrorKind::Import { module: entry.clone() }))?;
        host.unit_stack.push(entry.clone());
        Interpreter::new(&mut host, entry.clone()).run_main(&script, args)
    });

    match result {
        Ok(outputs) => Outcome::Succeeded {
            outputs: entry_outputs(ctx, outputs),
        },
        Err(err) if err.is_halted() || ctx.control.stopped() => Outcome::Cancelled,
        Err(err) => Outcome::Failed(describe_failure(ctx, &err)),
    }
}

/// Declared output parameters of the entry process, or the whole argument
/// map when it declares none.
fn entry_outputs(ctx: &RunContext, outputs: BTreeMap<String, Value>) -> BTreeMap<String, JsonValue> {
    let declared: Vec<&str> = ctx
        .project
        .entry_unit()
        .map(|unit| {
            unit.unit
                .params
                .iter()
                .filter(|p| p.var_direction == Direction::Output)
                .map(|p| p.var_name.as_str())
                .collect()
        })
        .unwrap_or_default();
    outputs
        .into_iter()
        .filter(|(name, _)| declared.is_empty() || declared.contains(&name.as_str()))
        .map(|(name, value)| (name, value.to_json()))
        .collect()
}

fn describe_failure(ctx: &RunContext, err: &ScriptError) -> Failure {
    let trace: Vec<FailureFrame> = err
        .trace
        .iter()
        .map(|frame| FailureFrame {
            unit: frame.unit.clone(),
            line: frame.line,
            flow_line: ctx
                .control
                .breakpoints
                .line_map(&frame.unit)
                .and_then(|map| map.flow_line(frame.line)),
        })
        .collect();
    let located = trace.iter().find(|frame| frame.flow_line.is_some());
    Failure {
        reason: translate(err, ctx.config.locale),
        unit: located.map(|frame| frame.unit.clone()),
        flow_line: located.and_then(|frame| frame.flow_line),
        trace,
    }
}

/// [`ScriptHost`] of one execution thread.
struct ExecutionHost<'a> {
    ctx: &'a RunContext,
    globals: BTreeMap<String, Value>,
    unit_stack: Vec<String>,
    step_depth: Option<usize>,
    entry_pending: bool,
}

impl<'a> ExecutionHost<'a> {
    fn new(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            globals: BTreeMap::new(),
            unit_stack: Vec::new(),
            step_depth: None,
            entry_pending: ctx.config.debug_mode && ctx.config.break_on_entry,
        }
    }

    fn halt_if_stopped(&self) -> ScriptResult<()> {
        if self.ctx.control.stopped() {
            Err(ScriptError::halted())
        } else {
            Ok(())
        }
    }

    fn load_globals(&mut self) -> ScriptResult<()> {
        let ctx = self.ctx;
        for (name, code) in &ctx.project.globals {
            let source = format!("gv[{}] = {}\n", json!(name), code);
            let script = parse_script(&source)?;
            Interpreter::new(self, GLOBALS_UNIT).run_main(&script, BTreeMap::new())?;
        }
        Ok(())
    }

    fn emit(&self, level: ReportLevel, data: JsonValue) {
        self.ctx.sink.emit(level, EventKind::Code, data);
    }

    fn snapshot(&self, scope: &Scope<'_>) -> BTreeMap<String, VariableSnapshot> {
        self.globals
            .iter()
            .chain(scope.locals().iter())
            .filter(|(name, _)| !name.starts_with("__"))
            .map(|(name, value)| {
                (
                    name.clone(),
                    VariableSnapshot {
                        value: value.to_json(),
                        type_name: value.type_name().to_string(),
                    },
                )
            })
            .collect()
    }

    fn pause(&mut self, info: PauseInfo) -> ScriptResult<()> {
        let ctx = self.ctx;
        let control = &ctx.control;
        let (unit, flow_line) = (info.unit.clone(), info.flow_line);
        let payload = serde_json::to_value(&info).unwrap_or_default();
        {
            let mut state = control.state.lock();
            state.status = ExecutionState::Paused;
            state.pause = Some(info);
            state.command = None;
            control.changed.notify_all();
        }
        tracing::debug!(%unit, flow_line, "paused");
        self.ctx.sink.emit(ReportLevel::Info, EventKind::Paused, payload);

        let command = {
            let mut state = control.state.lock();
            loop {
                if control.stopped() {
                    state.pause = None;
                    state.status = ExecutionState::Running;
                    return Err(ScriptError::halted());
                }
                if let Some(command) = state.command.take() {
                    break command;
                }
                control.changed.wait(&mut state);
            }
        };
        self.step_depth = match command {
            Command::Continue => None,
            Command::Next => Some(self.unit_stack.len()),
        };
        let name = match command {
            Command::Continue => "continue",
            Command::Next => "next",
        };
        self.ctx.sink.emit(
            ReportLevel::Info,
            EventKind::Resumed,
            json!({ "unit": unit, "line": flow_line, "command": name }),
        );
        Ok(())
    }

    fn call_unit(&mut self, id: &str, call: &AtomicCall) -> ScriptResult<Value> {
        let ctx = self.ctx;
        let (Some(script), Some(compiled)) = (ctx.scripts.get(id), ctx.project.units.get(id)) else {
            return Err(ScriptError::new(ErrorKind::Import {
                module: id.to_string(),
            }));
        };
        let args: BTreeMap<String, Value> = call
            .kwargs
            .iter()
            .filter(|(name, value)| !name.starts_with("__") && !matches!(value, Value::Unit { .. }))
            .cloned()
            .collect();

        tracing::debug!(unit = id, caller = %call.unit, "entering unit");
        self.unit_stack.push(id.to_string());
        let result = Interpreter::new(self, id.to_string()).run_main(script, args);
        self.unit_stack.pop();
        let outputs = result?;

        let declared: Vec<Value> = compiled
            .unit
            .params
            .iter()
            .filter(|p| p.var_direction == Direction::Output)
            .map(|p| outputs.get(&p.var_name).cloned().unwrap_or(Value::None))
            .collect();
        Ok(match declared.len() {
            0 => Value::None,
            1 => declared.into_iter().next().unwrap_or(Value::None),
            _ => Value::List(declared),
        })
    }

    fn run_atomic(&mut self, call: AtomicCall) -> ScriptResult<Value> {
        let ctx = self.ctx;
        let on_error = call
            .kwarg("__on_error__")
            .map(Value::to_display)
            .unwrap_or_else(|| "exit".to_string());
        let in_retry = call.kwarg("__in_retry__").is_some_and(Value::truthy);
        let print_result = call.kwarg("__print_result__").is_some_and(Value::truthy);
        let delay_after = call.kwarg("__delay_after__").and_then(Value::as_f64);
        let info = call
            .kwarg("__info__")
            .map(Value::to_json)
            .unwrap_or_else(|| json!([0, call.unit]));
        let flow_line = info.get(0).cloned().unwrap_or(JsonValue::Null);

        if let Some(delay) = call.kwarg("__delay_before__").and_then(Value::as_f64) {
            self.sleep(delay)?;
        }
        self.halt_if_stopped()?;
        if !in_retry {
            self.emit(
                ReportLevel::Info,
                json!({ "status": "start", "key": call.key, "unit": call.unit, "line": flow_line }),
            );
        }

        let mut args = Map::new();
        for (name, value) in &call.kwargs {
            if !(name.starts_with("__") && name.ends_with("__")) {
                args.insert(name.clone(), value.to_json());
            }
        }
        if !call.positional.is_empty() {
            args.insert(
                "__positional__".to_string(),
                JsonValue::Array(call.positional.iter().map(Value::to_json).collect()),
            );
        }
        let request = AtomicRequest {
            key: call.key.clone(),
            args,
            info,
            timeout: ctx.config.call_timeout(),
            cancel: ctx.control.stop.clone(),
        };
        tracing::debug!(key = %request.key, "invoking atomic operation");
        let result = ctx.backend.invoke(&request);
        self.halt_if_stopped()?;

        match result {
            Ok(result) => {
                if print_result {
                    self.emit(
                        ReportLevel::Info,
                        json!({
                            "status": "result",
                            "key": call.key,
                            "unit": call.unit,
                            "line": flow_line,
                            "result": result,
                        }),
                    );
                }
                if let Some(delay) = delay_after {
                    self.sleep(delay)?;
                }
                Ok(Value::from_json(&result))
            }
            Err(err) => {
                let error = atomic_failure(err);
                if on_error == "skip" {
                    self.emit(
                        ReportLevel::Warn,
                        json!({
                            "status": "skip",
                            "key": call.key,
                            "unit": call.unit,
                            "line": flow_line,
                            "error": error.to_string(),
                        }),
                    );
                    return Ok(Value::None);
                }
                Err(error)
            }
        }
    }
}

fn atomic_failure(err: AtomicError) -> ScriptError {
    let kind = match err {
        AtomicError::Transport(TransportError::Cancelled) => return ScriptError::halted(),
        AtomicError::Transport(TransportError::Timeout(elapsed)) => ErrorKind::Timeout {
            seconds: elapsed.as_secs_f64(),
        },
        AtomicError::Unknown(key) => ErrorKind::Import { module: key },
        AtomicError::Failed(message) => ErrorKind::Atomic { message },
        AtomicError::Transport(other) => ErrorKind::Atomic {
            message: other.to_string(),
        },
    };
    ScriptError::new(kind)
}

fn unit_target(call: &AtomicCall) -> Option<String> {
    call.kwargs.iter().find_map(|(name, value)| match value {
        Value::Unit { id, .. } if name == "process" || name == "content" => Some(id.clone()),
        _ => None,
    })
}

impl ScriptHost for ExecutionHost<'_> {
    fn checkpoint(&mut self, line: usize, scope: &Scope<'_>) -> ScriptResult<()> {
        self.halt_if_stopped()?;
        if !self.ctx.config.debug_mode {
            return Ok(());
        }
        let unit = scope.unit();
        let Some(flow_line) = self
            .ctx
            .control
            .breakpoints
            .line_map(unit)
            .and_then(|map| map.flow_line(line))
        else {
            return Ok(());
        };

        let reason = if std::mem::take(&mut self.entry_pending) {
            Some(PauseReason::Breakpoint)
        } else if self.ctx.control.breakpoints.contains(unit, line) {
            Some(PauseReason::Breakpoint)
        } else if self.step_depth.is_some_and(|depth| self.unit_stack.len() <= depth) {
            Some(PauseReason::Step)
        } else {
            None
        };
        let Some(reason) = reason else {
            return Ok(());
        };

        let info = PauseInfo {
            unit: unit.to_string(),
            flow_line,
            generated_line: line,
            reason,
            variables: self.snapshot(scope),
        };
        self.pause(info)
    }

    fn call_atomic(&mut self, call: AtomicCall) -> ScriptResult<Value> {
        self.halt_if_stopped()?;
        match unit_target(&call) {
            Some(id) => self.call_unit(&id, &call),
            None => self.run_atomic(call),
        }
    }

    fn report(&mut self, level: ReportLevel, record: Value) -> ScriptResult<()> {
        self.emit(level, record.to_json());
        Ok(())
    }

    fn sleep(&mut self, secs: f64) -> ScriptResult<()> {
        if !secs.is_finite() || secs <= 0.0 {
            return self.halt_if_stopped();
        }
        let deadline = Instant::now() + Duration::from_secs_f64(secs.min(MAX_SLEEP_SECS));
        let ctx = self.ctx;
        let control = &ctx.control;
        let mut state = control.state.lock();
        loop {
            if control.stopped() {
                return Err(ScriptError::halted());
            }
            if control.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        drop(state);
        self.halt_if_stopped()
    }

    fn globals(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.globals
    }

    fn print(&mut self, text: String) -> ScriptResult<()> {
        tracing::info!(target: "weft::script", "{text}");
        self.emit(ReportLevel::Info, json!({ "status": "print", "text": text }));
        Ok(())
    }
}
