//! Code generator: walks the AST and emits indented script lines.
//!
//! Every emitted line remembers the flow-line it came from. Boilerplate
//! lines (prologue, retry scaffolding, empty-block `pass`) use origin 0 and
//! never appear in the line map.

use serde::{Deserialize, Serialize};

use super::CompilationContext;
use super::ast::{Block, Clause, Conditional, ForKind, ForLoop, Loop, Program, Statement, TryBlock};
use super::flow::{Direction, FlowStep, OnError, VariableDef};
use super::params::{CallPolicy, ParamCompiler, ParamError, quote, value_code};

/// One emitted line of the generated program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLine {
    /// Nesting depth.
    pub indent: usize,
    /// Statement text without indentation.
    pub text: String,
    /// Flow-line this line was generated from, 0 for synthetic lines.
    pub origin_line: usize,
}

/// Join code lines into program text.
pub fn render(lines: &[CodeLine], indent_width: usize) -> String {
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&" ".repeat(line.indent * indent_width));
        out.push_str(&line.text);
    }
    out
}

/// Emits the code of one process unit.
pub struct CodeGenerator<'a> {
    ctx: &'a mut CompilationContext,
    unit_id: String,
    lines: Vec<CodeLine>,
}

type GenResult<T> = Result<T, ParamError>;

impl<'a> CodeGenerator<'a> {
    /// Create a generator for `unit_id`.
    pub fn new(ctx: &'a mut CompilationContext, unit_id: impl Into<String>) -> Self {
        Self {
            ctx,
            unit_id: unit_id.into(),
            lines: Vec::new(),
        }
    }

    /// Emit the entry function for `program` with its declared parameters.
    pub fn generate(mut self, program: &Program, params: &[VariableDef]) -> GenResult<Vec<CodeLine>> {
        self.emit(0, "def main(args):", 0);
        for param in params {
            let default = value_code(&self.compiler().compile_default(param));
            self.emit(
                1,
                format!(
                    "{} = args.get({}, {})",
                    param.var_name,
                    quote(&param.var_name),
                    default
                ),
                0,
            );
        }
        self.emit(1, "try:", 0);
        self.emit(2, "pass", 0);
        for stmt in &program.statements {
            self.statement(stmt, 2)?;
        }
        self.emit(1, "finally:", 0);
        self.emit(2, "pass", 0);
        for param in params.iter().filter(|p| p.var_direction == Direction::Output) {
            self.emit(
                2,
                format!("args[{}] = {}", quote(&param.var_name), param.var_name),
                0,
            );
        }
        Ok(self.lines)
    }

    fn compiler(&self) -> ParamCompiler<'_> {
        ParamCompiler::new(&self.ctx.globals)
    }

    fn emit(&mut self, indent: usize, text: impl Into<String>, origin_line: usize) {
        self.lines.push(CodeLine {
            indent,
            text: text.into(),
            origin_line,
        });
    }

    fn block(&mut self, block: &Block, indent: usize) -> GenResult<()> {
        if block.is_empty() {
            self.emit(indent, "pass", 0);
        }
        for stmt in &block.statements {
            self.statement(stmt, indent)?;
        }
        Ok(())
    }

    fn clause(&mut self, clause: &Clause, header: String, indent: usize) -> GenResult<()> {
        self.emit(indent, header, clause.step.flow_line);
        self.block(&clause.body, indent + 1)
    }

    fn closer(&mut self, end: &Option<FlowStep>, indent: usize) {
        if let Some(end) = end {
            self.emit(indent, "pass", end.flow_line);
        }
    }

    fn statement(&mut self, stmt: &Statement, indent: usize) -> GenResult<()> {
        match stmt {
            Statement::Atomic(step) => self.atomic(step, indent),
            Statement::AtomicAsCondition(cond) => self.conditional(cond, indent, true),
            Statement::AtomicAsIterator(lp) => self.iterator(lp, indent),
            Statement::If(cond) => self.conditional(cond, indent, false),
            Statement::While(lp) => {
                let test = self.condition_call(&lp.step)?;
                self.emit(indent, format!("while {test}:"), lp.step.flow_line);
                self.block(&lp.body, indent + 1)?;
                self.closer(&lp.end, indent);
                Ok(())
            }
            Statement::For(lp) => self.for_loop(lp, indent),
            Statement::Try(tb) => self.try_block(tb, indent),
            Statement::Break(step) => {
                self.emit(indent, "break", step.flow_line);
                Ok(())
            }
            Statement::Continue(step) => {
                self.emit(indent, "continue", step.flow_line);
                Ok(())
            }
            Statement::Return(step) => {
                self.emit(indent, "return", step.flow_line);
                Ok(())
            }
        }
    }

    fn policy(&self, step: &FlowStep) -> (CallPolicy, bool) {
        let wrapped = step.advanced.wants_retry() && !self.ctx.options.debug_mode;
        let on_error = match step.advanced.on_error {
            OnError::Retry => OnError::Exit,
            other => other,
        };
        let policy = CallPolicy {
            on_error,
            retry_count: step.advanced.retry_count,
            retry_interval: step.advanced.retry_interval,
            in_retry: wrapped,
        };
        (policy, wrapped)
    }

    fn info_arg(&self, step: &FlowStep) -> String {
        format!("__info__=[{}, {}]", step.flow_line, quote(&self.unit_id))
    }

    /// Build `Ns.op(args…)` for an atomic step.
    fn call_expr(&mut self, step: &FlowStep, policy: CallPolicy) -> GenResult<String> {
        let mut args = Vec::new();
        {
            let compiler = self.compiler();
            for input in step.visible_inputs() {
                let param = compiler.compile_input(&step.key, input)?;
                args.push(format!("{}={}", param.name, param.code()));
            }
        }
        let advanced = &step.advanced;
        if policy.on_error != OnError::Exit || advanced.on_error == OnError::Retry {
            args.push(format!("__on_error__={}", quote(policy.on_error.as_str())));
        }
        if advanced.delay_before > 0.0 {
            args.push(format!("__delay_before__={}", advanced.delay_before));
        }
        if advanced.delay_after > 0.0 {
            args.push(format!("__delay_after__={}", advanced.delay_after));
        }
        if advanced.print_result {
            args.push("__print_result__=True".to_string());
        }
        if policy.in_retry {
            args.push("__in_retry__=True".to_string());
        }
        args.push(self.info_arg(step));

        let names = self.ctx.atomic_info.entry(step.key.clone()).or_default();
        for input in step.visible_inputs().filter(|i| !i.name.starts_with("__")) {
            names.insert(input.name.clone(), input.title.clone());
        }
        Ok(format!("{}({})", step.key, args.join(", ")))
    }

    /// Build `consequence(...)` for `if`/`elseIf`/`while` steps.
    fn condition_call(&mut self, step: &FlowStep) -> GenResult<String> {
        let compiler = self.compiler();
        let mut args = Vec::new();
        for input in step.visible_inputs() {
            let param = compiler.compile_input(&step.key, input)?;
            args.push(format!("{}={}", param.name, param.code()));
        }
        args.push(self.info_arg(step));
        Ok(format!("consequence({})", args.join(", ")))
    }

    fn assign_prefix(&self, step: &FlowStep) -> String {
        if step.outputs.is_empty() {
            return String::new();
        }
        let compiler = self.compiler();
        let targets: Vec<String> = step
            .outputs
            .iter()
            .map(|o| compiler.output_target(&o.variable))
            .collect();
        format!("{} = ", targets.join(", "))
    }

    fn atomic(&mut self, step: &FlowStep, indent: usize) -> GenResult<()> {
        let (policy, wrapped) = self.policy(step);
        let call = self.call_expr(step, policy)?;
        let prefix = self.assign_prefix(step);
        if wrapped {
            self.retry_shape(step, indent, format!("{prefix}{call}"));
        } else {
            self.emit(indent, format!("{prefix}{call}"), step.flow_line);
        }
        Ok(())
    }

    /// Wrap `guarded` in the retry loop with report checkpoints.
    fn retry_shape(&mut self, step: &FlowStep, indent: usize, guarded: String) {
        let uid = step.flow_line;
        let counter = format!("__retry_count_{uid}__");
        let error = format!("__e_{uid}__");
        let record = |status: &str, extra: &str| {
            format!(
                "{{\"unit\": {}, \"line\": {}, \"key\": {}, \"status\": \"{}\"{}}}",
                quote(&self.unit_id),
                step.flow_line,
                quote(&step.key),
                status,
                extra
            )
        };
        let start = record("start", "");
        let failed = record("error", &format!(", \"error\": str({error})"));
        let retry = record(
            "retry",
            &format!(", \"remaining\": {counter}, \"error\": str({error})"),
        );

        self.emit(indent, format!("report.info({start})"), 0);
        self.emit(indent, format!("{counter} = {}", step.advanced.retry_count), 0);
        self.emit(indent, "while True:", 0);
        self.emit(indent + 1, "try:", 0);
        self.emit(indent + 2, guarded, step.flow_line);
        self.emit(indent + 2, "break", 0);
        self.emit(indent + 1, format!("except Exception as {error}:"), 0);
        self.emit(indent + 2, format!("{counter} -= 1"), 0);
        self.emit(indent + 2, format!("if {counter} < 0:"), 0);
        self.emit(indent + 3, format!("report.error({failed})"), 0);
        self.emit(indent + 3, "raise", 0);
        self.emit(indent + 2, format!("report.warn({retry})"), 0);
        if step.advanced.retry_interval > 0.0 {
            self.emit(indent + 2, format!("sleep({})", step.advanced.retry_interval), 0);
        }
    }

    fn conditional(&mut self, cond: &Conditional, indent: usize, atomic: bool) -> GenResult<()> {
        let step = &cond.step;
        if atomic {
            let (policy, wrapped) = self.policy(step);
            let call = self.call_expr(step, policy)?;
            if wrapped {
                let temp = format!("__exist_result_{}__", step.flow_line);
                self.retry_shape(step, indent, format!("{temp} = {call}"));
                self.emit(indent, format!("if {temp}:"), 0);
            } else {
                self.emit(indent, format!("if {call}:"), step.flow_line);
            }
        } else {
            let test = self.condition_call(step)?;
            self.emit(indent, format!("if {test}:"), step.flow_line);
        }
        self.block(&cond.consequence, indent + 1)?;

        for alt in &cond.alternatives {
            let test = self.condition_call(&alt.step)?;
            self.clause(alt, format!("elif {test}:"), indent)?;
        }
        if let Some(otherwise) = &cond.otherwise {
            self.clause(otherwise, "else:".to_string(), indent)?;
        }
        self.closer(&cond.end, indent);
        Ok(())
    }

    fn loop_targets(&self, step: &FlowStep) -> String {
        if step.outputs.is_empty() {
            return format!("__item_{}__", step.flow_line);
        }
        let compiler = self.compiler();
        step.outputs
            .iter()
            .map(|o| compiler.output_target(&o.variable))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn iterator(&mut self, lp: &Loop, indent: usize) -> GenResult<()> {
        let step = &lp.step;
        let (policy, wrapped) = self.policy(step);
        let call = self.call_expr(step, policy)?;
        let targets = self.loop_targets(step);
        if wrapped {
            let temp = format!("__for_iterable_{}__", step.flow_line);
            self.retry_shape(step, indent, format!("{temp} = {call}"));
            self.emit(indent, format!("for {targets} in {temp}:"), 0);
        } else {
            self.emit(indent, format!("for {targets} in {call}:"), step.flow_line);
        }
        self.block(&lp.body, indent + 1)?;
        self.closer(&lp.end, indent);
        Ok(())
    }

    /// Compiled code of the input called `name`, falling back to position.
    fn loop_arg(&self, step: &FlowStep, name: &str, position: usize, default: &str) -> GenResult<String> {
        let compiler = self.compiler();
        let input = step
            .input(name)
            .or_else(|| step.visible_inputs().nth(position));
        match input {
            Some(input) => Ok(compiler.compile_input(&step.key, input)?.code()),
            None => Ok(default.to_string()),
        }
    }

    fn for_loop(&mut self, lp: &ForLoop, indent: usize) -> GenResult<()> {
        let step = &lp.step;
        let compiler = self.compiler();
        let vars: Vec<String> = step
            .outputs
            .iter()
            .map(|o| compiler.output_target(&o.variable))
            .collect();
        let header = match lp.kind {
            ForKind::Step => {
                let start = self.loop_arg(step, "start", 0, "0")?;
                let end = self.loop_arg(step, "end", 1, "0")?;
                let stride = self.loop_arg(step, "step", 2, "1")?;
                let var = vars.first().cloned().unwrap_or_else(|| "i".to_string());
                format!(
                    "for {var} in range(int_param(\"start\", {start}), int_param(\"end\", {end}), int_param(\"step\", {stride})):"
                )
            }
            ForKind::List => {
                let items = self.loop_arg(step, "lists", 0, "[]")?;
                match vars.as_slice() {
                    [index, item, ..] => format!(
                        "for {index}, {item} in enumerate(list_param(\"lists\", {items})):"
                    ),
                    [item] => format!("for {item} in list_param(\"lists\", {items}):"),
                    [] => format!("for item in list_param(\"lists\", {items}):"),
                }
            }
            ForKind::Dict => {
                let entries = self.loop_arg(step, "dicts", 0, "{}")?;
                let (key, value) = match vars.as_slice() {
                    [key, value, ..] => (key.clone(), value.clone()),
                    _ => ("key".to_string(), "value".to_string()),
                };
                format!("for {key}, {value} in items(dict_param(\"dicts\", {entries})):")
            }
        };
        self.emit(indent, header, step.flow_line);
        self.block(&lp.body, indent + 1)?;
        self.closer(&lp.end, indent);
        Ok(())
    }

    fn try_block(&mut self, tb: &TryBlock, indent: usize) -> GenResult<()> {
        self.emit(indent, "try:", tb.step.flow_line);
        self.block(&tb.body, indent + 1)?;
        if let Some(catch) = &tb.catch {
            self.clause(catch, "except Exception as __error__:".to_string(), indent)?;
        }
        if let Some(finally) = &tb.finally {
            self.clause(finally, "finally:".to_string(), indent)?;
        }
        if tb.catch.is_none() && tb.finally.is_none() {
            self.emit(indent, "finally:", 0);
            self.emit(indent + 1, "pass", 0);
        }
        self.closer(&tb.end, indent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::flow::{Advanced, Fragment, StepInput, StepOutput};
    use crate::compiler::lexer::Lexer;
    use crate::compiler::parser::parse;
    use serde_json::json;

    fn step(key: &str, line: usize) -> FlowStep {
        FlowStep {
            key: key.to_string(),
            flow_line: line,
            ..FlowStep::default()
        }
    }

    fn generate(ctx: &mut CompilationContext, steps: Vec<FlowStep>) -> Vec<CodeLine> {
        let tokens = Lexer::new(steps, &ctx.tables).tokenize().expect("tokens");
        let program = parse(tokens).expect("parse");
        CodeGenerator::new(ctx, "p1").generate(&program, &[]).expect("codegen")
    }

    #[test]
    fn normal_call_is_a_single_mapped_line() {
        let mut ctx = CompilationContext::default();
        let mut open = step("Browser.open", 1);
        open.inputs.push(StepInput {
            name: "url".into(),
            title: "Url".into(),
            value: vec![Fragment::literal(json!("https://example.com"))],
            show: true,
            need_parse: None,
        });
        open.outputs.push(StepOutput {
            name: "page".into(),
            variable: "page".into(),
        });
        let lines = generate(&mut ctx, vec![open]);
        let mapped: Vec<&CodeLine> = lines.iter().filter(|l| l.origin_line > 0).collect();
        assert_eq!(mapped.len(), 1);
        assert_eq!(
            mapped[0].text,
            r#"page = Browser.open(url="https://example.com", __info__=[1, "p1"])"#
        );
        assert_eq!(mapped[0].indent, 2);
        assert!(ctx.atomic_info["Browser.open"].contains_key("url"));
    }

    #[test]
    fn retry_shape_keeps_only_the_call_mapped() {
        let mut ctx = CompilationContext::default();
        let mut flaky = step("Net.fetch", 1);
        flaky.advanced = Advanced {
            on_error: OnError::Retry,
            retry_count: 2,
            retry_interval: 0.5,
            ..Advanced::default()
        };
        let lines = generate(&mut ctx, vec![flaky]);
        let mapped: Vec<&CodeLine> = lines.iter().filter(|l| l.origin_line > 0).collect();
        assert_eq!(mapped.len(), 1);
        assert!(mapped[0].text.contains(r#"__on_error__="exit""#));
        assert!(mapped[0].text.contains("__in_retry__=True"));
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert!(texts.contains(&"__retry_count_1__ = 2"));
        assert!(texts.contains(&"sleep(0.5)"));
        assert!(texts.contains(&"raise"));
    }

    #[test]
    fn debug_mode_disables_the_retry_wrapper() {
        let mut ctx = CompilationContext::default();
        ctx.options.debug_mode = true;
        let mut flaky = step("Net.fetch", 1);
        flaky.advanced.on_error = OnError::Retry;
        flaky.advanced.retry_count = 3;
        let lines = generate(&mut ctx, vec![flaky]);
        assert!(!lines.iter().any(|l| l.text.starts_with("while True")));
    }

    #[test]
    fn closers_and_clauses_are_mapped() {
        let mut ctx = CompilationContext::default();
        let steps = vec![
            step("try", 1),
            step("A.a", 2),
            step("catch", 3),
            step("A.b", 4),
            step("tryEnd", 5),
        ];
        let lines = generate(&mut ctx, steps);
        let mapped: Vec<(usize, &str)> = lines
            .iter()
            .filter(|l| l.origin_line > 0)
            .map(|l| (l.origin_line, l.text.as_str()))
            .collect();
        assert_eq!(mapped[0], (1, "try:"));
        assert_eq!(mapped[2], (3, "except Exception as __error__:"));
        assert_eq!(mapped[4], (5, "pass"));
    }

    #[test]
    fn empty_blocks_get_synthetic_pass() {
        let mut ctx = CompilationContext::default();
        let lines = generate(&mut ctx, vec![step("forList", 1), step("forEnd", 2)]);
        let header = lines
            .iter()
            .position(|l| l.origin_line == 1)
            .expect("header");
        assert!(lines[header].text.starts_with("for item in list_param(\"lists\", [])"));
        assert_eq!(lines[header + 1].text, "pass");
        assert_eq!(lines[header + 1].origin_line, 0);
    }
}
