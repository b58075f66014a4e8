use std::collections::BTreeMap;
use std::rc::Rc;

use super::ast::{BinOp, CmpOp, Expr, Function, Script, Stmt, StmtKind, Target};
use super::builtins::{self, Args};
use super::value::Value;
use super::{ErrorKind, ScriptError, ScriptResult, TypeIssue};
use crate::runtime::report::ReportLevel;

const MAX_CALL_DEPTH: usize = 200;

/// Variables visible at a checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    unit: &'a str,
    locals: &'a BTreeMap<String, Value>,
    depth: usize,
}

impl<'a> Scope<'a> {
    /// Unit whose program is running.
    pub fn unit(&self) -> &'a str {
        self.unit
    }

    /// Local variables of the innermost function frame.
    pub fn locals(&self) -> &'a BTreeMap<String, Value> {
        self.locals
    }

    /// Function call depth inside the unit, 0 at module level.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// A call into a namespaced operation such as `Browser.open(...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicCall {
    /// Dotted operation key.
    pub key: String,
    /// Keyword arguments in call order.
    pub kwargs: Vec<(String, Value)>,
    /// Positional arguments.
    pub positional: Vec<Value>,
    /// Unit the call was made from.
    pub unit: String,
    /// Generated line of the calling statement.
    pub line: usize,
}

impl AtomicCall {
    /// Keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

/// Services a running program needs from its environment.
pub trait ScriptHost {
    /// Invoked before every statement and clause header. Returning an error
    /// aborts the program; [`ErrorKind::Halted`] is the force-stop path.
    fn checkpoint(&mut self, line: usize, scope: &Scope<'_>) -> ScriptResult<()>;

    /// Perform a namespaced operation.
    fn call_atomic(&mut self, call: AtomicCall) -> ScriptResult<Value>;

    /// Emit a structured report record.
    fn report(&mut self, level: ReportLevel, record: Value) -> ScriptResult<()>;

    /// Block for `secs` seconds, waking early on force-stop.
    fn sleep(&mut self, secs: f64) -> ScriptResult<()>;

    /// Project-wide global variables (`gv[...]`).
    fn globals(&mut self) -> &mut BTreeMap<String, Value>;

    /// Program output from `print(...)`.
    fn print(&mut self, text: String) -> ScriptResult<()> {
        tracing::info!(target: "weft::script", "{text}");
        Ok(())
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Tree-walking interpreter bound to one unit and one host.
pub struct Interpreter<'h, H: ScriptHost> {
    host: &'h mut H,
    unit: String,
    functions: BTreeMap<String, Rc<Function>>,
    frames: Vec<BTreeMap<String, Value>>,
    active_errors: Vec<ScriptError>,
    line: usize,
}

impl<'h, H: ScriptHost> Interpreter<'h, H> {
    /// Interpreter for `unit` running against `host`.
    pub fn new(host: &'h mut H, unit: impl Into<String>) -> Self {
        Self {
            host,
            unit: unit.into(),
            functions: BTreeMap::new(),
            frames: vec![BTreeMap::new()],
            active_errors: Vec::new(),
            line: 0,
        }
    }

    /// Run top-level statements, then `main(args)`. Returns the final
    /// contents of `args`, which carries output parameters back.
    pub fn run_main(
        &mut self,
        script: &Script,
        args: BTreeMap<String, Value>,
    ) -> ScriptResult<BTreeMap<String, Value>> {
        if let Flow::Return(_) = self.exec_block(&script.body)? {
            return Ok(args);
        }
        // Scripts without an entry function only run their top level.
        let Some(main) = self.functions.get("main").cloned() else {
            return Ok(args);
        };
        let (_, frame) = self.invoke(&main, vec![Value::Map(args)], Vec::new())?;
        match frame.get("args") {
            Some(Value::Map(map)) => Ok(map.clone()),
            _ => Ok(BTreeMap::new()),
        }
    }

    fn checkpoint(&mut self, line: usize) -> ScriptResult<()> {
        self.line = line;
        let depth = self.frames.len() - 1;
        let Some(locals) = self.frames.last() else {
            return Ok(());
        };
        let scope = Scope {
            unit: &self.unit,
            locals,
            depth,
        };
        self.host.checkpoint(line, &scope)
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        let frame = self.frames.last()?;
        frame.get(name).or_else(|| {
            if self.frames.len() > 1 {
                self.frames.first().and_then(|module| module.get(name))
            } else {
                None
            }
        })
    }

    fn is_bound(&self, name: &str) -> bool {
        self.lookup(name).is_some() || self.functions.contains_key(name)
    }

    fn set_local(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    fn exec_block(&mut self, body: &[Stmt]) -> ScriptResult<Flow> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> ScriptResult<Flow> {
        self.checkpoint(stmt.line)?;
        self.exec_kind(stmt)
            .map_err(|err| err.locate(&self.unit, stmt.line))
    }

    fn exec_kind(&mut self, stmt: &Stmt) -> ScriptResult<Flow> {
        match &stmt.kind {
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign(targets, expr) => {
                let value = self.eval(expr)?;
                self.assign_all(targets, value)?;
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign(target, op, expr) => {
                let current = match target {
                    Target::Name(name) => self.eval(&Expr::Name(name.clone()))?,
                    Target::Index(object, index) => {
                        self.eval(&Expr::Index(Box::new(object.clone()), Box::new(index.clone())))?
                    }
                };
                let rhs = self.eval(expr)?;
                let value = binary(*op, current, rhs)?;
                self.assign(target, value)?;
                Ok(Flow::Normal)
            }
            StmtKind::If(arms, otherwise) => {
                for (i, arm) in arms.iter().enumerate() {
                    if i > 0 {
                        self.checkpoint(arm.line)?;
                    }
                    if self.eval(&arm.test)?.truthy() {
                        return self.exec_block(&arm.body);
                    }
                }
                match otherwise {
                    Some(suite) => {
                        self.checkpoint(suite.line)?;
                        self.exec_block(&suite.body)
                    }
                    None => Ok(Flow::Normal),
                }
            }
            StmtKind::While(test, body) => {
                let mut first = true;
                loop {
                    if !first {
                        self.checkpoint(stmt.line)?;
                    }
                    first = false;
                    if !self.eval(test)?.truthy() {
                        return Ok(Flow::Normal);
                    }
                    match self.exec_block(body)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For(targets, iterable, body) => {
                let items = builtins::iterate(&self.eval(iterable)?)?;
                for (i, item) in items.into_iter().enumerate() {
                    if i > 0 {
                        self.checkpoint(stmt.line)?;
                    }
                    self.assign_all(targets, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Try {
                body,
                handler,
                finally,
            } => {
                let mut result = self.exec_block(body);
                let caught = match (&result, handler) {
                    (Err(err), Some(handler)) if err.is_catchable() => Some((err.clone(), handler)),
                    _ => None,
                };
                if let Some((err, handler)) = caught {
                    self.checkpoint(handler.line)?;
                    if let Some(name) = &handler.name {
                        self.set_local(name, Value::Str(err.kind.to_string()));
                    }
                    self.active_errors.push(err);
                    result = self.exec_block(&handler.body);
                    self.active_errors.pop();
                }
                if let Some(suite) = finally {
                    if !matches!(&result, Err(err) if err.is_halted()) {
                        self.checkpoint(suite.line)?;
                        match self.exec_block(&suite.body)? {
                            Flow::Normal => {}
                            flow => return Ok(flow),
                        }
                    }
                }
                result
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Raise(expr) => match expr {
                Some(expr) => {
                    let value = self.eval(expr)?;
                    Err(ScriptError::new(ErrorKind::Runtime {
                        message: value.to_display(),
                    }))
                }
                None => Err(self
                    .active_errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| ScriptError::runtime("no active exception to re-raise"))),
            },
            StmtKind::Def(function) => {
                self.functions
                    .insert(function.name.clone(), Rc::new(function.clone()));
                Ok(Flow::Normal)
            }
            StmtKind::Import(module) => Err(ScriptError::new(ErrorKind::Import {
                module: module.clone(),
            })),
        }
    }

    fn assign_all(&mut self, targets: &[Target], value: Value) -> ScriptResult<()> {
        match targets {
            [single] => self.assign(single, value),
            many => {
                let items = match value {
                    Value::List(items) => items,
                    other => {
                        return Err(ScriptError::type_error(TypeIssue::NotIterable(
                            other.type_name().to_string(),
                        )));
                    }
                };
                if items.len() != many.len() {
                    return Err(ScriptError::new(ErrorKind::Value {
                        message: format!(
                            "expected {} values to unpack, got {}",
                            many.len(),
                            items.len()
                        ),
                    }));
                }
                for (target, item) in many.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> ScriptResult<()> {
        match target {
            Target::Name(name) => {
                self.set_local(name, value);
                Ok(())
            }
            Target::Index(object, index) => {
                let key = self.eval(index)?;
                if matches!(object, Expr::Name(name) if name == "gv") && self.lookup("gv").is_none() {
                    self.host.globals().insert(key.to_display(), value);
                    return Ok(());
                }
                let container = self.place(object)?;
                set_item(container, key, value)
            }
        }
    }

    /// Evaluate the subscripts of a `name[a][b]` chain.
    fn place_path<'e>(&mut self, expr: &'e Expr) -> ScriptResult<Option<(&'e str, Vec<Value>)>> {
        match expr {
            Expr::Name(name) => Ok(Some((name.as_str(), Vec::new()))),
            Expr::Index(base, index) => {
                let Some((root, mut keys)) = self.place_path(base)? else {
                    return Ok(None);
                };
                keys.push(self.eval(index)?);
                Ok(Some((root, keys)))
            }
            _ => Ok(None),
        }
    }

    /// Mutable reference to the value named by `expr`.
    fn place(&mut self, expr: &Expr) -> ScriptResult<&mut Value> {
        let Some((root, keys)) = self.place_path(expr)? else {
            return Err(ScriptError::runtime("cannot assign into a temporary value"));
        };
        let mut keys = keys.into_iter();
        let mut current: &mut Value = if root == "gv" && self.lookup("gv").is_none() {
            let Some(first) = keys.next() else {
                return Err(ScriptError::runtime("cannot rebind gv"));
            };
            let name = first.to_display();
            self.host
                .globals()
                .get_mut(&name)
                .ok_or(ScriptError::new(ErrorKind::Key { key: name }))?
        } else {
            let in_frame = self
                .frames
                .last()
                .is_some_and(|frame| frame.contains_key(root));
            let frame = if in_frame || self.frames.len() == 1 {
                self.frames.last_mut()
            } else {
                self.frames.first_mut()
            };
            frame
                .and_then(|frame| frame.get_mut(root))
                .ok_or_else(|| {
                    ScriptError::new(ErrorKind::Name {
                        name: root.to_string(),
                    })
                })?
        };
        for key in keys {
            current = item_mut(current, &key)?;
        }
        Ok(current)
    }

    fn eval(&mut self, expr: &Expr) -> ScriptResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => match self.lookup(name) {
                Some(value) => Ok(value.clone()),
                None if name == "gv" => Ok(Value::Map(self.host.globals().clone())),
                None => Err(ScriptError::new(ErrorKind::Name { name: name.clone() })),
            },
            Expr::Attr(base, attr) => {
                let value = self.eval(base)?;
                Err(ScriptError::new(ErrorKind::Attribute {
                    type_name: value.type_name().to_string(),
                    attr: attr.clone(),
                }))
            }
            Expr::Index(base, index) => {
                if matches!(&**base, Expr::Name(name) if name == "gv") && self.lookup("gv").is_none() {
                    let key = self.eval(index)?.to_display();
                    return self
                        .host
                        .globals()
                        .get(&key)
                        .cloned()
                        .ok_or(ScriptError::new(ErrorKind::Key { key }));
                }
                let container = self.eval(base)?;
                let key = self.eval(index)?;
                get_item(&container, &key)
            }
            Expr::Call { func, args, kwargs } => self.call(func, args, kwargs),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<ScriptResult<Vec<_>>>()
                .map(Value::List),
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = self.eval(key)?.to_display();
                    let value = self.eval(value)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.truthy())),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(overflow),
                Value::Float(n) => Ok(Value::Float(-n)),
                Value::Bool(flag) => Ok(Value::Int(-i64::from(flag))),
                other => Err(ScriptError::type_error(TypeIssue::UnsupportedOperand {
                    op: "unary -".to_string(),
                    left: other.type_name().to_string(),
                    right: String::new(),
                })),
            },
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, left, right)
            }
            Expr::Compare(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                compare(*op, &left, &right).map(Value::Bool)
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() { self.eval(right) } else { Ok(left) }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() { Ok(left) } else { self.eval(right) }
            }
        }
    }

    fn eval_args(&mut self, args: &[Expr], kwargs: &[(String, Expr)]) -> ScriptResult<Args> {
        let positional = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<ScriptResult<Vec<_>>>()?;
        let keywords = kwargs
            .iter()
            .map(|(name, arg)| Ok((name.clone(), self.eval(arg)?)))
            .collect::<ScriptResult<Vec<_>>>()?;
        Ok(Args {
            positional,
            keywords,
        })
    }

    fn call(&mut self, func: &Expr, args: &[Expr], kwargs: &[(String, Expr)]) -> ScriptResult<Value> {
        match func {
            Expr::Name(name) => self.call_name(name, args, kwargs),
            Expr::Attr(base, method) => {
                if let Some(path) = func.dotted_path() {
                    let root = path[0];
                    if !self.is_bound(root) && root != "gv" {
                        if root == "report" && path.len() == 2 {
                            let level = ReportLevel::from_method(method).ok_or_else(|| {
                                ScriptError::new(ErrorKind::Attribute {
                                    type_name: "report".to_string(),
                                    attr: method.clone(),
                                })
                            })?;
                            let evaluated = self.eval_args(args, kwargs)?;
                            let record = evaluated.positional.into_iter().next().unwrap_or(Value::None);
                            self.host.report(level, record)?;
                            return Ok(Value::None);
                        }
                        let key = path.join(".");
                        let evaluated = self.eval_args(args, kwargs)?;
                        let call = AtomicCall {
                            key,
                            kwargs: evaluated.keywords,
                            positional: evaluated.positional,
                            unit: self.unit.clone(),
                            line: self.line,
                        };
                        let result = self.host.call_atomic(call).map_err(ScriptError::unwind);
                        return result;
                    }
                }
                let evaluated = self.eval_args(args, kwargs)?;
                let is_place = self.place_path_is_bound(base);
                if is_place {
                    let receiver = self.place(base)?;
                    call_method(receiver, method, evaluated)
                } else {
                    let mut receiver = self.eval(base)?;
                    call_method(&mut receiver, method, evaluated)
                }
            }
            other => {
                let value = self.eval(other)?;
                Err(ScriptError::type_error(TypeIssue::NotCallable(
                    value.type_name().to_string(),
                )))
            }
        }
    }

    fn place_path_is_bound(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Name(name) => self.lookup(name).is_some(),
            Expr::Index(base, _) => match &**base {
                Expr::Name(name) if name == "gv" => true,
                _ => self.place_path_is_bound(base),
            },
            _ => false,
        }
    }

    fn call_name(&mut self, name: &str, args: &[Expr], kwargs: &[(String, Expr)]) -> ScriptResult<Value> {
        if let Some(value) = self.lookup(name) {
            return Err(ScriptError::type_error(TypeIssue::NotCallable(
                value.type_name().to_string(),
            )));
        }
        if let Some(function) = self.functions.get(name).cloned() {
            let evaluated = self.eval_args(args, kwargs)?;
            let (value, _) = self.invoke(&function, evaluated.positional, evaluated.keywords)?;
            return Ok(value);
        }
        match name {
            "sleep" => {
                let evaluated = self.eval_args(args, kwargs)?;
                let secs = evaluated
                    .positional
                    .first()
                    .or_else(|| evaluated.keywords.first().map(|(_, v)| v))
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        ScriptError::type_error(TypeIssue::BadArguments {
                            func: "sleep".to_string(),
                            message: "expected a number of seconds".to_string(),
                        })
                    })?;
                self.host.sleep(secs)?;
                Ok(Value::None)
            }
            "print" => {
                let evaluated = self.eval_args(args, kwargs)?;
                let text = evaluated
                    .positional
                    .iter()
                    .map(Value::to_display)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.host.print(text)?;
                Ok(Value::None)
            }
            _ if builtins::is_builtin(name) => {
                let evaluated = self.eval_args(args, kwargs)?;
                builtins::call(name, evaluated)
            }
            _ => Err(ScriptError::new(ErrorKind::Name {
                name: name.to_string(),
            })),
        }
    }

    /// Call a user function; returns its value and final local frame.
    fn invoke(
        &mut self,
        function: &Function,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> ScriptResult<(Value, BTreeMap<String, Value>)> {
        if self.frames.len() > MAX_CALL_DEPTH {
            return Err(ScriptError::runtime("maximum recursion depth exceeded"));
        }
        let bad = |message: String| {
            ScriptError::type_error(TypeIssue::BadArguments {
                func: function.name.clone(),
                message,
            })
        };
        if positional.len() > function.params.len() {
            return Err(bad(format!(
                "takes {} positional arguments but {} were given",
                function.params.len(),
                positional.len()
            )));
        }
        let mut frame: BTreeMap<String, Value> = function.params.iter().cloned().zip(positional).collect();
        for (name, value) in keywords {
            if !function.params.contains(&name) {
                return Err(bad(format!("got an unexpected keyword argument '{name}'")));
            }
            frame.insert(name, value);
        }
        if let Some(missing) = function.params.iter().find(|p| !frame.contains_key(*p)) {
            return Err(bad(format!("missing required argument '{missing}'")));
        }

        self.frames.push(frame);
        let result = self.exec_block(&function.body);
        let frame = self.frames.pop().unwrap_or_default();
        match result {
            Ok(Flow::Return(value)) => Ok((value, frame)),
            Ok(_) => Ok((Value::None, frame)),
            Err(err) => Err(err.unwind()),
        }
    }
}

fn overflow() -> ScriptError {
    ScriptError::new(ErrorKind::Value {
        message: "integer overflow".to_string(),
    })
}

fn unsupported(op: &str, left: &Value, right: &Value) -> ScriptError {
    ScriptError::type_error(TypeIssue::UnsupportedOperand {
        op: op.to_string(),
        left: left.type_name().to_string(),
        right: right.type_name().to_string(),
    })
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Bool(flag) => Some(i64::from(*flag)),
        _ => None,
    }
}

fn repeat(items: &[Value], times: i64) -> Vec<Value> {
    let mut out = Vec::new();
    for _ in 0..times.max(0) {
        out.extend_from_slice(items);
    }
    out
}

fn binary(op: BinOp, left: Value, right: Value) -> ScriptResult<Value> {
    let symbol = op.symbol();
    if let (Some(a), Some(b)) = (as_int(&left), as_int(&right)) {
        return match op {
            BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Div if b == 0 => Err(ScriptError::new(ErrorKind::ZeroDivision)),
            BinOp::Div => Ok(Value::Float(a as f64 / b as f64)),
            BinOp::Mod if b == 0 => Err(ScriptError::new(ErrorKind::ZeroDivision)),
            BinOp::Mod => Ok(Value::Int(((a % b) + b) % b)),
        };
    }
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return match op {
            BinOp::Add => Ok(Value::Float(a + b)),
            BinOp::Sub => Ok(Value::Float(a - b)),
            BinOp::Mul => Ok(Value::Float(a * b)),
            BinOp::Div | BinOp::Mod if b == 0.0 => Err(ScriptError::new(ErrorKind::ZeroDivision)),
            BinOp::Div => Ok(Value::Float(a / b)),
            BinOp::Mod => Ok(Value::Float(a - b * (a / b).floor())),
        };
    }
    match (op, &left, &right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(text), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(text)) => {
            Ok(Value::Str(text.repeat((*n).max(0) as usize)))
        }
        (BinOp::Mul, Value::List(items), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::List(items)) => {
            Ok(Value::List(repeat(items, *n)))
        }
        _ => Err(unsupported(symbol, &left, &right)),
    }
}

fn contains(container: &Value, item: &Value) -> ScriptResult<bool> {
    match (container, item) {
        (Value::List(items), _) => Ok(items.iter().any(|v| v.loose_eq(item))),
        (Value::Map(map), Value::Str(key)) => Ok(map.contains_key(key)),
        (Value::Map(_), _) => Ok(false),
        (Value::Str(text), Value::Str(needle)) => Ok(text.contains(needle.as_str())),
        _ => Err(unsupported("in", item, container)),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> ScriptResult<bool> {
    match op {
        CmpOp::Eq => Ok(left.loose_eq(right)),
        CmpOp::Ne => Ok(!left.loose_eq(right)),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ord = left
                .partial_order(right)
                .ok_or_else(|| unsupported(op.symbol(), left, right))?;
            Ok(match op {
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            })
        }
    }
}

fn list_index(len: usize, key: &Value, type_name: &str) -> ScriptResult<usize> {
    let Some(index) = as_int(key) else {
        return Err(ScriptError::type_error(TypeIssue::BadArguments {
            func: format!("{type_name}.__getitem__"),
            message: format!("indices must be integers, not {}", key.type_name()),
        }));
    };
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(ScriptError::new(ErrorKind::Index {
            type_name: type_name.to_string(),
        }));
    }
    Ok(resolved as usize)
}

fn get_item(container: &Value, key: &Value) -> ScriptResult<Value> {
    match container {
        Value::Map(map) => {
            let key = key.to_display();
            map.get(&key)
                .cloned()
                .ok_or(ScriptError::new(ErrorKind::Key { key }))
        }
        Value::List(items) => Ok(items[list_index(items.len(), key, "list")?].clone()),
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let index = list_index(chars.len(), key, "string")?;
            Ok(Value::Str(chars[index].to_string()))
        }
        other => Err(ScriptError::type_error(TypeIssue::NotSubscriptable(
            other.type_name().to_string(),
        ))),
    }
}

fn item_mut<'v>(container: &'v mut Value, key: &Value) -> ScriptResult<&'v mut Value> {
    match container {
        Value::Map(map) => {
            let key = key.to_display();
            match map.get_mut(&key) {
                Some(value) => Ok(value),
                None => Err(ScriptError::new(ErrorKind::Key { key })),
            }
        }
        Value::List(items) => {
            let index = list_index(items.len(), key, "list")?;
            Ok(&mut items[index])
        }
        other => Err(ScriptError::type_error(TypeIssue::NotSubscriptable(
            other.type_name().to_string(),
        ))),
    }
}

fn set_item(container: &mut Value, key: Value, value: Value) -> ScriptResult<()> {
    match container {
        Value::Map(map) => {
            map.insert(key.to_display(), value);
            Ok(())
        }
        Value::List(items) => {
            let index = list_index(items.len(), &key, "list")?;
            items[index] = value;
            Ok(())
        }
        other => Err(ScriptError::type_error(TypeIssue::NotSubscriptable(
            other.type_name().to_string(),
        ))),
    }
}

fn arg(args: &Args, position: usize) -> Option<&Value> {
    args.positional.get(position)
}

fn no_method(type_name: &str, method: &str) -> ScriptError {
    ScriptError::new(ErrorKind::Attribute {
        type_name: type_name.to_string(),
        attr: method.to_string(),
    })
}

fn call_method(receiver: &mut Value, method: &str, args: Args) -> ScriptResult<Value> {
    let type_name = receiver.type_name();
    let missing = |what: &str| {
        ScriptError::type_error(TypeIssue::BadArguments {
            func: method.to_string(),
            message: format!("missing required argument '{what}'"),
        })
    };
    match receiver {
        Value::Map(map) => match method {
            "get" => {
                let key = arg(&args, 0).ok_or_else(|| missing("key"))?.to_display();
                Ok(map
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| arg(&args, 1).cloned().unwrap_or(Value::None)))
            }
            "keys" => Ok(Value::List(map.keys().cloned().map(Value::Str).collect())),
            "values" => Ok(Value::List(map.values().cloned().collect())),
            "items" => Ok(Value::List(
                map.iter()
                    .map(|(k, v)| Value::List(vec![Value::str(k.clone()), v.clone()]))
                    .collect(),
            )),
            "copy" => Ok(Value::Map(map.clone())),
            "update" => {
                if let Some(Value::Map(other)) = arg(&args, 0) {
                    map.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                map.extend(args.keywords.iter().cloned());
                Ok(Value::None)
            }
            "pop" => {
                let key = arg(&args, 0).ok_or_else(|| missing("key"))?.to_display();
                match map.remove(&key) {
                    Some(value) => Ok(value),
                    None => arg(&args, 1)
                        .cloned()
                        .ok_or(ScriptError::new(ErrorKind::Key { key })),
                }
            }
            "setdefault" => {
                let key = arg(&args, 0).ok_or_else(|| missing("key"))?.to_display();
                let default = arg(&args, 1).cloned().unwrap_or(Value::None);
                Ok(map.entry(key).or_insert(default).clone())
            }
            _ => Err(no_method(type_name, method)),
        },
        Value::List(items) => match method {
            "append" => {
                items.push(arg(&args, 0).cloned().ok_or_else(|| missing("object"))?);
                Ok(Value::None)
            }
            "extend" => {
                let more = builtins::iterate(arg(&args, 0).ok_or_else(|| missing("iterable"))?)?;
                items.extend(more);
                Ok(Value::None)
            }
            "insert" => {
                let index = arg(&args, 0).and_then(as_int).ok_or_else(|| missing("index"))?;
                let value = arg(&args, 1).cloned().ok_or_else(|| missing("object"))?;
                let len = items.len() as i64;
                let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
                items.insert(at as usize, value);
                Ok(Value::None)
            }
            "pop" => {
                if items.is_empty() {
                    return Err(ScriptError::new(ErrorKind::Index {
                        type_name: "pop from empty list".to_string(),
                    }));
                }
                let index = match arg(&args, 0) {
                    Some(key) => list_index(items.len(), key, "pop")?,
                    None => items.len() - 1,
                };
                Ok(items.remove(index))
            }
            "index" => {
                let needle = arg(&args, 0).ok_or_else(|| missing("value"))?;
                items
                    .iter()
                    .position(|v| v.loose_eq(needle))
                    .map(|i| Value::Int(i as i64))
                    .ok_or_else(|| {
                        ScriptError::new(ErrorKind::Value {
                            message: format!("{} is not in list", needle.repr()),
                        })
                    })
            }
            "count" => {
                let needle = arg(&args, 0).ok_or_else(|| missing("value"))?;
                Ok(Value::Int(items.iter().filter(|v| v.loose_eq(needle)).count() as i64))
            }
            "copy" => Ok(Value::List(items.clone())),
            _ => Err(no_method(type_name, method)),
        },
        Value::Str(text) => {
            string_method(text, method, &args).unwrap_or_else(|| Err(no_method(type_name, method)))
        }
        _ => Err(no_method(type_name, method)),
    }
}

fn string_method(text: &str, method: &str, args: &Args) -> Option<ScriptResult<Value>> {
    let text_arg = |i: usize| arg(args, i).map(Value::to_display);
    let value = match method {
        "upper" => Value::str(text.to_uppercase()),
        "lower" => Value::str(text.to_lowercase()),
        "strip" => Value::str(text.trim()),
        "lstrip" => Value::str(text.trim_start()),
        "rstrip" => Value::str(text.trim_end()),
        "startswith" => Value::Bool(text.starts_with(text_arg(0).unwrap_or_default().as_str())),
        "endswith" => Value::Bool(text.ends_with(text_arg(0).unwrap_or_default().as_str())),
        "find" => Value::Int(
            text.find(text_arg(0).unwrap_or_default().as_str())
                .map(|byte| text[..byte].chars().count() as i64)
                .unwrap_or(-1),
        ),
        "replace" => {
            let from = text_arg(0).unwrap_or_default();
            let to = text_arg(1).unwrap_or_default();
            Value::str(text.replace(&from, &to))
        }
        "split" => {
            let parts: Vec<Value> = match text_arg(0) {
                Some(sep) if !sep.is_empty() => text.split(sep.as_str()).map(Value::from).collect(),
                _ => text.split_whitespace().map(Value::from).collect(),
            };
            Value::List(parts)
        }
        "join" => {
            let items = match arg(args, 0).map(builtins::iterate) {
                Some(Ok(items)) => items,
                Some(Err(err)) => return Some(Err(err)),
                None => Vec::new(),
            };
            Value::str(
                items
                    .iter()
                    .map(Value::to_display)
                    .collect::<Vec<_>>()
                    .join(text),
            )
        }
        _ => return None,
    };
    Some(Ok(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_script;

    #[derive(Default)]
    struct TestHost {
        lines: Vec<usize>,
        calls: Vec<AtomicCall>,
        reports: Vec<(ReportLevel, Value)>,
        failures: usize,
        halt_at: Option<usize>,
        globals: BTreeMap<String, Value>,
        slept: f64,
    }

    impl ScriptHost for TestHost {
        fn checkpoint(&mut self, line: usize, _scope: &Scope<'_>) -> ScriptResult<()> {
            self.lines.push(line);
            if self.halt_at == Some(line) {
                return Err(ScriptError::halted());
            }
            Ok(())
        }

        fn call_atomic(&mut self, call: AtomicCall) -> ScriptResult<Value> {
            let key = call.key.clone();
            self.calls.push(call);
            if key == "Net.flaky" && self.failures > 0 {
                self.failures -= 1;
                return Err(ScriptError::new(ErrorKind::Atomic {
                    message: "connection reset".into(),
                }));
            }
            Ok(Value::str(format!("{key} ok")))
        }

        fn report(&mut self, level: ReportLevel, record: Value) -> ScriptResult<()> {
            self.reports.push((level, record));
            Ok(())
        }

        fn sleep(&mut self, secs: f64) -> ScriptResult<()> {
            self.slept += secs;
            Ok(())
        }

        fn globals(&mut self) -> &mut BTreeMap<String, Value> {
            &mut self.globals
        }
    }

    fn run(host: &mut TestHost, source: &str, args: BTreeMap<String, Value>) -> ScriptResult<BTreeMap<String, Value>> {
        let script = parse_script(source).expect("parse");
        Interpreter::new(host, "main").run_main(&script, args)
    }

    #[test]
    fn outputs_flow_back_through_args() {
        let mut host = TestHost::default();
        let source = "def main(args):\n    x = args.get(\"x\", 2)\n    try:\n        pass\n        y = x * 3 + 1\n    finally:\n        pass\n        args[\"y\"] = y\n";
        let args = BTreeMap::from([("x".to_string(), Value::Int(4))]);
        let out = run(&mut host, source, args).expect("run");
        assert_eq!(out["y"], Value::Int(13));
        assert_eq!(host.lines, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn atomic_calls_receive_keyword_arguments() {
        let mut host = TestHost::default();
        let source = "def main(args):\n    page = Browser.open(url=\"u\", __info__=[2, \"main\"])\n    args[\"page\"] = page\n";
        let out = run(&mut host, source, BTreeMap::new()).expect("run");
        assert_eq!(out["page"], Value::str("Browser.open ok"));
        let call = &host.calls[0];
        assert_eq!(call.line, 2);
        assert_eq!(call.kwarg("url"), Some(&Value::str("u")));
    }

    #[test]
    fn retry_wrapper_reports_and_recovers() {
        let mut host = TestHost {
            failures: 2,
            ..TestHost::default()
        };
        let source = "\
def main(args):
    report.info({\"status\": \"start\"})
    __retry_count_1__ = 2
    while True:
        try:
            r = Net.flaky(__in_retry__=True)
            break
        except Exception as __e_1__:
            __retry_count_1__ -= 1
            if __retry_count_1__ < 0:
                report.error({\"status\": \"error\", \"error\": str(__e_1__)})
                raise
            report.warn({\"status\": \"retry\", \"remaining\": __retry_count_1__})
            sleep(0.5)
    args[\"r\"] = r
";
        let out = run(&mut host, source, BTreeMap::new()).expect("run");
        assert_eq!(out["r"], Value::str("Net.flaky ok"));
        let warns = host.reports.iter().filter(|(l, _)| *l == ReportLevel::Warn).count();
        let errors = host.reports.iter().filter(|(l, _)| *l == ReportLevel::Error).count();
        assert_eq!((warns, errors), (2, 0));
        assert_eq!(host.slept, 1.0);
    }

    #[test]
    fn bare_raise_keeps_the_original_location() {
        let mut host = TestHost {
            failures: 1,
            ..TestHost::default()
        };
        let source = "def main(args):\n    try:\n        Net.flaky()\n    except Exception as e:\n        raise\n";
        let err = run(&mut host, source, BTreeMap::new()).expect_err("re-raised");
        assert_eq!(err.kind.to_string(), "connection reset");
        assert_eq!(err.trace[0].line, 3);
    }

    #[test]
    fn halt_is_not_caught_and_skips_finally() {
        let mut host = TestHost {
            halt_at: Some(3),
            ..TestHost::default()
        };
        let source = "def main(args):\n    try:\n        x = 1\n    except Exception:\n        y = 2\n    finally:\n        z = 3\n";
        let err = run(&mut host, source, BTreeMap::new()).expect_err("halted");
        assert!(err.is_halted());
        assert!(!host.lines.contains(&4));
        assert!(!host.lines.contains(&6));
    }

    #[test]
    fn globals_are_read_and_written_through_the_host() {
        let mut host = TestHost::default();
        host.globals.insert("count".into(), Value::Int(1));
        let source = "def main(args):\n    gv[\"count\"] = gv[\"count\"] + 1\n    gv[\"count\"] += 1\n";
        run(&mut host, source, BTreeMap::new()).expect("run");
        assert_eq!(host.globals["count"], Value::Int(3));
    }

    #[test]
    fn loops_support_break_continue_and_unpacking() {
        let mut host = TestHost::default();
        let source = "\
def main(args):
    total = 0
    for k, v in items({\"a\": 1, \"b\": 2, \"c\": 3}):
        if k == \"b\":
            continue
        total += v
    seen = []
    for i in range(10):
        if i >= 3:
            break
        seen.append(i)
    args[\"total\"] = total
    args[\"seen\"] = seen
";
        let out = run(&mut host, source, BTreeMap::new()).expect("run");
        assert_eq!(out["total"], Value::Int(4));
        assert_eq!(
            out["seen"],
            Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn errors_name_their_kind() {
        let mut host = TestHost::default();
        let err = run(&mut host, "def main(args):\n    x = missing + 1\n", BTreeMap::new())
            .expect_err("name error");
        assert_eq!(err.kind, ErrorKind::Name { name: "missing".into() });
        assert_eq!(err.trace[0].line, 2);

        let err = run(&mut host, "def main(args):\n    x = 1 / 0\n", BTreeMap::new())
            .expect_err("zero division");
        assert_eq!(err.kind, ErrorKind::ZeroDivision);

        let err = run(&mut host, "import os\n", BTreeMap::new()).expect_err("import");
        assert!(matches!(err.kind, ErrorKind::Import { .. }));
    }

    #[test]
    fn nested_function_errors_trace_both_frames() {
        let mut host = TestHost::default();
        let source = "def helper():\n    return {}[\"k\"]\n\ndef main(args):\n    helper()\n";
        let err = run(&mut host, source, BTreeMap::new()).expect_err("key error");
        let lines: Vec<usize> = err.trace.iter().map(|f| f.line).collect();
        assert_eq!(lines, vec![2, 5]);
    }
}
