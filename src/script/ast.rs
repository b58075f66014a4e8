use super::value::Value;

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

impl BinOp {
    /// Operator spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `in`
    In,
    /// `not in`
    NotIn,
}

impl CmpOp {
    /// Operator spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal constant.
    Literal(Value),
    /// Variable reference.
    Name(String),
    /// `base.attr`
    Attr(Box<Expr>, String),
    /// `base[index]`
    Index(Box<Expr>, Box<Expr>),
    /// Call with positional and keyword arguments.
    Call {
        /// Callee expression.
        func: Box<Expr>,
        /// Positional arguments.
        args: Vec<Expr>,
        /// Keyword arguments in source order.
        kwargs: Vec<(String, Expr)>,
    },
    /// `[a, b]` or a parenthesised tuple.
    List(Vec<Expr>),
    /// `{k: v}`
    Dict(Vec<(Expr, Expr)>),
    /// `not x`
    Not(Box<Expr>),
    /// `-x`
    Neg(Box<Expr>),
    /// Arithmetic.
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Comparison.
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    /// Short-circuit `and`.
    And(Box<Expr>, Box<Expr>),
    /// Short-circuit `or`.
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Dotted path of a pure `a.b.c` chain.
    pub fn dotted_path(&self) -> Option<Vec<&str>> {
        match self {
            Expr::Name(name) => Some(vec![name.as_str()]),
            Expr::Attr(base, attr) => {
                let mut path = base.dotted_path()?;
                path.push(attr.as_str());
                Some(path)
            }
            _ => None,
        }
    }
}

/// Assignment target.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Plain variable.
    Name(String),
    /// `object[index]`
    Index(Expr, Expr),
}

/// Clause body with the line of its header.
#[derive(Debug, Clone, PartialEq)]
pub struct Suite {
    /// Header line (`else:`, `except ...:`, `finally:`).
    pub line: usize,
    /// Statements.
    pub body: Vec<Stmt>,
}

/// `if`/`elif` arm.
#[derive(Debug, Clone, PartialEq)]
pub struct Arm {
    /// Header line.
    pub line: usize,
    /// Test expression.
    pub test: Expr,
    /// Statements.
    pub body: Vec<Stmt>,
}

/// `except` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    /// Header line.
    pub line: usize,
    /// Name bound to the error message.
    pub name: Option<String>,
    /// Statements.
    pub body: Vec<Stmt>,
}

/// User-defined function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Function name.
    pub name: String,
    /// Parameter names.
    pub params: Vec<String>,
    /// Body statements.
    pub body: Vec<Stmt>,
    /// Line of the `def`.
    pub line: usize,
}

/// Statement kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `pass`
    Pass,
    /// Expression evaluated for effect.
    Expr(Expr),
    /// `a = v` or `a, b = v`.
    Assign(Vec<Target>, Expr),
    /// `a += v`, `a -= v`, ...
    AugAssign(Target, BinOp, Expr),
    /// `if`/`elif`/`else` chain.
    If(Vec<Arm>, Option<Suite>),
    /// `while test:`
    While(Expr, Vec<Stmt>),
    /// `for targets in iter:`
    For(Vec<Target>, Expr, Vec<Stmt>),
    /// `try` with optional handler and finally.
    Try {
        /// Guarded statements.
        body: Vec<Stmt>,
        /// `except` clause.
        handler: Option<Handler>,
        /// `finally` clause.
        finally: Option<Suite>,
    },
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `return [value]`
    Return(Option<Expr>),
    /// `raise [value]`
    Raise(Option<Expr>),
    /// `def name(params):`
    Def(Function),
    /// `import module`; no modules are importable.
    Import(String),
}

/// A statement with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// 1-based line of the statement.
    pub line: usize,
    /// Statement kind.
    pub kind: StmtKind,
}

/// A loaded program: top-level statements, usually a single `def main`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    /// Top-level statements.
    pub body: Vec<Stmt>,
}
