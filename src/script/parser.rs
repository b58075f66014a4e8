use super::ast::{Arm, BinOp, CmpOp, Expr, Function, Handler, Script, Stmt, StmtKind, Suite, Target};
use super::value::Value;
use super::{ErrorKind, ScriptError, ScriptResult};

/// Parse program text into a [`Script`].
pub fn parse_script(source: &str) -> ScriptResult<Script> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, index: 0 };
    let mut body = Vec::new();
    while !parser.at(&Tok::Eof) {
        if parser.eat(&Tok::Newline) {
            continue;
        }
        body.push(parser.statement()?);
    }
    Ok(Script { body })
}

fn syntax(line: usize, message: impl Into<String>) -> ScriptError {
    ScriptError::new(ErrorKind::Syntax {
        line,
        message: message.into(),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Name(name) => format!("'{name}'"),
            Tok::Int(n) => n.to_string(),
            Tok::Float(n) => n.to_string(),
            Tok::Str(_) => "string".to_string(),
            Tok::Op(op) => format!("'{op}'"),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
    line: usize,
}

const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-", "*", "/", "%", "<", ">", "=",
    "(", ")", "[", "]", "{", "}", ",", ":", ".",
];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    out: Vec<Spanned>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            indents: vec![0],
            out: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.out.push(Spanned {
            tok,
            line: self.line,
        });
    }

    fn tokenize(mut self) -> ScriptResult<Vec<Spanned>> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    continue;
                }
                at_line_start = false;
            }
            let Some(ch) = self.peek() else { break };
            match ch {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        if !matches!(self.out.last().map(|s| &s.tok), Some(Tok::Newline) | None) {
                            self.push(Tok::Newline);
                        }
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '\'' | '"' => {
                    let text = self.string(ch)?;
                    self.push(Tok::Str(text));
                }
                c if c.is_ascii_digit() => {
                    let tok = self.number()?;
                    self.push(tok);
                }
                c if c == '_' || c.is_alphabetic() => {
                    let start = self.pos;
                    while self.peek().is_some_and(|c| c == '_' || c.is_alphanumeric()) {
                        self.pos += 1;
                    }
                    let name: String = self.chars[start..self.pos].iter().collect();
                    self.push(Tok::Name(name));
                }
                _ => {
                    let op = OPERATORS
                        .iter()
                        .find(|op| op.chars().enumerate().all(|(i, c)| self.peek_at(i) == Some(c)))
                        .copied()
                        .ok_or_else(|| syntax(self.line, format!("unexpected character '{ch}'")))?;
                    match op {
                        "(" | "[" | "{" => self.depth += 1,
                        ")" | "]" | "}" => {
                            self.depth = self
                                .depth
                                .checked_sub(1)
                                .ok_or_else(|| syntax(self.line, format!("unmatched '{op}'")))?;
                        }
                        _ => {}
                    }
                    self.pos += op.len();
                    self.push(Tok::Op(op));
                }
            }
        }
        if self.depth > 0 {
            return Err(syntax(self.line, "unexpected end of input inside brackets"));
        }
        if !matches!(self.out.last().map(|s| &s.tok), Some(Tok::Newline) | None) {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.out)
    }

    /// Measure the indentation of a new logical line. Returns `false` for
    /// blank and comment-only lines, which are skipped.
    fn indentation(&mut self) -> ScriptResult<bool> {
        let mut width = 0;
        while let Some(ch) = self.peek() {
            match ch {
                ' ' => width += 1,
                '\t' => width += 4,
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek() {
            None | Some('\n') | Some('#') | Some('\r') => {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.pos += 1;
                }
                if self.peek() == Some('\n') {
                    self.pos += 1;
                    self.line += 1;
                }
                return Ok(false);
            }
            _ => {}
        }
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(syntax(self.line, "unindent does not match any outer level"));
            }
        }
        Ok(true)
    }

    fn string(&mut self, quote: char) -> ScriptResult<String> {
        let line = self.line;
        self.pos += 1;
        let mut buf = String::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(syntax(line, "unterminated string"));
            };
            self.pos += 1;
            match ch {
                c if c == quote => return Ok(buf),
                '\n' => return Err(syntax(line, "unterminated string")),
                '\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(syntax(line, "unterminated string"));
                    };
                    self.pos += 1;
                    match escaped {
                        'n' => buf.push('\n'),
                        't' => buf.push('\t'),
                        'r' => buf.push('\r'),
                        '0' => buf.push('\0'),
                        '\\' | '\'' | '"' => buf.push(escaped),
                        '\n' => self.line += 1,
                        other => {
                            buf.push('\\');
                            buf.push(other);
                        }
                    }
                }
                other => buf.push(other),
            }
        }
    }

    fn number(&mut self) -> ScriptResult<Tok> {
        let start = self.pos;
        let mut is_float = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.pos += 1;
        }
        if self.peek() == Some('.') && self.peek_at(1).is_none_or(|c| !c.is_alphabetic() && c != '_') {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+') | Some('-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += 1 + sign;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let text: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
        if is_float {
            text.parse()
                .map(Tok::Float)
                .map_err(|_| syntax(self.line, format!("invalid number '{text}'")))
        } else {
            text.parse()
                .map(Tok::Int)
                .map_err(|_| syntax(self.line, format!("invalid number '{text}'")))
        }
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
}

impl Parser {
    fn current(&self) -> &Tok {
        self.tokens
            .get(self.index)
            .map(|s| &s.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn lookahead(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.index + offset)
            .map(|s| &s.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.current().clone();
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.current() == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.current(), Tok::Op(o) if *o == op)
    }

    fn at_word(&self, word: &str) -> bool {
        matches!(self.current(), Tok::Name(n) if n == word)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.at_word(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, wanted: &str) -> ScriptError {
        syntax(
            self.line(),
            format!("expected {wanted}, found {}", self.current().describe()),
        )
    }

    fn expect_op(&mut self, op: &str) -> ScriptResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{op}'")))
        }
    }

    fn expect_word(&mut self, word: &str) -> ScriptResult<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{word}'")))
        }
    }

    fn identifier(&mut self) -> ScriptResult<String> {
        match self.current().clone() {
            Tok::Name(name) if !is_reserved(&name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn statement(&mut self) -> ScriptResult<Stmt> {
        let line = self.line();
        let word = match self.current() {
            Tok::Name(word) => Some(word.clone()),
            Tok::Indent => return Err(syntax(line, "unexpected indent")),
            _ => None,
        };
        let kind = match word {
            Some(word) => match word.as_str() {
                "def" => self.def()?,
                "if" => self.if_chain()?,
                "while" => {
                    self.advance();
                    let test = self.expression()?;
                    let body = self.suite()?;
                    StmtKind::While(test, body)
                }
                "for" => {
                    self.advance();
                    let targets = self.for_targets()?;
                    self.expect_word("in")?;
                    let iter = self.expression_list()?;
                    let body = self.suite()?;
                    StmtKind::For(targets, iter, body)
                }
                "try" => self.try_stmt()?,
                _ => return self.simple_line(line),
            },
            None => return self.simple_line(line),
        };
        Ok(Stmt { line, kind })
    }

    fn simple_line(&mut self, line: usize) -> ScriptResult<Stmt> {
        let kind = self.simple()?;
        if !self.eat(&Tok::Newline) && !self.at(&Tok::Eof) {
            return Err(self.unexpected("end of line"));
        }
        Ok(Stmt { line, kind })
    }

    fn simple(&mut self) -> ScriptResult<StmtKind> {
        if self.eat_word("pass") {
            return Ok(StmtKind::Pass);
        }
        if self.eat_word("break") {
            return Ok(StmtKind::Break);
        }
        if self.eat_word("continue") {
            return Ok(StmtKind::Continue);
        }
        if self.eat_word("return") {
            let value = if self.ends_statement() { None } else { Some(self.expression_list()?) };
            return Ok(StmtKind::Return(value));
        }
        if self.eat_word("raise") {
            let value = if self.ends_statement() { None } else { Some(self.expression()?) };
            return Ok(StmtKind::Raise(value));
        }
        if self.eat_word("import") || self.at_word("from") {
            if self.eat_word("from") {
                let module = self.dotted_name()?;
                while !self.ends_statement() {
                    self.advance();
                }
                return Ok(StmtKind::Import(module));
            }
            return Ok(StmtKind::Import(self.dotted_name()?));
        }

        let first = self.expression_list()?;
        if self.at_op("=") {
            let targets = to_targets(first, self.line())?;
            self.advance();
            let value = self.expression_list()?;
            if self.at_op("=") {
                return Err(syntax(self.line(), "chained assignment is not supported"));
            }
            return Ok(StmtKind::Assign(targets, value));
        }
        let aug = [
            ("+=", BinOp::Add),
            ("-=", BinOp::Sub),
            ("*=", BinOp::Mul),
            ("/=", BinOp::Div),
            ("%=", BinOp::Mod),
        ];
        for (symbol, op) in aug {
            if self.eat_op(symbol) {
                let target = match to_targets(first, self.line())?.as_slice() {
                    [single] => single.clone(),
                    _ => return Err(syntax(self.line(), "illegal target for augmented assignment")),
                };
                let value = self.expression_list()?;
                return Ok(StmtKind::AugAssign(target, op, value));
            }
        }
        Ok(StmtKind::Expr(first))
    }

    fn ends_statement(&self) -> bool {
        matches!(self.current(), Tok::Newline | Tok::Eof | Tok::Dedent)
    }

    fn dotted_name(&mut self) -> ScriptResult<String> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn suite(&mut self) -> ScriptResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !self.eat(&Tok::Newline) {
            let line = self.line();
            return Ok(vec![self.simple_line(line)?]);
        }
        if !self.eat(&Tok::Indent) {
            return Err(self.unexpected("an indented block"));
        }
        let mut body = Vec::new();
        while !self.eat(&Tok::Dedent) {
            if self.at(&Tok::Eof) {
                break;
            }
            if self.eat(&Tok::Newline) {
                continue;
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn def(&mut self) -> ScriptResult<StmtKind> {
        let line = self.line();
        self.advance();
        let name = self.identifier()?;
        self.expect_op("(")?;
        let mut params = Vec::new();
        while !self.at_op(")") {
            params.push(self.identifier()?);
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        let body = self.suite()?;
        Ok(StmtKind::Def(Function {
            name,
            params,
            body,
            line,
        }))
    }

    fn if_chain(&mut self) -> ScriptResult<StmtKind> {
        let mut arms = Vec::new();
        let line = self.line();
        self.advance();
        let test = self.expression()?;
        let body = self.suite()?;
        arms.push(Arm { line, test, body });
        let mut otherwise = None;
        loop {
            let line = self.line();
            if self.eat_word("elif") {
                let test = self.expression()?;
                let body = self.suite()?;
                arms.push(Arm { line, test, body });
            } else if self.eat_word("else") {
                otherwise = Some(Suite {
                    line,
                    body: self.suite()?,
                });
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If(arms, otherwise))
    }

    fn try_stmt(&mut self) -> ScriptResult<StmtKind> {
        self.advance();
        let body = self.suite()?;
        let mut handler = None;
        let line = self.line();
        if self.eat_word("except") {
            let mut name = None;
            if !self.at_op(":") {
                // The exception class is accepted for readability only.
                self.postfix()?;
                if self.eat_word("as") {
                    name = Some(self.identifier()?);
                }
            }
            handler = Some(Handler {
                line,
                name,
                body: self.suite()?,
            });
            if self.at_word("except") {
                return Err(syntax(self.line(), "only one except clause is supported"));
            }
        }
        let line = self.line();
        let finally = if self.eat_word("finally") {
            Some(Suite {
                line,
                body: self.suite()?,
            })
        } else {
            None
        };
        if handler.is_none() && finally.is_none() {
            return Err(self.unexpected("'except' or 'finally'"));
        }
        Ok(StmtKind::Try {
            body,
            handler,
            finally,
        })
    }

    fn for_targets(&mut self) -> ScriptResult<Vec<Target>> {
        let line = self.line();
        let mut targets = Vec::new();
        loop {
            let expr = self.postfix()?;
            targets.extend(to_targets(expr, line)?);
            if !self.eat_op(",") || self.at_word("in") {
                break;
            }
        }
        Ok(targets)
    }

    /// Comma-separated expressions; more than one forms a tuple.
    fn expression_list(&mut self) -> ScriptResult<Expr> {
        let first = self.expression()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.ends_statement() || self.at_op("=") || self.at_op(":") {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Expr::List(items))
    }

    fn expression(&mut self) -> ScriptResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_word("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ScriptResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_word("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> ScriptResult<Expr> {
        if self.eat_word("not") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn compare_op(&mut self) -> Option<CmpOp> {
        let tok = self.current().clone();
        let op = match &tok {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::Ne,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::Le,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::Ge,
            Tok::Name(word) if word == "in" => CmpOp::In,
            Tok::Name(word) if word == "not" && matches!(self.lookahead(1), Tok::Name(w) if w == "in") => {
                self.advance();
                CmpOp::NotIn
            }
            Tok::Name(word) if word == "is" => {
                if matches!(self.lookahead(1), Tok::Name(w) if w == "not") {
                    self.advance();
                    CmpOp::Ne
                } else {
                    CmpOp::Eq
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn comparison(&mut self) -> ScriptResult<Expr> {
        let mut left = self.additive()?;
        let mut chain: Option<Expr> = None;
        while let Some(op) = self.compare_op() {
            let right = self.additive()?;
            let link = Expr::Compare(op, Box::new(left), Box::new(right.clone()));
            chain = Some(match chain {
                Some(prev) => Expr::And(Box::new(prev), Box::new(link)),
                None => link,
            });
            left = right;
        }
        Ok(chain.unwrap_or(left))
    }

    fn additive(&mut self) -> ScriptResult<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> ScriptResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> ScriptResult<Expr> {
        if self.eat_op("-") {
            return Ok(match self.unary()? {
                Expr::Literal(Value::Int(n)) => Expr::Literal(Value::Int(-n)),
                Expr::Literal(Value::Float(n)) => Expr::Literal(Value::Float(-n)),
                other => Expr::Neg(Box::new(other)),
            });
        }
        if self.eat_op("+") {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ScriptResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op(".") {
                let attr = self.identifier()?;
                expr = Expr::Attr(Box::new(expr), attr);
            } else if self.eat_op("[") {
                let index = self.expression_list()?;
                self.expect_op("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> ScriptResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.at_op(")") {
            let keyword = match (self.current(), self.lookahead(1)) {
                (Tok::Name(name), Tok::Op("=")) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.advance();
                self.advance();
                kwargs.push((name, self.expression()?));
            } else if kwargs.is_empty() {
                args.push(self.expression()?);
            } else {
                return Err(syntax(self.line(), "positional argument follows keyword argument"));
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> ScriptResult<Expr> {
        let line = self.line();
        match self.advance() {
            Tok::Int(n) => Ok(Expr::Literal(Value::Int(n))),
            Tok::Float(n) => Ok(Expr::Literal(Value::Float(n))),
            Tok::Str(mut text) => {
                while let Tok::Str(more) = self.current().clone() {
                    text.push_str(&more);
                    self.advance();
                }
                Ok(Expr::Literal(Value::Str(text)))
            }
            Tok::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Literal(Value::Bool(true))),
                "False" => Ok(Expr::Literal(Value::Bool(false))),
                "None" => Ok(Expr::Literal(Value::None)),
                word if is_reserved(word) => Err(syntax(line, format!("unexpected keyword '{word}'"))),
                _ => Ok(Expr::Name(name)),
            },
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expression()?;
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op(")") {
                        break;
                    }
                    items.push(self.expression()?);
                }
                self.expect_op(")")?;
                Ok(Expr::List(items))
            }
            Tok::Op("[") => {
                let mut items = Vec::new();
                while !self.at_op("]") {
                    items.push(self.expression()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                let mut entries = Vec::new();
                while !self.at_op("}") {
                    let key = self.expression()?;
                    self.expect_op(":")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(entries))
            }
            other => Err(syntax(line, format!("unexpected {}", other.describe()))),
        }
    }
}

fn is_reserved(word: &str) -> bool {
    matches!(
        word,
        "and" | "as" | "break" | "continue" | "def" | "elif" | "else" | "except" | "finally" | "for"
            | "from" | "if" | "import" | "in" | "is" | "not" | "or" | "pass" | "raise" | "return"
            | "try" | "while"
    )
}

fn to_targets(expr: Expr, line: usize) -> ScriptResult<Vec<Target>> {
    match expr {
        Expr::Name(name) => Ok(vec![Target::Name(name)]),
        Expr::Index(object, index) => Ok(vec![Target::Index(*object, *index)]),
        Expr::List(items) => {
            let mut targets = Vec::new();
            for item in items {
                match item {
                    Expr::Name(name) => targets.push(Target::Name(name)),
                    Expr::Index(object, index) => targets.push(Target::Index(*object, *index)),
                    _ => return Err(syntax(line, "cannot assign to expression")),
                }
            }
            Ok(targets)
        }
        _ => Err(syntax(line, "cannot assign to expression")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Script {
        parse_script(source).expect("parse")
    }

    #[test]
    fn parses_generated_prologue() {
        let script = parse(
            "def main(args):\n    x = args.get(\"x\", 1)\n    try:\n        pass\n        y = A.b(v=x, __info__=[1, \"p\"])\n    finally:\n        pass\n        args[\"y\"] = y\n",
        );
        let [Stmt { kind: StmtKind::Def(main), line: 1 }] = script.body.as_slice() else {
            panic!("expected a single def, got {:?}", script.body);
        };
        assert_eq!(main.params, vec!["args".to_string()]);
        assert_eq!(main.body.len(), 2);
        let StmtKind::Try { body, handler, finally } = &main.body[1].kind else {
            panic!("expected try");
        };
        assert!(handler.is_none());
        assert_eq!(body[1].line, 5);
        assert_eq!(finally.as_ref().map(|s| s.line), Some(6));
    }

    #[test]
    fn keyword_arguments_and_dotted_calls() {
        let script = parse("page = Browser.open(url=\"u\", __on_error__=\"skip\")");
        let StmtKind::Assign(targets, Expr::Call { func, args, kwargs }) = &script.body[0].kind else {
            panic!("expected call assignment");
        };
        assert_eq!(targets, &vec![Target::Name("page".into())]);
        assert_eq!(func.dotted_path(), Some(vec!["Browser", "open"]));
        assert!(args.is_empty());
        assert_eq!(kwargs[1].0, "__on_error__");
    }

    #[test]
    fn tuple_targets_in_for_loops() {
        let script = parse("for k, v in items(dict_param(\"dicts\", {\"a\": 1})):\n    pass\n");
        let StmtKind::For(targets, _, body) = &script.body[0].kind else {
            panic!("expected for");
        };
        assert_eq!(targets.len(), 2);
        assert_eq!(body[0].kind, StmtKind::Pass);
    }

    #[test]
    fn except_binds_a_name_and_elif_chains() {
        let script = parse(
            "try:\n    x = 1\nexcept Exception as err:\n    raise\nif a:\n    pass\nelif b:\n    pass\nelse:\n    pass\n",
        );
        let StmtKind::Try { handler: Some(handler), .. } = &script.body[0].kind else {
            panic!("expected try with handler");
        };
        assert_eq!(handler.name.as_deref(), Some("err"));
        assert_eq!(handler.line, 3);
        let StmtKind::If(arms, otherwise) = &script.body[1].kind else {
            panic!("expected if");
        };
        assert_eq!(arms.len(), 2);
        assert_eq!(otherwise.as_ref().map(|s| s.line), Some(9));
    }

    #[test]
    fn precedence_and_not_in() {
        let script = parse("x = 1 + 2 * 3 > 6 and 'a' not in names");
        let StmtKind::Assign(_, Expr::And(left, right)) = &script.body[0].kind else {
            panic!("expected and");
        };
        assert!(matches!(**left, Expr::Compare(CmpOp::Gt, _, _)));
        assert!(matches!(**right, Expr::Compare(CmpOp::NotIn, _, _)));
    }

    #[test]
    fn brackets_join_lines_and_comments_are_skipped() {
        let script = parse("# header\nx = [\n    1,\n    2,\n]\n\ny = x  # trailing\n");
        assert_eq!(script.body.len(), 2);
        assert_eq!(script.body[1].line, 7);
    }

    #[test]
    fn bad_indentation_reports_its_line() {
        let err = parse_script("if a:\n    x = 1\n  y = 2\n").expect_err("dedent mismatch");
        assert!(matches!(err.kind, ErrorKind::Syntax { line: 3, .. }));
    }

    #[test]
    fn import_statements_parse() {
        let script = parse("import os.path\n");
        assert_eq!(script.body[0].kind, StmtKind::Import("os.path".into()));
    }
}
