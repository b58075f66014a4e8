//! Recursive-descent parser over the flow token stream.
//!
//! The parser never aborts on a structural violation: it records the issue,
//! skips the offending token and keeps going so that every problem in the
//! flow is reported at once.

use thiserror::Error;

use super::ast::{Block, Clause, Conditional, ForKind, ForLoop, Loop, Program, Statement, TryBlock};
use super::token::{Keyword, Token, TokenKind};
use super::{CompileError, CompileResult};

const IF_CLOSERS: &[Keyword] = &[Keyword::ElseIf, Keyword::Else, Keyword::IfEnd];
const ELSE_CLOSERS: &[Keyword] = &[Keyword::IfEnd];
const WHILE_CLOSERS: &[Keyword] = &[Keyword::WhileEnd];
const FOR_CLOSERS: &[Keyword] = &[Keyword::ForEnd];
const TRY_CLOSERS: &[Keyword] = &[Keyword::Catch, Keyword::Finally, Keyword::TryEnd];
const FINALLY_CLOSERS: &[Keyword] = &[Keyword::TryEnd];

/// Structural violation found while parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxIssue {
    /// `break`/`continue` outside any loop.
    #[error("line {line}: `{key}` is only allowed inside a loop")]
    LoopControlOutsideLoop {
        /// Flow-line of the offending step.
        line: usize,
        /// `break` or `continue`.
        key: String,
    },
    /// A second `catch` in the same `try`.
    #[error("line {line}: a try block accepts only one catch")]
    MultipleCatchBlocks {
        /// Flow-line of the extra `catch`.
        line: usize,
    },
    /// A closer or clause keyword with nothing to attach to.
    #[error("line {line}: `{key}` does not match any open block")]
    UnexpectedKeyword {
        /// Flow-line of the offending step.
        line: usize,
        /// Keyword spelling.
        key: String,
    },
}

/// Parse a token stream, failing with every recorded issue.
pub fn parse(tokens: Vec<Token>) -> CompileResult<Program> {
    let mut parser = Parser::new(tokens);
    let program = parser.parse_program();
    if parser.errors.is_empty() {
        Ok(program)
    } else {
        Err(CompileError::Syntax(parser.errors))
    }
}

/// Parser state: current token, one token of lookahead and a loop counter.
pub struct Parser {
    tokens: std::vec::IntoIter<Token>,
    cur: Token,
    peek: Token,
    loop_depth: usize,
    errors: Vec<SyntaxIssue>,
}

impl Parser {
    /// Prime the parser with the first two tokens.
    pub fn new(tokens: Vec<Token>) -> Self {
        let mut parser = Self {
            tokens: tokens.into_iter(),
            cur: Token::eof(),
            peek: Token::eof(),
            loop_depth: 0,
            errors: Vec::new(),
        };
        parser.next_token();
        parser.next_token();
        parser
    }

    /// Issues recorded so far.
    pub fn errors(&self) -> &[SyntaxIssue] {
        &self.errors
    }

    fn next_token(&mut self) {
        let upcoming = self.tokens.next().unwrap_or_else(Token::eof);
        self.cur = std::mem::replace(&mut self.peek, upcoming);
    }

    fn at_eof(&self) -> bool {
        self.cur.kind == TokenKind::Eof
    }

    /// Parse the whole stream into a [`Program`].
    pub fn parse_program(&mut self) -> Program {
        let mut program = Program::default();
        while !self.at_eof() {
            if let Some(stmt) = self.parse_statement() {
                program.statements.push(stmt);
            }
            self.next_token();
        }
        program
    }

    fn parse_statement(&mut self) -> Option<Statement> {
        match self.cur.kind {
            TokenKind::Atomic => Some(Statement::Atomic(self.cur.step.clone())),
            TokenKind::AtomicCondition => Some(Statement::AtomicAsCondition(self.parse_conditional())),
            TokenKind::AtomicIterator => Some(Statement::AtomicAsIterator(self.parse_loop(FOR_CLOSERS))),
            TokenKind::Keyword(Keyword::If) => Some(Statement::If(self.parse_conditional())),
            TokenKind::Keyword(Keyword::While) => Some(Statement::While(self.parse_loop(WHILE_CLOSERS))),
            TokenKind::Keyword(Keyword::ForStep) => Some(self.parse_for(ForKind::Step)),
            TokenKind::Keyword(Keyword::ForList) => Some(self.parse_for(ForKind::List)),
            TokenKind::Keyword(Keyword::ForDict) => Some(self.parse_for(ForKind::Dict)),
            TokenKind::Keyword(Keyword::Try) => Some(Statement::Try(self.parse_try())),
            TokenKind::Keyword(kw @ (Keyword::Break | Keyword::Continue)) => {
                let step = self.cur.step.clone();
                if self.loop_depth == 0 {
                    self.errors.push(SyntaxIssue::LoopControlOutsideLoop {
                        line: step.flow_line,
                        key: kw.as_str().to_string(),
                    });
                    None
                } else if kw == Keyword::Break {
                    Some(Statement::Break(step))
                } else {
                    Some(Statement::Continue(step))
                }
            }
            TokenKind::Keyword(Keyword::Return) => Some(Statement::Return(self.cur.step.clone())),
            TokenKind::Keyword(other) => {
                self.errors.push(SyntaxIssue::UnexpectedKeyword {
                    line: self.cur.step.flow_line,
                    key: other.as_str().to_string(),
                });
                None
            }
            TokenKind::Eof => None,
        }
    }

    /// Consume the opener and parse statements until a closer or EOF.
    /// Leaves the closer as the current token.
    fn parse_block(&mut self, closers: &[Keyword]) -> Block {
        self.next_token();
        let mut block = Block::default();
        while !self.at_eof() && !self.cur.is_any(closers) {
            if let Some(stmt) = self.parse_statement() {
                block.statements.push(stmt);
            }
            self.next_token();
        }
        block
    }

    fn closing_step(&self, closer: Keyword) -> Option<super::flow::FlowStep> {
        self.cur.is(closer).then(|| self.cur.step.clone())
    }

    fn parse_conditional(&mut self) -> Conditional {
        let step = self.cur.step.clone();
        let consequence = self.parse_block(IF_CLOSERS);

        let mut alternatives = Vec::new();
        while self.cur.is(Keyword::ElseIf) {
            let arm = self.cur.step.clone();
            let body = self.parse_block(IF_CLOSERS);
            alternatives.push(Clause { step: arm, body });
        }

        let otherwise = if self.cur.is(Keyword::Else) {
            let arm = self.cur.step.clone();
            let body = self.parse_block(ELSE_CLOSERS);
            Some(Clause { step: arm, body })
        } else {
            None
        };

        Conditional {
            step,
            consequence,
            alternatives,
            otherwise,
            end: self.closing_step(Keyword::IfEnd),
        }
    }

    fn parse_loop(&mut self, closers: &[Keyword]) -> Loop {
        let step = self.cur.step.clone();
        self.loop_depth += 1;
        let body = self.parse_block(closers);
        self.loop_depth -= 1;
        Loop {
            step,
            body,
            end: self.closing_step(closers[0]),
        }
    }

    fn parse_for(&mut self, kind: ForKind) -> Statement {
        let Loop { step, body, end } = self.parse_loop(FOR_CLOSERS);
        Statement::For(ForLoop {
            kind,
            step,
            body,
            end,
        })
    }

    fn parse_try(&mut self) -> TryBlock {
        let step = self.cur.step.clone();
        let body = self.parse_block(TRY_CLOSERS);

        let mut catch = None;
        while self.cur.is(Keyword::Catch) {
            let arm = self.cur.step.clone();
            let line = arm.flow_line;
            let body = self.parse_block(TRY_CLOSERS);
            if catch.is_some() {
                self.errors.push(SyntaxIssue::MultipleCatchBlocks { line });
            } else {
                catch = Some(Clause { step: arm, body });
            }
        }

        let finally = if self.cur.is(Keyword::Finally) {
            let arm = self.cur.step.clone();
            let body = self.parse_block(FINALLY_CLOSERS);
            Some(Clause { step: arm, body })
        } else {
            None
        };

        TryBlock {
            step,
            body,
            catch,
            finally,
            end: self.closing_step(Keyword::TryEnd),
        }
    }
}
