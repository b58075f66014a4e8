//! Turns the surviving steps of a sub-flow into a token stream.

use super::flow::FlowStep;
use super::token::{GROUP_KEYS, Keyword, LexerTables, Token, TokenKind};
use super::{CompileError, CompileResult};

/// Forward-only token source over the steps of one sub-flow.
pub struct Lexer<'a> {
    steps: std::vec::IntoIter<FlowStep>,
    tables: &'a LexerTables,
}

impl<'a> Lexer<'a> {
    /// Create a lexer over already filtered steps.
    pub fn new(steps: Vec<FlowStep>, tables: &'a LexerTables) -> Self {
        Self {
            steps: steps.into_iter(),
            tables,
        }
    }

    /// Produce the next token, or [`TokenKind::Eof`] once the steps run out.
    pub fn next_token(&mut self) -> CompileResult<Token> {
        for step in self.steps.by_ref() {
            if step.key.is_empty() {
                return Err(CompileError::MissingKey {
                    line: step.flow_line,
                    id: step.id,
                });
            }
            if GROUP_KEYS.contains(&step.key.as_str()) {
                continue;
            }
            let kind = classify(&step.key, self.tables);
            return Ok(Token { kind, step });
        }
        Ok(Token::eof())
    }

    /// Drain the lexer into a vector ending with the EOF sentinel.
    pub fn tokenize(mut self) -> CompileResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }
}

fn classify(key: &str, tables: &LexerTables) -> TokenKind {
    if let Some(keyword) = Keyword::from_key(key) {
        TokenKind::Keyword(keyword)
    } else if tables.conditions.contains(key) {
        TokenKind::AtomicCondition
    } else if tables.iterators.contains(key) {
        TokenKind::AtomicIterator
    } else {
        TokenKind::Atomic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(key: &str, line: usize) -> FlowStep {
        FlowStep {
            key: key.to_string(),
            flow_line: line,
            ..FlowStep::default()
        }
    }

    #[test]
    fn classifies_keywords_and_table_keys() {
        let tables = LexerTables::default();
        let steps = vec![
            step("if", 1),
            step("Browser.element_exists", 2),
            step("Excel.row_loop", 3),
            step("group", 4),
            step("Browser.open", 5),
        ];
        let kinds: Vec<TokenKind> = Lexer::new(steps, &tables)
            .tokenize()
            .expect("tokens")
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword(Keyword::If),
                TokenKind::AtomicCondition,
                TokenKind::AtomicIterator,
                TokenKind::Atomic,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn empty_key_is_rejected() {
        let tables = LexerTables::default();
        let err = Lexer::new(vec![step("", 7)], &tables)
            .tokenize()
            .expect_err("missing key");
        assert!(matches!(err, CompileError::MissingKey { line: 7, .. }));
    }
}
