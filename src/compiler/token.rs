//! Token vocabulary shared by the lexer and parser.

use std::collections::BTreeSet;

use super::flow::FlowStep;

/// Structural keywords of the flow language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    /// `if`
    If,
    /// `elseIf`
    ElseIf,
    /// `else`
    Else,
    /// `ifEnd`
    IfEnd,
    /// `while`
    While,
    /// `whileEnd`
    WhileEnd,
    /// `forStep`, numeric range loop
    ForStep,
    /// `forList`
    ForList,
    /// `forDict`
    ForDict,
    /// `forEnd`
    ForEnd,
    /// `try`
    Try,
    /// `catch`
    Catch,
    /// `finally`
    Finally,
    /// `tryEnd`
    TryEnd,
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `return`
    Return,
}

impl Keyword {
    const ALL: [Keyword; 17] = [
        Keyword::If,
        Keyword::ElseIf,
        Keyword::Else,
        Keyword::IfEnd,
        Keyword::While,
        Keyword::WhileEnd,
        Keyword::ForStep,
        Keyword::ForList,
        Keyword::ForDict,
        Keyword::ForEnd,
        Keyword::Try,
        Keyword::Catch,
        Keyword::Finally,
        Keyword::TryEnd,
        Keyword::Break,
        Keyword::Continue,
        Keyword::Return,
    ];

    /// Spelling used in flow documents.
    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::If => "if",
            Keyword::ElseIf => "elseIf",
            Keyword::Else => "else",
            Keyword::IfEnd => "ifEnd",
            Keyword::While => "while",
            Keyword::WhileEnd => "whileEnd",
            Keyword::ForStep => "forStep",
            Keyword::ForList => "forList",
            Keyword::ForDict => "forDict",
            Keyword::ForEnd => "forEnd",
            Keyword::Try => "try",
            Keyword::Catch => "catch",
            Keyword::Finally => "finally",
            Keyword::TryEnd => "tryEnd",
            Keyword::Break => "break",
            Keyword::Continue => "continue",
            Keyword::Return => "return",
        }
    }

    /// Look up a keyword by its flow spelling.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kw| kw.as_str() == key)
    }
}

/// Grouping markers carry no semantics and never reach the parser.
pub const GROUP_KEYS: [&str; 2] = ["group", "groupEnd"];

/// Atomic keys whose result gates an if/elseIf/else chain.
pub const DEFAULT_CONDITION_KEYS: &[&str] = &[
    "Browser.element_exists",
    "Browser.text_exists",
    "Element.exists",
    "Window.exists",
    "Image.exists",
    "File.exists",
    "Folder.exists",
    "Process.exists",
];

/// Atomic keys whose result drives a loop.
pub const DEFAULT_ITERATOR_KEYS: &[&str] = &[
    "Browser.element_loop",
    "Browser.similar_loop",
    "Element.similar_loop",
    "Excel.row_loop",
    "DataTable.row_loop",
    "Folder.file_loop",
];

/// Lookup tables used to reclassify atomic keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexerTables {
    /// Keys lexed as [`TokenKind::AtomicCondition`].
    pub conditions: BTreeSet<String>,
    /// Keys lexed as [`TokenKind::AtomicIterator`].
    pub iterators: BTreeSet<String>,
}

impl Default for LexerTables {
    fn default() -> Self {
        Self {
            conditions: DEFAULT_CONDITION_KEYS.iter().map(|k| k.to_string()).collect(),
            iterators: DEFAULT_ITERATOR_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Classification of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Structural keyword.
    Keyword(Keyword),
    /// Plain atomic call.
    Atomic,
    /// Atomic call used as a branch condition.
    AtomicCondition,
    /// Atomic call used as a loop iterator.
    AtomicIterator,
    /// End of the stream.
    Eof,
}

/// A classified step.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Classification.
    pub kind: TokenKind,
    /// Step the token was produced from; empty for [`TokenKind::Eof`].
    pub step: FlowStep,
}

impl Token {
    /// End-of-stream sentinel.
    pub fn eof() -> Self {
        Self {
            kind: TokenKind::Eof,
            step: FlowStep::default(),
        }
    }

    /// Whether the token is the given keyword.
    pub fn is(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }

    /// Whether the token is any of the given keywords.
    pub fn is_any(&self, keywords: &[Keyword]) -> bool {
        keywords.iter().any(|kw| self.is(*kw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_spellings_round_trip() {
        for kw in Keyword::ALL {
            assert_eq!(Keyword::from_key(kw.as_str()), Some(kw));
        }
        assert_eq!(Keyword::from_key("Browser.open"), None);
    }
}
