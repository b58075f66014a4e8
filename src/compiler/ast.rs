//! Syntax tree produced by the flow parser.

use super::flow::FlowStep;

/// Root of one sub-flow.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    /// Top-level statements.
    pub statements: Vec<Statement>,
}

/// Sequence of statements nested under an opener.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    /// Statements in flow order.
    pub statements: Vec<Statement>,
}

impl Block {
    /// Whether the block has no statements.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// A keyword step together with the block it introduces.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// Step that opened the clause (`elseIf`, `else`, `catch`, `finally`).
    pub step: FlowStep,
    /// Clause body.
    pub body: Block,
}

/// `if` chain, either keyword-driven or gated by an atomic call.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditional {
    /// The `if` step or the condition-bearing atomic step.
    pub step: FlowStep,
    /// Body taken when the condition holds.
    pub consequence: Block,
    /// `elseIf` arms in order.
    pub alternatives: Vec<Clause>,
    /// Optional `else` arm.
    pub otherwise: Option<Clause>,
    /// Closing `ifEnd`, absent when the flow ended first.
    pub end: Option<FlowStep>,
}

/// `while` loop or iterator-bearing atomic call.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    /// Header step.
    pub step: FlowStep,
    /// Loop body.
    pub body: Block,
    /// Closing step.
    pub end: Option<FlowStep>,
}

/// Which `for` form a loop uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForKind {
    /// Numeric range.
    Step,
    /// List items.
    List,
    /// Map entries.
    Dict,
}

/// `forStep` / `forList` / `forDict` loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    /// Loop form.
    pub kind: ForKind,
    /// Header step.
    pub step: FlowStep,
    /// Loop body.
    pub body: Block,
    /// Closing `forEnd`.
    pub end: Option<FlowStep>,
}

/// `try` with optional `catch` and `finally`.
#[derive(Debug, Clone, PartialEq)]
pub struct TryBlock {
    /// The `try` step.
    pub step: FlowStep,
    /// Guarded body.
    pub body: Block,
    /// Single `catch` arm.
    pub catch: Option<Clause>,
    /// `finally` arm.
    pub finally: Option<Clause>,
    /// Closing `tryEnd`.
    pub end: Option<FlowStep>,
}

/// Statement node.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Plain atomic call.
    Atomic(FlowStep),
    /// Atomic call whose truthiness gates a branch chain.
    AtomicAsCondition(Conditional),
    /// Atomic call that yields loop variables.
    AtomicAsIterator(Loop),
    /// Keyword `if` chain.
    If(Conditional),
    /// `while` loop.
    While(Loop),
    /// One of the three `for` forms.
    For(ForLoop),
    /// `try` construct.
    Try(TryBlock),
    /// `break`
    Break(FlowStep),
    /// `continue`
    Continue(FlowStep),
    /// `return`
    Return(FlowStep),
}

impl Statement {
    /// Visit every step owned by the statement, closers included.
    pub fn for_each_step<'a>(&'a self, visit: &mut dyn FnMut(&'a FlowStep)) {
        fn block<'a>(body: &'a Block, visit: &mut dyn FnMut(&'a FlowStep)) {
            for stmt in &body.statements {
                stmt.for_each_step(visit);
            }
        }
        fn clause<'a>(clause: &'a Option<Clause>, visit: &mut dyn FnMut(&'a FlowStep)) {
            if let Some(clause) = clause {
                visit(&clause.step);
                block(&clause.body, visit);
            }
        }
        match self {
            Statement::Atomic(step)
            | Statement::Break(step)
            | Statement::Continue(step)
            | Statement::Return(step) => visit(step),
            Statement::AtomicAsCondition(cond) | Statement::If(cond) => {
                visit(&cond.step);
                block(&cond.consequence, visit);
                for alt in &cond.alternatives {
                    visit(&alt.step);
                    block(&alt.body, visit);
                }
                clause(&cond.otherwise, visit);
                if let Some(end) = &cond.end {
                    visit(end);
                }
            }
            Statement::AtomicAsIterator(lp) | Statement::While(lp) => {
                visit(&lp.step);
                block(&lp.body, visit);
                if let Some(end) = &lp.end {
                    visit(end);
                }
            }
            Statement::For(lp) => {
                visit(&lp.step);
                block(&lp.body, visit);
                if let Some(end) = &lp.end {
                    visit(end);
                }
            }
            Statement::Try(tb) => {
                visit(&tb.step);
                block(&tb.body, visit);
                clause(&tb.catch, visit);
                clause(&tb.finally, visit);
                if let Some(end) = &tb.end {
                    visit(end);
                }
            }
        }
    }
}

impl Program {
    /// Number of flow steps represented in the tree.
    pub fn step_count(&self) -> usize {
        let mut count = 0;
        for stmt in &self.statements {
            stmt.for_each_step(&mut |_| count += 1);
        }
        count
    }
}
