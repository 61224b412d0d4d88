use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,

    #[error("formula exceeds {0} characters")]
    TooLong(usize),

    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unexpected token {found} at offset {offset}")]
    UnexpectedToken { found: String, offset: usize },

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: &'static str,
        got: usize,
    },

    #[error("formula nesting exceeds depth {0}")]
    TooDeep(usize),

    #[error("division by zero")]
    DivisionByZero,

    #[error("formula produced a non-finite value")]
    NonFinite,
}

/// Evaluation failure for a single rule.
///
/// The engine records these against the rule id and moves on to the next rule.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuleError {
    #[error("formula error: {0}")]
    Formula(#[from] FormulaError),

    #[error("invalid rule configuration: {0}")]
    InvalidConfig(String),
}
