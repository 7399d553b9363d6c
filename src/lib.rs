//! Glisp - an evaluator for a small homoiconic Lisp that drives a live canvas
//!
//! Programs are plain data: lists, vectors, maps, symbols and literals. The
//! evaluator walks that data directly, so the same tree a user edits on the
//! canvas is the tree that runs. Evaluation can optionally stamp every list and
//! map node with the value it produced and the function applied there, which
//! lets tooling answer "what did this sub-expression become?" after a run.
//!
//! ```text
//! (def square (fn [x] (* x x)))
//! (let [a 3 b (square a)] [a b])       ; => [3 9]
//! (macro unless [c a b] `(if ~c ~b ~a))
//! (try (throw "boom") (catch e e))     ; => "boom"
//! ```
//!
//! ## Evaluation model
//!
//! - Tail positions (`if` branches, the last form of `do` and `let`, function
//!   bodies, `quasiquote` and `eval-when-execute` results) are evaluated by
//!   looping, so tail-recursive programs run in constant native stack.
//! - Macros are ordinary functions carrying a macro flag; they receive their
//!   arguments unevaluated and their result is evaluated in place of the call.
//! - Environments form a shared, mutable parent chain; closures capture the
//!   environment they were created in.
//! - Failures are `Result` values; `try`/`catch` intercepts them.
//!
//! ## Modules
//!
//! - `ast`: the value model, construction helpers and printer
//! - `metadata`: per-node evaluation metadata
//! - `evaluator`: environments, macro and quasiquote expansion, the dispatch loop
//! - `builtinops`: the native functions installed in the global environment
//! - `reader`: text front end (feature `reader`, enabled by default)

use std::fmt;

use crate::ast::Value;
use crate::builtinops::Arity;

/// Maximum nesting depth accepted by the reader
pub const MAX_PARSE_DEPTH: usize = 64;

/// Default maximum depth of non-tail evaluation
/// Tail calls loop and never count against this limit; argument lists, `let`
/// bindings, `if` conditions and `try` bodies each add one level.
///
/// Each level costs a few KiB of native stack in unoptimized builds. Run deep
/// programs on a thread with a 256 MiB stack, or pick a smaller limit with
/// [`evaluator::evaluate_with_limit`].
pub const MAX_EVAL_DEPTH: usize = 10_000;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (EOF, unterminated string, unclosed parens)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete, valid expression
    TrailingContent,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>, context: Option<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
        }
    }

    /// Create a ParseError with context extracted from input at a given offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        let context_start = error_offset.saturating_sub(20);
        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.len() < input.len() {
            display_context.push_str("[...]");
        }

        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        Self::new(kind, message, Some(display_context))
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// Error types for the evaluator
///
/// Every variant is catchable by `try`. A caught [`Error::Thrown`] binds the
/// thrown value itself; every other variant binds its message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("ParseError: {0}")]
    ParseError(ParseError),
    #[error("Symbol '{0}' not found")]
    UnboundSymbol(String),
    #[error("ArityError: expected {expected} arguments, got {got}")]
    ArityMismatch { expected: Arity, got: usize },
    #[error(
        "{kind} {value} is not a function. First element of list always should be a function."
    )]
    NotCallable { kind: &'static str, value: String },
    #[error("Invalid form: {0}")]
    InvalidForm(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("EvaluationError: {0}")]
    EvalError(String),
    #[error("Evaluation depth limit exceeded (max: {0})")]
    DepthExceeded(usize),
    #[error("{0}")]
    Thrown(Value),
}

impl Error {
    /// Create an ArityMismatch for a fixed argument count
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::ArityMismatch {
            expected: Arity::Exact(expected),
            got,
        }
    }

    /// Create an ArityMismatch for a variadic signature
    pub fn arity_error_at_least(min: usize, got: usize) -> Self {
        Error::ArityMismatch {
            expected: Arity::AtLeast(min),
            got,
        }
    }

    pub(crate) fn not_callable(value: &Value) -> Self {
        Error::NotCallable {
            kind: value.kind_name(),
            value: value.to_string(),
        }
    }

    /// The value a `catch` clause binds for this error
    pub fn into_catch_value(self) -> Value {
        match self {
            Error::Thrown(value) => value,
            other => Value::String(other.to_string()),
        }
    }
}

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod metadata;

#[cfg(feature = "reader")]
pub mod reader;
