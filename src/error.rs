use std::fmt;

use thiserror::Error;

use crate::location::SourceLocation;

/// The closed set of error categories reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexer,
    Parser,
    Sema,
    Runtime,
    Unquote,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Lexer => "lexer",
            ErrorKind::Parser => "parser",
            ErrorKind::Sema => "sema",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Unquote => "unquote",
        };
        write!(f, "{}", name)
    }
}

/// A fatal interpreter error. All errors unwind the whole evaluation.
/// Runtime errors additionally carry the live call-frame locations,
/// newest first, collected before the stack is abandoned.
#[derive(Debug, Clone, Error)]
#[error("[{kind} error {sl}] {message}")]
pub struct OpalError {
    pub kind: ErrorKind,
    pub sl: SourceLocation,
    pub message: String,
    pub trace: Vec<SourceLocation>,
}

impl OpalError {
    pub fn new(kind: ErrorKind, sl: SourceLocation, message: impl Into<String>) -> Self {
        OpalError {
            kind,
            sl,
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn lexer(sl: SourceLocation, message: impl Into<String>) -> Self {
        OpalError::new(ErrorKind::Lexer, sl, message)
    }

    pub fn parser(sl: SourceLocation, message: impl Into<String>) -> Self {
        OpalError::new(ErrorKind::Parser, sl, message)
    }

    pub fn sema(sl: SourceLocation, message: impl Into<String>) -> Self {
        OpalError::new(ErrorKind::Sema, sl, message)
    }

    pub fn runtime(sl: SourceLocation, message: impl Into<String>) -> Self {
        OpalError::new(ErrorKind::Runtime, sl, message)
    }

    pub fn unquote(message: impl Into<String>) -> Self {
        OpalError::new(ErrorKind::Unquote, SourceLocation::none(), message)
    }

    /// Attach a frame trace to a runtime error unless one is already
    /// present (a runtime error propagating out of a nested `.eval` keeps
    /// the inner trace). Other kinds never carry traces.
    pub fn with_trace(mut self, trace: Vec<SourceLocation>) -> Self {
        if self.kind == ErrorKind::Runtime && self.trace.is_empty() {
            self.trace = trace;
        }
        self
    }
}

pub type OpalResult<T> = Result<T, OpalError>;
