use std::fmt;

use serde::Serialize;

use crate::error::{LocateError, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticKind {
    PatternNotFound,
    AmbiguousPattern,
    ExtractionFailure,
    ExtractionTimeout,
    RewriteSkipped,
    CycleLimitReached,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticKind::PatternNotFound => "pattern-not-found",
            DiagnosticKind::AmbiguousPattern => "ambiguous-pattern",
            DiagnosticKind::ExtractionFailure => "extraction-failure",
            DiagnosticKind::ExtractionTimeout => "extraction-timeout",
            DiagnosticKind::RewriteSkipped => "rewrite-skipped",
            DiagnosticKind::CycleLimitReached => "cycle-limit-reached",
        }
    }
}

/// A non-fatal finding. Diagnostics never abort a run by themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub location: Option<Location>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, location: Option<Location>, message: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            message: message.into(),
        }
    }

    pub fn from_locate(err: &LocateError) -> Self {
        let kind = match err {
            LocateError::PatternNotFound { .. } => DiagnosticKind::PatternNotFound,
            LocateError::AmbiguousPattern { .. } => DiagnosticKind::AmbiguousPattern,
        };
        Self::new(kind, None, err.to_string())
    }

    /// Evaluation-time errors. Call-time errors are reported by the rewriter
    /// as `RewriteSkipped` at the call site.
    pub fn from_sandbox(err: &SandboxError, location: Option<Location>) -> Self {
        let kind = match err {
            SandboxError::ExtractionTimeout { .. } => DiagnosticKind::ExtractionTimeout,
            _ => DiagnosticKind::ExtractionFailure,
        };
        Self::new(kind, location, err.to_string())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(loc) => write!(f, "[{}] {}: {}", self.kind.as_str(), loc, self.message),
            None => write!(f, "[{}] {}", self.kind.as_str(), self.message),
        }
    }
}

/// Ordered diagnostic sink for one pipeline run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}
