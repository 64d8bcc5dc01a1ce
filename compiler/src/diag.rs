// diag.rs — Diagnostics model
//
// Shared diagnostic types for the pipeline runner. The reorder pass itself
// never emits diagnostics (every decision is "apply" or "skip"); the
// runner synthesizes them from failed verification obligations and from
// stage bookkeeping.

use std::fmt;

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by the pipeline runner.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: DiagLevel,
    /// Graph node the diagnostic refers to, if any.
    pub node: Option<String>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            node: None,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach the name of the node the diagnostic refers to.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        match &self.node {
            Some(node) => write!(f, "{}: {}: {}", level, node, self.message)?,
            None => write!(f, "{}: {}", level, self.message)?,
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
