// ABOUTME: Diagnostics accumulator for non-fatal warnings during a batch run.
// ABOUTME: Collects warnings that shouldn't fail the batch but should be shown to users.

/// Collects non-fatal warnings during batch operations.
#[derive(Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning.message);
        self.warnings.push(warning);
    }

    /// Get all collected warnings.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Check if any warnings were collected.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// A non-fatal warning collected during batch operations.
#[derive(Debug, Clone)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    /// Create a session close warning.
    pub fn session_close(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::SessionClose,
            message: message.into(),
        }
    }

    /// Create a connect failure warning.
    pub fn connect_failure(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::ConnectFailure,
            message: message.into(),
        }
    }
}

/// Categories of warnings that can occur during batch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Failed to cleanly close a session.
    SessionClose,
    /// Failed to connect to one host in a batch that continued without it.
    ConnectFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_starts_empty() {
        let diag = Diagnostics::default();
        assert!(!diag.has_warnings());
        assert!(diag.warnings().is_empty());
    }

    #[test]
    fn diagnostics_collects_warnings() {
        let mut diag = Diagnostics::default();

        diag.warn(Warning::session_close("connection reset"));
        diag.warn(Warning::connect_failure("web2: connection refused"));

        assert!(diag.has_warnings());
        assert_eq!(diag.warnings().len(), 2);
    }

    #[test]
    fn warning_constructors_set_correct_kind() {
        let close_warning = Warning::session_close("test");
        assert_eq!(close_warning.kind, WarningKind::SessionClose);

        let connect_warning = Warning::connect_failure("test");
        assert_eq!(connect_warning.kind, WarningKind::ConnectFailure);
    }
}
