//! Non-fatal diagnostics accumulated during an operation.

use tracing::warn;

use crate::error::{ErrorKind, Pointer};

/// A non-fatal problem noticed while reading or writing a file.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Machine-stable kind, shared with the error taxonomy.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Tree path or byte offset locating the problem, when known.
    pub pointer: Option<Pointer>,
}

/// Accumulator for [`Diagnostic`]s, surfaced on the file facade.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// New empty accumulator.
    pub fn new() -> Self {
        Diagnostics::default()
    }

    /// Record a diagnostic and emit it as a tracing warning.
    pub fn push(&mut self, kind: ErrorKind, message: impl Into<String>, pointer: Option<Pointer>) {
        let message = message.into();
        match &pointer {
            Some(p) => warn!(kind = %kind, pointer = %p, "{}", message),
            None => warn!(kind = %kind, "{}", message),
        }
        self.entries.push(Diagnostic { kind, message, pointer });
    }

    /// All diagnostics recorded so far, oldest first.
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget all recorded diagnostics.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read_back() {
        let mut diags = Diagnostics::new();
        assert!(diags.is_empty());
        diags.push(ErrorKind::UnknownTag, "no converter for tag", None);
        assert_eq!(diags.entries().len(), 1);
        assert_eq!(diags.entries()[0].kind, ErrorKind::UnknownTag);
        diags.clear();
        assert!(diags.is_empty());
    }
}
