//! User-facing progress output.
//!
//! Orchestration code never prints; it reports through a [`Reporter`] handed in by
//! the caller, so the CLI, tests and quiet runs each pick their own sink.

use std::io::Write;

/// Receiver of progress messages.
pub trait Reporter: Send + Sync {
    /// A step of an operation has begun or completed.
    fn step(&self, message: &str);

    /// Something went wrong without failing the operation.
    fn warn(&self, message: &str);
}

/// Writes progress lines to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter {
    quiet: bool,
}

impl ConsoleReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Reporter for ConsoleReporter {
    fn step(&self, message: &str) {
        log::debug!("{message}");
        if !self.quiet {
            let _ = writeln!(std::io::stderr(), "  {message}");
        }
    }

    fn warn(&self, message: &str) {
        log::debug!("warning: {message}");
        if !self.quiet {
            let _ = writeln!(std::io::stderr(), "  warning: {message}");
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn step(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}
}
