//! Error kinds and per-phase aggregation.
//!
//! Every user-visible error carries the most specific position available:
//! a source position, a module identity, or a module plus property. Internal
//! errors wrap captured panics and always indicate a bug in braid or a module
//! type, not in the input files.

use braid_syntax::Position;
use std::any::Any;
use thiserror::Error;

/// Errors reported after this many are dropped; in-flight work still drains.
pub const MAX_ERRORS: usize = 10;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("{pos}: {message}")]
    Source { pos: Position, message: String },

    #[error("{pos}: module {module:?}: {message}")]
    Module { pos: Position, module: String, message: String },

    #[error("{pos}: module {module:?}: property {property:?}: {message}")]
    Property { pos: Position, module: String, property: String, message: String },

    /// A positionless summary line, e.g. the head of a cycle report.
    #[error("{message}")]
    Misc { message: String },

    #[error("internal error in {phase}: {message}")]
    Internal { phase: String, message: String },
}

impl Error {
    pub fn source(pos: Position, message: impl Into<String>) -> Error {
        Error::Source { pos, message: message.into() }
    }

    pub fn module(pos: Position, module: impl Into<String>, message: impl Into<String>) -> Error {
        Error::Module { pos, module: module.into(), message: message.into() }
    }

    pub fn misc(message: impl Into<String>) -> Error {
        Error::Misc { message: message.into() }
    }

    /// Wraps a payload caught by `catch_unwind`, annotated with the phase
    /// that was running ("mutator arch for libfoo", "GenerateBuildActions
    /// for libbar").
    pub fn internal(phase: impl Into<String>, panic: Box<dyn Any + Send>) -> Error {
        Error::Internal { phase: phase.into(), message: panic_message(panic.as_ref()) }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Collects errors for one phase. The first `MAX_ERRORS` are kept; once the
/// cap is hit `keep_going` flips so producers can short-circuit new work.
#[derive(Default)]
pub struct ErrorCollector {
    errors: Vec<Error>,
    dropped: usize,
}

impl ErrorCollector {
    pub fn new() -> ErrorCollector {
        ErrorCollector::default()
    }

    pub fn add(&mut self, err: Error) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(err);
        } else {
            self.dropped += 1;
        }
    }

    pub fn extend(&mut self, errs: impl IntoIterator<Item = Error>) {
        for err in errs {
            self.add(err);
        }
    }

    pub fn keep_going(&self) -> bool {
        self.errors.len() < MAX_ERRORS
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Errors dropped after the cap was hit.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Consumes the collector; `Err` carries the collected errors if any.
    pub fn into_result(self) -> Result<(), Vec<Error>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_position_chain() {
        let pos = Position::new("dir/Braidfile", 4, 5);
        let err = Error::Property {
            pos,
            module: "libfoo".to_string(),
            property: "srcs".to_string(),
            message: "expected list of strings".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "dir/Braidfile:4:5: module \"libfoo\": property \"srcs\": expected list of strings"
        );
    }

    #[test]
    fn collector_caps_at_max_errors() {
        let mut c = ErrorCollector::new();
        for i in 0..MAX_ERRORS + 5 {
            c.add(Error::misc(format!("e{}", i)));
        }
        assert!(!c.keep_going());
        assert_eq!(c.len(), MAX_ERRORS);
        let errs = c.into_result().unwrap_err();
        assert_eq!(errs.len(), MAX_ERRORS);
    }

    #[test]
    fn panic_payload_formats() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_string()), "boom");
    }
}
