//! Error types and error handling strategy.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Fatal configuration and OS-level failures are returned as [`Error`]
//!   values whose message names the offending setting or call site; the
//!   runtime refuses to proceed past them
//! - Invariant violations are debug assertions; release builds skip them
//! - No error is used for control flow

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or incompatible configuration value.
    Configuration,
    /// An OS call failed (affinity query/bind, thread spawn/join).
    Os,
    /// The runtime was used outside its lifecycle (re-entry, use before
    /// `initialize`, use after `shutdown`).
    Lifecycle,
}

impl ErrorKind {
    /// Static description of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration error",
            Self::Os => "operating system error",
            Self::Lifecycle => "lifecycle violation",
        }
    }
}

/// The main error type for taskgrid operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Shorthand for an OS-level error with context.
    #[must_use]
    pub fn os(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Os).with_context(ctx)
    }

    /// Shorthand for a lifecycle violation with context.
    #[must_use]
    pub fn lifecycle(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lifecycle).with_context(ctx)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::new(ErrorKind::Configuration).with_context(err.to_string())
    }
}

/// Result alias for taskgrid operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::os("binding worker 3 to cpu 5");
        let msg = err.to_string();
        assert!(msg.contains("operating system error"));
        assert!(msg.contains("cpu 5"));
    }

    #[test]
    fn kind_is_preserved() {
        let err = Error::lifecycle("initialize called twice");
        assert_eq!(err.kind(), ErrorKind::Lifecycle);
    }

    #[test]
    fn source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "join failed");
        let err = Error::new(ErrorKind::Os).with_source(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
