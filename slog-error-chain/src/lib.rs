//! Minimal local vendoring of the `slog-error-chain` crate's `InlineErrorChain`
//! helper, providing the subset of the public API used by this workspace.
//!
//! `InlineErrorChain` wraps a `std::error::Error` and, via its `Display`
//! implementation, renders the error followed by each of its sources inline,
//! separated by `": "`.

use std::error::Error;
use std::fmt;

/// Formats an error and its chain of sources inline on a single line.
pub struct InlineErrorChain<'a> {
    start: &'a dyn Error,
}

impl<'a> InlineErrorChain<'a> {
    /// Create a new `InlineErrorChain` starting at `start`.
    pub fn new(start: &'a dyn Error) -> Self {
        Self { start }
    }
}

impl fmt::Display for InlineErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start)?;
        let mut source = self.start.source();
        while let Some(err) = source {
            write!(f, ": {}", err)?;
            source = err.source();
        }
        Ok(())
    }
}
