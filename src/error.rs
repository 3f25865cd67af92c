use thiserror::Error;

pub type Result<T> = std::result::Result<T, PmaError>;

/// An error raised by the storage engine.
///
/// Duplicate inserts and missing keys are not errors: those are reported
/// through the `bool` results of [`crate::Pma::insert`] and
/// [`crate::Pma::remove`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PmaError {
    /// The segment allocator could not obtain backing memory.
    ///
    /// The call that needed the memory fails and the engine keeps the
    /// contents it had before that call.
    #[error("failed to allocate {bytes} bytes of segment storage")]
    AllocationFailure { bytes: usize },

    /// An internal consistency check failed.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// The configuration cannot describe a working engine.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Reports a broken internal invariant.
///
/// Debug builds abort on the spot so the failing state can be examined;
/// release builds hand the error back to the caller.
#[inline]
#[track_caller]
pub(crate) fn violation(what: &'static str) -> PmaError {
    debug_assert!(false, "invariant violated: {what}");
    PmaError::InvariantViolation(what)
}
