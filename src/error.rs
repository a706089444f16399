//! Grepable error codes for structured error reporting.
//!
//! Every typed error in the crate implements [`ErrorCode`] so that callers
//! (and log lines) can branch on a stable `E_*` string instead of matching on
//! display text, and so retry loops can ask whether an error is worth another
//! attempt.

/// Grepable error code and retryable flag for typed errors.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
