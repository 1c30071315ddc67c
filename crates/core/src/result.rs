//! Result type definition and logging combinators.
//!
//! Provides combinators for Result types so that best-effort steps can log and
//! move on without unwrap/expect/panic.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for the shared helpers.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for best-effort operations whose failure is logged, not
/// propagated.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error at warn level.
    fn into_option_logged(self, context: &str) -> Option<T>;
}

impl<T, E: Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{context} failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_into_option_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.into_option_logged("lookup"), Some(42));
    }

    #[test]
    fn test_result_into_option_err() {
        let result: Result<i32> = Err(Error::toml_parse_failed("bad"));
        assert_eq!(result.into_option_logged("lookup"), None);
    }

    #[test]
    fn test_foreign_error_types_are_logged_too() {
        let result: std::result::Result<(), String> = Err("lease lost".to_string());
        assert_eq!(result.into_option_logged("lease release"), None);
    }
}
