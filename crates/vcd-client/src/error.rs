//! Error types for vCD REST calls.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;

/// Result type for vCD operations.
pub type VcdResult<T> = Result<T, Report<VcdError>>;

/// Errors that can occur while talking to vCD.
#[derive(Debug, Display)]
pub enum VcdError {
    /// Network connectivity issues
    #[display("Network error: {message}")]
    Network { message: String },

    /// Non-success HTTP status returned by vCD
    #[display("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Serialization/deserialization errors
    #[display("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration errors
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// Login failed or the session token is missing
    #[display("Authentication failed: {message}")]
    Authentication { message: String },

    /// A vCD task did not finish in time
    #[display("Task {href} timed out after {seconds}s")]
    Timeout { href: String, seconds: u64 },

    /// A vCD task finished with an error status
    #[display("Task {href} failed: {message}")]
    TaskFailed { href: String, message: String },
}

impl Error for VcdError {}

impl VcdError {
    /// HTTP status code, when the error came from an HTTP response.
    pub fn status(&self) -> Option<u16> {
        match self {
            VcdError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Finds the HTTP status carried anywhere in a report.
pub fn http_status<C>(report: &Report<C>) -> Option<u16> {
    report
        .frames()
        .find_map(|frame| frame.downcast_ref::<VcdError>())
        .and_then(VcdError::status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Display)]
    #[display("outer")]
    struct Outer;

    impl Error for Outer {}

    #[test]
    fn http_status_is_found_through_context_changes() {
        let report = Report::new(VcdError::Http {
            status: 400,
            message: "duplicate name".to_string(),
        })
        .change_context(Outer);

        assert_eq!(http_status(&report), Some(400));
    }

    #[test]
    fn display_formatting() {
        let err = VcdError::Http {
            status: 503,
            message: "Service Unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error: 503 - Service Unavailable");

        let err = VcdError::Timeout {
            href: "https://vcd/api/task/1".to_string(),
            seconds: 30,
        };
        assert_eq!(
            err.to_string(),
            "Task https://vcd/api/task/1 timed out after 30s"
        );
    }
}
