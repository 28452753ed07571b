use core::error::Error;

use derive_more::Display;
use error_stack::Report;

pub type PolicyResult<T> = Result<T, Report<PolicyError>>;

/// Compute policy manager errors
#[derive(Debug, Display)]
pub enum PolicyError {
    #[display("Compute policy '{name}' not found")]
    EntityNotFound { name: String },

    #[display("Compute policies are not supported by vCD at {host}")]
    OperationNotSupported { host: String },

    #[display("Global PVDC compute policies require vCD API version 35.0 or later (connected with {api_version})")]
    GlobalPvdcComputePolicyNotSupported { api_version: String },

    #[display("Invalid compute policy name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[display("vCD call failed: {operation}")]
    Vcd { operation: String },
}

impl Error for PolicyError {}

impl PolicyError {
    pub fn vcd(operation: impl Into<String>) -> Self {
        PolicyError::Vcd {
            operation: operation.into(),
        }
    }
}
