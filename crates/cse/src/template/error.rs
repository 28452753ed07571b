use core::error::Error;

use derive_more::Display;
use error_stack::Report;

pub type TemplateResult<T> = Result<T, Report<TemplateError>>;

/// Template cookbook, catalog and build failures
#[derive(Debug, Display)]
pub enum TemplateError {
    #[display("Failed to fetch the template cookbook from {url}")]
    Cookbook { url: String },

    #[display("Template {name} revision {revision} is not in the cookbook")]
    UnknownTemplate { name: String, revision: u32 },

    #[display("Catalog '{catalog}' not found in org '{org}'")]
    CatalogNotFound { org: String, catalog: String },

    #[display("Invalid OVA {path}: {reason}")]
    InvalidOva { path: String, reason: String },

    #[display("Checksum mismatch for {name}: expected {expected}, got {actual}")]
    Checksum {
        name: String,
        expected: String,
        actual: String,
    },

    #[display("Guest customization of {vm} did not complete")]
    Customization { vm: String },

    #[display("vCD call failed: {operation}")]
    Vcd { operation: String },

    #[display("I/O error on {path}")]
    Io { path: String },
}

impl Error for TemplateError {}

impl TemplateError {
    pub fn vcd(operation: impl Into<String>) -> Self {
        TemplateError::Vcd {
            operation: operation.into(),
        }
    }
}
