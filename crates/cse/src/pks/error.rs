use core::error::Error;

use derive_more::Display;
use error_stack::Report;

pub type PksResult<T> = Result<T, Report<PksError>>;

/// PKS and NSX-T configuration failures
#[derive(Debug, Display)]
pub enum PksError {
    #[display("vCD call failed: {operation}")]
    Vcd { operation: String },

    #[display("NSX-T call to {server} failed: {operation}")]
    Nsxt { server: String, operation: String },

    #[display("NSX-T server {server} is misconfigured")]
    NsxtConfiguration { server: String },
}

impl PksError {
    pub fn vcd(operation: impl Into<String>) -> Self {
        Self::Vcd {
            operation: operation.into(),
        }
    }
}

impl Error for PksError {}
