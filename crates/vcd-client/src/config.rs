//! client config

use std::time::Duration;

use error_stack::Report;

use crate::error::VcdError;
use crate::error::VcdResult;

/// cloudapi path version used by most endpoints.
pub const CLOUDAPI_V1: &str = "1.0.0";
/// cloudapi path version of the compute policy endpoints on API 35.0+.
pub const CLOUDAPI_V2: &str = "2.0.0";

/// vCD client config.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// base url, e.g. `https://vcd.example.com`
    pub host: String,
    /// vCD API version sent in the `Accept` header
    pub api_version: String,
    /// verify the server certificate
    pub verify_ssl: bool,
    /// HTTP request timeout
    pub request_timeout: Duration,
    /// log request and response bodies under the wire target
    pub log_wire: bool,
    /// page size used by paginated listings
    pub page_size: u32,
    /// interval between task status polls
    pub task_poll_interval: Duration,
    /// max time to wait for a task
    pub task_timeout: Duration,
}

impl ClientConfig {
    /// create new client config with default parameters.
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("https://{host}")
        };

        Self {
            host: host.trim_end_matches('/').to_string(),
            api_version: "36.0".to_string(),
            verify_ssl: true,
            request_timeout: Duration::from_secs(120),
            log_wire: false,
            page_size: 25,
            task_poll_interval: Duration::from_secs(5),
            task_timeout: Duration::from_secs(600),
        }
    }

    /// set the API version.
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// set certificate verification.
    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }

    /// set request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// enable or disable wire logging.
    pub fn with_log_wire(mut self, log_wire: bool) -> Self {
        self.log_wire = log_wire;
        self
    }

    /// set page size of paginated listings.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// set task polling interval and timeout.
    pub fn with_task_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.task_poll_interval = interval;
        self.task_timeout = timeout;
        self
    }

    /// API version as a number, e.g. `36.0`.
    pub fn api_version_number(&self) -> VcdResult<f64> {
        self.api_version.parse::<f64>().map_err(|e| {
            Report::new(VcdError::Configuration {
                message: format!("invalid API version '{}': {e}", self.api_version),
            })
        })
    }

    /// cloudapi path version matching the configured API version.
    pub fn compute_policy_api_path(&self) -> &'static str {
        match self.api_version_number() {
            Ok(v) if v >= 35.0 => CLOUDAPI_V2,
            _ => CLOUDAPI_V1,
        }
    }
}
