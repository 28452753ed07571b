//! Minimal vCD REST client used by CSE.
//!
//! Covers session login, JSON requests against `cloudapi` and the legacy
//! `api` tree, paginated listings and task polling.

pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod task;

pub use client::Credentials;
pub use client::VcdClient;
pub use client::VcdResponse;
pub use config::ClientConfig;
pub use error::http_status;
pub use error::VcdError;
pub use error::VcdResult;
pub use filter::construct_filter_string;
pub use task::TaskUpdate;
