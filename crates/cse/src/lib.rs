//! Container Service Extension for VMware Cloud Director.

pub mod cmd;
pub mod compute_policy;
pub mod config;
pub mod context;
pub mod install;
pub mod ovdc;
pub mod pks;
pub mod progress;
pub mod server;
pub mod server_config;
pub mod tasks;
pub mod telemetry;
pub mod template;
pub mod util;
