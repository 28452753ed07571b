//! Sizing and placement compute policies owned by CSE.

pub mod error;
pub mod manager;
pub mod naming;

pub use error::PolicyError;
pub use error::PolicyResult;
pub use manager::ComputePolicyManager;
pub use manager::CsePolicy;
pub use naming::CsePolicyName;
pub use naming::K8sRuntime;
