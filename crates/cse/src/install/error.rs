use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use semver::Version;

pub type InstallResult<T> = Result<T, Report<InstallError>>;
pub type UpgradeResult<T> = Result<T, Report<UpgradeError>>;

/// Install, upgrade and check failures
#[derive(Debug, Display)]
pub enum InstallError {
    #[display("vCD call failed: {operation}")]
    Vcd { operation: String },

    #[display("Invalid extension description '{description}'")]
    Description { description: String },

    #[display("Unsupported RDE setup: {message}")]
    Rde { message: String },

    #[display("Template step failed: {step}")]
    Template { step: String },

    #[display("Installation check failed: {message}")]
    Check { message: String },

    #[display("CSE is already registered with vCD; use 'cse upgrade' instead")]
    AlreadyInstalled,

    #[display("Upgrade refused")]
    Upgrade,

    #[display("Failed to read the CSE version")]
    Version,
}

impl Error for InstallError {}

impl InstallError {
    pub fn vcd(operation: impl Into<String>) -> Self {
        InstallError::Vcd {
            operation: operation.into(),
        }
    }
}

/// Upgrade transitions that are refused before anything is changed.
#[derive(Debug, Display, PartialEq, Eq)]
pub enum UpgradeError {
    #[display("CSE is not registered with vCD; use 'cse install' instead of 'cse upgrade'")]
    NotInstalled,

    #[display("CSE is registered as an MQTT extension and cannot be downgraded to AMQP")]
    MqttToAmqp,

    #[display("Cannot upgrade CSE {source} to the older version {target}")]
    Downgrade { source: Version, target: Version },

    #[display("Cannot move a non-legacy CSE {source} installation to legacy mode")]
    NonLegacyToLegacy { source: Version },

    #[display(
        "CSE {source} has a TKGm placement policy; TKGm was not supported before 3.1.0, \
         remove the policy before upgrading to {target}"
    )]
    UnexpectedTkgmPolicy { source: Version, target: Version },
}

impl Error for UpgradeError {}
