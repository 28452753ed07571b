use core::error::Error;

use derive_more::Display;
use error_stack::Report;

pub type ConfigResult<T> = Result<T, Report<ConfigError>>;

/// Config file errors
#[derive(Debug, Display, PartialEq)]
pub enum ConfigError {
    #[display("Missing key '{path}'")]
    MissingKey { path: String },

    #[display("Invalid key '{path}'")]
    UnknownKey { path: String },

    #[display("Invalid value for '{path}': {message}")]
    InvalidValue { path: String, message: String },

    #[display("Failed to read or write '{path}'")]
    Io { path: String },

    #[display("Malformed config: {message}")]
    Parse { message: String },

    #[display("'{path}' has permissions {mode:o}; only the owner may read or write it")]
    Permissions { path: String, mode: u32 },

    #[display("Failed to decrypt '{path}': wrong password or corrupted file")]
    Decryption { path: String },

    #[display("Failed to encrypt config")]
    Encryption,

    #[display("{target} check failed: {message}")]
    Check { target: String, message: String },
}

impl Error for ConfigError {}
