//! CSE config files: loading, validation and encryption at rest.

pub mod cli;
pub mod encryption;
pub mod error;
pub mod pks;
pub mod sample;
pub mod schema;
pub mod validate;
pub mod vcenter;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;
use tracing::warn;

pub use error::ConfigError;
pub use error::ConfigResult;
pub use pks::PksConfig;
pub use schema::CseConfig;
pub use vcenter::VcenterRegistry;

/// How a config file is read.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Decryption password; required unless `skip_decryption`.
    pub password: Option<String>,
    pub skip_decryption: bool,
    /// Reject plain-text files readable by group or others.
    pub check_permissions: bool,
}

impl LoadOptions {
    pub fn encrypted(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            skip_decryption: false,
            check_permissions: false,
        }
    }

    pub fn plain() -> Self {
        Self {
            password: None,
            skip_decryption: true,
            check_permissions: true,
        }
    }
}

#[derive(Debug)]
pub struct Loaded<T> {
    pub config: T,
    /// The file was encrypted with the deprecated SHA-256 key.
    pub used_legacy_key: bool,
}

/// Fails when group or others have any access to `path`.
#[cfg(unix)]
pub fn check_file_permissions(path: &Path) -> ConfigResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).change_context(ConfigError::Io {
        path: path.display().to_string(),
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(Report::new(ConfigError::Permissions {
            path: path.display().to_string(),
            mode,
        }));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_file_permissions(_path: &Path) -> ConfigResult<()> {
    Ok(())
}

/// Reads a file, decrypting it unless told otherwise.
pub fn read_config_text(path: &Path, options: &LoadOptions) -> ConfigResult<(String, bool)> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).change_context(ConfigError::Io {
        path: display.clone(),
    })?;
    if options.skip_decryption {
        if options.check_permissions {
            check_file_permissions(path)?;
        }
        return Ok((raw, false));
    }

    let password = options.password.as_deref().ok_or_else(|| {
        Report::new(ConfigError::Decryption {
            path: display.clone(),
        })
        .attach_printable("no password was supplied")
    })?;
    let decrypted = encryption::decrypt(&raw, password)
        .change_context(ConfigError::Decryption { path: display })?;
    Ok((decrypted.content, decrypted.used_legacy_key))
}

fn parse_error(e: impl std::fmt::Display) -> Report<ConfigError> {
    Report::new(ConfigError::Parse {
        message: e.to_string(),
    })
}

/// Parses and validates CSE config text, without touching vCD.
pub fn parse_config(text: &str) -> ConfigResult<CseConfig> {
    let raw: serde_yaml::Value = serde_yaml::from_str(text).map_err(parse_error)?;
    validate::check_config_keys(&raw)?;
    let config: CseConfig = serde_yaml::from_value(raw).map_err(parse_error)?;
    validate::validate_values(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path, options: &LoadOptions) -> ConfigResult<Loaded<CseConfig>> {
    let (text, used_legacy_key) = read_config_text(path, options)?;
    let config = parse_config(&text).attach_printable_lazy(|| format!("in {}", path.display()))?;
    if used_legacy_key {
        warn!(path = %path.display(), "Config uses a deprecated encryption key");
    }
    info!(path = %path.display(), legacy_mode = config.legacy_mode(), "Loaded config");
    Ok(Loaded {
        config,
        used_legacy_key,
    })
}

/// Loads the PKS config and checks it against the vCenters of `config`.
pub fn load_pks_config(
    path: &Path,
    options: &LoadOptions,
    config: &CseConfig,
) -> ConfigResult<Loaded<PksConfig>> {
    let (text, used_legacy_key) = read_config_text(path, options)?;
    let pks: PksConfig = serde_yaml::from_str(&text).map_err(parse_error)?;
    pks.validate(&VcenterRegistry::new(&config.vcs).names())?;
    Ok(Loaded {
        config: pks,
        used_legacy_key,
    })
}

/// Writes `content`, readable by the owner only. New files are created
/// with that mode; existing ones are narrowed before being truncated.
pub fn write_private(path: &Path, content: &str) -> ConfigResult<()> {
    let io = || ConfigError::Io {
        path: path.display().to_string(),
    };
    let mut options = OpenOptions::new();
    options.write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::fs::PermissionsExt;

        options.mode(0o600);
        if path.exists() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .change_context_lazy(io)?;
        }
    }
    let mut file = options.open(path).change_context_lazy(io)?;
    file.set_len(0).change_context_lazy(io)?;
    file.write_all(content.as_bytes()).change_context_lazy(io)?;
    Ok(())
}
