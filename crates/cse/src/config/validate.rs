//! Structural and semantic checks of config files.
//!
//! Keys are checked on the raw YAML first so that errors name the full
//! dotted path of the offending key; the typed parse afterwards only has
//! to deal with value types.

use error_stack::Report;
use serde_yaml::Mapping;
use serde_yaml::Value;
use tracing::info;

use super::error::ConfigError;
use super::error::ConfigResult;
use super::schema::CseConfig;

/// Required and optional keys of one mapping.
pub struct KeySpec {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

pub const TOP_LEVEL: KeySpec = KeySpec {
    required: &["vcd", "service", "broker"],
    optional: &["vcs", "amqp", "mqtt", "extra_options"],
};

pub const VCD: KeySpec = KeySpec {
    required: &["host", "username", "password"],
    optional: &["port", "api_version", "verify", "log"],
};

pub const VCS: KeySpec = KeySpec {
    required: &["name", "username", "password"],
    optional: &["verify"],
};

pub const SERVICE: KeySpec = KeySpec {
    required: &[],
    optional: &[
        "processors",
        "enforce_authorization",
        "log_wire",
        "legacy_mode",
        "telemetry",
        "listen_addr",
    ],
};

pub const TELEMETRY: KeySpec = KeySpec {
    required: &["enable"],
    optional: &["vac_url", "instance_id"],
};

pub const BROKER: KeySpec = KeySpec {
    required: &[
        "catalog",
        "default_template_name",
        "default_template_revision",
        "network",
        "org",
        "remote_template_cookbook_url",
        "storage_profile",
        "vdc",
    ],
    optional: &["ip_allocation_mode"],
};

pub const AMQP: KeySpec = KeySpec {
    required: &[
        "host",
        "port",
        "prefix",
        "username",
        "password",
        "exchange",
        "routing_key",
        "vhost",
    ],
    optional: &["ssl", "ssl_accept_all"],
};

pub const MQTT: KeySpec = KeySpec {
    required: &[],
    optional: &["verify_ssl", "token", "token_id", "ext_uuid"],
};

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Checks a mapping against `spec`, reporting keys by dotted path.
pub fn check_keys(value: &Value, path: &str, spec: &KeySpec) -> ConfigResult<()> {
    let map = as_mapping(value, path)?;
    for required in spec.required {
        if !map.contains_key(*required) {
            return Err(Report::new(ConfigError::MissingKey {
                path: join(path, required),
            }));
        }
    }
    for key in map.keys() {
        let key = key.as_str().unwrap_or_default();
        if !spec.required.contains(&key) && !spec.optional.contains(&key) {
            return Err(Report::new(ConfigError::UnknownKey {
                path: join(path, key),
            }));
        }
    }
    Ok(())
}

fn as_mapping<'a>(value: &'a Value, path: &str) -> ConfigResult<&'a Mapping> {
    value.as_mapping().ok_or_else(|| {
        Report::new(ConfigError::InvalidValue {
            path: if path.is_empty() { "<root>".into() } else { path.into() },
            message: "expected a mapping".into(),
        })
    })
}

/// Key layout of a whole CSE config file.
pub fn check_config_keys(root: &Value) -> ConfigResult<()> {
    check_keys(root, "", &TOP_LEVEL)?;
    check_keys(&root["vcd"], "vcd", &VCD)?;
    check_keys(&root["service"], "service", &SERVICE)?;
    if let Some(telemetry) = root["service"].get("telemetry") {
        check_keys(telemetry, "service.telemetry", &TELEMETRY)?;
    }
    check_keys(&root["broker"], "broker", &BROKER)?;

    if let Some(vcs) = root.get("vcs") {
        let list = vcs.as_sequence().ok_or_else(|| {
            Report::new(ConfigError::InvalidValue {
                path: "vcs".into(),
                message: "expected a list".into(),
            })
        })?;
        for (i, vc) in list.iter().enumerate() {
            check_keys(vc, &format!("vcs.{i}"), &VCS)?;
        }
    }

    let legacy_mode = root["service"]
        .get("legacy_mode")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let (required, forbidden, spec) = if legacy_mode {
        ("amqp", "mqtt", &AMQP)
    } else {
        ("mqtt", "amqp", &MQTT)
    };
    let section = root.get(required).ok_or_else(|| {
        Report::new(ConfigError::MissingKey {
            path: required.to_string(),
        })
    })?;
    check_keys(section, required, spec)?;
    if root.get(forbidden).is_some() {
        return Err(Report::new(ConfigError::UnknownKey {
            path: forbidden.to_string(),
        })
        .attach_printable(format!(
            "'{forbidden}' is not allowed when service.legacy_mode is {legacy_mode}"
        )));
    }
    Ok(())
}

/// Value checks that don't need vCD.
pub fn validate_values(config: &CseConfig) -> ConfigResult<()> {
    let invalid = |path: &str, message: String| {
        Err(Report::new(ConfigError::InvalidValue {
            path: path.to_string(),
            message,
        }))
    };

    if config.vcd.host.trim().is_empty() {
        return invalid("vcd.host", "must not be empty".into());
    }
    let api_version = match config.vcd.api_version.parse::<f64>() {
        Ok(v) => v,
        Err(e) => return invalid("vcd.api_version", e.to_string()),
    };
    if !config.legacy_mode() && api_version < 35.0 {
        return invalid(
            "vcd.api_version",
            format!("{api_version} requires service.legacy_mode to be true"),
        );
    }
    if config.service.processors == 0 {
        return invalid("service.processors", "must be at least 1".into());
    }
    if !matches!(config.broker.ip_allocation_mode.as_str(), "dhcp" | "pool") {
        return invalid(
            "broker.ip_allocation_mode",
            format!("'{}' is neither 'dhcp' nor 'pool'", config.broker.ip_allocation_mode),
        );
    }
    if let Err(e) = url::Url::parse(&config.broker.remote_template_cookbook_url) {
        return invalid("broker.remote_template_cookbook_url", e.to_string());
    }
    if let Some(vac_url) = &config.service.telemetry.vac_url {
        if let Err(e) = url::Url::parse(vac_url) {
            return invalid("service.telemetry.vac_url", e.to_string());
        }
    }
    if let Err(e) = config.service.listen_addr.parse::<std::net::SocketAddr>() {
        return invalid("service.listen_addr", e.to_string());
    }

    info!("Config file structure and values are valid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).expect("valid yaml")
    }

    const BASE: &str = r#"
vcd:
  host: vcd.local
  username: administrator
  password: secret
service:
  legacy_mode: false
broker:
  catalog: cse
  default_template_name: ubuntu
  default_template_revision: 1
  network: net
  org: org
  remote_template_cookbook_url: https://example.com/template.yaml
  storage_profile: "*"
  vdc: vdc
mqtt:
  verify_ssl: true
"#;

    #[test]
    fn valid_layout_passes() {
        check_config_keys(&yaml(BASE)).expect("valid");
    }

    #[test]
    fn missing_key_reports_dotted_path() {
        let text = BASE.replace("  network: net\n", "");
        let err = check_config_keys(&yaml(&text)).expect_err("missing key");
        assert_eq!(
            err.current_context(),
            &ConfigError::MissingKey {
                path: "broker.network".into()
            }
        );
    }

    #[test]
    fn unknown_key_reports_dotted_path() {
        let text = BASE.replace("  password: secret\n", "  password: secret\n  colour: red\n");
        let err = check_config_keys(&yaml(&text)).expect_err("unknown key");
        assert_eq!(
            err.current_context(),
            &ConfigError::UnknownKey {
                path: "vcd.colour".into()
            }
        );
    }

    #[test]
    fn legacy_mode_requires_amqp() {
        let text = BASE.replace("legacy_mode: false", "legacy_mode: true");
        let err = check_config_keys(&yaml(&text)).expect_err("amqp required");
        assert_eq!(
            err.current_context(),
            &ConfigError::MissingKey {
                path: "amqp".into()
            }
        );
    }

    #[test]
    fn vcs_entries_are_checked() {
        let text = format!("{BASE}vcs:\n  - name: vc1\n    username: u\n");
        let err = check_config_keys(&yaml(&text)).expect_err("missing password");
        assert_eq!(
            err.current_context(),
            &ConfigError::MissingKey {
                path: "vcs.0.password".into()
            }
        );
    }

    #[test]
    fn non_legacy_needs_api_35() {
        let mut config: CseConfig = serde_yaml::from_str(BASE).expect("typed");
        config.vcd.api_version = "34.0".into();
        let err = validate_values(&config).expect_err("too old");
        assert!(matches!(
            err.current_context(),
            ConfigError::InvalidValue { path, .. } if path == "vcd.api_version"
        ));

        config.service.legacy_mode = true;
        validate_values(&config).expect("legacy mode allows 34.0");
    }
}
