//! Typed CSE config file.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

fn default_vcd_port() -> u16 {
    443
}

fn default_api_version() -> String {
    "36.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_processors() -> usize {
    15
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_ip_allocation_mode() -> String {
    "pool".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CseConfig {
    pub vcd: VcdConfig,
    #[serde(default)]
    pub vcs: Vec<VcenterConfig>,
    pub service: ServiceConfig,
    pub broker: BrokerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amqp: Option<AmqpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_options: BTreeMap<String, serde_yaml::Value>,
}

impl CseConfig {
    pub fn legacy_mode(&self) -> bool {
        self.service.legacy_mode
    }

    /// Copy safe to log or return to callers.
    pub fn redacted(&self) -> Self {
        const MASK: &str = "[REDACTED]";
        let mut copy = self.clone();
        copy.vcd.password = MASK.to_string();
        for vc in &mut copy.vcs {
            vc.password = MASK.to_string();
        }
        if let Some(amqp) = &mut copy.amqp {
            amqp.password = MASK.to_string();
        }
        if let Some(mqtt) = &mut copy.mqtt {
            if mqtt.token.is_some() {
                mqtt.token = Some(MASK.to_string());
            }
        }
        copy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VcdConfig {
    pub host: String,
    #[serde(default = "default_vcd_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Log vCD request and response bodies.
    #[serde(default)]
    pub log: bool,
}

impl VcdConfig {
    /// `https://host[:port]`
    pub fn base_url(&self) -> String {
        let host = self
            .host
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        if self.port == 443 {
            format!("https://{host}")
        } else {
            format!("https://{host}:{}", self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VcenterConfig {
    pub name: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub verify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_processors")]
    pub processors: usize,
    #[serde(default)]
    pub enforce_authorization: bool,
    #[serde(default)]
    pub log_wire: bool,
    #[serde(default)]
    pub legacy_mode: bool,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vac_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            vac_url: None,
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    pub catalog: String,
    pub default_template_name: String,
    pub default_template_revision: u32,
    #[serde(default = "default_ip_allocation_mode")]
    pub ip_allocation_mode: String,
    pub network: String,
    pub org: String,
    pub remote_template_cookbook_url: String,
    pub storage_profile: String,
    pub vdc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub prefix: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ssl_accept_all: bool,
    pub vhost: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// Filled in by `install`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_uuid: Option<String>,
}
