//! Registration of CSE as a vCD API extension.
//!
//! Legacy installs register an AMQP extension service through the legacy
//! admin API; current installs register an MQTT API extension through
//! cloudapi. Both carry a description stamped with the CSE version.

use api_types::QueryRecord;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use futures::TryStreamExt;
use semver::Version;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use vcd_client::config::CLOUDAPI_V1;
use vcd_client::construct_filter_string;
use vcd_client::VcdClient;

use super::error::InstallError;
use super::error::InstallResult;
use super::rde;
use crate::config::schema::AmqpConfig;

pub const CSE_SERVICE_NAME: &str = "cse";
pub const CSE_SERVICE_NAMESPACE: &str = "cse";
pub const CSE_VENDOR: &str = "vmware";
const API_FILTER_PATTERN: &str = "/api/cse/.*";
pub const MQTT_EXTENSION_VERSION: &str = "1.0.0";
const MQTT_PRIORITY: u32 = 50;

/// Kind of extension CSE is registered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    None,
    Amqp,
    Mqtt,
}

/// Version info stamped on the extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDescription {
    pub cse_version: Version,
    pub vcd_api_version: String,
    #[serde(default)]
    pub legacy_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rde_version_in_use: Option<String>,
}

impl ExtensionDescription {
    /// Accepts the JSON form and the older `CSE-3.0.3, vCD API version-35.0`
    /// form. The older form predates legacy mode, which it derives from the
    /// API version.
    pub fn parse(text: &str) -> InstallResult<Self> {
        let invalid = || InstallError::Description {
            description: text.to_string(),
        };
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            let parsed: Self = serde_json::from_str(trimmed).change_context_lazy(invalid)?;
            return Ok(parsed.with_inferred_rde_version());
        }

        let mut cse_version = None;
        let mut vcd_api_version = None;
        for item in trimmed.split(',') {
            let Some((key, value)) = item.trim().split_once('-') else {
                continue;
            };
            match key.trim() {
                "CSE" => {
                    cse_version = Some(
                        Version::parse(value.trim())
                            .change_context_lazy(invalid)?,
                    )
                }
                "vCD API version" => vcd_api_version = Some(value.trim().to_string()),
                _ => {}
            }
        }
        let (Some(cse_version), Some(vcd_api_version)) = (cse_version, vcd_api_version) else {
            return Err(Report::new(invalid()));
        };
        let legacy_mode = vcd_api_version.parse::<f64>().map(|v| v < 35.0).unwrap_or(true);
        Ok(Self {
            cse_version,
            vcd_api_version,
            legacy_mode,
            rde_version_in_use: None,
        }
        .with_inferred_rde_version())
    }

    /// Non-legacy installs always have entities. Descriptions written
    /// before the RDE version was stamped get the one their API version
    /// implies.
    fn with_inferred_rde_version(mut self) -> Self {
        if !self.legacy_mode && self.rde_version_in_use.is_none() {
            self.rde_version_in_use = self
                .vcd_api_version
                .parse::<f64>()
                .ok()
                .and_then(rde::rde_version_for_api)
                .map(str::to_string);
        }
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmqpExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    pub name: String,
    pub namespace: String,
    pub routing_key: String,
    pub exchange: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub namespace: String,
    pub vendor: String,
    #[serde(default)]
    pub version: String,
    pub priority: u32,
    pub enabled: bool,
    pub authorization_enabled: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiFilters {
    #[serde(default, rename = "apiFilter")]
    filters: Vec<ApiFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFilter {
    url_pattern: String,
}

/// Token CSE uses to subscribe to its MQTT topics.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MqttToken {
    pub id: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct ExtensionManager {
    client: VcdClient,
}

impl ExtensionManager {
    pub fn new(client: VcdClient) -> Self {
        Self { client }
    }

    fn mqtt_url(&self, path: &str) -> String {
        self.client.cloudapi_url(CLOUDAPI_V1, path)
    }

    pub async fn find_mqtt(&self) -> InstallResult<Option<MqttExtension>> {
        let filter = construct_filter_string(&[
            ("vendor", CSE_VENDOR),
            ("namespace", CSE_SERVICE_NAMESPACE),
            ("name", CSE_SERVICE_NAME),
        ]);
        self.client
            .paginate::<MqttExtension>(
                self.mqtt_url("extensions/api"),
                vec![("filter".to_string(), filter)],
            )
            .boxed()
            .try_next()
            .await
            .change_context(InstallError::vcd("look up MQTT extension"))
    }

    pub async fn find_amqp(&self) -> InstallResult<Option<AmqpExtension>> {
        let filter = construct_filter_string(&[
            ("name", CSE_SERVICE_NAME),
            ("namespace", CSE_SERVICE_NAMESPACE),
        ]);
        let record = self
            .client
            .query_records::<QueryRecord>("adminService", Some(filter))
            .boxed()
            .try_next()
            .await
            .change_context(InstallError::vcd("look up AMQP extension"))?;
        match record {
            Some(record) => Ok(Some(
                self.client
                    .get_json(&record.href)
                    .await
                    .change_context(InstallError::vcd("read AMQP extension"))?,
            )),
            None => Ok(None),
        }
    }

    /// MQTT wins when both are present, since it is the newer one.
    pub async fn detect_kind(&self) -> InstallResult<ExtensionKind> {
        if self.find_mqtt().await?.is_some() {
            return Ok(ExtensionKind::Mqtt);
        }
        if self.find_amqp().await?.is_some() {
            return Ok(ExtensionKind::Amqp);
        }
        Ok(ExtensionKind::None)
    }

    pub async fn description(&self, kind: ExtensionKind) -> InstallResult<Option<ExtensionDescription>> {
        let text = match kind {
            ExtensionKind::None => return Ok(None),
            ExtensionKind::Mqtt => self.find_mqtt().await?.map(|e| e.description),
            ExtensionKind::Amqp => self.find_amqp().await?.map(|e| e.description),
        };
        text.map(|t| ExtensionDescription::parse(&t)).transpose()
    }

    pub async fn register_amqp(
        &self,
        amqp: &AmqpConfig,
        description: &ExtensionDescription,
    ) -> InstallResult<AmqpExtension> {
        let body = AmqpExtension {
            href: None,
            name: CSE_SERVICE_NAME.to_string(),
            namespace: CSE_SERVICE_NAMESPACE.to_string(),
            routing_key: amqp.routing_key.clone(),
            exchange: amqp.exchange.clone(),
            enabled: true,
            description: description.to_json(),
        };
        let created: AmqpExtension = self
            .client
            .post_json(&self.client.api_url("admin/extension/service"), &body)
            .await
            .change_context(InstallError::vcd("register AMQP extension"))?;
        if let Some(href) = &created.href {
            self.client
                .post(
                    &format!("{href}/apifilters"),
                    &json!({"urlPattern": API_FILTER_PATTERN}),
                )
                .await
                .change_context(InstallError::vcd("register AMQP API filter"))?;
        }
        info!(exchange = %amqp.exchange, routing_key = %amqp.routing_key, "Registered AMQP extension");
        Ok(created)
    }

    /// Re-points an existing AMQP extension at the configured exchange and
    /// routing key and refreshes its description.
    pub async fn update_amqp(
        &self,
        amqp: &AmqpConfig,
        description: &ExtensionDescription,
    ) -> InstallResult<()> {
        let mut existing = self
            .find_amqp()
            .await?
            .ok_or_else(|| Report::new(InstallError::vcd("AMQP extension is not registered")))?;
        let href = existing.href.clone().unwrap_or_default();
        existing.routing_key = amqp.routing_key.clone();
        existing.exchange = amqp.exchange.clone();
        existing.description = description.to_json();
        self.client
            .put(&href, &existing)
            .await
            .change_context(InstallError::vcd("update AMQP extension"))?;
        info!("Updated AMQP extension");
        Ok(())
    }

    pub async fn unregister_amqp(&self) -> InstallResult<()> {
        if let Some(existing) = self.find_amqp().await? {
            let href = existing.href.clone().unwrap_or_default();
            let mut disabled = existing;
            disabled.enabled = false;
            self.client
                .put(&href, &disabled)
                .await
                .change_context(InstallError::vcd("disable AMQP extension"))?;
            self.client
                .delete(&href)
                .await
                .change_context(InstallError::vcd("delete AMQP extension"))?;
            info!("Removed AMQP extension");
        }
        Ok(())
    }

    /// Registers the MQTT extension and creates its token.
    pub async fn register_mqtt(
        &self,
        description: &ExtensionDescription,
    ) -> InstallResult<(MqttExtension, MqttToken)> {
        let body = MqttExtension {
            id: None,
            name: CSE_SERVICE_NAME.to_string(),
            namespace: CSE_SERVICE_NAMESPACE.to_string(),
            vendor: CSE_VENDOR.to_string(),
            version: MQTT_EXTENSION_VERSION.to_string(),
            priority: MQTT_PRIORITY,
            enabled: true,
            authorization_enabled: false,
            description: description.to_json(),
        };
        let created: MqttExtension = self
            .client
            .post_json(&self.mqtt_url("extensions/api"), &body)
            .await
            .change_context(InstallError::vcd("register MQTT extension"))?;
        let id = created
            .id
            .clone()
            .ok_or_else(|| Report::new(InstallError::vcd("MQTT extension has no id")))?;

        self.client
            .post(
                &self.mqtt_url(&format!("extensions/api/{id}/apiFilters")),
                &json!({"urlPattern": API_FILTER_PATTERN}),
            )
            .await
            .change_context(InstallError::vcd("register MQTT API filter"))?;
        let token: MqttToken = self
            .client
            .post_json(
                &self.mqtt_url("tokens"),
                &json!({"name": format!("{CSE_SERVICE_NAME}-token"), "type": "EXTENSION", "extensionId": id}),
            )
            .await
            .change_context(InstallError::vcd("create MQTT token"))?;
        info!(%id, "Registered MQTT extension");
        Ok((created, token))
    }

    pub async fn update_mqtt_description(&self, description: &ExtensionDescription) -> InstallResult<()> {
        let mut existing = self
            .find_mqtt()
            .await?
            .ok_or_else(|| Report::new(InstallError::vcd("MQTT extension is not registered")))?;
        let id = existing.id.clone().unwrap_or_default();
        existing.description = description.to_json();
        self.client
            .put(&self.mqtt_url(&format!("extensions/api/{id}")), &existing)
            .await
            .change_context(InstallError::vcd("update MQTT extension"))?;
        Ok(())
    }

    pub async fn set_enabled(&self, kind: ExtensionKind, enabled: bool) -> InstallResult<()> {
        match kind {
            ExtensionKind::None => Err(Report::new(InstallError::vcd("CSE is not registered"))),
            ExtensionKind::Amqp => {
                let mut existing = self
                    .find_amqp()
                    .await?
                    .ok_or_else(|| Report::new(InstallError::vcd("AMQP extension is not registered")))?;
                let href = existing.href.clone().unwrap_or_default();
                existing.enabled = enabled;
                self.client
                    .put(&href, &existing)
                    .await
                    .change_context(InstallError::vcd("toggle AMQP extension"))?;
                Ok(())
            }
            ExtensionKind::Mqtt => {
                let mut existing = self
                    .find_mqtt()
                    .await?
                    .ok_or_else(|| Report::new(InstallError::vcd("MQTT extension is not registered")))?;
                let id = existing.id.clone().unwrap_or_default();
                existing.enabled = enabled;
                self.client
                    .put(&self.mqtt_url(&format!("extensions/api/{id}")), &existing)
                    .await
                    .change_context(InstallError::vcd("toggle MQTT extension"))?;
                Ok(())
            }
        }
    }

    /// Whether the AMQP extension still routes `/api/cse` requests to CSE.
    pub async fn has_api_filter(&self) -> InstallResult<bool> {
        let Some(href) = self.find_amqp().await?.and_then(|e| e.href) else {
            return Ok(false);
        };
        let filters: ApiFilters = self
            .client
            .get_json(&format!("{href}/apifilters"))
            .await
            .change_context(InstallError::vcd("list AMQP API filters"))?;
        Ok(filters
            .filters
            .iter()
            .any(|f| f.url_pattern == API_FILTER_PATTERN))
    }
}
