//! Usage telemetry.
//!
//! Every recorded event is best effort: a disabled collector, a missing
//! endpoint or a failed upload never fail the operation being recorded.

use std::time::Duration;

use chrono::Utc;
use derive_more::Display;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::config::schema::TelemetryConfig;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const SENSITIVE_KEY_PARTS: [&str; 4] = ["password", "secret", "token", "key"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CseOperation {
    #[display("CONFIG_CHECK")]
    ConfigCheck,
    #[display("SERVICE_INSTALL")]
    ServiceInstall,
    #[display("SERVICE_UPGRADE")]
    ServiceUpgrade,
    #[display("SERVICE_RUN")]
    ServiceRun,
    #[display("TEMPLATE_LIST")]
    TemplateList,
    #[display("TEMPLATE_INSTALL")]
    TemplateInstall,
    #[display("TEMPLATE_IMPORT")]
    TemplateImport,
    #[display("OVDC_LIST")]
    OvdcList,
    #[display("OVDC_INFO")]
    OvdcInfo,
    #[display("OVDC_UPDATE")]
    OvdcUpdate,
    #[display("OVDC_COMPUTE_POLICY_UPDATE")]
    OvdcComputePolicyUpdate,
    #[display("SYSTEM_UPDATE")]
    SystemUpdate,
    #[display("PKS_CONFIGURE")]
    PksConfigure,
    #[display("CREATE_SERVICE_ROLE")]
    CreateServiceRole,
    #[display("CLUSTER_LIST")]
    ClusterList,
    #[display("CLUSTER_INFO")]
    ClusterInfo,
    #[display("CLUSTER_DELETE")]
    ClusterDelete,
    #[display("CLUSTER_CONFIG")]
    ClusterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    #[display("SUCCESS")]
    Success,
    #[display("FAILED")]
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    #[serde(rename = "@type")]
    pub kind: &'static str,
    #[serde(rename = "@id")]
    pub id: String,
    pub instance_id: String,
    pub cse_version: &'static str,
    pub operation: CseOperation,
    pub status: OperationStatus,
    pub timestamp: String,
    pub properties: Map<String, Value>,
}

/// Drops values whose key looks like a credential, recursively.
pub fn sanitize(properties: &Map<String, Value>) -> Map<String, Value> {
    properties
        .iter()
        .filter(|(key, _)| {
            let key = key.to_ascii_lowercase();
            !SENSITIVE_KEY_PARTS.iter().any(|part| key.contains(part))
        })
        .map(|(key, value)| {
            let value = match value {
                Value::Object(inner) => Value::Object(sanitize(inner)),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TelemetryClient {
    http: reqwest::Client,
    vac_url: Option<String>,
    instance_id: String,
    enabled: bool,
}

impl TelemetryClient {
    pub fn new(config: &TelemetryConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            vac_url: config.vac_url.clone(),
            instance_id: config
                .instance_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            enabled: config.enable,
        }
    }

    pub fn disabled() -> Self {
        Self::new(&TelemetryConfig {
            enable: false,
            vac_url: None,
            instance_id: None,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.vac_url.is_some()
    }

    pub fn event(
        &self,
        operation: CseOperation,
        status: OperationStatus,
        properties: &Map<String, Value>,
    ) -> TelemetryEvent {
        TelemetryEvent {
            kind: "cse",
            id: Uuid::new_v4().to_string(),
            instance_id: self.instance_id.clone(),
            cse_version: utils::version::CSE_VERSION,
            operation,
            status,
            timestamp: Utc::now().to_rfc3339(),
            properties: sanitize(properties),
        }
    }

    pub async fn record(&self, operation: CseOperation, status: OperationStatus) {
        self.record_with(operation, status, &Map::new()).await;
    }

    pub async fn record_with(
        &self,
        operation: CseOperation,
        status: OperationStatus,
        properties: &Map<String, Value>,
    ) {
        let Some(url) = self.vac_url.as_deref().filter(|_| self.enabled) else {
            debug!(%operation, %status, "Telemetry disabled, event dropped");
            return;
        };
        let event = self.event(operation, status, properties);
        let result = self
            .http
            .post(url)
            .json(&event)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => debug!(%operation, %status, "Telemetry event sent"),
            Err(e) => warn!(%operation, "Failed to send telemetry: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;
    use test_log::test;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    #[test]
    fn credentials_are_stripped() {
        let props = json!({
            "vcd": {"host": "h", "password": "p"},
            "apiToken": "t",
            "legacy_mode": false
        });
        let clean = sanitize(props.as_object().expect("object"));
        assert_eq!(
            Value::Object(clean),
            json!({"vcd": {"host": "h"}, "legacy_mode": false})
        );
    }

    #[test(tokio::test)]
    async fn event_is_posted_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "operation": "SERVICE_INSTALL",
                "status": "FAILED",
                "instance_id": "i-1"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = TelemetryClient::new(&TelemetryConfig {
            enable: true,
            vac_url: Some(server.uri()),
            instance_id: Some("i-1".into()),
        });
        client
            .record(CseOperation::ServiceInstall, OperationStatus::Failed)
            .await;
    }

    #[test(tokio::test)]
    async fn upload_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let client = TelemetryClient::new(&TelemetryConfig {
            enable: true,
            vac_url: Some(server.uri()),
            instance_id: None,
        });
        client
            .record(CseOperation::OvdcUpdate, OperationStatus::Success)
            .await;
        assert!(client.is_enabled());
        assert!(!TelemetryClient::disabled().is_enabled());
    }
}
