use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::RequestEnvelope;
use cse::config::parse_config;
use cse::config::sample::sample_config;
use cse::context::ContextFactory;
use cse::server::dispatch;
use cse::server::ServerState;
use cse::server_config::ServerConfig;
use cse::tasks::TaskRunner;
use cse::telemetry::TelemetryClient;
use cse::util::keyed_lock::KeyedAsyncLock;
use serde_json::json;
use similar_asserts::assert_eq;
use test_log::test;
use vcd_client::ClientConfig;
use vcd_client::Credentials;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

const CLUSTER_ID: &str = "urn:vcloud:entity:cse:nativeCluster:42";

async fn mount_sessions(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/cloudapi/1.0.0/sessions/provider"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-vmware-vcloud-access-token", "sysadmin-token")
                .set_body_json(json!({})),
        )
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/cloudapi/1.0.0/sessions/current"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

/// State built the way `cse run` builds it, against a mock vCD.
fn state(server: &MockServer) -> ServerState {
    let config = parse_config(&sample_config(false)).expect("sample config");
    let server_config = ServerConfig::from_serializable(&config.redacted()).expect("server config");
    ServerState {
        contexts: ContextFactory::new(
            ClientConfig::new(server.uri()),
            Credentials::system("administrator", "pw"),
        ),
        server_config: Arc::new(server_config),
        runner: Arc::new(TaskRunner::new(config.service.processors)),
        locks: Arc::new(KeyedAsyncLock::new()),
        telemetry: TelemetryClient::disabled(),
        legacy_mode: config.legacy_mode(),
        enforce_authorization: true,
    }
}

fn request(method: &str, uri: &str) -> RequestEnvelope {
    RequestEnvelope {
        id: "req-1".into(),
        method: method.into(),
        request_uri: uri.into(),
        headers: BTreeMap::from([(
            "x-vcloud-authorization".to_string(),
            "user-token".to_string(),
        )]),
        ..Default::default()
    }
}

#[test(tokio::test)]
async fn cluster_config_is_read_with_the_callers_token() {
    let server = MockServer::start().await;
    mount_sessions(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("/cloudapi/1.0.0/entities/{CLUSTER_ID}")))
        .and(header("authorization", "Bearer user-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": CLUSTER_ID,
            "name": "dev",
            "entityType": "urn:vcloud:type:cse:nativeCluster:2.0.0",
            "entity": {"status": {"phase": "CREATE:SUCCEEDED", "kubeconfig": "apiVersion: v1\n"}},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = dispatch(
        &state(&server),
        request("GET", &format!("/api/cse/3.0/cluster/{CLUSTER_ID}/config")),
    )
    .await;
    assert_eq!(response.id, "req-1");
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, json!("apiVersion: v1\n"));
}

#[test(tokio::test)]
async fn missing_cluster_is_not_found() {
    let server = MockServer::start().await;
    mount_sessions(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("/cloudapi/1.0.0/entities/{CLUSTER_ID}")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "no such entity"})))
        .mount(&server)
        .await;

    let response = dispatch(&state(&server), request("GET", &format!("/api/cse/cluster/{CLUSTER_ID}"))).await;
    assert_eq!(response.status_code, 404);
    assert_eq!(response.body["minorErrorCode"], "NOT_FOUND");
}

#[test(tokio::test)]
async fn failed_sysadmin_login_is_an_internal_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudapi/1.0.0/sessions/provider"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let response = dispatch(&state(&server), request("GET", "/api/cse/clusters")).await;
    assert_eq!(response.status_code, 500);
}

#[test(tokio::test)]
async fn system_info_reflects_the_loaded_config() {
    let server = MockServer::start().await;
    let response = dispatch(&state(&server), request("GET", "/api/cse/system")).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body["enabled"], true);
    assert_eq!(response.body["legacy_mode"], false);
}
