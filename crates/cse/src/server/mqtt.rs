//! Consumer for requests vCD publishes on the extension's MQTT topics.
//!
//! vCD wraps each forwarded API call in an `API_REQUEST` message on the
//! `.../ext` topic; the answer goes back as an `API_RESPONSE` on the
//! `.../vcd` topic, correlated by `requestId`. Both HTTP halves are carried
//! base64 encoded.

use core::error::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::RequestEnvelope;
use api_types::ResponseEnvelope;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use rumqttc::Transport;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::handlers::dispatch;
use super::handlers::ServerState;
use crate::config::schema::MqttConfig;
use crate::config::schema::VcdConfig;
use crate::install::extension::CSE_SERVICE_NAME;
use crate::install::extension::CSE_VENDOR;
use crate::install::extension::MQTT_EXTENSION_VERSION;

const MQTT_CONNECT_PATH: &str = "/messaging/mqtt";
const API_REQUEST: &str = "API_REQUEST";
const API_RESPONSE: &str = "API_RESPONSE";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum BusError {
    #[display("MQTT token missing from the config, run 'cse install' first")]
    MissingToken,

    #[display("Malformed MQTT message: {message}")]
    Malformed { message: String },

    #[display("MQTT {operation} failed")]
    Client { operation: String },
}

impl Error for BusError {}

pub type BusResult<T> = Result<T, Report<BusError>>;

fn malformed(message: impl Into<String>) -> BusError {
    BusError::Malformed {
        message: message.into(),
    }
}

/// `(listen, respond)` topics of the CSE extension.
pub fn topics() -> (String, String) {
    let base = format!("topic/extension/{CSE_VENDOR}/{CSE_SERVICE_NAME}/{MQTT_EXTENSION_VERSION}");
    (format!("{base}/ext"), format!("{base}/vcd"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    http_request: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequest {
    method: String,
    request_uri: String,
    #[serde(default)]
    query_string: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    headers: BTreeMap<String, String>,
    http_response: HttpResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpResponse {
    status_code: u16,
    headers: BTreeMap<String, String>,
    body: String,
}

fn header_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.first().map(header_text).unwrap_or_default(),
        other => other.to_string(),
    }
}

/// Base64 text holding JSON, plain JSON text, or an inline value.
fn decode_json(value: Value, what: &str) -> BusResult<Value> {
    let Value::String(text) = value else {
        return Ok(value);
    };
    if text.is_empty() {
        return Ok(Value::Null);
    }
    let bytes = STANDARD.decode(text.trim()).unwrap_or_else(|_| text.clone().into_bytes());
    serde_json::from_slice(&bytes).change_context_lazy(|| malformed(format!("{what} is not JSON")))
}

/// Turns an `API_REQUEST` payload into the envelope handlers take.
pub fn decode_request(payload: &[u8]) -> BusResult<RequestEnvelope> {
    let message: IncomingMessage =
        serde_json::from_slice(payload).change_context_lazy(|| malformed("payload is not a JSON message"))?;
    if message.kind != API_REQUEST {
        return Err(Report::new(malformed(format!("unexpected message type {}", message.kind))));
    }
    let id = message
        .headers
        .get("requestId")
        .map(header_text)
        .ok_or_else(|| Report::new(malformed("message has no requestId")))?;
    let http: HttpRequest = serde_json::from_value(decode_json(message.http_request, "httpRequest")?)
        .change_context_lazy(|| malformed("httpRequest lacks method or requestUri"))?;

    Ok(RequestEnvelope {
        id,
        method: http.method,
        request_uri: http.request_uri,
        query_string: http.query_string.unwrap_or_default(),
        headers: http
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), header_text(v)))
            .collect(),
        body: decode_json(http.body, "request body")?,
    })
}

/// Wraps a response envelope in an `API_RESPONSE` message.
pub fn encode_response(response: &ResponseEnvelope) -> BusResult<Vec<u8>> {
    let body = serde_json::to_vec(&response.body).change_context_lazy(|| malformed("response body"))?;
    let mut headers = response.headers.clone();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert("Content-Length".to_string(), body.len().to_string());

    let message = OutgoingMessage {
        kind: API_RESPONSE,
        headers: BTreeMap::from([("requestId".to_string(), response.id.clone())]),
        http_response: HttpResponse {
            status_code: response.status_code,
            headers,
            body: STANDARD.encode(body),
        },
    };
    serde_json::to_vec(&message).change_context_lazy(|| malformed("response message"))
}

/// Consumes the extension's request topic until shutdown.
pub struct BusListener {
    state: Arc<ServerState>,
    options: MqttOptions,
}

impl BusListener {
    pub fn new(state: Arc<ServerState>, vcd: &VcdConfig, mqtt: &MqttConfig) -> BusResult<Self> {
        let token = mqtt.token.clone().ok_or_else(|| Report::new(BusError::MissingToken))?;
        let token_id = mqtt.token_id.clone().unwrap_or_else(|| CSE_SERVICE_NAME.to_string());
        let url = format!("{}{MQTT_CONNECT_PATH}", vcd.base_url().replacen("https://", "wss://", 1));
        if !mqtt.verify_ssl {
            warn!("mqtt.verify_ssl is off, but the MQTT connection still verifies the vCD certificate");
        }

        let mut options = MqttOptions::new(format!("{CSE_SERVICE_NAME}-{}", uuid::Uuid::new_v4()), url, vcd.port);
        options
            .set_transport(Transport::wss_with_default_config())
            .set_credentials(token_id, token)
            .set_keep_alive(KEEP_ALIVE);
        Ok(Self { state, options })
    }

    /// Serves until `shutdown` is cancelled. Connection errors are retried.
    pub async fn run(self, shutdown: CancellationToken) -> BusResult<()> {
        let (listen_topic, respond_topic) = topics();
        let (client, mut events) = AsyncClient::new(self.options, CHANNEL_CAPACITY);
        client
            .subscribe(&listen_topic, QoS::AtLeastOnce)
            .await
            .change_context(BusError::Client {
                operation: format!("subscribe to {listen_topic}"),
            })?;
        info!(topic = %listen_topic, "Listening for CSE requests on MQTT");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let state = Arc::clone(&self.state);
                    let client = client.clone();
                    let respond_topic = respond_topic.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_message(&state, &client, &respond_topic, &publish.payload).await {
                            error!("Failed to answer MQTT request: {e:?}");
                        }
                    });
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to the vCD message bus");
                    // a clean session forgets the subscription
                    if let Err(e) = client.try_subscribe(&listen_topic, QoS::AtLeastOnce) {
                        warn!("Failed to renew MQTT subscription: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {e}, retrying in {RECONNECT_DELAY:?}");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        info!("MQTT listener shutdown requested");
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }
        Ok(())
    }
}

async fn handle_message(
    state: &ServerState,
    client: &AsyncClient,
    respond_topic: &str,
    payload: &[u8],
) -> BusResult<()> {
    let request = decode_request(payload)?;
    debug!(id = %request.id, method = %request.method, uri = %request.request_uri, "MQTT request");
    let response = dispatch(state, request).await;
    let message = encode_response(&response)?;
    client
        .publish(respond_topic, QoS::AtLeastOnce, false, message)
        .await
        .change_context(BusError::Client {
            operation: format!("publish to {respond_topic}"),
        })
}
