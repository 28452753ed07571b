use core::error::Error;
use std::sync::Arc;

use api_types::RequestEnvelope;
use api_types::ResponseEnvelope;
use derive_more::Display;
use error_stack::Report;
use poem::get;
use poem::handler;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::web::Data;
use poem::web::Json;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use serde_json::json;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::handlers::dispatch;
use super::handlers::ServerState;

#[derive(Debug, Display)]
pub enum ListenerError {
    #[display("HTTP listener on {addr} failed: {message}")]
    Serve { addr: String, message: String },
}

impl Error for ListenerError {}

#[handler]
async fn handle_request(
    Data(state): Data<&Arc<ServerState>>,
    Json(request): Json<RequestEnvelope>,
) -> Json<ResponseEnvelope> {
    Json(dispatch(state, request).await)
}

#[handler]
fn health(Data(state): Data<&Arc<ServerState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "enabled": state.server_config.is_enabled(),
    }))
}

/// `POST /api/v1/requests` takes the envelope vCD would put on the
/// extension bus and answers with the response envelope.
pub fn routes(state: Arc<ServerState>) -> impl Endpoint {
    Route::new()
        .at("/api/v1/requests", post(handle_request))
        .at("/api/v1/health", get(health))
        .data(state)
        .with(Tracing)
}

/// Listener for request envelopes.
pub struct RequestListener {
    state: Arc<ServerState>,
    listen_addr: String,
}

impl RequestListener {
    pub fn new(state: Arc<ServerState>, listen_addr: impl Into<String>) -> Self {
        Self {
            state,
            listen_addr: listen_addr.into(),
        }
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Report<ListenerError>> {
        info!("Listening for CSE requests on {}", self.listen_addr);
        let app = routes(self.state);
        let server = Server::new(TcpListener::bind(self.listen_addr.clone()));

        tokio::select! {
            result = server.run(app) => match result {
                Ok(()) => {
                    info!("Request listener stopped");
                    Ok(())
                }
                Err(e) => {
                    error!("Request listener failed: {e}");
                    Err(Report::new(ListenerError::Serve {
                        addr: self.listen_addr,
                        message: e.to_string(),
                    }))
                }
            },
            _ = shutdown.cancelled() => {
                info!("Request listener shutdown requested");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use similar_asserts::assert_eq;
    use vcd_client::ClientConfig;
    use vcd_client::Credentials;

    use super::*;
    use crate::context::ContextFactory;
    use crate::server_config::ServerConfig;
    use crate::tasks::TaskRunner;
    use crate::telemetry::TelemetryClient;
    use crate::util::keyed_lock::KeyedAsyncLock;

    fn client() -> TestClient<impl Endpoint> {
        let state = ServerState {
            contexts: ContextFactory::new(
                ClientConfig::new("http://127.0.0.1:9"),
                Credentials::system("administrator", "pw"),
            ),
            server_config: Arc::new(ServerConfig::new(json!({"service": {"enabled": true}}))),
            runner: Arc::new(TaskRunner::new(1)),
            locks: Arc::new(KeyedAsyncLock::new()),
            telemetry: TelemetryClient::disabled(),
            legacy_mode: false,
            enforce_authorization: false,
        };
        TestClient::new(routes(Arc::new(state)))
    }

    #[tokio::test]
    async fn envelope_round_trip() {
        let resp = client()
            .post("/api/v1/requests")
            .body_json(&json!({
                "id": "req-7",
                "method": "GET",
                "requestUri": "/api/cse/system",
            }))
            .send()
            .await;
        resp.assert_status_is_ok();
        let envelope: ResponseEnvelope = resp.json().await.value().deserialize();
        assert_eq!(envelope.id, "req-7");
        assert_eq!(envelope.status_code, 200);
        assert_eq!(envelope.body["enabled"], true);
    }

    #[tokio::test]
    async fn unknown_path_is_an_error_envelope() {
        let resp = client()
            .post("/api/v1/requests")
            .body_json(&json!({"method": "GET", "requestUri": "/api/cse/unknown"}))
            .send()
            .await;
        resp.assert_status_is_ok();
        let envelope: ResponseEnvelope = resp.json().await.value().deserialize();
        assert_eq!(envelope.status_code, 404);
        assert_eq!(envelope.body["minorErrorCode"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn malformed_envelope_is_rejected() {
        let resp = client()
            .post("/api/v1/requests")
            .body_json(&json!({"id": "x"}))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_enabled_flag() {
        let resp = client().get("/api/v1/health").send().await;
        resp.assert_status_is_ok();
        resp.assert_json(json!({"status": "ok", "enabled": true})).await;
    }
}
