//! Authenticated JSON client for vCD's cloudapi and legacy API.

use std::sync::Arc;

use api_types::Page;
use api_types::QueryRecords;
use async_stream::try_stream;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use reqwest::header::ACCEPT;
use reqwest::header::AUTHORIZATION;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::LOCATION;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use utils::logging::WIRE_TARGET;

use crate::config::ClientConfig;
use crate::config::CLOUDAPI_V1;
use crate::error::VcdError;
use crate::error::VcdResult;

const ACCESS_TOKEN_HEADER: &str = "x-vmware-vcloud-access-token";

/// Login credentials. `org` is `System` for the provider.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub org: String,
    pub password: String,
}

impl Credentials {
    pub fn system(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            org: "System".to_string(),
            password: password.into(),
        }
    }

    fn is_provider(&self) -> bool {
        self.org.eq_ignore_ascii_case("system")
    }
}

/// Raw response of a vCD call.
#[derive(Debug, Clone)]
pub struct VcdResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: Value,
}

impl VcdResponse {
    /// Href of the task tracking an asynchronous operation, if any.
    ///
    /// Legacy API calls return the task document (or an entity carrying
    /// `tasks.task[]`), cloudapi calls answer 202 with a `Location` header.
    pub fn task_href(&self) -> Option<String> {
        let body_href = |v: &Value| v.get("href").and_then(Value::as_str).map(str::to_string);

        if self.body.get("status").is_some_and(Value::is_string)
            && self
                .body
                .get("href")
                .and_then(Value::as_str)
                .is_some_and(|h| h.contains("/task/"))
        {
            return body_href(&self.body);
        }
        if let Some(task) = self
            .body
            .pointer("/tasks/task/0")
            .and_then(|t| body_href(t))
        {
            return Some(task);
        }
        self.location.clone().filter(|l| l.contains("/task/"))
    }

    /// Deserialize the body.
    pub fn json<T: DeserializeOwned>(self) -> VcdResult<T> {
        serde_json::from_value(self.body).change_context(VcdError::Serialization {
            message: "Failed to deserialize vCD response".into(),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VcdErrorBody {
    #[serde(default)]
    message: String,
}

/// vCD client bound to one session.
#[derive(Clone)]
pub struct VcdClient {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
    token: Option<Arc<str>>,
}

impl std::fmt::Debug for VcdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcdClient")
            .field("host", &self.config.host)
            .field("api_version", &self.config.api_version)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl VcdClient {
    /// create an unauthenticated client
    pub fn new(config: ClientConfig) -> VcdResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .change_context(VcdError::Configuration {
                message: "Failed to create HTTP client".into(),
            })?;

        Ok(Self {
            config: Arc::new(config),
            http,
            token: None,
        })
    }

    /// Reuse an existing bearer token, e.g. the one vCD forwarded with a
    /// tenant request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token: String = token.into();
        self.token = Some(Arc::from(token.as_str()));
        self
    }

    /// Log in and return an authenticated client.
    pub async fn login(config: ClientConfig, credentials: &Credentials) -> VcdResult<Self> {
        let client = Self::new(config)?;
        let path = if credentials.is_provider() {
            "sessions/provider"
        } else {
            "sessions"
        };
        let url = client.cloudapi_url(CLOUDAPI_V1, path);

        let response = client
            .http
            .post(&url)
            .header(ACCEPT, client.accept_header(&url))
            .basic_auth(
                format!("{}@{}", credentials.username, credentials.org),
                Some(&credentials.password),
            )
            .send()
            .await
            .change_context(VcdError::Network {
                message: format!("Failed to reach {url}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Report::new(VcdError::Authentication {
                message: format!(
                    "login as {}@{} returned {status}",
                    credentials.username, credentials.org
                ),
            }));
        }

        let token = response
            .headers()
            .get(ACCESS_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Report::new(VcdError::Authentication {
                    message: "login response carried no access token".into(),
                })
            })?
            .to_string();

        info!(
            host = %client.config.host,
            user = %credentials.username,
            org = %credentials.org,
            "Logged in to vCD"
        );
        Ok(client.with_token(token))
    }

    /// End the session.
    pub async fn logout(&self) -> VcdResult<()> {
        if self.token.is_none() {
            return Ok(());
        }
        let url = self.cloudapi_url(CLOUDAPI_V1, "sessions/current");
        self.send(Method::DELETE, &url, None).await?;
        debug!(host = %self.config.host, "Logged out of vCD");
        Ok(())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// `{host}/cloudapi/{version}/{path}`
    pub fn cloudapi_url(&self, version: &str, path: &str) -> String {
        format!(
            "{}/cloudapi/{version}/{}",
            self.config.host,
            path.trim_start_matches('/')
        )
    }

    /// `{host}/api/{path}`
    pub fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.config.host, path.trim_start_matches('/'))
    }

    fn accept_header(&self, url: &str) -> String {
        if url.contains("/cloudapi/") {
            format!("application/json;version={}", self.config.api_version)
        } else {
            format!("application/*+json;version={}", self.config.api_version)
        }
    }

    fn headers(&self, url: &str) -> VcdResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let invalid = || VcdError::Configuration {
            message: "invalid header value".into(),
        };
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&self.accept_header(url)).change_context_lazy(invalid)?,
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(token) = &self.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).change_context_lazy(invalid)?,
            );
        }
        Ok(headers)
    }

    /// Issue a request and return the raw response. Non-2xx statuses become
    /// [`VcdError::Http`].
    pub async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> VcdResult<VcdResponse> {
        if self.config.log_wire {
            debug!(target: WIRE_TARGET, %method, %url, body = ?body, "request");
        }

        let mut request = self
            .http
            .request(method.clone(), url)
            .headers(self.headers(url)?);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.change_context(VcdError::Network {
            message: format!("{method} {url} failed"),
        })?;

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await.change_context(VcdError::Network {
            message: format!("Failed to read response body of {method} {url}"),
        })?;

        if self.config.log_wire {
            debug!(target: WIRE_TARGET, %method, %url, status = status.as_u16(), body = %text, "response");
        }

        if !status.is_success() {
            let message = serde_json::from_str::<VcdErrorBody>(&text)
                .map(|b| b.message)
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or(text);
            return Err(Report::new(VcdError::Http {
                status: status.as_u16(),
                message,
            })
            .attach_printable(format!("{method} {url}")));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).change_context(VcdError::Serialization {
                message: format!("{method} {url} returned invalid JSON"),
            })?
        };

        Ok(VcdResponse {
            status: status.as_u16(),
            location,
            body,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> VcdResult<T> {
        self.send(Method::GET, url, None).await?.json()
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> VcdResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = to_value(body)?;
        self.send(Method::POST, url, Some(&body)).await?.json()
    }

    pub async fn put_json<B, T>(&self, url: &str, body: &B) -> VcdResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = to_value(body)?;
        self.send(Method::PUT, url, Some(&body)).await?.json()
    }

    /// POST returning the raw response, for calls that answer with a task.
    pub async fn post<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> VcdResult<VcdResponse> {
        let body = to_value(body)?;
        self.send(Method::POST, url, Some(&body)).await
    }

    /// PUT returning the raw response, for calls that answer with a task.
    pub async fn put<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> VcdResult<VcdResponse> {
        let body = to_value(body)?;
        self.send(Method::PUT, url, Some(&body)).await
    }

    pub async fn delete(&self, url: &str) -> VcdResult<VcdResponse> {
        self.send(Method::DELETE, url, None).await
    }

    /// Upload raw bytes to a transfer URL handed out by vCD (OVF descriptor
    /// and disk uploads).
    pub async fn put_bytes(&self, url: &str, bytes: Vec<u8>) -> VcdResult<()> {
        let len = bytes.len();
        let mut request = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.change_context(VcdError::Network {
            message: format!("upload to {url} failed"),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Report::new(VcdError::Http {
                status: status.as_u16(),
                message: format!("upload of {len} bytes rejected"),
            })
            .attach_printable(format!("PUT {url}")));
        }
        debug!(%url, bytes = len, "Uploaded file");
        Ok(())
    }

    /// Stream every item of a cloudapi collection, one page at a time,
    /// until a page with an empty `values` array is returned.
    ///
    /// Query values must already be encoded.
    pub fn paginate<T>(
        &self,
        url: String,
        query: Vec<(String, String)>,
    ) -> impl Stream<Item = VcdResult<T>> + '_
    where
        T: DeserializeOwned + 'static,
    {
        try_stream! {
            let mut page: u64 = 1;
            loop {
                let mut params = query.clone();
                params.push(("page".to_string(), page.to_string()));
                params.push(("pageSize".to_string(), self.config.page_size.to_string()));
                let target = with_query(&url, &params);

                let body: Page<T> = self.get_json(&target).await?;
                if body.values.is_empty() {
                    break;
                }
                for item in body.values {
                    yield item;
                }
                page += 1;
            }
        }
    }

    /// Stream the records of a legacy typed query (`/api/query?type=...`).
    pub fn query_records<T>(
        &self,
        query_type: &str,
        filter: Option<String>,
    ) -> impl Stream<Item = VcdResult<T>> + '_
    where
        T: DeserializeOwned + 'static,
    {
        let url = self.api_url("query");
        let mut base = vec![
            ("type".to_string(), query_type.to_string()),
            ("format".to_string(), "records".to_string()),
        ];
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            base.push(("filter".to_string(), filter));
        }

        try_stream! {
            let page_size = u64::from(self.config.page_size);
            let mut page: u64 = 1;
            loop {
                let mut params = base.clone();
                params.push(("page".to_string(), page.to_string()));
                params.push(("pageSize".to_string(), page_size.to_string()));
                let target = with_query(&url, &params);

                let body: QueryRecords<T> = self.get_json(&target).await?;
                let received = body.record.len() as u64;
                for item in body.record {
                    yield item;
                }
                if received == 0 || page * page_size >= body.total {
                    break;
                }
                page += 1;
            }
        }
    }
}

fn to_value<B: Serialize + ?Sized>(body: &B) -> VcdResult<Value> {
    serde_json::to_value(body).change_context(VcdError::Serialization {
        message: "Failed to serialize request body".into(),
    })
}

/// Appends pre-encoded query parameters to a URL.
pub fn with_query(url: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn with_query_appends_with_correct_separator() {
        let params = vec![("page".to_string(), "1".to_string())];
        assert_eq!(with_query("https://h/x", &params), "https://h/x?page=1");
        assert_eq!(
            with_query("https://h/x?a=b", &params),
            "https://h/x?a=b&page=1"
        );
        assert_eq!(with_query("https://h/x", &[]), "https://h/x");
    }

    #[test]
    fn task_href_from_task_body() {
        let response = VcdResponse {
            status: 202,
            location: None,
            body: json!({"href": "https://vcd/api/task/42", "status": "running"}),
        };
        assert_eq!(
            response.task_href().as_deref(),
            Some("https://vcd/api/task/42")
        );
    }

    #[test]
    fn task_href_from_embedded_tasks() {
        let response = VcdResponse {
            status: 201,
            location: None,
            body: json!({
                "href": "https://vcd/api/vApp/vapp-1",
                "tasks": {"task": [{"href": "https://vcd/api/task/7", "status": "queued"}]}
            }),
        };
        assert_eq!(
            response.task_href().as_deref(),
            Some("https://vcd/api/task/7")
        );
    }

    #[test]
    fn task_href_from_location_header() {
        let response = VcdResponse {
            status: 202,
            location: Some("https://vcd/api/task/9".to_string()),
            body: Value::Null,
        };
        assert_eq!(
            response.task_href().as_deref(),
            Some("https://vcd/api/task/9")
        );

        let response = VcdResponse {
            status: 201,
            location: Some("https://vcd/cloudapi/1.0.0/entities/1".to_string()),
            body: Value::Null,
        };
        assert_eq!(response.task_href(), None);
    }

    #[test]
    fn urls_are_built_from_host() {
        let client = VcdClient::new(ClientConfig::new("https://vcd.local")).expect("client");
        assert_eq!(
            client.cloudapi_url("2.0.0", "/vdcComputePolicies"),
            "https://vcd.local/cloudapi/2.0.0/vdcComputePolicies"
        );
        assert_eq!(
            client.api_url("admin/vdc/1"),
            "https://vcd.local/api/admin/vdc/1"
        );
        assert!(!client.is_authenticated());
    }
}
