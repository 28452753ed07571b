//! Per-request vCD sessions.

use std::sync::Arc;

use error_stack::ResultExt;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;
use vcd_client::ClientConfig;
use vcd_client::Credentials;
use vcd_client::VcdClient;
use vcd_client::VcdError;
use vcd_client::VcdResult;

/// Opens sysadmin sessions for incoming requests.
#[derive(Debug, Clone)]
pub struct ContextFactory {
    config: Arc<ClientConfig>,
    credentials: Arc<Credentials>,
}

impl ContextFactory {
    pub fn new(config: ClientConfig, credentials: Credentials) -> Self {
        Self {
            config: Arc::new(config),
            credentials: Arc::new(credentials),
        }
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.config
    }

    /// Logs in as sysadmin and, when the caller forwarded a token, wraps
    /// it in a second client acting as that user.
    pub async fn open(&self, user_token: Option<&str>) -> VcdResult<OperationContext> {
        let sysadmin = VcdClient::login((*self.config).clone(), &self.credentials).await?;
        let user = match user_token {
            Some(token) => Some(
                VcdClient::new((*self.config).clone())
                    .change_context(VcdError::Configuration {
                        message: "user client".into(),
                    })?
                    .with_token(token),
            ),
            None => None,
        };
        Ok(OperationContext::new(sysadmin, user))
    }
}

/// Sessions used while serving one request, including its background work.
///
/// Must be closed with [`OperationContext::end`] once the work is done.
#[derive(Debug)]
pub struct OperationContext {
    id: Uuid,
    sysadmin: VcdClient,
    user: Option<VcdClient>,
}

impl OperationContext {
    pub fn new(sysadmin: VcdClient, user: Option<VcdClient>) -> Self {
        let id = Uuid::new_v4();
        debug!(%id, "Opened operation context");
        Self { id, sysadmin, user }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sysadmin_client(&self) -> &VcdClient {
        &self.sysadmin
    }

    /// The caller's client, falling back to sysadmin when no token was
    /// forwarded.
    pub fn client(&self) -> &VcdClient {
        self.user.as_ref().unwrap_or(&self.sysadmin)
    }

    /// Ends the sysadmin session. The user session belongs to vCD.
    pub async fn end(self) {
        if let Err(e) = self.sysadmin.logout().await {
            warn!(id = %self.id, "Failed to end sysadmin session: {e:?}");
        }
        debug!(id = %self.id, "Closed operation context");
    }
}
