//! Dispatch targets for identity allocation. The legacy endpoint family and
//! the function-based endpoint are opaque services; this module only speaks
//! their request/response contract.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::MigrationError;
use crate::model::{Identity, Pathway};

#[async_trait]
pub trait AllocationPathway: Send + Sync {
    fn id(&self) -> Pathway;

    /// Advisory availability as seen by the pathway itself.
    async fn check(&self, username: &str) -> Result<bool, MigrationError>;

    /// Completes allocation of an identity whose username is already reserved.
    async fn create(&self, identity: &Identity) -> Result<(), MigrationError>;
}

/// Pathway with no remote side: the shared ledger reservation is the allocation.
#[derive(Clone, Copy, Debug)]
pub struct LocalPathway(pub Pathway);

#[async_trait]
impl AllocationPathway for LocalPathway {
    fn id(&self) -> Pathway {
        self.0
    }

    async fn check(&self, _username: &str) -> Result<bool, MigrationError> {
        Ok(true)
    }

    async fn create(&self, _identity: &Identity) -> Result<(), MigrationError> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointRequest<'a> {
    op: &'a str,
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
struct EndpointResponse {
    ok: bool,
    #[serde(default)]
    available: Option<bool>,
    #[serde(default)]
    identity: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// JSON-over-HTTP endpoint: `{op, username, displayName?, userId?}` in,
/// `{ok, available?, identity?}` out. 409 is a conflict; other 4xx and
/// `ok:false` are refusals. Transport errors, timeouts and 5xx are `Upstream`
/// because the endpoint may already have acted.
#[derive(Clone)]
pub struct HttpPathway {
    pathway: Pathway,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPathway {
    pub fn new(
        pathway: Pathway,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, MigrationError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("idshift/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout.min(Duration::from_secs(3)))
            .timeout(timeout)
            .build()
            .map_err(|e| MigrationError::Config(format!("http client: {e}")))?;
        Ok(Self {
            pathway,
            endpoint: endpoint.into(),
            client,
        })
    }

    fn upstream(&self, message: impl Into<String>) -> MigrationError {
        MigrationError::Upstream {
            pathway: self.pathway,
            message: message.into(),
        }
    }

    fn refused(&self, message: impl Into<String>) -> MigrationError {
        MigrationError::Rejected {
            pathway: self.pathway,
            message: message.into(),
        }
    }

    async fn call(&self, req: &EndpointRequest<'_>) -> Result<EndpointResponse, MigrationError> {
        debug!(pathway = %self.pathway, op = req.op, username = req.username, "calling identity endpoint");
        let resp = self
            .client
            .post(&self.endpoint)
            .json(req)
            .send()
            .await
            .map_err(|e| self.upstream(e.to_string()))?;
        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Err(MigrationError::Conflict(req.username.to_string()));
        }
        if status.is_client_error() {
            return Err(self.refused(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(self.upstream(format!("HTTP {status}")));
        }
        let body: EndpointResponse = resp
            .json()
            .await
            .map_err(|e| self.upstream(format!("malformed response: {e}")))?;
        if !body.ok {
            let detail = body.error.as_deref().unwrap_or("endpoint reported ok:false");
            return Err(self.refused(detail.to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl AllocationPathway for HttpPathway {
    fn id(&self) -> Pathway {
        self.pathway
    }

    async fn check(&self, username: &str) -> Result<bool, MigrationError> {
        let body = self
            .call(&EndpointRequest {
                op: "check",
                username,
                display_name: None,
                user_id: None,
            })
            .await?;
        body.available
            .ok_or_else(|| self.upstream("check response missing `available`"))
    }

    async fn create(&self, identity: &Identity) -> Result<(), MigrationError> {
        let body = self
            .call(&EndpointRequest {
                op: "create",
                username: &identity.username,
                display_name: Some(&identity.display_name),
                user_id: Some(&identity.owner_id),
            })
            .await?;
        let echoed = body
            .identity
            .as_ref()
            .and_then(|v| v.get("username"))
            .and_then(Value::as_str);
        if let Some(echoed) = echoed {
            if echoed != identity.username {
                return Err(self.upstream(format!(
                    "endpoint allocated `{echoed}` instead of `{}`",
                    identity.username
                )));
            }
        }
        debug!(
            pathway = %self.pathway,
            username = %identity.username,
            confirmed = echoed.is_some(),
            "identity endpoint allocated"
        );
        Ok(())
    }
}
