use std::time::Duration;

use url::Url;

use crate::domain::{BenchmarkConfig, Command};
use crate::error::{AppError, AppResult, LifecycleError};

/// Header marking a request another agent already forwarded once.
pub(crate) const FORWARDED_HEADER: &str = "x-benchmesh-forwarded";

/// Raw answer of a control endpoint.
#[derive(Debug, Clone)]
pub struct ControlReply {
    pub status: u16,
    pub body: String,
}

impl ControlReply {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// HTTP client for another agent's control server.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
}

impl ControlClient {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// Sends `command` to the agent at `base`.
    ///
    /// # Errors
    ///
    /// Returns `LeaderUnreachable` when the request cannot be delivered.
    pub async fn command(
        &self,
        base: &str,
        command: Command,
        config: Option<&BenchmarkConfig>,
        forwarded: bool,
    ) -> AppResult<ControlReply> {
        let url = endpoint(base, &format!("v1/{}", command))?;
        let mut request = self.http.post(url);
        if let Some(config) = config {
            request = request.json(config);
        }
        if forwarded {
            request = request.header(FORWARDED_HEADER, "1");
        }
        self.send(base, request).await
    }

    /// # Errors
    ///
    /// Returns `LeaderUnreachable` when the request cannot be delivered.
    pub async fn status(&self, base: &str) -> AppResult<ControlReply> {
        let url = endpoint(base, "v1/status")?;
        self.send(base, self.http.get(url)).await
    }

    async fn send(&self, base: &str, request: reqwest::RequestBuilder) -> AppResult<ControlReply> {
        let unreachable = |err: reqwest::Error| {
            AppError::lifecycle(LifecycleError::LeaderUnreachable {
                addr: base.to_owned(),
                reason: err.to_string(),
            })
        };
        let response = request.send().await.map_err(unreachable)?;
        let status = response.status();
        let body = response.text().await.map_err(unreachable)?;
        Ok(ControlReply {
            status: status.as_u16(),
            body: if body.is_empty() {
                status.canonical_reason().unwrap_or_default().to_owned()
            } else {
                body
            },
        })
    }
}

/// `base` may be `host:port` or a full `http://` URL.
fn endpoint(base: &str, path: &str) -> AppResult<Url> {
    let invalid = |reason: String| {
        AppError::lifecycle(LifecycleError::LeaderUnreachable {
            addr: base.to_owned(),
            reason,
        })
    };
    let with_scheme = if base.contains("://") {
        base.to_owned()
    } else {
        format!("http://{}", base)
    };
    let root = Url::parse(&with_scheme).map_err(|err| invalid(err.to_string()))?;
    root.join(path).map_err(|err| invalid(err.to_string()))
}
