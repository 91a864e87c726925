use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::domain::{AgentStatus, BenchmarkConfig, Command, keys};
use crate::error::{AppError, AppResult, LifecycleError};
use crate::leader::{ClusterReport, CommandAck, LeaderCoordinator};
use crate::membership::{GroupMembership, MembershipView, StaticMembership};
use crate::metrics::{BenchmarkMetrics, MetricsDocument, MetricsPublisher, render_prometheus};
use crate::phase::PhaseGuard;
use crate::store::{StateStore, get_all_json};
use crate::system::ShutdownReceiver;

use super::client::{ControlClient, FORWARDED_HEADER};
use super::http::{
    HttpRequest, JSON_CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE, error_body, read_http_request,
    write_response,
};

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the control endpoints read from or act on.
pub struct ControlContext {
    pub coordinator: Arc<LeaderCoordinator>,
    pub membership: Arc<StaticMembership>,
    pub guard: Arc<PhaseGuard>,
    pub store: Arc<dyn StateStore>,
    pub publisher: MetricsPublisher,
    /// Used by `POST /v1/prepare` with an empty body.
    pub default_config: Option<BenchmarkConfig>,
    pub client: ControlClient,
}

/// Body of `GET /v1/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub agent: AgentStatus,
    pub leader: Option<String>,
    /// Present only when answered by the leader.
    pub cluster: Option<ClusterReport>,
}

struct Reply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: JSON_CONTENT_TYPE,
                body,
            },
            Err(err) => Self::error(500, &format!("Failed to encode response: {}", err)),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: JSON_CONTENT_TYPE,
            body: error_body(message),
        }
    }
}

/// Hand-rolled HTTP/1.1 control plane, one request per connection.
pub struct ControlServer {
    context: Arc<ControlContext>,
    read_timeout: Duration,
}

impl ControlServer {
    #[must_use]
    pub fn new(context: ControlContext) -> Self {
        Self {
            context: Arc::new(context),
            read_timeout: REQUEST_READ_TIMEOUT,
        }
    }

    /// Bound on how long a client may take to send its whole request.
    #[must_use]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn bind(addr: &str) -> AppResult<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        info!("Control server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts connections until shutdown.
    ///
    /// # Errors
    ///
    /// Never fails; accept errors are logged.
    pub async fn run(self, listener: TcpListener, mut shutdown_rx: ShutdownReceiver) -> AppResult<()> {
        loop {
            let (socket, peer) = tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Failed to accept control connection: {}", err);
                        continue;
                    }
                },
            };
            debug!("Control connection from {}", peer);
            let context = Arc::clone(&self.context);
            let read_timeout = self.read_timeout;
            tokio::spawn(async move {
                handle_connection(&context, socket, read_timeout).await;
            });
        }
        Ok(())
    }
}

async fn handle_connection(context: &ControlContext, mut socket: TcpStream, read_timeout: Duration) {
    let reply = match tokio::time::timeout(read_timeout, read_http_request(&mut socket)).await {
        Ok(Ok(request)) => route(context, &request).await,
        Ok(Err(err)) => Reply::error(err.status, &err.message),
        Err(_elapsed) => {
            debug!("Control client sent no complete request in {}ms", read_timeout.as_millis());
            Reply::error(408, "Request was not received in time")
        }
    };
    if let Err(err) = write_response(&mut socket, reply.status, reply.content_type, &reply.body).await
    {
        debug!("Control client went away: {}", err);
    }
}

async fn route(context: &ControlContext, request: &HttpRequest) -> Reply {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/v1/status") => status(context).await,
        ("GET", "/v1/metrics") => Reply::json(200, &context.publisher.document()),
        ("GET", "/metrics") => prometheus(&[context.publisher.snapshot()]),
        ("GET", "/metrics/cluster") => {
            let agents: Vec<BenchmarkMetrics> =
                get_all_json::<MetricsDocument>(context.store.as_ref(), keys::METRICS_PREFIX)
                    .await
                    .into_iter()
                    .map(|(document, _)| document.metrics)
                    .collect();
            prometheus(&agents)
        }
        ("PUT", "/v1/membership") => update_membership(context, &request.body),
        ("POST", path) => match path.strip_prefix("/v1/").map(str::parse::<Command>) {
            Some(Ok(command)) => dispatch(context, command, request).await,
            Some(Err(_)) | None => Reply::error(404, "Not found"),
        },
        _ => Reply::error(404, "Not found"),
    }
}

async fn dispatch(context: &ControlContext, command: Command, request: &HttpRequest) -> Reply {
    let config = if command != Command::Prepare {
        None
    } else if request.body.iter().all(u8::is_ascii_whitespace) {
        context.default_config.clone()
    } else {
        match serde_json::from_slice::<BenchmarkConfig>(&request.body) {
            Ok(config) => Some(config),
            Err(err) => return Reply::error(400, &format!("Invalid benchmark config: {}", err)),
        }
    };

    match context
        .coordinator
        .request_transition(command, config.clone())
        .await
    {
        Ok(ack) => Reply::json(200, &ack),
        Err(AppError::Lifecycle(LifecycleError::NotLeader { leader })) => {
            if request.headers.contains_key(FORWARDED_HEADER) {
                return Reply::error(503, &format!("Agent {} does not consider itself leader", leader));
            }
            forward(context, &leader, command, config.as_ref()).await
        }
        Err(AppError::Lifecycle(
            err @ (LifecycleError::InvalidTransition { .. }
            | LifecycleError::ConfigConflict { .. }
            | LifecycleError::MissingConfig),
        )) => {
            let target = context.coordinator.current_target().await;
            Reply::json(
                409,
                &CommandAck::rejected(target.phase, target.version, err.to_string()),
            )
        }
        Err(AppError::Lifecycle(err @ (LifecycleError::NoLeader | LifecycleError::LeaderBusy))) => {
            Reply::error(503, &err.to_string())
        }
        Err(err) => {
            warn!("{} failed: {}", command, err);
            Reply::error(500, &err.to_string())
        }
    }
}

async fn forward(
    context: &ControlContext,
    leader: &str,
    command: Command,
    config: Option<&BenchmarkConfig>,
) -> Reply {
    let Some(member) = context.membership.member(leader).await else {
        return Reply::error(503, &format!("Leader {} is not in the roster", leader));
    };
    debug!(
        "Forwarding {} to leader {} at {}",
        command, leader, member.control_addr
    );
    match context
        .client
        .command(&member.control_addr, command, config, true)
        .await
    {
        Ok(reply) => Reply {
            status: reply.status,
            content_type: JSON_CONTENT_TYPE,
            body: reply.body.into_bytes(),
        },
        Err(err) => Reply::error(503, &err.to_string()),
    }
}

async fn status(context: &ControlContext) -> Reply {
    let agent = context.guard.snapshot().await;
    let leader = context.membership.current_leader().await;
    let cluster = if context.membership.is_leader().await {
        match context.coordinator.aggregate_status().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!("Cluster status unavailable: {}", err);
                None
            }
        }
    } else {
        None
    };
    Reply::json(
        200,
        &StatusResponse {
            agent,
            leader,
            cluster,
        },
    )
}

fn prometheus(agents: &[BenchmarkMetrics]) -> Reply {
    match render_prometheus(agents) {
        Ok(text) => Reply {
            status: 200,
            content_type: PROMETHEUS_CONTENT_TYPE,
            body: text.into_bytes(),
        },
        Err(err) => Reply::error(500, &err.to_string()),
    }
}

fn update_membership(context: &ControlContext, body: &[u8]) -> Reply {
    let view = match serde_json::from_slice::<MembershipView>(body) {
        Ok(view) => view,
        Err(err) => return Reply::error(400, &format!("Invalid membership view: {}", err)),
    };
    match context.membership.update(view) {
        Ok(applied) => Reply::json(200, &applied),
        Err(err) => Reply::error(400, &err.to_string()),
    }
}
