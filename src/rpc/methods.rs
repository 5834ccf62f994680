//! RPC method dispatch.
//!
//! Every method maps onto one `Orchestrator` operation. Engine errors are
//! returned with the application codes from `protocol`.

use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::orchestrator::DEFAULT_STATUS_LINES;
use crate::core::{NewTarget, Orchestrator, RegistryCounts, TargetId};

use super::protocol::{Request, Response};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub jobs: RegistryCounts,
    pub max_concurrent_jobs: usize,
    pub rpc_bind: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelResult {
    pub target_id: TargetId,
    pub cancelled: bool,
}

#[derive(Deserialize)]
struct TargetParams {
    target_id: TargetId,
}

#[derive(Deserialize)]
struct StatusParams {
    target_id: TargetId,
    #[serde(default)]
    lines: Option<usize>,
}

#[derive(Deserialize, Default)]
struct ActiveParams {
    #[serde(default)]
    lines: Option<usize>,
}

pub struct MethodHandler {
    orchestrator: Orchestrator,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id),
            "crawl.start" => self.crawl_start(id, params).await,
            "crawl.cancel" => self.crawl_cancel(id, params).await,
            "crawl.status" => self.crawl_status(id, params).await,
            "crawl.active" => self.crawl_active(id, params),
            "crawl.reset" => self.crawl_reset(id, params).await,
            "targets.add" => self.targets_add(id, params).await,
            _ => Response::method_not_found(id, &request.method),
        }
    }

    fn daemon_status(&self, id: Value) -> Response {
        let config = self.orchestrator.config();
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                jobs: self.orchestrator.counts(),
                max_concurrent_jobs: config.max_concurrent_jobs,
                rpc_bind: config.rpc_bind.to_string(),
            },
        )
    }

    async fn crawl_start(&self, id: Value, params: Value) -> Response {
        let params: TargetParams = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        match self.orchestrator.request_start(params.target_id).await {
            Ok(outcome) => Response::success(id, outcome),
            Err(e) => Response::crawl_error(id, &e),
        }
    }

    async fn crawl_cancel(&self, id: Value, params: Value) -> Response {
        let params: TargetParams = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        match self.orchestrator.request_cancel(params.target_id).await {
            Ok(cancelled) => Response::success(
                id,
                CancelResult {
                    target_id: params.target_id,
                    cancelled,
                },
            ),
            Err(e) => Response::crawl_error(id, &e),
        }
    }

    async fn crawl_status(&self, id: Value, params: Value) -> Response {
        let params: StatusParams = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        let lines = params.lines.unwrap_or(DEFAULT_STATUS_LINES);
        match self.orchestrator.query_status(params.target_id, lines).await {
            Ok(report) => Response::success(id, report),
            Err(e) => Response::crawl_error(id, &e),
        }
    }

    fn crawl_active(&self, id: Value, params: Value) -> Response {
        let params: ActiveParams = if params.is_null() {
            ActiveParams::default()
        } else {
            match parse(&id, params) {
                Ok(p) => p,
                Err(resp) => return resp,
            }
        };
        Response::success(id, self.orchestrator.list_active(params.lines.unwrap_or(0)))
    }

    async fn crawl_reset(&self, id: Value, params: Value) -> Response {
        let params: TargetParams = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        match self.orchestrator.request_reset(params.target_id).await {
            Ok(outcome) => Response::success(id, outcome),
            Err(e) => Response::crawl_error(id, &e),
        }
    }

    async fn targets_add(&self, id: Value, params: Value) -> Response {
        let new: NewTarget = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };
        match self.orchestrator.add_target(new).await {
            Ok(target) => Response::success(id, target),
            Err(e) => Response::crawl_error(id, &e),
        }
    }
}

fn parse<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}
