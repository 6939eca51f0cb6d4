use std::sync::Arc;

use tonic::{Request, Response, Status as RpcStatus};

use vix_core::types::INDEX_NODE_ROLE;
use vix_observe::metricsinfo::{construct_component_name, parse_metric_type, SYSTEM_INFO_METRICS};
use vix_proto::v1::index_node_server::IndexNode as IndexNodeRpc;
use vix_proto::v1::{
    ComponentInfo, ComponentStates, CreateIndexRequest, ErrorCode, GetComponentStatesRequest,
    GetMetricsRequest, GetMetricsResponse, Status,
};

use crate::node::IndexNode;

/// The worker's RPC surface.
pub struct IndexNodeService {
    node: Arc<IndexNode>,
}

impl IndexNodeService {
    pub fn new(node: Arc<IndexNode>) -> Self {
        Self { node }
    }
}

fn failure(reason: impl Into<String>) -> Status {
    Status {
        error_code: ErrorCode::UnexpectedError as i32,
        reason: reason.into(),
    }
}

#[tonic::async_trait]
impl IndexNodeRpc for IndexNodeService {
    async fn create_index(
        &self,
        request: Request<CreateIndexRequest>,
    ) -> Result<Response<Status>, RpcStatus> {
        let req = request.into_inner();
        tracing::debug!(
            index_build_id = req.index_build_id,
            version = req.version,
            "CreateIndex"
        );
        Ok(Response::new(self.node.create_index(req)))
    }

    async fn get_component_states(
        &self,
        _request: Request<GetComponentStatesRequest>,
    ) -> Result<Response<ComponentStates>, RpcStatus> {
        Ok(Response::new(ComponentStates {
            state: Some(ComponentInfo {
                node_id: self.node.server_id(),
                role: INDEX_NODE_ROLE.to_string(),
                state_code: self.node.state() as i32,
            }),
            status: Some(Status {
                error_code: ErrorCode::Success as i32,
                reason: String::new(),
            }),
        }))
    }

    async fn get_metrics(
        &self,
        request: Request<GetMetricsRequest>,
    ) -> Result<Response<GetMetricsResponse>, RpcStatus> {
        let req = request.into_inner();
        let component_name = construct_component_name(INDEX_NODE_ROLE, self.node.server_id());

        if !self.node.is_healthy() {
            return Ok(Response::new(GetMetricsResponse {
                status: Some(failure(format!(
                    "worker {} is not healthy",
                    self.node.server_id()
                ))),
                response: String::new(),
                component_name,
            }));
        }

        let metric_type = match parse_metric_type(&req.request) {
            Ok(metric_type) => metric_type,
            Err(reason) => {
                return Ok(Response::new(GetMetricsResponse {
                    status: Some(failure(reason)),
                    response: String::new(),
                    component_name,
                }));
            }
        };
        if metric_type != SYSTEM_INFO_METRICS {
            return Ok(Response::new(GetMetricsResponse {
                status: Some(failure(format!(
                    "unimplemented metric type: {metric_type}"
                ))),
                response: String::new(),
                component_name,
            }));
        }

        match serde_json::to_string(&self.node.system_info()) {
            Ok(doc) => Ok(Response::new(GetMetricsResponse {
                status: Some(Status {
                    error_code: ErrorCode::Success as i32,
                    reason: String::new(),
                }),
                response: doc,
                component_name,
            })),
            Err(err) => Ok(Response::new(GetMetricsResponse {
                status: Some(failure(err.to_string())),
                response: String::new(),
                component_name,
            })),
        }
    }
}
