use std::sync::Arc;

use tonic::{Request, Response, Status as RpcStatus};

use vix_core::types::INDEX_COORD_ROLE;
use vix_proto::v1::coordinator_server::Coordinator;
use vix_proto::v1::{
    BuildIndexRequest, BuildIndexResponse, ComponentInfo, ComponentStates, DropIndexRequest,
    ErrorCode, GetComponentStatesRequest, GetIndexFilePathsRequest, GetIndexFilePathsResponse,
    GetIndexStatesRequest, GetIndexStatesResponse, GetMetricsRequest, GetMetricsResponse,
    IndexFilePathInfo, IndexStateInfo, Status,
};
use vix_wire::{ToWire, TryToCore};

use crate::coordinator::IndexCoord;
use crate::metrics_info::{self, SYSTEM_INFO_METRICS};

/// The coordinator's RPC surface. Business failures are carried in the
/// response status pair; a transport-level error never encodes one.
pub struct CoordinatorService {
    coord: Arc<IndexCoord>,
}

impl CoordinatorService {
    pub fn new(coord: Arc<IndexCoord>) -> Self {
        Self { coord }
    }

    /// Every RPC short-circuits while the coordinator is not `Healthy`.
    fn health_failure(&self) -> Option<Status> {
        if self.coord.is_healthy() {
            return None;
        }
        Some(failure(format!(
            "coordinator {} is not healthy (state {:?})",
            self.coord.id(),
            self.coord.state()
        )))
    }
}

fn success() -> Status {
    Status {
        error_code: ErrorCode::Success as i32,
        reason: String::new(),
    }
}

fn failure(reason: impl Into<String>) -> Status {
    Status {
        error_code: ErrorCode::UnexpectedError as i32,
        reason: reason.into(),
    }
}

#[tonic::async_trait]
impl Coordinator for CoordinatorService {
    async fn build_index(
        &self,
        request: Request<BuildIndexRequest>,
    ) -> Result<Response<BuildIndexResponse>, RpcStatus> {
        let req = request.into_inner();
        tracing::debug!(
            index_id = req.index_id,
            index_name = %req.index_name,
            data_paths = req.data_paths.len(),
            "BuildIndex"
        );

        if let Some(status) = self.health_failure() {
            return Ok(Response::new(BuildIndexResponse {
                status: Some(status),
                index_build_id: 0,
            }));
        }

        let core_req = match req.try_to_core() {
            Ok(core_req) => core_req,
            Err(err) => {
                return Ok(Response::new(BuildIndexResponse {
                    status: Some(failure(err.to_string())),
                    index_build_id: 0,
                }));
            }
        };

        match self.coord.build_index(core_req).await {
            Ok((index_build_id, deduplicated)) => Ok(Response::new(BuildIndexResponse {
                status: Some(Status {
                    error_code: ErrorCode::Success as i32,
                    reason: if deduplicated {
                        "already have same index".to_string()
                    } else {
                        String::new()
                    },
                }),
                index_build_id,
            })),
            Err(err) => Ok(Response::new(BuildIndexResponse {
                status: Some(failure(err.to_string())),
                index_build_id: 0,
            })),
        }
    }

    async fn get_index_states(
        &self,
        request: Request<GetIndexStatesRequest>,
    ) -> Result<Response<GetIndexStatesResponse>, RpcStatus> {
        let req = request.into_inner();
        if let Some(status) = self.health_failure() {
            return Ok(Response::new(GetIndexStatesResponse {
                status: Some(status),
                states: Vec::new(),
            }));
        }

        let states = self
            .coord
            .meta_table()
            .get_index_states(&req.index_build_ids)
            .into_iter()
            .map(|(index_build_id, state, reason)| IndexStateInfo {
                index_build_id,
                state: state.to_wire() as i32,
                reason,
            })
            .collect();

        Ok(Response::new(GetIndexStatesResponse {
            status: Some(success()),
            states,
        }))
    }

    async fn get_index_file_paths(
        &self,
        request: Request<GetIndexFilePathsRequest>,
    ) -> Result<Response<GetIndexFilePathsResponse>, RpcStatus> {
        let req = request.into_inner();
        if let Some(status) = self.health_failure() {
            return Ok(Response::new(GetIndexFilePathsResponse {
                status: Some(status),
                file_paths: Vec::new(),
            }));
        }

        let mut file_paths = Vec::with_capacity(req.index_build_ids.len());
        for id in req.index_build_ids {
            match self.coord.meta_table().get_index_file_path_info(id) {
                Ok(paths) => file_paths.push(IndexFilePathInfo {
                    index_build_id: id,
                    index_file_paths: paths,
                }),
                Err(err) => {
                    return Ok(Response::new(GetIndexFilePathsResponse {
                        status: Some(failure(err.to_string())),
                        file_paths: Vec::new(),
                    }));
                }
            }
        }

        Ok(Response::new(GetIndexFilePathsResponse {
            status: Some(success()),
            file_paths,
        }))
    }

    async fn drop_index(
        &self,
        request: Request<DropIndexRequest>,
    ) -> Result<Response<Status>, RpcStatus> {
        let req = request.into_inner();
        tracing::debug!(index_id = req.index_id, "DropIndex");
        if let Some(status) = self.health_failure() {
            return Ok(Response::new(status));
        }

        match self.coord.drop_index(req.index_id).await {
            Ok(()) => Ok(Response::new(success())),
            Err(err) => Ok(Response::new(failure(err.to_string()))),
        }
    }

    async fn get_component_states(
        &self,
        _request: Request<GetComponentStatesRequest>,
    ) -> Result<Response<ComponentStates>, RpcStatus> {
        Ok(Response::new(ComponentStates {
            state: Some(ComponentInfo {
                node_id: self.coord.id(),
                role: INDEX_COORD_ROLE.to_string(),
                state_code: self.coord.state() as i32,
            }),
            status: Some(success()),
        }))
    }

    async fn get_metrics(
        &self,
        request: Request<GetMetricsRequest>,
    ) -> Result<Response<GetMetricsResponse>, RpcStatus> {
        let req = request.into_inner();
        if let Some(status) = self.health_failure() {
            return Ok(Response::new(GetMetricsResponse {
                status: Some(status),
                response: String::new(),
                component_name: String::new(),
            }));
        }

        let metric_type = match metrics_info::parse_metric_type(&req.request) {
            Ok(metric_type) => metric_type,
            Err(reason) => {
                tracing::warn!(request = %req.request, reason = %reason,
                    "GetMetrics failed to parse metric type");
                return Ok(Response::new(GetMetricsResponse {
                    status: Some(failure(reason)),
                    response: String::new(),
                    component_name: String::new(),
                }));
            }
        };

        if metric_type == SYSTEM_INFO_METRICS {
            let resp = metrics_info::get_system_info_metrics(&self.coord, &req.request).await;
            return Ok(Response::new(resp));
        }

        tracing::debug!(metric_type = %metric_type, "unimplemented metric type");
        Ok(Response::new(GetMetricsResponse {
            status: Some(failure(format!(
                "unimplemented metric type: {metric_type}"
            ))),
            response: String::new(),
            component_name: String::new(),
        }))
    }
}
