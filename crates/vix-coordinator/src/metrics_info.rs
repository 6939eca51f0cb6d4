use vix_observe::metricsinfo::{
    construct_component_name, BaseComponentInfos, ConnTopology, IndexClusterTopology,
    IndexCoordInfos, IndexCoordTopology, IndexNodeInfos,
};
use vix_proto::v1::{ErrorCode, GetMetricsResponse, Status};

use crate::coordinator::IndexCoord;

pub use vix_observe::metricsinfo::{parse_metric_type, SYSTEM_INFO_METRICS};

/// Builds the `system_info` cluster topology: self info plus one entry per
/// worker, fanned out in parallel. A worker that errors becomes a
/// `has_error` entry rather than failing the whole response.
pub async fn get_system_info_metrics(coord: &IndexCoord, request: &str) -> GetMetricsResponse {
    let component_name =
        construct_component_name(vix_core::types::INDEX_COORD_ROLE, coord.id());

    let mut topology = IndexClusterTopology {
        self_info: IndexCoordInfos {
            base: BaseComponentInfos {
                name: component_name.clone(),
                ..Default::default()
            },
        },
        connected_nodes: Vec::new(),
    };

    for node_metrics in coord.node_manager().get_metrics(request).await {
        let entry = match node_metrics.response {
            Err(reason) => {
                tracing::warn!(node_id = node_metrics.node_id, error = %reason,
                    "invalid metrics from worker");
                IndexNodeInfos {
                    base: BaseComponentInfos {
                        has_error: true,
                        error_reason: reason,
                        name: String::new(),
                    },
                }
            }
            Ok(resp) => {
                let status = resp.status.clone().unwrap_or_default();
                if status.error_code() != ErrorCode::Success {
                    tracing::warn!(node_id = node_metrics.node_id, reason = %status.reason,
                        "worker reported metrics error");
                    IndexNodeInfos {
                        base: BaseComponentInfos {
                            has_error: true,
                            error_reason: status.reason,
                            name: resp.component_name,
                        },
                    }
                } else {
                    match serde_json::from_str::<IndexNodeInfos>(&resp.response) {
                        Ok(infos) => infos,
                        Err(err) => {
                            tracing::warn!(node_id = node_metrics.node_id, error = %err,
                                "undecodable metrics from worker");
                            IndexNodeInfos {
                                base: BaseComponentInfos {
                                    has_error: true,
                                    error_reason: err.to_string(),
                                    name: resp.component_name,
                                },
                            }
                        }
                    }
                }
            }
        };
        topology.connected_nodes.push(entry);
    }

    let coord_topology = IndexCoordTopology {
        cluster: topology,
        connections: ConnTopology {
            name: component_name.clone(),
            connected_components: Vec::new(),
        },
    };

    match serde_json::to_string(&coord_topology) {
        Ok(doc) => GetMetricsResponse {
            status: Some(Status {
                error_code: ErrorCode::Success as i32,
                reason: String::new(),
            }),
            response: doc,
            component_name,
        },
        Err(err) => GetMetricsResponse {
            status: Some(Status {
                error_code: ErrorCode::UnexpectedError as i32,
                reason: err.to_string(),
            }),
            response: String::new(),
            component_name,
        },
    }
}
