use serde::{Deserialize, Serialize};

/// The only metric type currently served.
pub const SYSTEM_INFO_METRICS: &str = "system_info";

/// Shared component header of every topology entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseComponentInfos {
    #[serde(default)]
    pub has_error: bool,
    #[serde(default)]
    pub error_reason: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexCoordInfos {
    #[serde(flatten)]
    pub base: BaseComponentInfos,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexNodeInfos {
    #[serde(flatten)]
    pub base: BaseComponentInfos,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexClusterTopology {
    #[serde(rename = "self")]
    pub self_info: IndexCoordInfos,
    pub connected_nodes: Vec<IndexNodeInfos>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnTopology {
    pub name: String,
    pub connected_components: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexCoordTopology {
    pub cluster: IndexClusterTopology,
    pub connections: ConnTopology,
}

pub fn construct_component_name(role: &str, node_id: i64) -> String {
    format!("{role}-{node_id}")
}

#[derive(Debug, Deserialize)]
struct MetricRequest {
    metric_type: String,
}

/// Pulls `metric_type` out of a metric request document,
/// e.g. `{"metric_type":"system_info"}`.
pub fn parse_metric_type(request: &str) -> Result<String, String> {
    let parsed: MetricRequest = serde_json::from_str(request)
        .map_err(|e| format!("invalid metric request {request:?}: {e}"))?;
    if parsed.metric_type.trim().is_empty() {
        return Err(format!("metric request {request:?} missing metric_type"));
    }
    Ok(parsed.metric_type)
}

/// The request document for a metric type.
pub fn metric_request(metric_type: &str) -> String {
    format!(r#"{{"metric_type":"{metric_type}"}}"#)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_metric_type_extracts_field() {
        assert_eq!(
            parse_metric_type(&metric_request(SYSTEM_INFO_METRICS)).unwrap(),
            SYSTEM_INFO_METRICS
        );
    }

    #[test]
    fn parse_metric_type_rejects_garbage() {
        assert!(parse_metric_type("not json").is_err());
        assert!(parse_metric_type(r#"{"metric_type":""}"#).is_err());
        assert!(parse_metric_type(r#"{"other":"x"}"#).is_err());
    }

    #[test]
    fn topology_serializes_self_field() {
        let topo = IndexCoordTopology {
            cluster: IndexClusterTopology {
                self_info: IndexCoordInfos {
                    base: BaseComponentInfos {
                        name: "vix-coordinator-1".to_string(),
                        ..Default::default()
                    },
                },
                connected_nodes: vec![IndexNodeInfos {
                    base: BaseComponentInfos {
                        has_error: true,
                        error_reason: "down".to_string(),
                        name: String::new(),
                    },
                }],
            },
            connections: ConnTopology::default(),
        };

        let doc = serde_json::to_string(&topo).unwrap();
        assert!(doc.contains(r#""self""#));
        assert!(doc.contains(r#""has_error":true"#));

        let back: IndexCoordTopology = serde_json::from_str(&doc).unwrap();
        assert_eq!(back.cluster.connected_nodes.len(), 1);
        assert_eq!(back.cluster.connected_nodes[0].base.error_reason, "down");
    }
}
