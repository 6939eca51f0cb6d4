use crate::types::UniqueId;

/// Registry prefix holding every task record.
pub const INDEXES_PREFIX: &str = "indexes";

/// Registry key of one task record.
pub fn index_meta_key(index_build_id: UniqueId) -> String {
    format!("{INDEXES_PREFIX}/{index_build_id}")
}

/// Parse the build id back out of a task-record key.
pub fn parse_index_meta_key(key: &str) -> Option<UniqueId> {
    key.strip_prefix(INDEXES_PREFIX)?
        .strip_prefix('/')?
        .parse()
        .ok()
}

/// Blob prefix holding every artifact of one build.
pub fn index_file_prefix(index_build_id: UniqueId) -> String {
    format!("{index_build_id}")
}

/// Blob prefix holding the artifacts of one build version.
pub fn index_file_version_prefix(index_build_id: UniqueId, version: i64) -> String {
    format!("{index_build_id}/{version}")
}
