use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `VIX_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for vix daemons:
/// - Always include `node_id` when available.
/// - Include `index_build_id` and `index_id` on any task-related event.
/// - Include `version` on any assignment/commit-related event (even if 0).
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("VIX_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
