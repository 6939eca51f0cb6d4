#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod coordinator;
pub mod error;
pub mod grpc;
pub mod meta_table;
pub mod metrics_info;
pub mod node_manager;
pub mod priority_queue;
pub mod sched;

use std::time::Duration;

/// Bound on every outgoing worker RPC and every admission.
pub const REQ_TIMEOUT_INTERVAL: Duration = Duration::from_secs(10);

/// Recycle-loop tick.
pub const DURATION_INTERVAL: Duration = Duration::from_secs(10);

/// Assignment-loop tick.
pub const ASSIGN_TASK_INTERVAL: Duration = Duration::from_secs(3);

/// Per-tick work cap for assignment and recycle.
pub const TASK_LIMIT: usize = 20;

/// Allocator heartbeat tick.
pub const TS_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Registry bring-up attempts before `init` fails.
pub const INIT_RETRY_ATTEMPTS: usize = 300;
