#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tonic::transport::Server;
use tracing::{info, info_span, Instrument};

use vix_core::types::INDEX_NODE_ROLE;
use vix_proto::v1::index_node_server::IndexNodeServer;
use vix_registry::allocator::GlobalIdAllocator;
use vix_registry::Session;
use vixd_node::node::IndexNode;
use vixd_node::service::IndexNodeService;

const INIT_RETRY_ATTEMPTS: usize = 300;

#[derive(Debug, Parser)]
#[command(name = "vixd-node")]
struct Args {
    /// Registry root, e.g. `etcd://127.0.0.1:2379/vix-meta`.
    #[arg(long, env = "VIX_REGISTRY_ROOT", default_value = "mem://")]
    registry_root: String,

    /// Registry path prefix for allocator state (shared with the coordinator).
    #[arg(long, env = "VIX_KV_ROOT_PATH", default_value = "vix-kv")]
    kv_root_path: String,

    /// Blob-store root: a directory or `s3://bucket/prefix`.
    #[arg(long, env = "VIX_BLOB_ROOT", default_value = "/tmp/vix/index-files")]
    blob_root: String,

    /// Address to bind the worker gRPC server.
    #[arg(long, env = "VIX_NODE_BIND_ADDR", default_value = "0.0.0.0:50052")]
    addr: SocketAddr,

    /// Address registered in service discovery.
    #[arg(long, env = "VIX_NODE_ADVERTISE_ADDR", default_value = "127.0.0.1:50052")]
    advertise_addr: String,

    /// Stable server id; 0 allocates a fresh one from the registry.
    #[arg(long, env = "VIX_NODE_SERVER_ID", default_value_t = 0)]
    server_id: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    vix_observe::logging::init_tracing();

    let args = Args::parse();
    let span = info_span!("vixd-node", addr = %args.addr);
    async move {
        info!(registry_root = %args.registry_root, blob_root = %args.blob_root,
            "starting worker");

        let kv = vix_registry::retry_do(INIT_RETRY_ATTEMPTS, Duration::from_secs(1), || {
            vix_registry::open_from_root(&args.registry_root)
        })
        .await?;
        let blob = vix_blob_store::open_from_root(&args.blob_root).await?;

        let server_id = if args.server_id != 0 {
            args.server_id
        } else {
            let allocator =
                GlobalIdAllocator::new(kv.clone(), format!("{}/index_gid", args.kv_root_path));
            allocator.initialize().await?;
            allocator.alloc_one().await?
        };

        let node = Arc::new(IndexNode::new(server_id, kv.clone(), blob));
        let service = IndexNodeService::new(node.clone());

        // Bind before registering the session so the coordinator never dials
        // a socket that is not listening yet.
        let listener = tokio::net::TcpListener::bind(args.addr).await?;
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        let session = kv
            .register_session(
                INDEX_NODE_ROLE,
                &Session {
                    server_id,
                    address: args.advertise_addr.clone(),
                },
            )
            .await?;
        info!(node_id = server_id, advertise_addr = %args.advertise_addr,
            "worker session registered");

        Server::builder()
            .add_service(IndexNodeServer::new(service))
            .serve_with_incoming_shutdown(incoming, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await?;

        drop(session);
        Ok(())
    }
    .instrument(span)
    .await
}
