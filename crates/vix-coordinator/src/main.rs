#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tonic::transport::Server;
use tracing::{info, info_span, Instrument};

use vix_coordinator::coordinator::{CoordConfig, IndexCoord};
use vix_coordinator::grpc::CoordinatorService;
use vix_coordinator::INIT_RETRY_ATTEMPTS;
use vix_proto::v1::coordinator_server::CoordinatorServer;

#[derive(Debug, Parser)]
#[command(name = "vix-coordinator")]
struct Args {
    /// Registry root, e.g. `etcd://127.0.0.1:2379/vix-meta` or `mem://`.
    #[arg(long, env = "VIX_REGISTRY_ROOT", default_value = "mem://")]
    registry_root: String,

    /// Registry path prefix for allocator state.
    #[arg(long, env = "VIX_KV_ROOT_PATH", default_value = "vix-kv")]
    kv_root_path: String,

    /// Blob-store root: a directory or `s3://bucket/prefix`.
    #[arg(long, env = "VIX_BLOB_ROOT", default_value = "/tmp/vix/index-files")]
    blob_root: String,

    /// Address to bind the coordinator gRPC server.
    #[arg(long, env = "VIX_COORD_BIND_ADDR", default_value = "0.0.0.0:50051")]
    addr: SocketAddr,

    /// Address registered in service discovery.
    #[arg(long, env = "VIX_COORD_ADVERTISE_ADDR", default_value = "127.0.0.1:50051")]
    advertise_addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    vix_observe::logging::init_tracing();

    let args = Args::parse();
    let span = info_span!("vix-coordinator", addr = %args.addr);
    async move {
        info!(registry_root = %args.registry_root, blob_root = %args.blob_root,
            "starting coordinator");

        let kv = vix_registry::retry_do(INIT_RETRY_ATTEMPTS, Duration::from_secs(1), || {
            vix_registry::open_from_root(&args.registry_root)
        })
        .await?;
        let blob = vix_blob_store::open_from_root(&args.blob_root).await?;

        let coord = IndexCoord::init(
            kv,
            blob,
            CoordConfig {
                kv_root_path: args.kv_root_path.clone(),
                advertise_addr: args.advertise_addr.clone(),
                ..CoordConfig::default()
            },
        )
        .await?;
        coord.start();

        let service = CoordinatorService::new(coord.clone());
        Server::builder()
            .add_service(CoordinatorServer::new(service))
            .serve_with_shutdown(args.addr, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await?;

        coord.stop().await;
        Ok(())
    }
    .instrument(span)
    .await
}
