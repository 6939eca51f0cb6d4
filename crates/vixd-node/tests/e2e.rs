//! Full-stack check: a real worker serving gRPC, driven by the real
//! coordinator over an in-memory registry and a filesystem blob store.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use vix_blob_store::fs::FsBlobStore;
use vix_blob_store::BlobStore;
use vix_coordinator::coordinator::{CoordConfig, IndexCoord};
use vix_core::keys::index_meta_key;
use vix_core::types::{BuildRequest, TaskMeta, TaskState, INDEX_NODE_ROLE};
use vix_proto::v1::index_node_server::IndexNodeServer;
use vix_registry::mem::MemRegistry;
use vix_registry::{MetaKv, Session, WatchEvent};
use vixd_node::node::IndexNode;
use vixd_node::service::IndexNodeService;

async fn wait_for_state(
    kv: &MemRegistry,
    id: i64,
    want: TaskState,
    timeout: Duration,
) -> TaskMeta {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(pair) = kv.get(&index_meta_key(id)).await.unwrap() {
            let meta = TaskMeta::decode(&pair.value).unwrap();
            if meta.state == want {
                return meta;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} never reached {want:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn build_flows_end_to_end() {
    let mut blob_root = std::env::temp_dir();
    blob_root.push(format!(
        "vixd-e2e-{}-{}",
        std::process::id(),
        vix_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&blob_root).unwrap();

    let kv = MemRegistry::new();
    let blob = Arc::new(FsBlobStore::new(blob_root.clone()));
    blob.put("raw/part0", b"vectors-0").await.unwrap();
    blob.put("raw/part1", b"vectors-1").await.unwrap();

    // Worker up first, session registered once the socket listens.
    let node = Arc::new(IndexNode::new(9, Arc::new(kv.clone()), blob.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpListenerStream::new(listener);
    let service = IndexNodeService::new(node.clone());
    let server = tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(IndexNodeServer::new(service))
            .serve_with_incoming(incoming)
            .await;
    });
    let _session = kv
        .register_session(
            INDEX_NODE_ROLE,
            &Session {
                server_id: 9,
                address: format!("127.0.0.1:{}", addr.port()),
            },
        )
        .await
        .unwrap();

    // Coordinator discovers the worker during init.
    let coord = IndexCoord::init(
        Arc::new(kv.clone()),
        blob.clone(),
        CoordConfig::default(),
    )
    .await
    .unwrap();
    coord.sched().start();

    let (id, deduplicated) = coord
        .build_index(BuildRequest {
            index_id: 7,
            index_name: "ivf".to_string(),
            data_paths: vec!["raw/part0".to_string(), "raw/part1".to_string()],
            type_params: Vec::new(),
            index_params: Vec::new(),
        })
        .await
        .unwrap();
    assert!(!deduplicated);

    coord.assign_tick().await;

    // The worker builds asynchronously and commits straight to the registry.
    let meta = wait_for_state(&kv, id, TaskState::Finished, Duration::from_secs(5)).await;
    assert_eq!(meta.node_id, 9);
    assert_eq!(meta.version, 1);
    assert_eq!(
        meta.index_file_paths,
        vec![format!("{id}/1/ivf_0"), format!("{id}/1/ivf_1")]
    );
    for key in &meta.index_file_paths {
        assert!(!blob.get(key).await.unwrap().is_empty());
    }

    // The coordinator observes completion via the registry watch path.
    let committed = kv.get(&index_meta_key(id)).await.unwrap().unwrap();
    coord.handle_meta_event(WatchEvent::Put(committed)).await;
    assert_eq!(coord.node_manager().priority(9), Some(0));
    assert_eq!(
        coord.meta_table().get_index_file_path_info(id).unwrap(),
        meta.index_file_paths
    );

    server.abort();
    let _ = std::fs::remove_dir_all(blob_root);
}
