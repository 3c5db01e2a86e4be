//! Cluster tests: the controller driving in-process storage nodes

use ringkv::common::{
    CacheStrategy, ClientConfig, DigestHasher, EcsConfig, Error, NodeConfig, PoolEntry, Result,
};
use ringkv::coordinator::registry::{node_path, NODES_PATH};
use ringkv::coordinator::{Controller, LaunchSpec, Launcher, MemoryRegistry, Registry};
use ringkv::node::{NodeServer, NodeState};
use ringkv::protocol::StatusType;
use ringkv::KvClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Starts pre-bound servers instead of remote processes.
struct InProcessLauncher {
    servers: Mutex<HashMap<String, NodeServer>>,
}

impl Launcher for InProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let server = self.servers.lock().unwrap().remove(&spec.node_name);
        let Some(server) = server else {
            return Err(Error::LaunchFailed {
                node: spec.node_name.clone(),
                reason: "no server left for this slot".into(),
            });
        };
        tokio::spawn(async move {
            let _ = server.serve().await;
        });
        Ok(())
    }
}

struct Cluster {
    _dir: TempDir,
    controller: Arc<Controller<InProcessLauncher>>,
    registry: Arc<dyn Registry>,
    states: HashMap<String, Arc<NodeState>>,
}

async fn cluster(size: usize) -> Cluster {
    let dir = TempDir::new().unwrap();
    let mut servers = HashMap::new();
    let mut states = HashMap::new();
    let mut pool = Vec::new();

    for i in 0..size {
        let name = format!("node-{}", i);
        let config = NodeConfig {
            name: name.clone(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.path().join(&name),
            cache_strategy: CacheStrategy::Lru,
            replication_interval_ms: 100,
            ..Default::default()
        };
        let server = NodeServer::bind(config, ClientConfig::default()).await.unwrap();
        let addr = server.local_addr().unwrap();
        pool.push(PoolEntry {
            name: name.clone(),
            host: addr.ip().to_string(),
            port: addr.port(),
        });
        states.insert(name.clone(), server.state());
        servers.insert(name, server);
    }

    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
    let ecs = EcsConfig {
        pool,
        launch_wait_ms: 5_000,
        ..Default::default()
    };
    let launcher = InProcessLauncher {
        servers: Mutex::new(servers),
    };
    let controller = Arc::new(Controller::new(
        ecs,
        ClientConfig::default(),
        &DigestHasher::default(),
        launcher,
        registry.clone(),
    ));

    Cluster {
        _dir: dir,
        controller,
        registry,
        states,
    }
}

/// Client that already knows the current ring.
async fn client_for(cluster: &Cluster) -> KvClient {
    let seed = cluster.controller.metadata().nodes()[0].address();
    let client = KvClient::new(seed, ClientConfig::default());
    client.refresh_metadata().await.unwrap();
    client
}

async fn assert_all_readable(client: &KvClient, count: usize) {
    for i in 0..count {
        let reply = client.get(&format!("key-{}", i)).await.unwrap();
        assert_eq!(reply.status, StatusType::GetSuccess, "key-{}", i);
        assert_eq!(reply.value, Some(format!("value-{}", i)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_init_add_remove_keeps_data() {
    let cluster = cluster(4).await;
    let controller = &cluster.controller;

    let launched = controller
        .init_service(2, CacheStrategy::Lru, 10)
        .await
        .unwrap();
    assert_eq!(launched.len(), 2);
    controller.start().await.unwrap();
    assert_eq!(cluster.registry.children(NODES_PATH).unwrap().len(), 2);

    let client = client_for(&cluster).await;
    for i in 0..30 {
        let reply = client
            .put(&format!("key-{}", i), &format!("value-{}", i))
            .await
            .unwrap();
        assert!(reply.status.is_write_ack(), "{}", reply);
    }
    assert_all_readable(&client, 30).await;
    client.disconnect().await;

    let added = controller.add_node(CacheStrategy::Fifo, 5).await.unwrap();
    assert_eq!(controller.metadata().len(), 3);
    assert!(controller.metadata().get(&added.name).is_some());

    let client = client_for(&cluster).await;
    assert_all_readable(&client, 30).await;
    client.disconnect().await;

    let leaving = launched[0].name.clone();
    controller.remove_node(&leaving).await.unwrap();
    assert_eq!(controller.metadata().len(), 2);
    assert!(controller.metadata().get(&leaving).is_none());
    assert!(cluster.states[&leaving].is_shutting_down());
    assert!(cluster.registry.read(&node_path(&leaving)).unwrap().is_none());

    let client = client_for(&cluster).await;
    assert_all_readable(&client, 30).await;
    client.disconnect().await;

    controller.shutdown().await.unwrap();
    assert!(controller.metadata().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_node_is_replaced() {
    let cluster = cluster(3).await;
    let controller = &cluster.controller;

    let launched = controller
        .init_service(2, CacheStrategy::Fifo, 10)
        .await
        .unwrap();
    controller.start().await.unwrap();

    let lost = launched[0].name.clone();
    cluster.states[&lost].request_shutdown();
    cluster.registry.delete(&node_path(&lost)).unwrap();
    controller.handle_membership_change().await.unwrap();

    let metadata = controller.metadata();
    assert_eq!(metadata.len(), 2);
    assert!(metadata.get(&lost).is_none());

    // the replacement serves writes
    let client = client_for(&cluster).await;
    for i in 0..10 {
        let reply = client
            .put(&format!("key-{}", i), &format!("value-{}", i))
            .await
            .unwrap();
        assert!(reply.status.is_write_ack(), "{}", reply);
    }
    assert_all_readable(&client, 10).await;
    client.disconnect().await;

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_add_node_without_free_slot() {
    let cluster = cluster(1).await;
    let controller = &cluster.controller;

    controller
        .init_service(1, CacheStrategy::None, 0)
        .await
        .unwrap();
    assert!(matches!(
        controller.add_node(CacheStrategy::Lru, 10).await,
        Err(Error::NoNodeAvailable)
    ));
    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_join_is_rolled_back() {
    let cluster = cluster(2).await;
    let controller = &cluster.controller;

    let launched = controller
        .init_service(1, CacheStrategy::Lru, 10)
        .await
        .unwrap();
    let member = launched[0].name.clone();
    let joining = cluster
        .states
        .keys()
        .find(|name| **name != member)
        .cloned()
        .unwrap();

    // the only possible successor cannot be write-locked any more
    cluster.states[&member].request_shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert!(controller.add_node(CacheStrategy::Lru, 10).await.is_err());
    assert_eq!(controller.metadata().len(), 1);
    assert!(controller.metadata().get(&joining).is_none());
    assert!(cluster.registry.read(&node_path(&joining)).unwrap().is_none());
    assert!(cluster.states[&joining].is_shutting_down());

    let slots = controller.nodes().await;
    let slot = slots.iter().find(|n| n.name() == joining).unwrap();
    assert!(!slot.is_launched());
}
