//! End-to-end cluster scenarios on the in-memory store.
//!
//! Several coordinators share one `MemoryStore`, each acting as a node.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scrape_cluster::cluster::work_item::timestamp_score;
use scrape_cluster::cluster::{
    CoordinationStore, Coordinator, HealthState, HealthStatus, MemoryStore, ResourceUsage,
    StaticProbe, WorkItem, WorkStatus,
};
use scrape_cluster::config::ClusterConfig;

fn node(store: &MemoryStore, node_id: &str) -> Coordinator {
    let mut config = ClusterConfig::new()
        .with_node_id(node_id)
        .with_shutdown_timeout(Duration::from_secs(1));
    // Retries become due immediately.
    config.backoff_base = Duration::ZERO;

    Coordinator::with_probe(
        Arc::new(store.clone()),
        config,
        Arc::new(StaticProbe(ResourceUsage {
            cpu_percent: 12.0,
            memory_percent: 30.0,
            disk_percent: 40.0,
        })),
    )
    .expect("valid config")
}

fn jobs(prefix: &str, n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| {
            WorkItem::new(
                format!("{}-{}", prefix, i),
                "Madrid",
                format!("https://example.com/{}/{}", prefix, i),
            )
        })
        .collect()
}

/// Makes a node look like it stopped heartbeating `minutes` ago.
async fn backdate(store: &MemoryStore, coordinator: &Coordinator, minutes: i64) {
    let seen = Utc::now() - chrono::Duration::minutes(minutes);
    let keys = coordinator.keys();
    let record = HealthStatus {
        node_id: coordinator.node_id().to_string(),
        status: HealthState::Healthy,
        cpu_percent: 0.0,
        memory_percent: 0.0,
        disk_percent: 0.0,
        active_workers: 0,
        last_heartbeat: seen,
        error_count: 0,
        warning_count: 0,
    };
    store
        .hash_replace_with_ttl(
            &keys.node_health(coordinator.node_id()),
            &record.to_fields(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
    store
        .sorted_add(&keys.node_registry(), coordinator.node_id(), timestamp_score(seen))
        .await
        .unwrap();
}

async fn queued(store: &MemoryStore, coordinator: &Coordinator, node_id: &str) -> usize {
    store
        .list_len(&coordinator.keys().node_queue(node_id))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_even_distribution_across_nodes() {
    let store = MemoryStore::new();
    let nodes: Vec<Coordinator> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|id| node(&store, id))
        .collect();
    for n in &nodes {
        n.heartbeat_once().await.expect("heartbeat");
    }

    let result = nodes[0].distribute(jobs("job", 10)).await;

    assert_eq!(result.total, 10);
    assert_eq!(result.distributed + result.failed, result.total);
    assert_eq!(result.failed, 0);
    for n in &nodes {
        let count = queued(&store, &nodes[0], n.node_id()).await;
        assert!(count == 3 || count == 4, "{} got {}", n.node_id(), count);
    }
}

#[tokio::test]
async fn test_crashed_node_work_moves_to_survivors() {
    let store = MemoryStore::new();
    let a = node(&store, "node-a");
    let b = node(&store, "node-b");
    let dead = node(&store, "node-dead");
    for n in [&a, &b, &dead] {
        n.heartbeat_once().await.expect("heartbeat");
    }
    assert_eq!(a.distribute(jobs("job", 9)).await.distributed, 9);

    // The dead node pulled two items before crashing.
    let in_flight = dead.pull(2).await;
    assert_eq!(in_flight.len(), 2);
    backdate(&store, &dead, 10).await;

    let report = a.cleanup_stale_nodes().await;

    assert_eq!(report.nodes_cleaned, 1);
    assert_eq!(report.items_recovered, 3);
    assert_eq!(report.items_redistributed, 3);
    assert_eq!(queued(&store, &a, "node-dead").await, 0);
    assert_eq!(
        queued(&store, &a, "node-a").await + queued(&store, &a, "node-b").await,
        9
    );

    let status = a.cluster_status().await;
    assert_eq!(status.total_nodes, 2);
    assert_eq!(status.totals.pending, 9);
    assert_eq!(status.totals.active, 0);

    // Recovered items were not charged a retry.
    let mut recovered = a.pull(10).await;
    recovered.extend(b.pull(10).await);
    assert_eq!(recovered.len(), 9);
    assert!(recovered.iter().all(|item| item.retry_count == 0));
}

#[tokio::test]
async fn test_work_lifecycle_with_retries_and_exhaustion() {
    let store = MemoryStore::new();
    let a = node(&store, "node-a");
    a.heartbeat_once().await.expect("heartbeat");
    a.distribute(vec![
        WorkItem::new("good", "Madrid", "https://example.com/good"),
        WorkItem::new("flaky", "Madrid", "https://example.com/flaky").with_max_retries(2),
    ])
    .await;

    let mut pulled = a.pull(2).await;
    assert_eq!(pulled.len(), 2);
    let mut flaky = pulled.pop().unwrap();
    let mut good = pulled.pop().unwrap();
    assert_eq!(good.work_id, "good");

    assert!(a.acquire_lock(&good.work_id).await);
    assert!(a.complete(&mut good).await);
    assert!(a.release_lock(&good.work_id).await);

    assert!(a.fail(&mut flaky, "timeout").await);
    assert_eq!(flaky.status, WorkStatus::Retrying);

    // First failure scheduled a retry that is already due.
    let requeued = a.requeue_pending().await;
    assert_eq!(requeued.distributed, 1);
    let mut flaky = a.pull(1).await.remove(0);
    assert_eq!(flaky.retry_count, 1);
    assert_eq!(flaky.status, WorkStatus::InProgress);

    assert!(a.fail(&mut flaky, "timeout again").await);
    assert_eq!(flaky.status, WorkStatus::Failed);
    assert_eq!(a.requeue_pending().await.total, 0);

    let status = a.cluster_status().await;
    assert_eq!(status.totals.completed, 1);
    assert_eq!(status.totals.failed, 1);
    assert_eq!(status.totals.active, 0);
    assert_eq!(status.scheduled_retries, 0);
}

#[tokio::test]
async fn test_graceful_shutdown_hands_work_to_remaining_nodes() {
    let store = MemoryStore::new();
    let a = node(&store, "node-a");
    let b = node(&store, "node-b");
    a.heartbeat_once().await.expect("heartbeat");
    b.heartbeat_once().await.expect("heartbeat");
    a.distribute(jobs("job", 6)).await;
    b.pull(1).await;

    let report = b.coordinate_shutdown().await;
    assert!(report.clean);
    assert_eq!(report.active_requeued + report.pending_requeued, 3);
    assert_eq!(a.healthy_nodes().await, vec!["node-a".to_string()]);

    let requeued = a.requeue_pending().await;
    assert_eq!(requeued.distributed, 3);
    assert_eq!(queued(&store, &a, "node-a").await, 6);
}

#[tokio::test]
async fn test_locks_are_exclusive_across_nodes() {
    let store = MemoryStore::new();
    let a = node(&store, "node-a");
    let b = node(&store, "node-b");

    assert!(a.acquire_lock("shared").await);
    assert!(!b.acquire_lock("shared").await);
    assert!(!b.release_lock("shared").await);
    assert_eq!(b.locks().holder("shared").await.as_deref(), Some("node-a"));

    assert!(a.release_lock("shared").await);
    assert!(b.acquire_lock("shared").await);
}
