//! In-process multi-node scenarios against the in-memory stores.
//!
//! Timings are shrunk to tens of milliseconds so failover happens quickly;
//! every wait is bounded by `eventually`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bobbin_core::domain::{FailureKind, TaskStatus};
use bobbin_core::impls::{InMemoryCoordinationStore, InMemoryTaskStore};
use bobbin_core::ports::SystemClock;
use bobbin_core::typed::DynHandler;
use bobbin_core::{
    Handler, HandlerError, Node, NodeBuilder, NodeConfig, NodeHandle, NodeId, SubmitOptions,
    Task, TaskClient, TaskContext, TaskId, TaskOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const WAIT: Duration = Duration::from_secs(10);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn fast_config(name: &str) -> NodeConfig {
    let mut config = NodeConfig::new(name)
        .with_capacity(2)
        .with_heartbeat_interval(ms(50))
        .with_lease_duration(ms(400))
        .with_lease_safety_margin(ms(100))
        .with_renew_interval(ms(100))
        .with_claim_interval(ms(20))
        .with_sweep_interval(ms(100))
        .with_shard_count(8);
    config.retry_base_delay_ms = 10;
    config.retry_max_delay_ms = 50;
    config.store_backoff_base_ms = 10;
    config.store_backoff_max_ms = 50;
    config
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(ms(10)).await;
    }
}

async fn wait_for_status(client: &TaskClient, id: TaskId, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while client.status(id).await.unwrap().status != status {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {status}");
        tokio::time::sleep(ms(10)).await;
    }
}

async fn wait_for_members(handle: &NodeHandle, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let members = handle
            .control()
            .assignment()
            .await
            .unwrap()
            .map(|a| a.members().len())
            .unwrap_or(0);
        if members == count {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {count} members");
        tokio::time::sleep(ms(10)).await;
    }
}

/// Shared stores standing in for the external durable store.
#[derive(Clone)]
struct Cluster {
    tasks: InMemoryTaskStore,
    coordination: InMemoryCoordinationStore,
    probe: Probe,
}

impl Cluster {
    fn new() -> Self {
        Self {
            tasks: InMemoryTaskStore::new(),
            coordination: InMemoryCoordinationStore::new(Arc::new(SystemClock)),
            probe: Probe::default(),
        }
    }

    fn build(&self, config: NodeConfig) -> Node {
        NodeBuilder::new(config)
            .task_store(Arc::new(self.tasks.clone()))
            .coordination_store(Arc::new(self.coordination.clone()))
            .register::<Add, _>(AddHandler)
            .unwrap()
            .register_dyn(Arc::new(Work {
                probe: self.probe.clone(),
            }))
            .unwrap()
            .expect_tasks(&[Add::TYPE, Work::TYPE])
            .build()
            .unwrap()
    }

    async fn start(&self, config: NodeConfig) -> NodeHandle {
        let handle = self.build(config).start();
        eventually("node to own shards", || !handle.owned_shards().is_empty()).await;
        handle
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

impl Task for Add {
    const TYPE: &'static str = "test.math.add.v1";
    type Output = i64;
}

struct AddHandler;

#[async_trait]
impl Handler<Add> for AddHandler {
    async fn handle(&self, task: Add, _ctx: TaskContext) -> Result<i64, HandlerError> {
        Ok(task.a + task.b)
    }
}

/// What the `test.work.v1` handler saw.
#[derive(Clone, Default)]
struct Probe {
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    runs: Arc<Mutex<Vec<(String, NodeId)>>>,
}

impl Probe {
    fn runs(&self) -> Vec<(String, NodeId)> {
        self.runs.lock().unwrap().clone()
    }

    fn runs_of(&self, label: &str) -> usize {
        self.runs().iter().filter(|(l, _)| l == label).count()
    }
}

/// Raw JSON handler driven by its payload:
/// `{"label": "...", "sleep_ms": n, "fail": "transient" | "permanent"}`.
struct Work {
    probe: Probe,
}

impl Work {
    const TYPE: &'static str = "test.work.v1";
}

#[async_trait]
impl DynHandler for Work {
    async fn handle_dyn(&self, payload: Value, ctx: TaskContext) -> Result<Value, HandlerError> {
        let label = payload["label"].as_str().unwrap_or_default().to_string();
        self.probe
            .runs
            .lock()
            .unwrap()
            .push((label.clone(), ctx.node_id.clone()));

        let now_running = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_running.fetch_max(now_running, Ordering::SeqCst);
        let sleep = payload["sleep_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(ms(sleep)).await;
        self.probe.running.fetch_sub(1, Ordering::SeqCst);

        match payload["fail"].as_str() {
            Some("transient") => Err(HandlerError::transient(format!("{label} flaked"))),
            Some("permanent") => Err(HandlerError::permanent(format!("{label} rejected"))),
            _ => Ok(json!({ "label": label, "node": ctx.node_id })),
        }
    }

    fn task_type(&self) -> &str {
        Self::TYPE
    }
}

fn work(label: &str, sleep_ms: u64) -> Value {
    json!({ "label": label, "sleep_ms": sleep_ms })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn typed_task_runs_to_completion() {
    let cluster = Cluster::new();
    let node = cluster.start(fast_config("a")).await;
    let client = node.client();

    let id = client
        .submit_typed(&Add { a: 40, b: 2 }, SubmitOptions::default())
        .await
        .unwrap();
    let outcome = client.await_result(id, WAIT).await.unwrap();
    assert_eq!(outcome.output::<Add>().unwrap().unwrap(), 42);

    let view = client.status(id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Succeeded);
    assert_eq!(view.attempts, 1);
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tasks_of_a_killed_node_are_recovered() {
    let cluster = Cluster::new();
    let a = cluster.start(fast_config("a")).await;
    let b = cluster.start(fast_config("b")).await;
    wait_for_members(&a, 2).await;

    let client = b.client();
    let mut ids = Vec::new();
    for i in 0..16 {
        let id = client
            .submit(Work::TYPE, work(&format!("job-{i}"), 150), SubmitOptions::default())
            .await
            .unwrap();
        ids.push(id);
    }

    eventually("node a to pick up work", || a.in_flight() > 0).await;
    a.kill();

    for id in &ids {
        let outcome = client.await_result(*id, WAIT).await.unwrap();
        assert!(outcome.is_success(), "{id} ended as {outcome:?}");
    }
    let counts = client.counts().await.unwrap();
    assert_eq!(counts.succeeded, 16);
    assert_eq!(counts.in_flight(), 0);

    // at-least-once: whatever a was running when it died ran again on b
    let runs = cluster.probe.runs();
    for i in 0..16 {
        let label = format!("job-{i}");
        let mine: Vec<&NodeId> = runs.iter().filter(|(l, _)| *l == label).map(|(_, n)| n).collect();
        assert!(!mine.is_empty());
        if mine.len() > 1 {
            assert_eq!(mine.last().map(|n| n.as_str()), Some("b"));
        }
    }
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_attempt_failure_is_final() {
    let cluster = Cluster::new();
    let node = cluster.start(fast_config("a")).await;
    let client = node.client();

    let id = client
        .submit(
            Work::TYPE,
            json!({ "label": "once", "fail": "transient" }),
            SubmitOptions::default().with_max_attempts(1),
        )
        .await
        .unwrap();

    match client.await_result(id, WAIT).await.unwrap() {
        TaskOutcome::Failed(failure) => {
            assert_eq!(failure.kind, FailureKind::HandlerError);
            assert!(failure.message.contains("once flaked"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(client.status(id).await.unwrap().attempts, 1);
    assert_eq!(cluster.probe.runs_of("once"), 1);
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_retry_up_to_the_attempt_bound() {
    let cluster = Cluster::new();
    let node = cluster.start(fast_config("a")).await;
    let client = node.client();

    let flaky = client
        .submit(
            Work::TYPE,
            json!({ "label": "flaky", "fail": "transient" }),
            SubmitOptions::default().with_max_attempts(3),
        )
        .await
        .unwrap();
    let rejected = client
        .submit(
            Work::TYPE,
            json!({ "label": "rejected", "fail": "permanent" }),
            SubmitOptions::default().with_max_attempts(3),
        )
        .await
        .unwrap();

    assert!(!client.await_result(flaky, WAIT).await.unwrap().is_success());
    assert!(!client.await_result(rejected, WAIT).await.unwrap().is_success());
    assert_eq!(client.status(flaky).await.unwrap().attempts, 3);
    assert_eq!(cluster.probe.runs_of("flaky"), 3);
    assert_eq!(client.status(rejected).await.unwrap().attempts, 1);
    assert_eq!(cluster.probe.runs_of("rejected"), 1);
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_slot_runs_highest_priority_first() {
    let cluster = Cluster::new();
    let node = cluster.build(fast_config("a").with_capacity(1));

    // queued before the node starts claiming
    let client = node.client();
    let mut ids = Vec::new();
    for priority in [1, 5, 3] {
        let id = client
            .submit(
                Work::TYPE,
                work(&format!("p{priority}"), 0),
                SubmitOptions::default().with_priority(priority),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    let handle = node.start();
    for id in ids {
        client.await_result(id, WAIT).await.unwrap();
    }
    let order: Vec<String> = cluster.probe.runs().into_iter().map(|(l, _)| l).collect();
    assert_eq!(order, vec!["p5", "p3", "p1"]);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_bounds_concurrent_executions() {
    let cluster = Cluster::new();
    let node = cluster.start(fast_config("a").with_capacity(3)).await;
    let client = node.client();

    let mut ids = Vec::new();
    for i in 0..10 {
        let id = client
            .submit(Work::TYPE, work(&format!("c{i}"), 60), SubmitOptions::default())
            .await
            .unwrap();
        ids.push(id);
    }
    for id in ids {
        assert!(client.await_result(id, WAIT).await.unwrap().is_success());
    }

    let max = cluster.probe.max_running.load(Ordering::SeqCst);
    assert!(max <= 3, "ran {max} at once");
    assert!(max >= 1);
    assert!(node.in_flight() <= 3);
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drained_node_stops_taking_work() {
    let cluster = Cluster::new();
    let a = cluster.start(fast_config("a")).await;
    let b = cluster.start(fast_config("b")).await;

    assert!(a.control().drain_node(&NodeId::new("a")).await.unwrap());
    eventually("a to drain and hand over its shards", || {
        a.is_draining() && a.owned_shards().is_empty()
    })
    .await;

    let client = a.client();
    let mut ids = Vec::new();
    for i in 0..6 {
        let id = client
            .submit(Work::TYPE, work(&format!("d{i}"), 10), SubmitOptions::default())
            .await
            .unwrap();
        ids.push(id);
    }
    for id in ids {
        assert!(client.await_result(id, WAIT).await.unwrap().is_success());
    }
    assert!(cluster.probe.runs().iter().all(|(_, node)| node.as_str() == "b"));

    let nodes = a.control().list_nodes().await.unwrap();
    let draining: HashMap<&str, bool> = nodes
        .iter()
        .map(|v| (v.record.node_id.as_str(), v.record.draining))
        .collect();
    assert_eq!(draining.get("a"), Some(&true));
    assert_eq!(draining.get("b"), Some(&false));

    assert!(a.control().resume_node(&NodeId::new("a")).await.unwrap());
    eventually("a to resume", || !a.is_draining()).await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_stops_a_running_task() {
    let cluster = Cluster::new();
    let node = cluster
        .start(fast_config("a").with_execution_timeout(Duration::from_secs(30)))
        .await;
    let client = node.client();

    let id = client
        .submit(Work::TYPE, work("long", 30_000), SubmitOptions::default())
        .await
        .unwrap();
    wait_for_status(&client, id, TaskStatus::Running).await;

    assert!(client.cancel(id).await.unwrap());
    assert_eq!(
        client.await_result(id, WAIT).await.unwrap(),
        TaskOutcome::Cancelled
    );
    eventually("slot to be released", || node.in_flight() == 0).await;
    assert!(!client.cancel(id).await.unwrap());
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_finishes_in_flight_work() {
    let cluster = Cluster::new();
    let node = cluster.start(fast_config("a")).await;
    let client = node.client();

    let id: TaskId = client
        .submit(Work::TYPE, work("last", 200), SubmitOptions::default())
        .await
        .unwrap();
    eventually("task to start", || node.in_flight() == 1).await;

    node.shutdown().await;
    assert_eq!(client.status(id).await.unwrap().status, TaskStatus::Succeeded);
    // the node left the membership on the way out
    assert!(cluster.coordination_is_empty().await);
}

impl Cluster {
    async fn coordination_is_empty(&self) -> bool {
        use bobbin_core::ports::CoordinationStore;
        self.coordination.list_nodes().await.unwrap().is_empty()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_outage_partitions_the_node_until_it_recovers() {
    let cluster = Cluster::new();
    let node = cluster.start(fast_config("a")).await;

    cluster.coordination.set_unavailable(true);
    eventually("node to notice the partition", || node.is_partitioned()).await;

    // no claims while partitioned
    let client = node.client();
    let id = client
        .submit(Work::TYPE, work("held", 0), SubmitOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(ms(200)).await;
    assert_eq!(client.status(id).await.unwrap().status, TaskStatus::Pending);

    cluster.coordination.set_unavailable(false);
    eventually("node to rejoin", || !node.is_partitioned()).await;
    assert!(client.await_result(id, WAIT).await.unwrap().is_success());
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn healthy_node_is_never_reported_suspected() {
    use bobbin_core::domain::NodeState;

    let cluster = Cluster::new();
    let node = cluster.start(fast_config("steady")).await;
    let control = node.control();

    let deadline = tokio::time::Instant::now() + WAIT;
    while control.list_nodes().await.unwrap()[0].state != NodeState::Active {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for Active");
        tokio::time::sleep(ms(10)).await;
    }

    // sample across several heartbeat periods
    for _ in 0..100 {
        let state = control.list_nodes().await.unwrap()[0].state;
        assert_eq!(state, NodeState::Active);
        tokio::time::sleep(ms(3)).await;
    }
    node.shutdown().await;
}
