//! bobbin: runs an in-process Bobbin cluster.
//!
//! Every node shares one in-memory task store and coordination store, which
//! stand in for the external durable store.
//!
//! # Usage
//!
//! ```text
//! bobbin demo --nodes 3 --tasks 24 --capacity 2 --kill
//! bobbin demo --config node.toml
//! bobbin config --config node.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bobbin_core::impls::{InMemoryCoordinationStore, InMemoryTaskStore};
use bobbin_core::ports::SystemClock;
use bobbin_core::{
    Handler, HandlerError, NodeBuilder, NodeConfig, NodeHandle, SubmitOptions, Task, TaskContext,
    TaskOutcome,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bobbin", about = "Decentralized async task executor demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot a cluster, submit work and report every outcome.
    Demo {
        /// Node config (TOML). Node ids get a `-<n>` suffix per node.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of nodes.
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Override the configured per-node capacity.
        #[arg(long)]
        capacity: Option<u32>,

        /// Number of tasks to submit.
        #[arg(long, default_value = "24")]
        tasks: usize,

        /// Kill one node while it is running tasks.
        #[arg(long)]
        kill: bool,
    },
    /// Print the effective node config as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Render {
    frame: u32,
    millis: u64,
}

impl Task for Render {
    const TYPE: &'static str = "demo.render.frame.v1";
    type Output = String;
}

struct RenderHandler;

#[async_trait]
impl Handler<Render> for RenderHandler {
    async fn handle(&self, task: Render, ctx: TaskContext) -> Result<String, HandlerError> {
        tokio::time::sleep(Duration::from_millis(task.millis)).await;
        Ok(format!("frame {} rendered on {}", task.frame, ctx.node_id))
    }
}

/// Fails its first attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Upload {
    frame: u32,
}

impl Task for Upload {
    const TYPE: &'static str = "demo.upload.frame.v1";
    type Output = u32;
}

struct UploadHandler;

#[async_trait]
impl Handler<Upload> for UploadHandler {
    async fn handle(&self, task: Upload, ctx: TaskContext) -> Result<u32, HandlerError> {
        if ctx.attempt == 1 {
            return Err(HandlerError::transient("upstream busy"));
        }
        Ok(task.frame)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bobbin=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Demo {
            config,
            nodes,
            capacity,
            tasks,
            kill,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(capacity) = capacity {
                config = config.with_capacity(capacity);
                config.validate()?;
            }
            run_demo(config, nodes, tasks, kill).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        }
        None => demo_config(),
    };
    config.validate()?;
    Ok(config)
}

/// Short timings so failover is visible within seconds.
fn demo_config() -> NodeConfig {
    NodeConfig::new("node")
        .with_capacity(3)
        .with_heartbeat_interval(Duration::from_millis(250))
        .with_lease_duration(Duration::from_secs(2))
        .with_lease_safety_margin(Duration::from_millis(500))
        .with_claim_interval(Duration::from_millis(50))
        .with_sweep_interval(Duration::from_millis(500))
        .with_shard_count(12)
}

async fn run_demo(config: NodeConfig, nodes: usize, tasks: usize, kill: bool) -> anyhow::Result<()> {
    anyhow::ensure!(nodes > 0, "need at least one node");
    let task_store = InMemoryTaskStore::new();
    let coordination = InMemoryCoordinationStore::new(Arc::new(SystemClock));

    let mut handles: Vec<NodeHandle> = Vec::with_capacity(nodes);
    for n in 1..=nodes {
        let mut node_config = config.clone();
        node_config.node_id = format!("{}-{n}", config.node_id);
        let node = NodeBuilder::new(node_config)
            .task_store(Arc::new(task_store.clone()))
            .coordination_store(Arc::new(coordination.clone()))
            .register::<Render, _>(RenderHandler)?
            .register::<Upload, _>(UploadHandler)?
            .expect_tasks(&[Render::TYPE, Upload::TYPE])
            .build()?;
        handles.push(node.start());
    }

    // let membership settle so every node owns shards
    tokio::time::sleep(config.heartbeat_interval() * 2).await;

    let client = handles[0].client();
    let mut ids = Vec::with_capacity(tasks);
    for i in 0..tasks {
        let frame = u32::try_from(i)?;
        let id = if i % 4 == 3 {
            client
                .submit_typed(&Upload { frame }, SubmitOptions::default())
                .await?
        } else {
            client
                .submit_typed(
                    &Render {
                        frame,
                        millis: 300 + (i as u64 % 5) * 100,
                    },
                    SubmitOptions::default().with_priority((i % 3) as i32),
                )
                .await?
        };
        ids.push(id);
    }
    info!(tasks, nodes, "submitted");

    if kill && handles.len() > 1 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let victim = handles.remove(handles.len() - 1);
        warn!(node_id = %victim.node_id(), in_flight = victim.in_flight(), "killing node mid-flight");
        victim.kill();
    }

    let wait = config.lease_duration() * 10;
    for id in &ids {
        match client.await_result(*id, wait).await? {
            TaskOutcome::Succeeded(value) => info!(%id, %value, "succeeded"),
            TaskOutcome::Failed(failure) => warn!(%id, %failure, "failed"),
            TaskOutcome::Cancelled => info!(%id, "cancelled"),
        }
    }

    let counts = client.counts().await?;
    info!(
        succeeded = counts.succeeded,
        failed = counts.failed,
        cancelled = counts.cancelled,
        "all tasks finished"
    );
    for view in handles[0].control().list_nodes().await? {
        info!(
            node_id = %view.record.node_id,
            state = ?view.state,
            seq = view.record.heartbeat_seq,
            "node"
        );
    }

    for handle in handles {
        handle.shutdown().await;
    }
    Ok(())
}
