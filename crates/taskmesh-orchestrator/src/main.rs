//! TaskMesh Orchestrator Server

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use taskmesh_core::Task;
use taskmesh_orchestrator::{http, BackoffPolicy, Config, EchoHandler, LocalBackend, Orchestrator};

/// TaskMesh orchestrator - supervised worker pool with an HTTP ops surface
#[derive(Parser)]
#[command(name = "taskmesh-orchestrator")]
#[command(about = "Run a supervised pool of local workers", long_about = None)]
struct Args {
    /// HTTP bind address
    #[arg(long, default_value = "[::1]:50060")]
    http_addr: String,

    /// Workers to spawn at startup
    #[arg(short, long, default_value = "2")]
    workers: usize,

    /// Maximum concurrent worker instances
    #[arg(long, default_value = "8")]
    max_instances: usize,

    /// Demo tasks to submit once the workers are up
    #[arg(long, default_value = "0")]
    demo_tasks: usize,

    /// Contributions required per demo task
    #[arg(long, default_value = "1")]
    contributions: u32,

    /// Simulated execution time of the echo handler, in milliseconds
    #[arg(long, default_value = "200")]
    task_delay_ms: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "5")]
    heartbeat_interval: u64,

    /// Heartbeat timeout in seconds
    #[arg(long, default_value = "15")]
    heartbeat_timeout: u64,

    /// Supervision cycle interval in seconds
    #[arg(long, default_value = "2")]
    cycle_interval: u64,

    /// Drain grace period in seconds
    #[arg(long, default_value = "30")]
    grace_period: u64,

    /// Maximum reconnect attempts per connection failure
    #[arg(long, default_value = "5")]
    reconnect_attempts: u32,
}

impl Args {
    fn to_config(&self) -> Config {
        Config {
            max_instances: self.max_instances,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            cycle_interval: Duration::from_secs(self.cycle_interval),
            grace_period: Duration::from_secs(self.grace_period),
            reconnect: BackoffPolicy {
                max_attempts: self.reconnect_attempts,
                ..BackoffPolicy::default()
            },
            http_bind_addr: self.http_addr.clone(),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskmesh=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = args.to_config();
    let http_addr: SocketAddr = config.http_bind_addr.parse()?;

    let handler = Arc::new(EchoHandler::new(Duration::from_millis(args.task_delay_ms)));
    let (backend, events) = LocalBackend::new(handler, config.heartbeat_interval);
    let orchestrator = Orchestrator::new(config, backend)?;
    orchestrator.start(events);

    info!(workers = args.workers, http_addr = %http_addr, "Starting TaskMesh orchestrator");

    for _ in 0..args.workers {
        match orchestrator.spawn_worker("echo", BTreeMap::new()).await {
            Ok(worker_id) => info!(worker_id = %worker_id, "Worker ready"),
            Err(e) => warn!(error = %e, "Failed to spawn worker"),
        }
    }

    for n in 0..args.demo_tasks {
        let payload = serde_json::json!({ "demo": n }).to_string();
        let task = Task::new(payload)
            .with_expected_contributions(args.contributions)
            .with_label("source", "demo");
        match orchestrator.submit(task) {
            Ok(assignment) => info!(
                task_id = %assignment.task_id,
                worker_id = %assignment.worker_id,
                "Demo task submitted"
            ),
            Err(e) => warn!(error = %e, "Demo task rejected"),
        }
    }

    let listener = TcpListener::bind(http_addr).await?;
    let router = http::create_router(orchestrator.clone());
    info!("HTTP server listening on {}", http_addr);

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
        info!("Shutdown requested");
    });
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }

    orchestrator.shutdown().await;
    Ok(())
}
