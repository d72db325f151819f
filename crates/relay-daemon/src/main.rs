//! The relay host process.
//!
//! Boot sequence: resolve configuration, initialize tracing and the store,
//! wire the supervisor and executor together, reload persisted state
//! (crash-recovery resume), replay the delivery queue, then run the
//! heartbeat sweep and health endpoint until SIGINT.

mod config;
mod serve;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_core::breaker::BreakerRegistry;
use relay_core::dag::DagExecutor;
use relay_core::delivery::DeliveryQueue;
use relay_core::harness::ClaudeHarness;
use relay_core::health::HealthRegistry;
use relay_core::router::ModelRouter;
use relay_core::supervisor::{SupervisorConfig, TaskSupervisor};
use relay_store::{DataDir, JsonStore, RelayConfig};

use config::{DaemonConfig, load_config_file};

#[derive(Parser)]
#[command(name = "relayd", about = "Swarm orchestration daemon for the personal-assistant relay")]
struct Cli {
    /// Root directory holding data/
    #[arg(long, env = "PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Heartbeat sweep interval in seconds
    #[arg(long)]
    heartbeat_secs: Option<u64>,

    /// Bind address for the health/metrics endpoint
    #[arg(long)]
    health_addr: Option<SocketAddr>,

    /// Disable the health/metrics endpoint
    #[arg(long)]
    no_serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut relay_config = RelayConfig::from_env();
    if let Some(dir) = cli.project_dir {
        relay_config.project_dir = dir;
    }
    let file = load_config_file(&relay_config.project_dir)?;
    let daemon_config = DaemonConfig::resolve(
        cli.heartbeat_secs,
        cli.health_addr,
        relay_config.claude_path.clone(),
        file,
    )?;

    info!(
        project_dir = %relay_config.project_dir.display(),
        agent = %daemon_config.claude_path,
        timezone = relay_config.user_timezone.as_deref().unwrap_or("unset"),
        "relayd starting"
    );

    let store = Arc::new(JsonStore::new(DataDir::new(relay_config.data_dir())));
    store.init().await.context("failed to initialize data dir")?;

    let harness = Arc::new(ClaudeHarness::with_binary(&daemon_config.claude_path));
    let supervisor_config = SupervisorConfig {
        default_workdir: relay_config.project_dir.clone(),
        ..Default::default()
    };
    let supervisor = TaskSupervisor::new(Arc::clone(&store), harness, supervisor_config);
    supervisor.load().await.context("failed to load task registry")?;

    let executor = DagExecutor::new(
        Arc::clone(&store),
        Arc::clone(&supervisor),
        ModelRouter::default(),
    );
    executor.attach().await;
    let resumed = executor
        .resume_from_disk()
        .await
        .context("failed to resume swarms")?;
    info!(resumed, "crash-recovery resume finished");

    supervisor
        .set_alert_callback(Arc::new(|message| {
            info!(alert = %message, "task alert");
        }))
        .await;

    // The chat transport is an external collaborator; replayed entries are
    // logged here and re-queued by the transport when it reconnects.
    let queue = DeliveryQueue::new(Arc::clone(&store));
    queue.load().await?;
    let replayed = queue
        .drain(|reply| async move {
            info!(chat_id = %reply.chat_id, reply_id = %reply.id, "replaying pending reply");
            Ok(())
        })
        .await?;
    if replayed > 0 {
        info!(replayed, "delivery queue replayed");
    }

    let breakers = Arc::new(BreakerRegistry::default());
    let health = Arc::new(HealthRegistry::new());
    health.register(Arc::clone(&breakers) as _).await;

    let cancel = CancellationToken::new();

    if !cli.no_serve {
        let state = serve::AppState {
            health: Arc::clone(&health),
            supervisor: Arc::clone(&supervisor),
            executor: Arc::clone(&executor),
            breakers: Arc::clone(&breakers),
        };
        let addr = daemon_config.health_addr;
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serve::serve(addr, state, serve_cancel).await {
                warn!(error = %format!("{e:#}"), "health endpoint exited");
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    run_heartbeat(
        &store,
        &supervisor,
        &executor,
        Duration::from_secs(daemon_config.heartbeat_secs),
        cancel,
    )
    .await;

    info!("relayd stopped");
    Ok(())
}

/// The periodic safety net: sweep supervised tasks, re-tick every active
/// graph, and persist the rotation state.
async fn run_heartbeat(
    store: &Arc<JsonStore>,
    supervisor: &Arc<TaskSupervisor>,
    executor: &Arc<DagExecutor>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut state = match store.load_heartbeat().await {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "failed to load heartbeat state, starting fresh");
            Default::default()
        }
    };

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                supervisor.check().await;
                executor.tick_all().await;

                state.sweep_count += 1;
                state.last_run_at = Some(Utc::now());
                if let Err(e) = store.save_heartbeat(&state).await {
                    warn!(error = %e, "failed to persist heartbeat state");
                }
            }
        }
    }
}
