use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sim_supervisor::backend::Backends;
use sim_supervisor::config::{AgentConfig, DispatchMode, SupervisorConfig};
use sim_supervisor::job::JobTracker;
use sim_supervisor::protocol::agent::spawn_agent;
use sim_supervisor::protocol::server::{ServerState, supervisor_routes};
use sim_supervisor::runner::{AgentDispatcher, LocalRunner};

const USAGE: &str = "usage: sim-supervisor <serve|agent>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mode = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    match mode.as_str() {
        "serve" => serve().await,
        "agent" => agent().await,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    let config = SupervisorConfig::from_env()?;
    let _log_guard = init_tracing(config.log_dir.as_deref(), "supervisor.log");

    eprintln!("Sim Supervisor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.bind);
    eprintln!("   Dispatch: {:?}", config.dispatch);

    let mut tracker = None;
    let state = match config.dispatch {
        DispatchMode::Local => {
            let backends = Backends::from_config(&config.backends);
            eprintln!("   Backends: {:?}", backends.kinds());
            let local = Arc::new(JobTracker::new(config.backends.grace_period));
            tracker = Some(Arc::clone(&local));
            ServerState::local(Arc::new(LocalRunner::new(local, backends)))
        }
        DispatchMode::Agent => ServerState::dispatching(Arc::new(
            AgentDispatcher::with_retention(config.dispatch_retention),
        )),
    };

    let app = supervisor_routes(state);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(bind = %config.bind, "Supervisor started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    if let Some(tracker) = tracker {
        let killed = tracker.kill_everything().await;
        tracing::info!(killed, "Supervisor stopped");
    }
    Ok(())
}

async fn agent() -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::from_env()?;
    let _log_guard = init_tracing(config.log_dir.as_deref(), "agent.log");

    eprintln!("Sim Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent id: {}", config.agent_id);
    eprintln!("   Supervisor: {}", config.supervisor_url);

    let backends = Backends::from_config(&config.backends);
    let tracker = Arc::new(JobTracker::new(config.backends.grace_period));
    let (handle, shutdown) = spawn_agent(config, Arc::clone(&tracker), backends);

    tokio::signal::ctrl_c().await?;
    shutdown.store(true, Ordering::Relaxed);
    let killed = tracker.kill_everything().await;
    tracing::info!(killed, "Agent stopped");
    handle.abort();
    Ok(())
}

/// Log to stderr, and to a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>, file_name: &str) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
