use anyhow::Context;

use worker_engine::config::{EngineConfig, StoreBackend};
use worker_engine::engine::Engine;
use worker_engine::error::HandlerError;
use worker_engine::handlers::HandlerOutput;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    eprintln!("⚙️  Worker Engine v{}", env!("CARGO_PKG_VERSION"));
    match &config.store {
        StoreBackend::LibSql { path } => eprintln!("   Store: libsql ({})", path.display()),
        StoreBackend::Memory => eprintln!("   Store: in-memory"),
    }
    eprintln!(
        "   Batch: {} every {}s, handler timeout {}s",
        config.dispatch.batch_size,
        config.dispatch.poll_interval.as_secs(),
        config.execution.handler_timeout.as_secs()
    );
    eprintln!("   Press Ctrl-C to stop.\n");

    let engine = Engine::open(config)
        .await
        .context("failed to start engine")?;

    engine
        .register_fn("echo", |ctx, payload| async move {
            tracing::info!(task_id = %ctx.task_id, payload = %payload, "echo");
            Ok::<_, HandlerError>(HandlerOutput::json(payload).with_summary("echoed payload"))
        })
        .await;

    for schedule in engine.list_schedules().await? {
        tracing::info!(
            schedule = %schedule.name,
            trigger = %schedule.trigger,
            paused = schedule.paused,
            next_fire_at = ?schedule.next_fire_at,
            "Loaded schedule"
        );
    }

    let handle = engine.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, finishing in-flight tasks");
    handle.shutdown().await;

    Ok(())
}
