mod routes;
mod webhook;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use mainline_agent::{claude::ClaudeCli, executor::ChatExecutor};
use mainline_core::{
    adapters::AdapterManager,
    agent::{AgentExecutor, AgentProcess},
    bus::EventBus,
    circuit::BreakerSet,
    config::Config,
    director::Director,
    dlq::DeadLetterQueue,
    git::Git,
    idempotency::IdempotencyGuard,
    integrator::Integrator,
    janitor::Janitor,
    manifest::ManifestManager,
    rate::RateLimiter,
    reactions::ReactionEngine,
    runner::PipelineRunner,
    saga,
    sessions::SessionStore,
    types::{ManifestReadyEntry, PipelineEvent, PipelineEventType},
};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "mainline_server=info,mainline_core=info,mainline_agent=info,tower_http=warn".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Config parse failure is fatal; a missing file means defaults.
    let config_path =
        std::env::var("MAINLINE_CONFIG").unwrap_or_else(|_| "mainline.json".into());
    let config = Arc::new(Config::load(Path::new(&config_path))?);
    std::fs::create_dir_all(config.pipeline_dir())?;

    let bus = Arc::new(EventBus::new(config.events_path()));
    let breakers = Arc::new(BreakerSet::from_config(&config.resilience.circuit_breaker));
    let idempotency =
        Arc::new(IdempotencyGuard::load(config.pipeline_dir().join("idempotency.json"))?);
    let dlq = Arc::new(DeadLetterQueue::new(config.dlq_path(), &config.resilience.dlq));

    // Startup recovery: half-finished sagas are flagged, never auto-resumed.
    let incomplete = saga::incomplete_sagas(&config.sagas_path()).await;
    for log in &incomplete {
        warn!(
            request_id = %log.request_id,
            "saga '{}' was interrupted at step {:?}",
            log.saga_name, log.current_step,
        );
    }
    if !incomplete.is_empty() {
        warn!("{} interrupted saga(s) need manual inspection", incomplete.len());
    }

    let executor: Arc<dyn AgentExecutor> =
        Arc::new(ChatExecutor::new(&config, breakers.claude.clone()));
    let runner = PipelineRunner::new(
        Arc::clone(&config),
        Arc::clone(&bus),
        executor,
        Arc::clone(&idempotency),
    );

    let claude_bin = std::env::var("CLAUDE_BIN").unwrap_or_else(|_| "claude".into());
    let conflict_agent: Arc<dyn AgentProcess> = Arc::new(ClaudeCli::new(claude_bin));

    let manifest = Arc::new(ManifestManager::new(config.pipeline_dir()));
    let integrator = Arc::new(Integrator::new(
        Arc::clone(&config),
        Arc::clone(&bus),
        Arc::clone(&breakers),
        Arc::clone(&conflict_agent),
    ));
    let director =
        Arc::new(Director::new(Arc::clone(&config), Arc::clone(&manifest), integrator));
    let sessions = Arc::new(SessionStore::new(config.sessions_path()));
    let reactions = ReactionEngine::new(
        Arc::clone(&config),
        Arc::clone(&bus),
        sessions,
        Arc::clone(&conflict_agent),
        Arc::clone(&breakers),
        config.project_path.clone(),
    );
    let janitor = Arc::new(Janitor::new(
        Arc::clone(&config),
        Arc::clone(&manifest),
        config.project_path.clone(),
    ));

    // ── Bus listeners ─────────────────────────────────────────────────────

    // Manifest writer: a completed run becomes a ready entry, except
    // skip_merge runs, which take the removed exit instead.
    {
        let mut sub = bus.subscribe_types(&[PipelineEventType::PipelineCompleted]);
        let manifest = Arc::clone(&manifest);
        let config = Arc::clone(&config);
        let janitor = Arc::clone(&janitor);
        tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                let skip_merge =
                    event.data.get("skip_merge").and_then(Value::as_bool).unwrap_or(false);
                if skip_merge {
                    if let Some(branch) = event.data.get("branch").and_then(Value::as_str) {
                        info!(branch, "skip_merge run retired without a manifest entry");
                        janitor.retire(branch).await;
                    }
                    continue;
                }
                if let Err(e) = write_ready_entry(&manifest, &config, &event).await {
                    warn!(request_id = %event.request_id, "manifest writer: {e:#}");
                }
            }
        });
    }

    // Failed, errored, and stopped runs never integrate; clean up their
    // pipeline branches unless the config keeps failed work around.
    {
        let mut sub = bus.subscribe_types(&[
            PipelineEventType::PipelineFailed,
            PipelineEventType::PipelineError,
            PipelineEventType::PipelineStopped,
        ]);
        let janitor = Arc::clone(&janitor);
        tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                janitor.on_run_failed(&event).await;
            }
        });
    }

    // Director trigger: give the manifest write time to land, then cycle.
    // Merged PRs move the trunk and may unblock dependent entries, so they
    // schedule a cycle too.
    {
        let mut sub = bus.subscribe_types(&[
            PipelineEventType::PipelineCompleted,
            PipelineEventType::IntegrationPrMerged,
        ]);
        let director = Arc::clone(&director);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            while let Some(_event) = sub.rx.recv().await {
                tokio::time::sleep(Duration::from_millis(config.director.auto_trigger_delay_ms))
                    .await;
                run_director_cycle(&director, &config).await;
            }
        });
    }

    // Reaction engine: CI / review / stuck-agent workflows.
    {
        let mut sub = bus.subscribe_types(ReactionEngine::trigger_types());
        let reactions = Arc::clone(&reactions);
        tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                reactions.handle(&event).await;
            }
        });
    }

    // Janitor: merged PRs advance the manifest and drop dead branches.
    {
        let mut sub = bus.subscribe_types(&[PipelineEventType::IntegrationPrMerged]);
        let janitor = Arc::clone(&janitor);
        tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                janitor.on_merged(&event).await;
            }
        });
    }

    // ── Periodic work ─────────────────────────────────────────────────────

    // Outbound webhook adapters + DLQ retry sweeper.
    AdapterManager::new(Arc::clone(&bus), Arc::clone(&dlq), config.adapters.webhooks.clone())
        .start();
    if config.resilience.dlq.enabled {
        let dlq = Arc::clone(&dlq);
        let interval = Duration::from_millis(config.adapters.retry_interval_ms.max(1_000));
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            loop {
                tokio::time::sleep(interval).await;
                dlq.sweep(&client).await;
            }
        });
    }

    // Optional periodic director cycle.
    if config.director.schedule_interval_ms > 0 {
        let director = Arc::clone(&director);
        let config = Arc::clone(&config);
        let interval = Duration::from_millis(config.director.schedule_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                run_director_cycle(&director, &config).await;
            }
        });
    }

    // Daily stale-branch sweep.
    {
        let janitor = Arc::clone(&janitor);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                janitor.sweep_stale().await;
            }
        });
    }

    // ── HTTP surface ──────────────────────────────────────────────────────

    let state = Arc::new(routes::AppState {
        config: Arc::clone(&config),
        bus: Arc::clone(&bus),
        runner: Arc::clone(&runner),
        director: Arc::clone(&director),
        run_limiter: RateLimiter::new(10, 60_000),
        webhook_limiter: RateLimiter::new(60, 60_000),
        start_time: Instant::now(),
    });

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/pipeline/run", post(routes::run_pipeline))
        .route("/pipeline/stop/:request_id", post(routes::stop_pipeline))
        .route("/pipeline/status/:request_id", get(routes::pipeline_status))
        .route("/pipeline/list", get(routes::list_pipelines))
        .route("/pipeline/events/:request_id", get(routes::pipeline_events))
        .route("/director/run", post(routes::director_run))
        .route("/webhooks/:vcs", post(routes::vcs_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Intake is closed; cancel the runs and give compensating sagas and
    // pending DLQ writes a moment to settle before exit.
    runner.stop_all();
    tokio::time::sleep(Duration::from_millis(750)).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, draining");
}

/// One director cycle in its own task, so a panic is caught and logged
/// instead of killing the trigger loop.
async fn run_director_cycle(director: &Arc<Director>, config: &Arc<Config>) {
    let director = Arc::clone(director);
    let project_path = config.project_path.clone();
    let handle = tokio::spawn(async move { director.run_cycle(&project_path).await });
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("director cycle: {e:#}"),
        Err(join_err) => warn!("director cycle panicked: {join_err}"),
    }
}

/// Build and append the manifest ready-entry for a completed run.
async fn write_ready_entry(
    manifest: &ManifestManager,
    config: &Config,
    event: &PipelineEvent,
) -> anyhow::Result<()> {
    let data = &event.data;
    let Some(branch) = data.get("branch").and_then(Value::as_str) else {
        anyhow::bail!("pipeline.completed without branch");
    };
    let metadata = event.metadata.clone().unwrap_or(Value::Null);
    let git = Git::new(&config.project_path);
    git.fetch_origin().await.ok();
    let base_main_sha = git
        .rev_parse(&format!("origin/{}", config.branch.main))
        .await
        .unwrap_or_default();

    let entry = ManifestReadyEntry {
        branch: branch.to_string(),
        pipeline_branch: config.pipeline_branch_for(branch),
        worktree_path: data
            .get("worktree_path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        request_id: event.request_id.clone(),
        tier: data.get("tier").cloned().and_then(|t| serde_json::from_value(t).ok()),
        pipeline_result: data.get("result").cloned().unwrap_or(Value::Null),
        corrections_applied: data
            .get("corrections_applied")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        ready_at: Utc::now(),
        priority: metadata
            .get("priority")
            .and_then(Value::as_u64)
            .map(|p| p as u32)
            .unwrap_or(config.director.default_priority),
        depends_on: metadata
            .get("depends_on")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        base_branch: data.get("base_branch").and_then(Value::as_str).map(str::to_string),
        base_main_sha,
        skip_merge: data.get("skip_merge").and_then(Value::as_bool).unwrap_or(false),
        last_error: None,
    };
    manifest.add_to_ready(entry).await
}
