//! Daemon assembly — wires the store, metric source, router, analysis
//! engine, controller and API together and runs the HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use rollgate_analysis::{AnalysisEngine, EngineConfig};
use rollgate_api::{ApiState, build_router};
use rollgate_core::config::MetricsBackend;
use rollgate_core::{DaemonConfig, RolloutId, RolloutManifest};
use rollgate_metrics::{CohortRecorder, MetricSource, PrometheusSource, QueryTemplates};
use rollgate_rollout::{
    AlertFanout, ControllerError, LogAlertSink, MachineSettings, MemoryAlertSink,
    RolloutController, WebhookAlertSink,
};
use rollgate_state::StateStore;
use rollgate_traffic::WeightedRouter;

/// How often idle cohort series are dropped from the recorder.
const RECORDER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Every long-lived component of a running daemon.
pub struct Daemon {
    pub controller: Arc<RolloutController>,
    pub api: ApiState,
    pub router: WeightedRouter,
}

/// Build the daemon's components over an opened store.
pub fn assemble(config: &DaemonConfig, store: StateStore) -> anyhow::Result<Daemon> {
    let recorder = CohortRecorder::default();
    let source: Arc<dyn MetricSource> = match config.metrics.backend {
        MetricsBackend::Prometheus => {
            let templates = QueryTemplates::with_overrides(
                &config.metrics.queries,
                config.metrics.count_query.as_deref(),
            );
            info!(address = %config.metrics.prometheus_address, "using prometheus metric source");
            Arc::new(PrometheusSource::new(
                &config.metrics.prometheus_address,
                templates,
            ))
        }
        MetricsBackend::Recorder => {
            info!("using in-process cohort recorder as metric source");
            Arc::new(recorder.clone())
        }
    };
    let engine = AnalysisEngine::new(
        source,
        EngineConfig {
            query_timeout: config.metrics.query_timeout,
        },
    );

    let memory_alerts = MemoryAlertSink::new(config.alerts.history);
    let mut alerts = AlertFanout::new()
        .with(Arc::new(LogAlertSink))
        .with(Arc::new(memory_alerts.clone()));
    if let Some(target) = &config.alerts.webhook {
        let webhook = WebhookAlertSink::new(target)
            .with_context(|| format!("invalid alert webhook {target:?}"))?;
        info!(endpoint = %webhook.endpoint(), "alert webhook enabled");
        alerts = alerts.with(Arc::new(webhook));
    }

    let router = WeightedRouter::new();
    for pools in &config.services {
        router
            .register(pools)
            .with_context(|| format!("invalid backend pools for service {:?}", pools.name))?;
        info!(
            service = %pools.name,
            stable = pools.stable.len(),
            canary = pools.canary.len(),
            "service pools registered"
        );
    }
    let controller = Arc::new(RolloutController::new(
        store,
        engine,
        Arc::new(router.clone()),
        Arc::new(alerts),
        MachineSettings::from_config(&config.controller),
    ));

    Ok(Daemon {
        api: ApiState {
            controller: controller.clone(),
            recorder,
            alerts: memory_alerts,
            router: router.clone(),
        },
        controller,
        router,
    })
}

/// Start every rollout in a manifest. Rollouts whose workload is already
/// rolling out, or already runs the canary version, are skipped.
pub async fn start_manifest(
    controller: &RolloutController,
    manifest: &RolloutManifest,
) -> anyhow::Result<Vec<RolloutId>> {
    let mut started = Vec::new();
    for spec in &manifest.rollouts {
        let promoted = controller
            .store()
            .get_workload(&spec.workload)?
            .is_some_and(|r| r.active_rollout.is_none() && r.stable_version == spec.canary_version);
        if promoted {
            info!(
                workload = %spec.workload,
                version = %spec.canary_version,
                "workload already runs the canary version, skipping"
            );
            continue;
        }

        match controller.start(spec.clone()).await {
            Ok(id) => {
                info!(rollout = %id, workload = %spec.workload, "manifest rollout started");
                started.push(id);
            }
            Err(ControllerError::AlreadyActive { workload, holder }) => {
                info!(%workload, rollout = %holder, "workload already rolling out, skipping");
            }
            Err(e) => {
                warn!(workload = %spec.workload, error = %e, "manifest rollout rejected");
            }
        }
    }
    Ok(started)
}

pub async fn run_serve(
    config: DaemonConfig,
    manifest: Option<RolloutManifest>,
) -> anyhow::Result<()> {
    info!("Rollgate daemon starting");

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("rollgate.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let daemon = assemble(&config, store)?;

    let resumed = daemon.controller.recover().await?;
    info!(count = resumed.len(), "unfinished rollouts resumed");

    if let Some(manifest) = &manifest {
        let started = start_manifest(&daemon.controller, manifest).await?;
        info!(count = started.len(), "manifest applied");
    }

    let recorder = daemon.api.recorder.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RECORDER_PRUNE_INTERVAL);
        loop {
            tick.tick().await;
            let dropped = recorder.prune().await;
            if dropped > 0 {
                debug!(dropped, "idle cohort series pruned");
            }
        }
    });

    // ── Start API server ───────────────────────────────────────

    let app = build_router(daemon.api.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    // Persisted state is resumed on the next start.
    daemon.controller.shutdown().await;
    info!(
        services = daemon.router.list_services().len(),
        "Rollgate daemon stopped"
    );
    Ok(())
}
