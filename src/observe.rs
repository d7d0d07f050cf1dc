use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters and gauges exposed in the Prometheus text format.
pub struct Observe {
    registry: Registry,
    pub intents_submitted: IntCounter,
    pub submissions_rejected: IntCounter,
    pub policies_applied: IntCounter,
    pub policies_failed: IntCounter,
    pub feedback_evaluations: IntCounter,
    pub feedback_corrections: IntCounter,
    pub feedback_metric_unavailable: IntCounter,
    pub feedback_hysteresis_blocks: IntCounter,
    pub transport_reconnects: IntCounter,
    pub intents_active: IntGauge,
}

impl Observe {
    pub fn new() -> Arc<Observe> {
        let registry = Registry::new();
        let intents_submitted =
            IntCounter::new("drover_intents_submitted_total", "Intents accepted").unwrap();
        let submissions_rejected = IntCounter::new(
            "drover_submissions_rejected_total",
            "Submissions rejected before persistence",
        )
        .unwrap();
        let policies_applied =
            IntCounter::new("drover_policies_applied_total", "Policies applied").unwrap();
        let policies_failed =
            IntCounter::new("drover_policies_failed_total", "Policies failed").unwrap();
        let feedback_evaluations = IntCounter::new(
            "drover_feedback_evaluations_total",
            "Goal evaluations performed",
        )
        .unwrap();
        let feedback_corrections = IntCounter::new(
            "drover_feedback_corrections_total",
            "Corrective intents emitted",
        )
        .unwrap();
        let feedback_metric_unavailable = IntCounter::new(
            "drover_feedback_metric_unavailable_total",
            "Evaluations skipped for lack of samples",
        )
        .unwrap();
        let feedback_hysteresis_blocks = IntCounter::new(
            "drover_feedback_hysteresis_blocks_total",
            "Oscillating intents paused",
        )
        .unwrap();
        let transport_reconnects = IntCounter::new(
            "drover_transport_reconnects_total",
            "Message bus reconnections",
        )
        .unwrap();
        let intents_active =
            IntGauge::new("drover_intents_active", "Intents in a live status").unwrap();

        for collector in [
            &intents_submitted,
            &submissions_rejected,
            &policies_applied,
            &policies_failed,
            &feedback_evaluations,
            &feedback_corrections,
            &feedback_metric_unavailable,
            &feedback_hysteresis_blocks,
            &transport_reconnects,
        ] {
            registry.register(Box::new(collector.clone())).unwrap();
        }
        registry.register(Box::new(intents_active.clone())).unwrap();

        Arc::new(Observe {
            registry,
            intents_submitted,
            submissions_rejected,
            policies_applied,
            policies_failed,
            feedback_evaluations,
            feedback_corrections,
            feedback_metric_unavailable,
            feedback_hysteresis_blocks,
            transport_reconnects,
            intents_active,
        })
    }

    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Liveness facts shared with the health endpoint.
#[derive(Debug)]
pub struct HealthState {
    pub started_at: std::time::Instant,
    pub schema_version: i64,
    pub shaper_mode: &'static str,
    pub transport_connected: Arc<AtomicBool>,
    pub degraded: Arc<AtomicBool>,
}

impl HealthState {
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "components": {
                "store": if self.degraded.load(Ordering::Relaxed) { "degraded" } else { "ok" },
                "transport": if self.transport_connected.load(Ordering::Relaxed) { "connected" } else { "disconnected" },
                "shaper": self.shaper_mode,
            },
            "schema_version": self.schema_version,
            "uptime_seconds": self.started_at.elapsed().as_secs(),
        })
    }
}

#[derive(Clone)]
struct AppState {
    observe: Arc<Observe>,
    health: Arc<HealthState>,
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.observe.render()
}

async fn health_handler(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    axum::Json(state.health.summary())
}

/// Serve /metrics and /healthz until shutdown.
pub fn spawn_exposition(
    listen: std::net::SocketAddr,
    observe: Arc<Observe>,
    health: Arc<HealthState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    log: slog::Logger,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
        let app = axum::Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(health_handler))
            .with_state(AppState { observe, health });

        let listener = match tokio::net::TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(e) => {
                slog::error!(log, "unable to bind metrics listener";
                    "addr" => listen.to_string(), "error" => e.to_string());
                return;
            }
        };
        slog::info!(log, "metrics exposition listening"; "addr" => listen.to_string());

        let served = axum::serve(listener, app).with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        });
        if let Err(e) = served.await {
            slog::error!(log, "metrics exposition failed"; "error" => e.to_string());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_text_format() {
        let observe = Observe::new();
        observe.intents_submitted.inc();
        observe.policies_applied.inc_by(3);
        let rendered = observe.render();
        assert!(rendered.contains("drover_intents_submitted_total 1"));
        assert!(rendered.contains("drover_policies_applied_total 3"));
    }

    #[test]
    fn health_summary_reports_components() {
        let health = HealthState {
            started_at: std::time::Instant::now(),
            schema_version: 1,
            shaper_mode: "dry",
            transport_connected: Arc::new(AtomicBool::new(true)),
            degraded: Arc::new(AtomicBool::new(false)),
        };
        let summary = health.summary();
        assert_eq!(summary["components"]["store"], "ok");
        assert_eq!(summary["components"]["transport"], "connected");
        assert_eq!(summary["schema_version"], 1);
    }
}
