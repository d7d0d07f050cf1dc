use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::catalog::DeviceKind;
use crate::core::Request;
use crate::observe::Observe;
use crate::parser::TargetSelector;
use crate::store::{
    Goal, GoalAggregate, GoalComparator, Intent, IntentStatus, PolicyKind, Store,
};

#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    pub interval: std::time::Duration,
    pub tolerance: f64,
    pub metric_retention: std::time::Duration,
    pub correction_step: f64,
    pub pause_ticks: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        FeedbackConfig {
            interval: std::time::Duration::from_secs(15),
            tolerance: 0.10,
            metric_retention: std::time::Duration::from_secs(24 * 60 * 60),
            correction_step: 0.25,
            pause_ticks: 10,
        }
    }
}

// Oscillation bookkeeping per goal-bearing intent.
#[derive(Debug, Default)]
struct Tracker {
    last_within: Option<bool>,
    last_transition_tick: u64,
    oscillations: u32,
    paused_until: u64,
}

/// The closed loop: each tick compares observed aggregates against every
/// active goal and nudges drifting intents back through the normal
/// submission path.
pub struct FeedbackLoop {
    store: Arc<Store>,
    requests: tokio::sync::mpsc::Sender<Request>,
    config: FeedbackConfig,
    observe: Arc<Observe>,
    trackers: HashMap<Uuid, Tracker>,
    tick_index: u64,
    log: slog::Logger,
}

impl FeedbackLoop {
    pub fn new(
        store: Arc<Store>,
        requests: tokio::sync::mpsc::Sender<Request>,
        config: FeedbackConfig,
        observe: Arc<Observe>,
        log: slog::Logger,
    ) -> FeedbackLoop {
        FeedbackLoop {
            store,
            requests,
            config,
            observe,
            trackers: HashMap::new(),
            tick_index: 0,
            log,
        }
    }

    pub fn spawn(
        mut self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn(async move {
            let period = self.config.interval;
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            slog::debug!(self.log, "feedback loop exiting");
        })
    }

    pub async fn tick(&mut self) {
        let retention = chrono::Duration::from_std(self.config.metric_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        if let Err(e) = self.store.prune_metrics(Utc::now() - retention).await {
            slog::warn!(self.log, "metric pruning failed"; "error" => e.to_string());
        }

        let intents = match self.store.active_goal_intents().await {
            Ok(intents) => intents,
            Err(e) => {
                slog::error!(self.log, "unable to read active intents"; "error" => e.to_string());
                self.tick_index += 1;
                return;
            }
        };
        self.observe.intents_active.set(intents.len() as i64);

        for intent in intents {
            self.evaluate_intent(&intent).await;
        }
        self.tick_index += 1;
    }

    async fn evaluate_intent(&mut self, intent: &Intent) {
        let goal = match &intent.goal {
            Some(goal) => goal.clone(),
            None => return,
        };
        self.observe.feedback_evaluations.inc();

        let window = chrono::Duration::from_std(self.config.interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let samples = match self
            .store
            .metric_window(&goal.metric, goal.device_id.as_deref(), Utc::now() - window)
            .await
        {
            Ok(samples) => samples,
            Err(e) => {
                slog::warn!(self.log, "metric query failed";
                    "metric" => &goal.metric, "error" => e.to_string());
                self.observe.feedback_metric_unavailable.inc();
                return;
            }
        };
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let observed = match aggregate(goal.aggregate, &values) {
            Some(observed) => observed,
            None => {
                // No samples in the window; the status does not change.
                self.observe.feedback_metric_unavailable.inc();
                return;
            }
        };

        let within = within_band(&goal, observed, self.config.tolerance);
        slog::debug!(self.log, "goal evaluated";
            "intent" => intent.id.to_string(), "metric" => &goal.metric,
            "observed" => observed, "target" => goal.value, "within" => within);

        if within {
            if matches!(intent.status, IntentStatus::Violated | IntentStatus::Applied) {
                self.send(Request::SetIntentStatus {
                    intent_id: intent.id,
                    status: IntentStatus::Satisfied,
                    reason: "goal_within_band",
                })
                .await;
            }
        } else {
            if intent.status != IntentStatus::Violated {
                self.send(Request::SetIntentStatus {
                    intent_id: intent.id,
                    status: IntentStatus::Violated,
                    reason: "goal_outside_band",
                })
                .await;
            }
            if self.tick_index >= self.tracker(intent.id).paused_until {
                self.emit_correction(intent, &goal, observed).await;
            }
        }

        self.note_transition(intent.id, within).await;
    }

    fn tracker(&mut self, intent_id: Uuid) -> &mut Tracker {
        self.trackers.entry(intent_id).or_default()
    }

    // A satisfied->violated->satisfied swing completed within three ticks is
    // one oscillation; three in a row pause corrections for this intent.
    async fn note_transition(&mut self, intent_id: Uuid, within: bool) {
        let tick = self.tick_index;
        let pause_ticks = self.config.pause_ticks;
        let tracker = self.tracker(intent_id);
        let transitioned = tracker.last_within.map(|w| w != within).unwrap_or(false);
        if !transitioned {
            if tracker.last_within.is_none() {
                tracker.last_within = Some(within);
                tracker.last_transition_tick = tick;
            }
            return;
        }

        if tick.saturating_sub(tracker.last_transition_tick) > 3 {
            tracker.oscillations = 0;
        }
        if within {
            // Completed a violated->satisfied swing.
            tracker.oscillations += 1;
            if tracker.oscillations >= 3 {
                tracker.paused_until = tick + pause_ticks;
                tracker.oscillations = 0;
                self.observe.feedback_hysteresis_blocks.inc();
                slog::info!(self.log, "hysteresis block";
                    "intent" => intent_id.to_string(), "paused_until_tick" => tick + pause_ticks);
                if let Err(e) = self
                    .store
                    .record_audit(
                        "intent",
                        &intent_id.to_string(),
                        "hysteresis_block",
                        Some(&format!("paused until tick {}", tick + pause_ticks)),
                    )
                    .await
                {
                    slog::warn!(self.log, "unable to record hysteresis block"; "error" => e.to_string());
                }
            }
        }
        let tracker = self.tracker(intent_id);
        tracker.last_within = Some(within);
        tracker.last_transition_tick = tick;
    }

    /// Emit at most one corrective intent for this intent this tick, through
    /// the normal parse/compile/apply path.
    async fn emit_correction(&mut self, intent: &Intent, goal: &Goal, observed: f64) {
        let phrase = match intent
            .parsed
            .first()
            .and_then(|p| selector_phrase(&p.target_selector))
        {
            Some(phrase) => phrase,
            None => {
                slog::warn!(self.log, "cannot re-phrase target selector for correction";
                    "intent" => intent.id.to_string());
                return;
            }
        };

        let current = self.current_enforced_value(intent, goal).await;
        let raw_text = match correction_text(goal, current, observed, self.config.correction_step, &phrase)
        {
            Some(raw_text) => raw_text,
            None => return,
        };

        slog::info!(self.log, "emitting corrective intent";
            "parent" => intent.id.to_string(), "text" => &raw_text);
        self.observe.feedback_corrections.inc();
        self.send(Request::Submit {
            raw_text,
            submitter: "feedback".to_owned(),
            parent: Some(intent.id),
            reply: None,
        })
        .await;
    }

    // The live value on the goal's enforcement key. After a correction the
    // claim belongs to the corrective child, so chase the conflict key rather
    // than the parent's own (rolled back) policy.
    async fn current_enforced_value(&self, intent: &Intent, goal: &Goal) -> Option<f64> {
        let kind = match goal.metric.as_str() {
            "latency_ms" => PolicyKind::NetemDelay,
            "throughput_bps" => PolicyKind::HtbClass,
            _ => return None,
        };
        let own = self.store.policies_for_intent(intent.id).await.ok()?;
        let key = own
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.conflict_key.clone())?;
        let live = self.store.live_conflicts(&key, Uuid::nil()).await.ok()?;
        let policy = live.iter().find(|p| p.kind == kind)?;
        let parameter = match kind {
            PolicyKind::NetemDelay => policy
                .parameters
                .get("effective_delay_ms")
                .or_else(|| policy.parameters.get("delay_ms")),
            _ => policy.parameters.get("rate_bps"),
        };
        parameter.and_then(|v| v.as_f64())
    }

    async fn send(&self, request: Request) {
        if let Err(e) = self.requests.send(request).await {
            slog::error!(self.log, "submission worker unreachable"; "error" => e.to_string());
        }
    }
}

pub fn aggregate(aggregate: GoalAggregate, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match aggregate {
        GoalAggregate::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
        GoalAggregate::Max => values.iter().cloned().reduce(f64::max),
        GoalAggregate::P95 => {
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
            sorted.get(rank.saturating_sub(1)).copied()
        }
    }
}

/// The symmetric tolerance band around the goal value.
pub fn within_band(goal: &Goal, observed: f64, tolerance: f64) -> bool {
    match goal.comparator {
        GoalComparator::AtMost => observed <= goal.value * (1.0 + tolerance),
        GoalComparator::AtLeast => observed >= goal.value * (1.0 - tolerance),
    }
}

/// One bounded correction step towards the goal, rendered back into the
/// intent grammar.
pub fn correction_text(
    goal: &Goal,
    current: Option<f64>,
    observed: f64,
    step: f64,
    target_phrase: &str,
) -> Option<String> {
    match (goal.metric.as_str(), goal.comparator) {
        ("latency_ms", GoalComparator::AtMost) => {
            let current = current.unwrap_or(goal.value);
            let tightened = (current * (1.0 - step)).floor().max(1.0);
            if observed <= goal.value || tightened >= current {
                return None;
            }
            Some(format!(
                "set latency to {}ms for {}",
                tightened as u64, target_phrase
            ))
        }
        ("throughput_bps", GoalComparator::AtMost) => {
            let current = current.unwrap_or(goal.value);
            let tightened = (current * (1.0 - step)).floor().max(1024.0);
            if observed <= goal.value || tightened >= current {
                return None;
            }
            Some(format!(
                "limit {} to {}bit",
                target_phrase, tightened as u64
            ))
        }
        ("throughput_bps", GoalComparator::AtLeast) => {
            let current = current.unwrap_or(goal.value);
            let loosened = (current * (1.0 + step)).ceil();
            Some(format!("limit {} to {}bit", target_phrase, loosened as u64))
        }
        _ => None,
    }
}

/// Render a selector back into a phrase the grammar accepts.
pub fn selector_phrase(selector: &TargetSelector) -> Option<String> {
    match selector {
        TargetSelector::Ids(ids) if ids.is_empty() => None,
        TargetSelector::Ids(ids) => Some(ids.join(" and ")),
        TargetSelector::Glob(pattern) => Some(pattern.clone()),
        TargetSelector::Kind(kind) => kind_plural(*kind),
        TargetSelector::KindLabeled { kind, label } => {
            kind_plural(*kind).map(|plural| format!("{} {}", label, plural))
        }
    }
}

fn kind_plural(kind: DeviceKind) -> Option<String> {
    match kind {
        DeviceKind::Sensor => Some("sensors".to_owned()),
        DeviceKind::Camera => Some("cameras".to_owned()),
        DeviceKind::Audio => Some("audio devices".to_owned()),
        DeviceKind::Gateway => Some("gateways".to_owned()),
        DeviceKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_store;
    use crate::store::MetricSample;

    fn goal(metric: &str, value: f64) -> Goal {
        Goal {
            metric: metric.to_owned(),
            device_id: Some("sensor-01".to_owned()),
            aggregate: GoalAggregate::Mean,
            comparator: GoalComparator::AtMost,
            value,
        }
    }

    #[test]
    fn aggregates_compute_mean_max_p95() {
        let values = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(aggregate(GoalAggregate::Mean, &values), Some(25.0));
        assert_eq!(aggregate(GoalAggregate::Max, &values), Some(40.0));
        assert_eq!(aggregate(GoalAggregate::P95, &values), Some(40.0));
        assert_eq!(aggregate(GoalAggregate::Mean, &[]), None);
    }

    #[test]
    fn tolerance_band_is_symmetric_around_goal() {
        let cap = goal("latency_ms", 20.0);
        assert!(within_band(&cap, 22.0, 0.10));
        assert!(!within_band(&cap, 22.1, 0.10));
        assert!(within_band(&cap, 5.0, 0.10));

        let floor = Goal {
            comparator: GoalComparator::AtLeast,
            ..goal("throughput_bps", 1000.0)
        };
        assert!(within_band(&floor, 900.0, 0.10));
        assert!(!within_band(&floor, 899.0, 0.10));
    }

    #[test]
    fn correction_tightens_by_a_bounded_step() {
        let goal = goal("latency_ms", 20.0);
        let text = correction_text(&goal, Some(20.0), 40.0, 0.25, "sensor-01").unwrap();
        assert_eq!(text, "set latency to 15ms for sensor-01");

        // Already within goal: no correction.
        assert!(correction_text(&goal, Some(20.0), 19.0, 0.25, "sensor-01").is_none());
    }

    #[test]
    fn selector_phrases_round_trip_through_grammar() {
        use crate::catalog::tests::test_snapshot;
        let snapshot = test_snapshot();
        let phrases = [
            selector_phrase(&TargetSelector::Ids(vec!["temp-01".to_owned()])).unwrap(),
            selector_phrase(&TargetSelector::Glob("esp32-*".to_owned())).unwrap(),
            selector_phrase(&TargetSelector::Kind(DeviceKind::Camera)).unwrap(),
            selector_phrase(&TargetSelector::KindLabeled {
                kind: DeviceKind::Sensor,
                label: "temperature".to_owned(),
            })
            .unwrap(),
        ];
        for phrase in phrases {
            let selector = snapshot.parse_target_phrase(&phrase).unwrap();
            assert!(!snapshot.resolve_targets(&selector).is_empty(), "{}", phrase);
        }
    }

    async fn seeded_intent(store: &Store, status: IntentStatus) -> Intent {
        use crate::store::tests::test_intent;
        let mut intent = test_intent("reduce latency to 20ms for sensor-01", "operator");
        intent.parsed = vec![crate::parser::ParsedIntent {
            kind: crate::parser::IntentKind::Latency,
            target_selector: TargetSelector::Ids(vec!["sensor-01".to_owned()]),
            parameters: serde_json::json!({"delay_ms": 20}),
        }];
        intent.goal = Some(goal("latency_ms", 20.0));
        intent.status = status;
        store.create_intent(&intent, &[]).await.unwrap();
        intent
    }

    async fn inject_latency(store: &Store, value: f64, offset_ms: i64) {
        store
            .append_metric(&MetricSample {
                metric_name: "latency_ms".to_owned(),
                device_id: Some("sensor-01".to_owned()),
                value,
                timestamp: Utc::now() - chrono::Duration::milliseconds(offset_ms),
            })
            .await
            .unwrap();
    }

    fn test_loop(
        store: Arc<Store>,
    ) -> (
        FeedbackLoop,
        tokio::sync::mpsc::Receiver<Request>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let feedback = FeedbackLoop::new(
            store,
            tx,
            FeedbackConfig::default(),
            Observe::new(),
            log,
        );
        (feedback, rx)
    }

    #[tokio::test]
    async fn drifted_goal_marks_violated_and_emits_correction() {
        let store = Arc::new(test_store().await);
        let intent = seeded_intent(&store, IntentStatus::Applied).await;
        for i in 0..3 {
            inject_latency(&store, 40.0, i * 100).await;
        }

        let (mut feedback, mut rx) = test_loop(store);
        feedback.tick().await;

        let first = rx.try_recv().unwrap();
        match first {
            Request::SetIntentStatus {
                intent_id, status, ..
            } => {
                assert_eq!(intent_id, intent.id);
                assert_eq!(status, IntentStatus::Violated);
            }
            _ => panic!("expected a status update first"),
        }
        let second = rx.try_recv().unwrap();
        match second {
            Request::Submit {
                raw_text,
                submitter,
                parent,
                ..
            } => {
                assert_eq!(submitter, "feedback");
                assert_eq!(parent, Some(intent.id));
                assert_eq!(raw_text, "set latency to 15ms for sensor-01");
            }
            _ => panic!("expected a corrective submission"),
        }
    }

    #[tokio::test]
    async fn converged_goal_marks_satisfied() {
        let store = Arc::new(test_store().await);
        let intent = seeded_intent(&store, IntentStatus::Violated).await;
        for i in 0..3 {
            inject_latency(&store, 21.0, i * 100).await;
        }

        let (mut feedback, mut rx) = test_loop(store);
        feedback.tick().await;

        match rx.try_recv().unwrap() {
            Request::SetIntentStatus {
                intent_id, status, ..
            } => {
                assert_eq!(intent_id, intent.id);
                assert_eq!(status, IntentStatus::Satisfied);
            }
            _ => panic!("expected a status update"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_samples_leave_status_untouched() {
        let store = Arc::new(test_store().await);
        seeded_intent(&store, IntentStatus::Applied).await;

        let (mut feedback, mut rx) = test_loop(store);
        let before = feedback.observe.feedback_metric_unavailable.get();
        feedback.tick().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(feedback.observe.feedback_metric_unavailable.get(), before + 1);
    }

    #[tokio::test]
    async fn oscillation_pauses_corrections_after_three_swings() {
        let store = Arc::new(test_store().await);
        let intent = seeded_intent(&store, IntentStatus::Applied).await;
        let (mut feedback, _rx) = test_loop(store);

        // Drive the tracker directly through three fast swings.
        for _ in 0..3 {
            feedback.note_transition(intent.id, false).await;
            feedback.tick_index += 1;
            feedback.note_transition(intent.id, true).await;
            feedback.tick_index += 1;
        }
        let tracker = feedback.trackers.get(&intent.id).unwrap();
        assert!(tracker.paused_until > feedback.tick_index);
        assert_eq!(feedback.observe.feedback_hysteresis_blocks.get(), 1);
    }
}
