/**
 * RECOVERY ORCHESTRATOR - Récupération des instances en panne
 *
 * RÔLE : Consommer les rapports de santé classés, tenir un circuit breaker et
 * un limiteur par instance, et lancer les actions de récupération adaptées.
 *
 * FONCTIONNEMENT :
 * - Closed : chaque poll en échec incrémente le compteur, un rapport sain le remet à zéro
 * - Seuil atteint : Open, récupération automatique suspendue + alerte sur le bus
 * - Récupération manuelle toujours possible (forcée), mais limitée par fenêtre glissante
 * - Les tentatives automatiques ont leur propre fenêtre : elles n'entament pas le quota manuel
 * - Une seule récupération en vol par instance ; les instances sont indépendantes
 * - Plan mixed : network puis process, le second est annulé si le premier échoue
 */

pub mod actions;

pub use actions::{plan_for, HttpRecoveryExecutor, RecoveryAction, RecoveryError, RecoveryExecutor};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RecoveryConf;
use crate::discovery::SharedDiscovery;
use crate::events::{publish_event, SharedPublisher, TOPIC_ALERT};
use crate::models::{format_ts, Instance};
use crate::quality::{Classification, HealthReport};
use crate::resilience::{CircuitBreaker, CircuitState, SlidingWindowLimiter};

const ATTEMPT_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    CircuitOpen,
    RateLimited,
}

/// Réponse immédiate à une demande de récupération
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum RecoveryDecision {
    Accepted,
    Rejected(RejectReason),
    AlreadyInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub started_at: String,
    pub finished_at: String,
    pub trigger: Trigger,
    pub forced: bool,
    pub classification: Option<Classification>,
    pub actions: Vec<RecoveryAction>,
    /// Actions effectivement terminées avec succès
    pub completed: Vec<RecoveryAction>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}

struct InstanceRecovery {
    breaker: CircuitBreaker,
    manual_limiter: SlidingWindowLimiter,
    auto_limiter: SlidingWindowLimiter,
    in_flight: bool,
    last_classification: Option<Classification>,
    attempts: VecDeque<AttemptRecord>,
}

impl InstanceRecovery {
    fn new(conf: &RecoveryConf) -> Self {
        Self {
            breaker: CircuitBreaker::new(conf.failure_threshold),
            manual_limiter: SlidingWindowLimiter::new(conf.max_attempts_per_window, conf.window()),
            auto_limiter: SlidingWindowLimiter::new(conf.max_attempts_per_window, conf.window()),
            in_flight: false,
            last_classification: None,
            attempts: VecDeque::new(),
        }
    }
}

/// Vue sérialisable de l'état de récupération d'une instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStateView {
    pub instance_id: String,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub in_flight: bool,
    /// Quota manuel
    pub attempts_in_window: usize,
    pub remaining_in_window: usize,
    pub retry_after_secs: Option<u64>,
    pub auto_attempts_in_window: usize,
    pub last_classification: Option<Classification>,
    pub last_attempt: Option<AttemptRecord>,
    pub attempts: Vec<AttemptRecord>,
}

/// Droit d'exécuter une récupération, obtenu par `admit`
struct RecoveryTicket {
    instance: Instance,
    plan: Vec<RecoveryAction>,
    classification: Option<Classification>,
    trigger: Trigger,
    forced: bool,
}

/// Libère le verrou in-flight, y compris si l'exécution panique
struct InFlightGuard<'a> {
    orchestrator: &'a RecoveryOrchestrator,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(st) = self.orchestrator.states.lock().get_mut(&self.id) {
            st.in_flight = false;
        }
    }
}

pub struct RecoveryOrchestrator {
    conf: RecoveryConf,
    discovery: SharedDiscovery,
    executor: Arc<dyn RecoveryExecutor>,
    publisher: SharedPublisher,
    states: Mutex<HashMap<String, InstanceRecovery>>,
}

pub type SharedRecovery = Arc<RecoveryOrchestrator>;

impl RecoveryOrchestrator {
    pub fn new(
        conf: RecoveryConf,
        discovery: SharedDiscovery,
        executor: Arc<dyn RecoveryExecutor>,
        publisher: SharedPublisher,
    ) -> Self {
        Self { conf, discovery, executor, publisher, states: Mutex::new(HashMap::new()) }
    }

    /// Applique un rapport de poll au circuit de l'instance
    pub fn observe(self: &Arc<Self>, report: &HealthReport) {
        let auto = {
            let mut states = self.states.lock();
            let st = states
                .entry(report.instance_id.clone())
                .or_insert_with(|| InstanceRecovery::new(&self.conf));
            st.last_classification = Some(report.classification);

            if report.is_healthy() {
                if st.breaker.record_success() {
                    info!("[recovery] {} healthy again, circuit closed", report.instance_id);
                }
                return;
            }

            if st.breaker.record_failure(Instant::now()) {
                warn!(
                    "[recovery] {} circuit OPEN after {} consecutive failures",
                    report.instance_id,
                    st.breaker.consecutive_failures()
                );
                publish_event(
                    self.publisher.as_ref(),
                    TOPIC_ALERT,
                    &serde_json::json!({
                        "instanceId": report.instance_id,
                        "kind": "circuit_open",
                        "consecutiveFailures": st.breaker.consecutive_failures(),
                        "classification": report.classification,
                        "score": report.score,
                        "timestamp": format_ts(OffsetDateTime::now_utc()),
                    }),
                );
            }
            self.conf.auto_recover && !st.breaker.is_open() && !st.in_flight
        };

        if auto {
            match self.recover(&report.instance_id, false, Trigger::Auto) {
                Ok(RecoveryDecision::Accepted) => {
                    info!("[recovery] auto recovery started for {}", report.instance_id)
                }
                Ok(decision) => debug!("[recovery] auto recovery for {}: {decision:?}", report.instance_id),
                Err(e) => debug!("[recovery] auto recovery skipped: {e}"),
            }
        }
    }

    /// Ordre des contrôles : in-flight, circuit (sauf forcé), limiteur du déclencheur
    fn admit(&self, instance: Instance, forced: bool, trigger: Trigger) -> Result<RecoveryTicket, RecoveryDecision> {
        let mut states = self.states.lock();
        let st = states
            .entry(instance.id.clone())
            .or_insert_with(|| InstanceRecovery::new(&self.conf));

        if st.in_flight {
            return Err(RecoveryDecision::AlreadyInProgress);
        }
        if !forced && st.breaker.is_open() {
            return Err(RecoveryDecision::Rejected(RejectReason::CircuitOpen));
        }
        let limiter = match trigger {
            Trigger::Manual => &mut st.manual_limiter,
            Trigger::Auto => &mut st.auto_limiter,
        };
        if !limiter.try_acquire(Instant::now()) {
            return Err(RecoveryDecision::Rejected(RejectReason::RateLimited));
        }
        st.in_flight = true;

        let classification = st.last_classification;
        Ok(RecoveryTicket { instance, plan: plan_for(classification), classification, trigger, forced })
    }

    /// Demande de récupération : décision immédiate, exécution en tâche de fond
    pub fn recover(self: &Arc<Self>, id: &str, forced: bool, trigger: Trigger) -> Result<RecoveryDecision, RecoveryError> {
        let instance = self
            .discovery
            .resolve(id)
            .ok_or_else(|| RecoveryError::UnknownInstance(id.to_string()))?;
        match self.admit(instance, forced, trigger) {
            Ok(ticket) => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.execute(ticket).await;
                });
                Ok(RecoveryDecision::Accepted)
            }
            Err(decision) => Ok(decision),
        }
    }

    /// Comme `recover`, mais attend la fin de l'exécution
    pub async fn run(&self, id: &str, forced: bool, trigger: Trigger) -> Result<RecoveryDecision, RecoveryError> {
        let instance = self
            .discovery
            .resolve(id)
            .ok_or_else(|| RecoveryError::UnknownInstance(id.to_string()))?;
        match self.admit(instance, forced, trigger) {
            Ok(ticket) => {
                self.execute(ticket).await;
                Ok(RecoveryDecision::Accepted)
            }
            Err(decision) => Ok(decision),
        }
    }

    async fn execute(&self, ticket: RecoveryTicket) -> AttemptRecord {
        let id = ticket.instance.id.clone();
        let _guard = InFlightGuard { orchestrator: self, id: id.clone() };
        let started_at = format_ts(OffsetDateTime::now_utc());
        let timeout = self.conf.action_timeout();
        let mut completed = Vec::new();
        let mut failure = None;

        info!(
            "[recovery] {id}: running {:?} ({})",
            ticket.plan.iter().map(RecoveryAction::as_str).collect::<Vec<_>>(),
            if ticket.forced { "forced" } else { "normal" }
        );
        for action in &ticket.plan {
            let result = match tokio::time::timeout(timeout, self.executor.execute(&ticket.instance, *action)).await {
                Ok(r) => r,
                Err(_) => Err(RecoveryError::Timeout { action: action.as_str(), after: timeout }),
            };
            match result {
                Ok(()) => completed.push(*action),
                Err(e) => {
                    error!("[recovery] {id}: {e}, aborting remaining actions");
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let record = AttemptRecord {
            started_at,
            finished_at: format_ts(OffsetDateTime::now_utc()),
            trigger: ticket.trigger,
            forced: ticket.forced,
            classification: ticket.classification,
            actions: ticket.plan,
            completed,
            outcome: if failure.is_none() { AttemptOutcome::Succeeded } else { AttemptOutcome::Failed },
            error: failure,
        };
        if let Some(st) = self.states.lock().get_mut(&id) {
            st.attempts.push_back(record.clone());
            while st.attempts.len() > ATTEMPT_HISTORY {
                st.attempts.pop_front();
            }
        }
        record
    }

    /// Fermeture manuelle du circuit. false si l'instance n'a aucun état.
    pub fn reset(&self, id: &str) -> bool {
        match self.states.lock().get_mut(id) {
            Some(st) => {
                st.breaker.reset();
                info!("[recovery] {id}: circuit reset manually");
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> Option<RecoveryStateView> {
        let mut states = self.states.lock();
        states.get_mut(id).map(|st| view(id, st))
    }

    pub fn snapshot(&self) -> Vec<RecoveryStateView> {
        let mut states = self.states.lock();
        let mut views: Vec<RecoveryStateView> = states.iter_mut().map(|(id, st)| view(id, st)).collect();
        views.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        views
    }

    /// Consomme les rapports du monitor
    pub fn spawn_consumer(self: Arc<Self>, mut rx: mpsc::Receiver<HealthReport>) {
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                self.observe(&report);
            }
            debug!("[recovery] report channel closed");
        });
    }
}

fn view(id: &str, st: &mut InstanceRecovery) -> RecoveryStateView {
    let now = Instant::now();
    RecoveryStateView {
        instance_id: id.to_string(),
        circuit: st.breaker.state(),
        consecutive_failures: st.breaker.consecutive_failures(),
        in_flight: st.in_flight,
        attempts_in_window: st.manual_limiter.count(now),
        remaining_in_window: st.manual_limiter.remaining(now),
        retry_after_secs: st.manual_limiter.retry_after(now).map(|d| d.as_secs().max(1)),
        auto_attempts_in_window: st.auto_limiter.count(now),
        last_classification: st.last_classification,
        last_attempt: st.attempts.back().cloned(),
        attempts: st.attempts.iter().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConf, StaticInstanceConf};
    use crate::discovery::FleetDiscovery;
    use crate::events::RecordingPublisher;
    use crate::quality::SubsystemFlags;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Exécuteur scripté : échoue sur les actions listées, peut bloquer
    #[derive(Default)]
    struct ScriptedExecutor {
        fail_on: Vec<RecoveryAction>,
        delay: Option<Duration>,
        calls: Mutex<Vec<(String, RecoveryAction)>>,
    }

    #[async_trait]
    impl RecoveryExecutor for ScriptedExecutor {
        async fn execute(&self, instance: &Instance, action: RecoveryAction) -> Result<(), RecoveryError> {
            self.calls.lock().push((instance.id.clone(), action));
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.fail_on.contains(&action) {
                return Err(RecoveryError::ActionFailed { action: action.as_str(), reason: "scripted".into() });
            }
            Ok(())
        }
    }

    async fn fleet() -> SharedDiscovery {
        let conf = DiscoveryConf {
            static_instances: (0..3)
                .map(|n| StaticInstanceConf {
                    host: format!("emu-{n}"),
                    display_port: None,
                    health_port: None,
                    control_port: None,
                    ready: true,
                })
                .collect(),
            ..DiscoveryConf::default()
        };
        let discovery = Arc::new(FleetDiscovery::without_cluster(conf, "test"));
        discovery.discover().await;
        discovery
    }

    async fn orchestrator(
        executor: ScriptedExecutor,
        publisher: Arc<RecordingPublisher>,
    ) -> (Arc<RecoveryOrchestrator>, Arc<ScriptedExecutor>) {
        let executor = Arc::new(executor);
        let conf = RecoveryConf { auto_recover: false, ..RecoveryConf::default() };
        let orch = RecoveryOrchestrator::new(conf, fleet().await, executor.clone(), publisher);
        (Arc::new(orch), executor)
    }

    fn failing(id: &str, flags: SubsystemFlags) -> HealthReport {
        let mut report = HealthReport::unreachable(id, OffsetDateTime::UNIX_EPOCH, 1, "down".into());
        report.flags = flags;
        report.classification = crate::quality::classify(&flags);
        report
    }

    fn healthy(id: &str) -> HealthReport {
        let mut report = failing(id, SubsystemFlags::ALL_OK);
        report.reachable = true;
        report
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (orch, _) = orchestrator(ScriptedExecutor::default(), publisher.clone()).await;
        for _ in 0..5 {
            orch.observe(&failing("instance-1", SubsystemFlags::ALL_FAILED));
        }
        let st = orch.status("instance-1").unwrap();
        assert_eq!(st.circuit, CircuitState::Open);
        assert_eq!(publisher.on_topic(TOPIC_ALERT).len(), 1);

        let decision = orch.run("instance-1", false, Trigger::Manual).await.unwrap();
        assert_eq!(decision, RecoveryDecision::Rejected(RejectReason::CircuitOpen));
        let decision = orch.run("instance-1", true, Trigger::Manual).await.unwrap();
        assert_eq!(decision, RecoveryDecision::Accepted);
    }

    #[tokio::test]
    async fn test_forced_recovery_is_rate_limited() {
        let (orch, executor) = orchestrator(ScriptedExecutor::default(), Arc::default()).await;
        for _ in 0..5 {
            orch.observe(&failing("instance-1", SubsystemFlags::ALL_FAILED));
        }
        for _ in 0..5 {
            assert_eq!(orch.run("instance-1", true, Trigger::Manual).await.unwrap(), RecoveryDecision::Accepted);
        }
        let sixth = orch.run("instance-1", true, Trigger::Manual).await.unwrap();
        assert_eq!(sixth, RecoveryDecision::Rejected(RejectReason::RateLimited));
        // plan mixed : deux actions par tentative acceptée
        assert_eq!(executor.calls.lock().len(), 10);

        let st = orch.status("instance-1").unwrap();
        assert_eq!(st.remaining_in_window, 0);
        assert!(st.retry_after_secs.is_some());
    }

    #[tokio::test]
    async fn test_auto_recovery_keeps_manual_budget() {
        let executor = Arc::new(ScriptedExecutor::default());
        let orch = Arc::new(RecoveryOrchestrator::new(
            RecoveryConf::default(),
            fleet().await,
            executor.clone(),
            Arc::new(RecordingPublisher::default()),
        ));
        for _ in 0..5 {
            orch.observe(&failing("instance-0", SubsystemFlags::ALL_FAILED));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let st = orch.status("instance-0").unwrap();
        assert_eq!(st.circuit, CircuitState::Open);
        assert_eq!(st.auto_attempts_in_window, 4);
        assert_eq!(st.attempts_in_window, 0);

        let mut decisions = Vec::new();
        for _ in 0..6 {
            decisions.push(orch.run("instance-0", true, Trigger::Manual).await.unwrap());
        }
        assert_eq!(decisions[..5], [RecoveryDecision::Accepted; 5]);
        assert_eq!(decisions[5], RecoveryDecision::Rejected(RejectReason::RateLimited));
    }

    #[tokio::test]
    async fn test_auto_attempts_have_their_own_cap() {
        let conf = RecoveryConf { failure_threshold: 100, max_attempts_per_window: 2, ..RecoveryConf::default() };
        let orch = Arc::new(RecoveryOrchestrator::new(
            conf,
            fleet().await,
            Arc::new(ScriptedExecutor::default()),
            Arc::new(RecordingPublisher::default()),
        ));
        for _ in 0..4 {
            orch.observe(&failing("instance-1", SubsystemFlags::ALL_FAILED));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let st = orch.status("instance-1").unwrap();
        assert_eq!(st.auto_attempts_in_window, 2);
        assert_eq!(st.remaining_in_window, 2);
    }

    #[tokio::test]
    async fn test_healthy_report_resets_counter() {
        let (orch, _) = orchestrator(ScriptedExecutor::default(), Arc::default()).await;
        for _ in 0..4 {
            orch.observe(&failing("instance-0", SubsystemFlags::ALL_FAILED));
        }
        orch.observe(&healthy("instance-0"));
        assert_eq!(orch.status("instance-0").unwrap().consecutive_failures, 0);
        orch.observe(&failing("instance-0", SubsystemFlags::ALL_FAILED));
        assert_eq!(orch.status("instance-0").unwrap().circuit, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_mixed_plan_aborts_after_failed_network_reset() {
        let executor = ScriptedExecutor { fail_on: vec![RecoveryAction::NetworkReset], ..Default::default() };
        let (orch, executor) = orchestrator(executor, Arc::default()).await;
        orch.observe(&failing("instance-2", SubsystemFlags { network: false, process: false, ..SubsystemFlags::ALL_OK }));

        orch.run("instance-2", false, Trigger::Manual).await.unwrap();
        assert_eq!(executor.calls.lock().as_slice(), &[("instance-2".to_string(), RecoveryAction::NetworkReset)]);

        let st = orch.status("instance-2").unwrap();
        let last = st.last_attempt.unwrap();
        assert_eq!(last.outcome, AttemptOutcome::Failed);
        assert!(last.completed.is_empty());
        // l'échec d'une action ne compte pas comme un poll en échec
        assert_eq!(st.consecutive_failures, 1);
        assert!(!st.in_flight);
    }

    #[tokio::test]
    async fn test_client_plan_restarts_session_only() {
        let (orch, executor) = orchestrator(ScriptedExecutor::default(), Arc::default()).await;
        orch.observe(&failing("instance-0", SubsystemFlags { audio: false, ..SubsystemFlags::ALL_OK }));
        orch.run("instance-0", false, Trigger::Manual).await.unwrap();
        assert_eq!(executor.calls.lock()[0].1, RecoveryAction::SessionRestart);
    }

    #[tokio::test]
    async fn test_single_recovery_in_flight() {
        let executor = ScriptedExecutor { delay: Some(Duration::from_millis(200)), ..Default::default() };
        let (orch, _) = orchestrator(executor, Arc::default()).await;

        assert_eq!(orch.recover("instance-0", false, Trigger::Manual).unwrap(), RecoveryDecision::Accepted);
        assert_eq!(orch.recover("instance-0", true, Trigger::Manual).unwrap(), RecoveryDecision::AlreadyInProgress);
        // une autre instance n'est pas concernée
        assert_eq!(orch.recover("instance-1", false, Trigger::Manual).unwrap(), RecoveryDecision::Accepted);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!orch.status("instance-0").unwrap().in_flight);
        assert_eq!(orch.recover("instance-0", false, Trigger::Manual).unwrap(), RecoveryDecision::Accepted);
    }

    #[tokio::test]
    async fn test_manual_reset_closes_circuit() {
        let (orch, _) = orchestrator(ScriptedExecutor::default(), Arc::default()).await;
        assert!(!orch.reset("instance-0"));
        for _ in 0..5 {
            orch.observe(&failing("instance-0", SubsystemFlags::ALL_FAILED));
        }
        assert!(orch.reset("instance-0"));
        let st = orch.status("instance-0").unwrap();
        assert_eq!(st.circuit, CircuitState::Closed);
        assert_eq!(st.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let (orch, _) = orchestrator(ScriptedExecutor::default(), Arc::default()).await;
        assert!(matches!(
            orch.recover("instance-9", true, Trigger::Manual),
            Err(RecoveryError::UnknownInstance(_))
        ));
    }

    #[test]
    fn test_decision_wire_format() {
        assert_eq!(serde_json::to_value(RecoveryDecision::Accepted).unwrap(), serde_json::json!({ "result": "accepted" }));
        assert_eq!(
            serde_json::to_value(RecoveryDecision::Rejected(RejectReason::RateLimited)).unwrap(),
            serde_json::json!({ "result": "rejected", "reason": "rate_limited" })
        );
    }
}
