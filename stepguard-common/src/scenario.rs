//! Read operations during step-down.
//!
//! Drives one scenario end to end: seed a document, open a cursor, park a
//! getMore and a find on fail points, step the primary down while they are
//! parked, release them, and check that both reads and the pre-opened cursor
//! survive the transition.
//!
//! The orchestrator is strictly sequential. Concurrency lives only in the
//! actors, which it observes through the node (current-op, log, role).

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::actor::{ActorHandle, ActorSummary, ensure_batch_eq, spawn_actor};
use crate::client::{Connection, DEFAULT_CONNECT_TIMEOUT};
use crate::errors::{HarnessError, HarnessResult};
use crate::failpoint::{
    ArmedFailPoints, WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH,
    WAIT_IN_FIND_BEFORE_MAKING_BATCH, set_fail_point,
};
use crate::introspection::{MemberStateProbe, OperationParkedProbe, ReplicationProbe};
use crate::logwatch::{STEP_DOWN_INTERRUPT_MARKER, check_causal_order, wait_for_log_marker};
use crate::poller::{PollPolicy, Probe, wait_until};
use crate::protocol::{Command, LogLine};
use crate::types::{
    CursorId, Document, Endpoint, FailPointMode, MemberState, Namespace, WriteConcern,
};

const SCENARIO_NAME: &str = "read_ops_during_step_down";

/// Orchestrator input. Every fixture name is explicit here.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioConfig {
    pub endpoint: Endpoint,
    pub namespace: Namespace,
    /// Fail point that parks the continuation (getMore) actor.
    pub get_more_fail_point: String,
    /// Fail point that parks the fresh-query (find) actor.
    pub find_fail_point: String,
    /// Log line proving the transition began interrupting operations.
    pub interruption_marker: String,
    /// Log position the marker search starts from. Defaults to the position
    /// when the run starts.
    pub marker_since: Option<u64>,
    /// Role the node must report once the transition is over.
    pub expected_role: MemberState,
    pub step_down_secs: u64,
    pub force: bool,
    pub poll: PollPolicy,
    pub join_timeout: Duration,
    pub connect_timeout: Duration,
    /// Deadline for each command the orchestrator itself sends. Actor
    /// commands are bounded by `join_timeout` instead.
    pub command_timeout: Duration,
    /// Turn the fail points off after the marker is observed. Disabling this
    /// exercises the join deadline.
    pub release_fail_points: bool,
}

impl ScenarioConfig {
    pub fn new(endpoint: Endpoint, namespace: Namespace) -> Self {
        Self {
            endpoint,
            namespace,
            get_more_fail_point: WAIT_AFTER_PINNING_CURSOR_BEFORE_GET_MORE_BATCH.to_string(),
            find_fail_point: WAIT_IN_FIND_BEFORE_MAKING_BATCH.to_string(),
            interruption_marker: STEP_DOWN_INTERRUPT_MARKER.to_string(),
            marker_since: None,
            expected_role: MemberState::Secondary,
            step_down_secs: 100,
            force: true,
            poll: PollPolicy::default(),
            join_timeout: Duration::from_secs(60),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: Duration::from_secs(30),
            release_fail_points: true,
        }
    }

    /// Documents seeded before the handle is opened.
    pub fn seed_documents(&self) -> Vec<Document> {
        vec![json!({"_id": 0})]
    }

    /// Write concern of the seed insert. Bounded by the poll timeout so a
    /// stalled replication fails the run instead of blocking it.
    pub fn seed_write_concern(&self) -> WriteConcern {
        let limit = u64::try_from(self.poll.timeout.as_millis()).unwrap_or(u64::MAX);
        WriteConcern::majority().with_timeout_ms(limit.max(1))
    }

    fn connection(&self) -> Connection {
        Connection::new(self.endpoint.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_command_timeout(self.command_timeout)
    }
}

/// Scenario states in the order they are entered. A phase is entered when
/// its work starts, so a failure is attributed to the phase doing the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    Seeding,
    HandleOpenedPreTransition,
    ActorsBlocked,
    TransitionTriggered,
    TransitionObserved,
    Drained,
    Verified,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Seeding => "Seeding",
            Self::HandleOpenedPreTransition => "HandleOpenedPreTransition",
            Self::ActorsBlocked => "ActorsBlocked",
            Self::TransitionTriggered => "TransitionTriggered",
            Self::TransitionObserved => "TransitionObserved",
            Self::Drained => "Drained",
            Self::Verified => "Verified",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: ScenarioPhase,
    pub entered_at: DateTime<Utc>,
}

/// A resource handle opened by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub name: String,
    pub cursor_id: CursorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Passed,
    Failed {
        phase: ScenarioPhase,
        code: String,
        error: String,
        remediation: Vec<String>,
    },
}

/// Structured pass/fail report of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub run_id: Uuid,
    pub endpoint: Endpoint,
    pub namespace: Namespace,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    pub handles: Vec<HandleRecord>,
    pub actors: Vec<ActorSummary>,
    /// Fail points teardown had to turn off.
    pub fail_points: Vec<String>,
    /// Log position when the last actor was confirmed parked.
    pub parked_at: Option<u64>,
    pub marker: Option<LogLine>,
    pub last_diagnostic: Option<String>,
    pub teardown_errors: Vec<String>,
    pub outcome: ScenarioOutcome,
}

impl ScenarioReport {
    /// Empty report for a run against `config`, marked passed until it fails.
    pub fn new(config: &ScenarioConfig) -> Self {
        Self {
            scenario: SCENARIO_NAME.to_string(),
            run_id: Uuid::new_v4(),
            endpoint: config.endpoint.clone(),
            namespace: config.namespace.clone(),
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
            handles: Vec::new(),
            actors: Vec::new(),
            fail_points: Vec::new(),
            parked_at: None,
            marker: None,
            last_diagnostic: None,
            teardown_errors: Vec::new(),
            outcome: ScenarioOutcome::Passed,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == ScenarioOutcome::Passed
    }

    /// Last phase entered.
    pub fn phase(&self) -> Option<ScenarioPhase> {
        self.phases.last().map(|p| p.phase)
    }
}

/// A run that did not pass, with the phase it failed in.
#[derive(Debug, thiserror::Error)]
#[error("scenario failed in phase {phase}: {source}")]
pub struct ScenarioFailure {
    pub phase: ScenarioPhase,
    pub report: Box<ScenarioReport>,
    #[source]
    pub source: HarnessError,
}

/// Bookkeeping of one run, torn down whether or not the run succeeds.
struct ScenarioState {
    report: ScenarioReport,
    actors: Vec<ActorHandle>,
    armed: ArmedFailPoints,
    baseline: u64,
}

impl ScenarioState {
    fn enter(&mut self, phase: ScenarioPhase) {
        info!(%phase, "Entering phase");
        self.report.phases.push(PhaseRecord {
            phase,
            entered_at: Utc::now(),
        });
    }

    fn phase(&self) -> ScenarioPhase {
        self.report.phase().unwrap_or(ScenarioPhase::Seeding)
    }

    fn actor_mut(&mut self, name: &str) -> HarnessResult<&mut ActorHandle> {
        self.actors
            .iter_mut()
            .find(|a| a.name() == name)
            .ok_or_else(|| HarnessError::Protocol(format!("no actor named '{name}'")))
    }
}

const GET_MORE_ACTOR: &str = "getMore";
const FIND_ACTOR: &str = "find";
const STEP_DOWN_ACTOR: &str = "stepDown";

/// The read-operations-during-step-down scenario.
pub struct ReadOpsDuringStepDown {
    config: ScenarioConfig,
}

impl ReadOpsDuringStepDown {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Run the scenario once. Never retried.
    pub async fn run(&self) -> Result<ScenarioReport, ScenarioFailure> {
        let mut state = ScenarioState {
            report: ScenarioReport::new(&self.config),
            actors: Vec::new(),
            armed: ArmedFailPoints::new(),
            baseline: 0,
        };
        let span = info_span!(
            "scenario",
            scenario = SCENARIO_NAME,
            run_id = %state.report.run_id,
            ns = %self.config.namespace
        );

        async move {
            let result = self.drive(&mut state).await;
            self.teardown(&mut state).await;
            state.report.finished_at = Some(Utc::now());

            match result {
                Ok(()) => {
                    info!("Scenario passed");
                    Ok(state.report)
                }
                Err(source) => {
                    let phase = state.phase();
                    if let HarnessError::ConditionTimeout { diagnostic, .. } = source.root_cause() {
                        state.report.last_diagnostic = Some(diagnostic.clone());
                    }
                    let code = source.root_cause().code();
                    state.report.outcome = ScenarioOutcome::Failed {
                        phase,
                        code: code.code_string(),
                        error: source.to_string(),
                        remediation: code.remediation().iter().map(|s| (*s).to_string()).collect(),
                    };
                    warn!(%phase, error = %source, "Scenario failed");
                    Err(ScenarioFailure {
                        phase,
                        report: Box::new(state.report),
                        source,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, state: &mut ScenarioState) -> HarnessResult<()> {
        let cfg = &self.config;
        let ns = &cfg.namespace;
        let mut conn = cfg.connection();
        let expected = cfg.seed_documents();

        state.enter(ScenarioPhase::Seeding);
        let position = conn.current_op(None, None).await?.log_position;
        state.baseline = cfg.marker_since.unwrap_or(position);
        let op_time = conn
            .insert(ns, expected.clone(), Some(cfg.seed_write_concern()))
            .await?;
        wait_until(
            "seed write replicated to every member",
            cfg.poll,
            &mut ReplicationProbe::new(&mut conn, op_time),
        )
        .await?;

        state.enter(ScenarioPhase::HandleOpenedPreTransition);
        let handle = conn.find(ns, None, Some(0)).await?;
        if handle.id.is_exhausted() || !handle.batch.is_empty() {
            return Err(HarnessError::VerificationMismatch {
                context: "pre-transition handle".to_string(),
                expected: "live cursor with an empty first batch".to_string(),
                actual: format!("cursor {} with {} documents", handle.id, handle.batch.len()),
            });
        }
        state.report.handles.push(HandleRecord {
            name: "readAfterStepDown".to_string(),
            cursor_id: handle.id,
        });

        state.enter(ScenarioPhase::ActorsBlocked);
        state.armed.record(&cfg.get_more_fail_point);
        state
            .actors
            .push(self.spawn_get_more_actor(expected.clone()));
        self.wait_for_parked(state, &mut conn, GET_MORE_ACTOR, &cfg.get_more_fail_point)
            .await?;

        state.armed.record(&cfg.find_fail_point);
        state.actors.push(self.spawn_find_actor(expected.clone()));
        let parked_at = self
            .wait_for_parked(state, &mut conn, FIND_ACTOR, &cfg.find_fail_point)
            .await?;
        state.report.parked_at = Some(parked_at);

        state.enter(ScenarioPhase::TransitionTriggered);
        state.actors.push(self.spawn_step_down_actor());

        state.enter(ScenarioPhase::TransitionObserved);
        let marker = wait_for_log_marker(
            &mut conn,
            &cfg.interruption_marker,
            Some(state.baseline),
            cfg.poll,
        )
        .await?;
        info!(seq = marker.seq, parked_at, "Observed transition marker");
        state.report.marker = Some(marker.clone());
        check_causal_order(&marker, parked_at)?;

        state.enter(ScenarioPhase::Drained);
        if cfg.release_fail_points {
            for name in [&cfg.find_fail_point, &cfg.get_more_fail_point] {
                set_fail_point(&mut conn, name, FailPointMode::Off).await?;
                state.armed.forget(name);
            }
        } else {
            warn!("Leaving fail points armed; joins are expected to time out");
        }

        for name in [GET_MORE_ACTOR, FIND_ACTOR, STEP_DOWN_ACTOR] {
            state.actor_mut(name)?.join(cfg.join_timeout).await?;
        }

        state.enter(ScenarioPhase::Verified);
        wait_until(
            &format!("node reports {}", cfg.expected_role),
            cfg.poll,
            &mut MemberStateProbe::new(&mut conn, cfg.expected_role),
        )
        .await?;

        // The transition may have closed every connection open at the time.
        let mut verifier = cfg.connection();
        let resumed = verifier.get_more(ns, handle.id, None).await?;
        ensure_batch_eq("getMore on pre-transition handle", &expected, &resumed.batch)
    }

    /// Wait until actor `name` is parked at `fail_point`, returning the log
    /// position of the confirming snapshot.
    ///
    /// An actor that finishes before it is seen parked is joined so that its
    /// own error surfaces instead of a poll timeout.
    async fn wait_for_parked(
        &self,
        state: &mut ScenarioState,
        conn: &mut Connection,
        name: &str,
        fail_point: &str,
    ) -> HarnessResult<u64> {
        let cfg = &self.config;
        let description = format!("{name} parked at {fail_point} on {}", cfg.namespace);
        let actor = state.actor_mut(name)?;

        let mut probe = ActorParkedProbe {
            parked: OperationParkedProbe::new(conn, cfg.namespace.clone(), fail_point),
            actor,
        };
        wait_until(&description, cfg.poll, &mut probe).await?;

        if let Some(position) = probe.parked.confirmed_at() {
            info!(actor = name, fail_point, log_position = position, "Actor parked");
            return Ok(position);
        }

        let actor = probe.actor;
        actor.join(Duration::ZERO).await?;
        Err(HarnessError::ActorFailure {
            actor: name.to_string(),
            source: Box::new(HarnessError::Protocol(format!(
                "finished without parking at {fail_point}"
            ))),
        })
    }

    fn spawn_get_more_actor(&self, expected: Vec<Document>) -> ActorHandle {
        let ns = self.config.namespace.clone();
        let fail_point = self.config.get_more_fail_point.clone();
        spawn_actor(GET_MORE_ACTOR, &self.config.endpoint, move |mut conn| async move {
            let cursor = conn.find(&ns, None, Some(0)).await?;
            set_fail_point(&mut conn, &fail_point, FailPointMode::AlwaysOn).await?;
            let reply = conn.get_more(&ns, cursor.id, None).await?;
            ensure_batch_eq("getMore during step-down", &expected, &reply.batch)
        })
    }

    fn spawn_find_actor(&self, expected: Vec<Document>) -> ActorHandle {
        let ns = self.config.namespace.clone();
        let fail_point = self.config.find_fail_point.clone();
        spawn_actor(FIND_ACTOR, &self.config.endpoint, move |mut conn| async move {
            set_fail_point(&mut conn, &fail_point, FailPointMode::AlwaysOn).await?;
            let reply = conn.find(&ns, None, None).await?;
            ensure_batch_eq("find during step-down", &expected, &reply.batch)
        })
    }

    fn spawn_step_down_actor(&self) -> ActorHandle {
        let command = Command::ReplSetStepDown {
            step_down_secs: self.config.step_down_secs,
            force: self.config.force,
        };
        let target = self.config.endpoint.to_string();
        spawn_actor(STEP_DOWN_ACTOR, &self.config.endpoint, move |mut conn| async move {
            match conn.run_command_raw(command).await? {
                Ok(_) => Ok(()),
                Err(source) => Err(HarnessError::AdminCommandFailed {
                    command: "replSetStepDown",
                    target,
                    source,
                }),
            }
        })
    }

    /// Release every fail point that may still be armed and abort unjoined actors.
    async fn teardown(&self, state: &mut ScenarioState) {
        state.report.fail_points = state.armed.names().to_vec();
        if !state.armed.is_empty() {
            let mut conn = self.config.connection();
            for err in state.armed.release_all(&mut conn).await {
                warn!(error = %err, "Failed to release fail point during teardown");
                state.report.teardown_errors.push(err.to_string());
            }
        }
        state.report.actors = state.actors.iter().map(ActorHandle::summary).collect();
        state.actors.clear();
    }
}

/// Parked probe that also stops waiting when the actor has already finished.
struct ActorParkedProbe<'a> {
    parked: OperationParkedProbe<'a>,
    actor: &'a mut ActorHandle,
}

impl Probe for ActorParkedProbe<'_> {
    fn check(&mut self) -> impl Future<Output = HarnessResult<bool>> + Send {
        async move {
            if self.parked.check().await? {
                return Ok(true);
            }
            Ok(self.actor.is_finished())
        }
    }

    fn on_timeout_message(&mut self) -> impl Future<Output = String> + Send {
        self.parked.on_timeout_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_step_down_scenario() {
        let cfg = ScenarioConfig::new(Endpoint::new("127.0.0.1:27017"), Namespace::new("test", "coll"));
        assert_eq!(cfg.get_more_fail_point, "waitAfterPinningCursorBeforeGetMoreBatch");
        assert_eq!(cfg.find_fail_point, "waitInFindBeforeMakingBatch");
        assert_eq!(cfg.interruption_marker, "Starting to kill user operations");
        assert_eq!(cfg.expected_role, MemberState::Secondary);
        assert_eq!(cfg.step_down_secs, 100);
        assert!(cfg.force);
        assert!(cfg.release_fail_points);
        assert_eq!(cfg.seed_documents(), vec![json!({"_id": 0})]);
        assert_eq!(cfg.seed_write_concern().wtimeout_ms, Some(30_000));
    }

    #[test]
    fn test_phases_are_ordered() {
        assert!(ScenarioPhase::Seeding < ScenarioPhase::HandleOpenedPreTransition);
        assert!(ScenarioPhase::TransitionObserved < ScenarioPhase::Drained);
        assert!(ScenarioPhase::Drained < ScenarioPhase::Verified);
        assert_eq!(ScenarioPhase::ActorsBlocked.to_string(), "ActorsBlocked");
    }

    #[test]
    fn test_failed_outcome_serializes_with_tag() {
        let outcome = ScenarioOutcome::Failed {
            phase: ScenarioPhase::Drained,
            code: "SG-E302".to_string(),
            error: "Actor 'getMore' did not finish within 2s".to_string(),
            remediation: vec![],
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["result"], "failed");
        assert_eq!(value["phase"], "drained");
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_in_seeding() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = ScenarioConfig::new(Endpoint::from(addr), Namespace::new("test", "coll"));
        cfg.connect_timeout = Duration::from_millis(200);
        let failure = ReadOpsDuringStepDown::new(cfg).run().await.unwrap_err();
        assert_eq!(failure.phase, ScenarioPhase::Seeding);
        assert!(matches!(failure.source, HarnessError::Connect { .. }));
        assert!(!failure.report.passed());
        assert!(failure.report.actors.is_empty());
        assert!(failure.report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_silent_node_fails_in_seeding_without_hanging() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut cfg = ScenarioConfig::new(Endpoint::from(addr), Namespace::new("test", "coll"));
        cfg.command_timeout = Duration::from_millis(200);
        let failure = tokio::time::timeout(
            Duration::from_secs(10),
            ReadOpsDuringStepDown::new(cfg).run(),
        )
        .await
        .expect("run must be bounded by the command timeout")
        .unwrap_err();
        assert_eq!(failure.phase, ScenarioPhase::Seeding);
        assert!(
            matches!(failure.source, HarnessError::CommandTimeout { command: "currentOp", .. }),
            "unexpected error: {}",
            failure.source
        );
        silent.abort();
    }
}
