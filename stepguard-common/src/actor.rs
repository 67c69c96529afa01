//! Concurrent actors.
//!
//! An actor is a tokio task with its own [`Connection`] to the target node.
//! The orchestrator never shares memory with an actor: it learns about the
//! actor's progress from the node (current-op, log) and about its result
//! from [`ActorHandle::join`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::client::Connection;
use crate::errors::{HarnessError, HarnessResult};
use crate::types::{Document, Endpoint, canonical_batch};

/// Final state of an actor as recorded in scenario reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ActorOutcome {
    Running,
    Succeeded,
    Failed(String),
    TimedOut,
}

impl fmt::Display for ActorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSummary {
    pub name: String,
    pub id: Uuid,
    pub spawned_at: DateTime<Utc>,
    pub outcome: ActorOutcome,
}

/// Join handle of a spawned actor. Dropping an unjoined handle aborts the task.
pub struct ActorHandle {
    name: String,
    id: Uuid,
    spawned_at: DateTime<Utc>,
    outcome: ActorOutcome,
    task: Option<JoinHandle<HarnessResult<()>>>,
}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Run `work` in its own task, handing it a fresh connection to `endpoint`.
///
/// The connection is opened lazily by the first command `work` issues.
pub fn spawn_actor<F, Fut>(name: impl Into<String>, endpoint: &Endpoint, work: F) -> ActorHandle
where
    F: FnOnce(Connection) -> Fut + Send + 'static,
    Fut: Future<Output = HarnessResult<()>> + Send + 'static,
{
    let name = name.into();
    let id = Uuid::new_v4();
    let conn = Connection::new(endpoint.clone());
    let span = info_span!("actor", actor = %name, actor_id = %id);

    let task = tokio::spawn(
        async move {
            debug!("Actor started");
            let result = work(conn).await;
            match &result {
                Ok(()) => debug!("Actor finished"),
                Err(err) => warn!(error = %err, "Actor failed"),
            }
            result
        }
        .instrument(span),
    );

    ActorHandle {
        name,
        id,
        spawned_at: Utc::now(),
        outcome: ActorOutcome::Running,
        task: Some(task),
    }
}

impl ActorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn outcome(&self) -> &ActorOutcome {
        &self.outcome
    }

    /// True once the task has completed, without consuming its result.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn summary(&self) -> ActorSummary {
        ActorSummary {
            name: self.name.clone(),
            id: self.id,
            spawned_at: self.spawned_at,
            outcome: self.outcome.clone(),
        }
    }

    /// Wait up to `timeout` for the actor to finish and propagate its failure.
    ///
    /// An actor still running at the deadline is aborted and reported as
    /// [`HarnessError::JoinTimeout`]. An error or panic inside the actor is
    /// wrapped in [`HarnessError::ActorFailure`].
    pub async fn join(&mut self, timeout: Duration) -> HarnessResult<()> {
        let Some(mut task) = self.task.take() else {
            return Err(HarnessError::ActorFailure {
                actor: self.name.clone(),
                source: Box::new(HarnessError::Protocol(format!(
                    "actor already joined ({})",
                    self.outcome
                ))),
            });
        };

        let joined = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                self.outcome = ActorOutcome::TimedOut;
                warn!(actor = %self.name, ?timeout, "Actor did not finish in time");
                return Err(HarnessError::JoinTimeout {
                    actor: self.name.clone(),
                    waited: timeout,
                });
            }
        };

        let result = match joined {
            Ok(result) => result,
            Err(join_err) => Err(join_error(join_err)),
        };

        match result {
            Ok(()) => {
                self.outcome = ActorOutcome::Succeeded;
                Ok(())
            }
            Err(source) => {
                self.outcome = ActorOutcome::Failed(source.to_string());
                Err(HarnessError::ActorFailure {
                    actor: self.name.clone(),
                    source: Box::new(source),
                })
            }
        }
    }
}

impl Drop for ActorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn join_error(err: JoinError) -> HarnessError {
    if err.is_panic() {
        HarnessError::Panicked(panic_message(err.into_panic()))
    } else {
        HarnessError::Panicked("actor task was cancelled".to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fail with [`HarnessError::VerificationMismatch`] unless the batches are identical.
///
/// Comparison uses the canonical serialization of each document, so key
/// order inside a document does not matter but element order does.
pub fn ensure_batch_eq(context: &str, expected: &[Document], actual: &[Document]) -> HarnessResult<()> {
    let expected = canonical_batch(expected);
    let actual = canonical_batch(actual);
    if expected == actual {
        Ok(())
    } else {
        Err(HarnessError::VerificationMismatch {
            context: context.to_string(),
            expected,
            actual,
        })
    }
}
