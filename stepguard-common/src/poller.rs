//! Bounded retry-until-true polling.
//!
//! Every wait site in the harness goes through [`wait_until`]: parked
//! operations, log markers, replication and role changes. A [`Probe`]
//! supplies the predicate and a diagnostic that is only computed when the
//! deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::errors::{HarnessError, HarnessResult};

/// Deadline and cadence of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(100),
        }
    }
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// A condition checked repeatedly by [`wait_until`].
pub trait Probe: Send {
    /// One attempt. `Ok(false)` means "not yet".
    fn check(&mut self) -> impl Future<Output = HarnessResult<bool>> + Send;

    /// Diagnostic attached to the timeout error, evaluated only on failure.
    fn on_timeout_message(&mut self) -> impl Future<Output = String> + Send;
}

/// Summary of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Poll `probe` every `policy.interval` until it reports true.
///
/// Transient errors are logged and retried until the deadline; the attempt
/// made at or after the deadline is final, and its error (transient or not)
/// is returned as is. Non-transient errors abort immediately. A predicate
/// that keeps returning false ends in [`HarnessError::ConditionTimeout`].
pub async fn wait_until<P: Probe>(
    description: &str,
    policy: PollPolicy,
    probe: &mut P,
) -> HarnessResult<PollStats> {
    debug!(
        "Waiting for: {description} (timeout: {:?}, interval: {:?})",
        policy.timeout, policy.interval
    );

    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let outcome = probe.check().await;
        let expired = Instant::now() >= deadline;

        match outcome {
            Ok(true) => {
                let elapsed = start.elapsed();
                debug!(attempts, "Condition satisfied: {description} after {elapsed:?}");
                return Ok(PollStats { attempts, elapsed });
            }
            Ok(false) if expired => {
                let diagnostic = probe.on_timeout_message().await;
                warn!(
                    attempts,
                    "Timeout waiting for: {description} after {:?}", policy.timeout
                );
                return Err(HarnessError::ConditionTimeout {
                    description: description.to_string(),
                    timeout: policy.timeout,
                    attempts,
                    diagnostic,
                });
            }
            Ok(false) => {}
            Err(err) if err.is_transient() && !expired => {
                debug!(attempts, error = %err, "Transient error while polling {description}; retrying");
            }
            Err(err) => return Err(err),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep(policy.interval.min(remaining)).await;
    }
}

/// Probe built from two closures, for call sites whose futures own their state.
pub struct FnProbe<P, M> {
    predicate: P,
    message: M,
}

/// Build a [`Probe`] from a predicate closure and a diagnostic closure.
pub fn probe_fn<P, PF, M, MF>(predicate: P, message: M) -> FnProbe<P, M>
where
    P: FnMut() -> PF + Send,
    PF: Future<Output = HarnessResult<bool>> + Send,
    M: FnMut() -> MF + Send,
    MF: Future<Output = String> + Send,
{
    FnProbe { predicate, message }
}

impl<P, PF, M, MF> Probe for FnProbe<P, M>
where
    P: FnMut() -> PF + Send,
    PF: Future<Output = HarnessResult<bool>> + Send,
    M: FnMut() -> MF + Send,
    MF: Future<Output = String> + Send,
{
    fn check(&mut self) -> impl Future<Output = HarnessResult<bool>> + Send {
        (self.predicate)()
    }

    fn on_timeout_message(&mut self) -> impl Future<Output = String> + Send {
        (self.message)()
    }
}
