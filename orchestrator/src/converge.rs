//! Convergence poller
//!
//! Every "wait until the outside world catches up" in the orchestrator goes
//! through [`wait_for`]: node readiness, background task completion, and the
//! create/delete states exposed by managed backends. The probe must be free of
//! side effects; it is invoked once per interval until the observation
//! converges, a terminal error is returned, or the cancellation token fires.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Context, OrchestratorError, Result};

/// Polling options
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Delay between two probes
    pub interval: Duration,
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of comparing one observation against the desired state
#[derive(Debug)]
pub enum Check {
    Converged,
    Pending,
    Fail(OrchestratorError),
}

/// Desired state for [`wait_for_state`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desired {
    /// The resource reports exactly this state
    State(String),

    /// The resource no longer exists
    Absent,
}

impl std::fmt::Display for Desired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Desired::State(s) => write!(f, "{}", s),
            Desired::Absent => write!(f, "<absent>"),
        }
    }
}

/// Poll `probe` until `check` reports convergence and return the converged
/// observation.
///
/// Probe errors are retried unless they are terminal. Cancellation is
/// observed while the probe is in flight and at every sleep boundary.
pub async fn wait_for<S, F, Fut, C>(
    cancel: &CancellationToken,
    options: &PollOptions,
    what: &str,
    mut probe: F,
    mut check: C,
) -> Result<S>
where
    S: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S>>,
    C: FnMut(&S) -> Check,
{
    let cancelled = || OrchestratorError::Cancelled {
        what: what.to_string(),
    };

    loop {
        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            observed = probe() => observed,
        };

        match observed {
            Ok(state) => match check(&state) {
                Check::Converged => {
                    debug!("{} converged: {:?}", what, state);
                    return Ok(state);
                }
                Check::Pending => {
                    debug!("Waiting for {}: observed {:?}", what, state);
                }
                Check::Fail(e) => {
                    return Err(e).with_context(|| format!("failed waiting for {}", what));
                }
            },
            Err(e) if e.is_terminal() => {
                return Err(e).with_context(|| format!("failed waiting for {}", what));
            }
            Err(e) => {
                warn!("Probe for {} failed, retrying: {}", what, e);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = tokio::time::sleep(options.interval) => {}
        }
    }
}

/// Poll until `probe` returns `true`
pub async fn wait_until<F, Fut>(
    cancel: &CancellationToken,
    options: &PollOptions,
    what: &str,
    probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    wait_for(cancel, options, what, probe, |ready| {
        if *ready {
            Check::Converged
        } else {
            Check::Pending
        }
    })
    .await
    .map(|_| ())
}

/// Poll a resource's reported state until it matches `desired`.
///
/// The probe returns `None` when the resource is not found. Not found is
/// success when [`Desired::Absent`] is wanted, and a hard failure otherwise.
pub async fn wait_for_state<F, Fut>(
    cancel: &CancellationToken,
    options: &PollOptions,
    what: &str,
    desired: &Desired,
    probe: F,
) -> Result<Option<String>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    wait_for(cancel, options, what, probe, |observed| {
        debug!("{}: observed {:?}, desired {}", what, observed, desired);
        match (observed, desired) {
            (None, Desired::Absent) => Check::Converged,
            (None, Desired::State(state)) => Check::Fail(OrchestratorError::ResourceVanished {
                what: what.to_string(),
                desired: state.clone(),
            }),
            (Some(current), Desired::State(state)) if current == state => Check::Converged,
            (Some(_), _) => Check::Pending,
        }
    })
    .await
}
