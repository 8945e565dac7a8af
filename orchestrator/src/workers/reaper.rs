//! Expiry reaper: removes clusters whose expiry passed

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::deploy::orchestrator::Orchestrator;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Reaper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between sweeps
    pub interval: Duration,

    /// Initial delay before the first sweep
    pub initial_delay: Duration,

    /// Backoff after failed sweeps
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Run the reaper worker until `shutdown_signal` resolves
pub async fn run<S, F>(
    options: &Options,
    orchestrator: &Orchestrator,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reaper worker starting...");

    let mut delay = options.initial_delay;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reaper worker shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }

        debug!("Sweeping expired clusters...");
        match orchestrator.remove_expired(Utc::now()).await {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!("Removed {} expired clusters: {:?}", removed.len(), removed);
                }
                failures = 0;
                delay = options.interval;
            }
            Err(e) => {
                delay = calc_exp_backoff(&options.cooldown, failures);
                failures = failures.saturating_add(1);
                error!("Sweep failed, retrying in {:?}: {}", delay, e);
            }
        }
    }
}
