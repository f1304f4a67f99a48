//! Activity monitor
//!
//! Polls every connected source for audibility on a fixed interval and
//! diffs the result against the previously tracked snapshot. Decisions
//! are edge-triggered: a command is only produced when a source starts
//! or stops being audible, never on every tick.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::channel::{SourceId, SourceRouter};

/// Immutable set of unprotected sources observed as audible
///
/// Replaced wholesale on every tick, never mutated in place.
pub type AudibleSnapshot = Arc<BTreeSet<SourceId>>;

/// What a tick asks of the protected source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Lower the protected source
    Duck,
    /// Bring the protected source back to its original volume
    Restore,
    /// Steady state, no command
    Hold,
}

/// Diff the previous snapshot against the current one
pub fn decide(tracked: &BTreeSet<SourceId>, current: &BTreeSet<SourceId>) -> Decision {
    let newly_audible = current.difference(tracked).next().is_some();
    let newly_quiet = tracked.difference(current).next().is_some();

    if !current.is_empty() && newly_audible {
        Decision::Duck
    } else if current.is_empty() && newly_quiet {
        Decision::Restore
    } else {
        Decision::Hold
    }
}

/// Level-triggered decision, used to re-issue a command that failed to dispatch
pub fn settle(current: &BTreeSet<SourceId>) -> Decision {
    if current.is_empty() {
        Decision::Restore
    } else {
        Decision::Duck
    }
}

/// Ask every unprotected source whether it is audible
///
/// Queries run concurrently, each bounded by `timeout`. A source that
/// fails or does not answer in time counts as not audible for this tick.
pub async fn audible_sources(
    router: &SourceRouter,
    protected: &SourceId,
    timeout: Duration,
) -> BTreeSet<SourceId> {
    let mut queries = JoinSet::new();

    for source_id in router.sources().await {
        if &source_id == protected {
            continue;
        }
        let router = router.clone();
        queries.spawn(async move {
            let result = router.query_audible(&source_id, timeout).await;
            (source_id, result)
        });
    }

    let mut audible = BTreeSet::new();
    while let Some(joined) = queries.join_next().await {
        match joined {
            Ok((source_id, Ok(true))) => {
                audible.insert(source_id);
            }
            Ok((_, Ok(false))) => {}
            Ok((source_id, Err(e))) => {
                debug!(%source_id, error = %e, "audibility query failed, treating as quiet");
            }
            Err(e) => {
                debug!(error = %e, "audibility query task failed");
            }
        }
    }

    audible
}

/// Running poll loop for one activation
pub struct MonitorTask {
    handle: JoinHandle<()>,
    wake: Arc<Notify>,
    generation: u64,
}

impl MonitorTask {
    /// Spawn a loop calling `tick` every `period`, first tick one period from now
    pub fn spawn<F, Fut>(period: Duration, generation: u64, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wake = Arc::new(Notify::new());
        let woken = Arc::clone(&wake);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = woken.notified() => {
                        debug!(generation, "monitor woken early");
                    }
                }
                tick().await;
            }
        });

        info!(generation, period_ms = period.as_millis() as u64, "activity monitor started");

        Self {
            handle,
            wake,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run an extra tick as soon as possible
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Cancel future ticks
    pub fn stop(self) {
        info!(generation = self.generation, "activity monitor stopped");
        drop(self);
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
