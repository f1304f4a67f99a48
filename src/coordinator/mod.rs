//! Ducking coordinator
//!
//! Owns the [`StateMachine`] behind a single lock and carries out the
//! effects of its transitions: volume queries and commands through the
//! [`SourceRouter`], activity monitor lifecycle, persistence and event
//! broadcast.
//!
//! Lock order is monitor slot, then machine. Toggles are serialized by a
//! separate transition lock so a pending volume query never blocks
//! duck checks or poll ticks.

mod bridge;

pub use bridge::AgentBridge;

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::channel::{AgentCommand, DuckAdvice, MediaReport, SourceId, SourceRouter, Volume};
use crate::config::CoordinatorSettings;
use crate::events::{CoordinatorEvent, MediaActivity};
use crate::monitor::{self, MonitorTask};
use crate::state::{Effect, ProtectionState, StateMachine};
use crate::store::{self, StateStore};

/// Point-in-time view of the coordinator for status queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub state: ProtectionState,
    pub ducked: bool,
    pub connected_sources: usize,
}

struct Inner {
    machine: Mutex<StateMachine>,
    transitions: Mutex<()>,
    monitor: Mutex<Option<MonitorTask>>,
    router: SourceRouter,
    store: Arc<dyn StateStore>,
    settings: CoordinatorSettings,
    events: broadcast::Sender<CoordinatorEvent>,
}

/// Cloneable handle to the single coordinator instance
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create a coordinator, loading the persisted state from `store`
    pub fn new(
        settings: CoordinatorSettings,
        store: Arc<dyn StateStore>,
        router: SourceRouter,
        events: broadcast::Sender<CoordinatorEvent>,
    ) -> Self {
        let persisted = store::load_or_default(store.as_ref());
        let machine = StateMachine::new(settings.duck_factor).with_persisted(&persisted);
        info!(state = %machine.state(), "coordinator created");

        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(machine),
                transitions: Mutex::new(()),
                monitor: Mutex::new(None),
                router,
                store,
                settings,
                events,
            }),
        }
    }

    pub fn router(&self) -> &SourceRouter {
        &self.inner.router
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Current `{active, protectedSourceId}`
    pub async fn get_state(&self) -> ProtectionState {
        self.inner.machine.lock().await.snapshot()
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let (state, ducked) = {
            let machine = self.inner.machine.lock().await;
            (machine.snapshot(), machine.is_ducked())
        };
        CoordinatorStatus {
            state,
            ducked,
            connected_sources: self.inner.router.len().await,
        }
    }

    /// Toggle protection of `source_id` and return the resulting state
    pub async fn toggle_protected_source(&self, source_id: SourceId) -> ProtectionState {
        let _serial = self.inner.transitions.lock().await;

        let (effects, generation) = {
            let mut machine = self.inner.machine.lock().await;
            (machine.toggle(&source_id), machine.generation())
        };

        self.execute(effects, generation).await;
        // A destroy notification may have landed while effects ran
        self.get_state().await
    }

    /// The host destroyed a source
    pub async fn on_source_destroyed(&self, source_id: SourceId) {
        self.inner.router.remove(&source_id).await;

        let (effects, generation) = {
            let mut machine = self.inner.machine.lock().await;
            (machine.source_destroyed(&source_id), machine.generation())
        };

        if effects.is_empty() {
            debug!(%source_id, "unprotected source destroyed");
            return;
        }
        self.execute(effects, generation).await;
    }

    /// Answer an agent's local duck check
    pub async fn should_duck(&self, source_id: &SourceId) -> DuckAdvice {
        self.inner.machine.lock().await.should_duck(source_id)
    }

    /// Record a media activity report from an agent
    pub async fn on_media_report(&self, source_id: &SourceId, report: MediaReport) {
        let kind = match report {
            MediaReport::MediaPlayed { .. } => MediaActivity::Played,
            MediaReport::MediaVolumeChanged { .. } => MediaActivity::VolumeChanged,
        };
        debug!(%source_id, ?kind, volume = ?report.volume(), "media report");

        self.emit(CoordinatorEvent::MediaReported {
            source_id: source_id.clone(),
            kind,
            volume: report.volume(),
        });

        if kind != MediaActivity::Played {
            return;
        }

        let monitor = self.inner.monitor.lock().await;
        let unprotected = self
            .inner
            .machine
            .lock()
            .await
            .protected()
            .is_some_and(|protected| protected != source_id);
        if let (true, Some(task)) = (unprotected, monitor.as_ref()) {
            task.wake();
        }
    }

    /// Reconcile a protection loaded from disk with the connected sources
    ///
    /// Waits up to the startup grace period for the protected source to
    /// register. If it never does, protection is reset to inactive.
    pub async fn resume(&self) {
        let (source_id, generation) = {
            let machine = self.inner.machine.lock().await;
            (machine.protected().cloned(), machine.generation())
        };
        let Some(source_id) = source_id else {
            return;
        };

        info!(%source_id, "waiting for protected source to reconnect");
        let present = self
            .inner
            .router
            .wait_for(&source_id, self.inner.settings.startup_grace)
            .await;

        let _serial = self.inner.transitions.lock().await;
        let (effects, generation) = {
            let mut machine = self.inner.machine.lock().await;
            if machine.generation() != generation {
                debug!("protection changed during startup, skipping resume");
                return;
            }
            let effects = if present {
                machine.resume()
            } else {
                warn!(%source_id, "protected source did not reconnect, resetting");
                machine.source_destroyed(&source_id)
            };
            (effects, machine.generation())
        };

        self.execute(effects, generation).await;
    }

    /// Stop monitoring and un-duck the protected source before exit
    pub async fn shutdown(&self) {
        let _serial = self.inner.transitions.lock().await;
        let (effects, generation) = {
            let mut machine = self.inner.machine.lock().await;
            (machine.shutdown(), machine.generation())
        };
        self.execute(effects, generation).await;
        info!("coordinator shut down");
    }

    /// One activity monitor tick for the activation `generation`
    async fn poll_tick(&self, generation: u64) {
        let protected = {
            let machine = self.inner.machine.lock().await;
            if !machine.is_current(generation) {
                return;
            }
            machine.protected().cloned()
        };
        let Some(protected) = protected else {
            return;
        };

        let timeout = self.inner.settings.query_timeout;
        let current = monitor::audible_sources(&self.inner.router, &protected, timeout).await;

        let effects = self.inner.machine.lock().await.observe(generation, current);
        for effect in effects {
            match effect {
                Effect::SetVolume {
                    source_id,
                    volume,
                    retry_on_failure,
                } => self.set_volume(&source_id, volume, retry_on_failure, generation).await,
                Effect::Emit(event) => self.emit(event),
                other => debug!(?other, "ignoring effect outside a transition"),
            }
        }
    }

    /// Carry out transition effects in order
    ///
    /// Stops early once another transition has superseded `generation`.
    async fn execute(&self, effects: Vec<Effect>, generation: u64) {
        for effect in effects {
            if self.inner.machine.lock().await.generation() != generation {
                debug!(generation, "transition superseded, dropping remaining effects");
                return;
            }

            match effect {
                Effect::QueryVolume(source_id) => {
                    let volume = match self
                        .inner
                        .router
                        .query_volume(&source_id, self.inner.settings.query_timeout)
                        .await
                    {
                        Ok(volume) => volume,
                        Err(e) => {
                            warn!(
                                %source_id,
                                error = %e,
                                "could not snapshot volume, assuming full"
                            );
                            Volume::FULL
                        }
                    };

                    let event = self
                        .inner
                        .machine
                        .lock()
                        .await
                        .record_original_volume(generation, volume);
                    match event {
                        Some(event) => self.emit(event),
                        None => {
                            debug!(%source_id, "activation superseded during volume snapshot");
                            return;
                        }
                    }
                }
                Effect::StartMonitor => self.start_monitor(generation).await,
                Effect::StopMonitor => {
                    if let Some(task) = self.inner.monitor.lock().await.take() {
                        task.stop();
                    }
                }
                Effect::SetVolume {
                    source_id,
                    volume,
                    retry_on_failure,
                } => self.set_volume(&source_id, volume, retry_on_failure, generation).await,
                Effect::Persist(state) => self.persist(&state),
                Effect::Emit(event) => self.emit(event),
            }
        }
    }

    async fn start_monitor(&self, generation: u64) {
        let mut slot = self.inner.monitor.lock().await;
        if !self.inner.machine.lock().await.is_current(generation) {
            debug!(generation, "not starting monitor for superseded activation");
            return;
        }

        let coordinator = self.clone();
        let task = MonitorTask::spawn(self.inner.settings.poll_interval, generation, move || {
            let coordinator = coordinator.clone();
            async move { coordinator.poll_tick(generation).await }
        });
        *slot = Some(task);
    }

    /// Dispatch a volume command unless `generation` was superseded
    ///
    /// The machine lock is held across the dispatch so a command from a
    /// finished activation cannot land after the transition that ended it.
    async fn set_volume(
        &self,
        source_id: &SourceId,
        volume: Volume,
        retry_on_failure: bool,
        generation: u64,
    ) {
        let mut machine = self.inner.machine.lock().await;
        if machine.generation() != generation {
            debug!(%source_id, %volume, generation, "dropping command of a superseded transition");
            return;
        }

        let delivered = match self
            .inner
            .router
            .send(source_id, AgentCommand::SetVolume { volume })
            .await
        {
            Ok(()) => {
                debug!(%source_id, %volume, "volume command dispatched");
                true
            }
            Err(e) => {
                warn!(%source_id, %volume, error = %e, "volume command dropped");
                false
            }
        };

        if retry_on_failure {
            machine.record_dispatch(generation, delivered);
        }
    }

    fn persist(&self, state: &ProtectionState) {
        if let Err(e) = self.inner.store.save(state) {
            warn!(error = %e, ?state, "state not persisted, in-memory state stays authoritative");
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        debug!(%event, "emitting coordinator event");
        let _ = self.inner.events.send(event);
    }

    #[cfg(test)]
    pub(crate) async fn generation(&self) -> u64 {
        self.inner.machine.lock().await.generation()
    }

    #[cfg(test)]
    pub(crate) async fn monitor_running(&self) -> bool {
        self.inner.monitor.lock().await.is_some()
    }

    #[cfg(test)]
    pub(crate) async fn original_volume(&self) -> Volume {
        self.inner.machine.lock().await.original_volume()
    }
}
