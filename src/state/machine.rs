//! Core ducking state machine
//!
//! Pure transition logic: every operation takes the current state plus an
//! input and returns the list of side effects the coordinator must carry
//! out. Nothing here performs I/O.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channel::{DuckAdvice, SourceId, Volume};
use crate::events::CoordinatorEvent;
use crate::monitor::{self, AudibleSnapshot, Decision};

/// Protection state of the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    /// No source is protected
    #[default]
    Inactive,
    /// The given source is protected and ducked while others play
    Active(SourceId),
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Inactive => write!(f, "Inactive"),
            State::Active(source_id) => write!(f, "Active({})", source_id),
        }
    }
}

/// Externally visible part of the state, also the persisted layout
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionState {
    pub active: bool,
    pub protected_source_id: Option<SourceId>,
}

impl ProtectionState {
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn active(source_id: SourceId) -> Self {
        Self {
            active: true,
            protected_source_id: Some(source_id),
        }
    }
}

impl From<&State> for ProtectionState {
    fn from(state: &State) -> Self {
        match state {
            State::Inactive => Self::inactive(),
            State::Active(source_id) => Self::active(source_id.clone()),
        }
    }
}

impl From<&ProtectionState> for State {
    fn from(persisted: &ProtectionState) -> Self {
        match (&persisted.active, &persisted.protected_source_id) {
            (true, Some(source_id)) => State::Active(source_id.clone()),
            _ => State::Inactive,
        }
    }
}

/// Side effect requested by a transition, executed in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Snapshot the source's volume as the original volume
    QueryVolume(SourceId),
    StartMonitor,
    StopMonitor,
    SetVolume {
        source_id: SourceId,
        volume: Volume,
        /// Re-derive and re-issue on the next tick if dispatch fails
        retry_on_failure: bool,
    },
    Persist(ProtectionState),
    Emit(CoordinatorEvent),
}

/// The state machine owning protection, original volume and audibility
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: State,
    original_volume: Volume,
    tracked: AudibleSnapshot,
    /// Bumped on every transition; stale replies and ticks compare against it
    generation: u64,
    ducked: bool,
    redispatch: bool,
    duck_factor: f64,
}

impl StateMachine {
    pub fn new(duck_factor: f64) -> Self {
        Self {
            state: State::Inactive,
            original_volume: Volume::FULL,
            tracked: AudibleSnapshot::default(),
            generation: 0,
            ducked: false,
            redispatch: false,
            duck_factor,
        }
    }

    /// Start from a persisted state; session-only fields are reset
    pub fn with_persisted(mut self, persisted: &ProtectionState) -> Self {
        self.state = State::from(persisted);
        self
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn snapshot(&self) -> ProtectionState {
        ProtectionState::from(&self.state)
    }

    pub fn protected(&self) -> Option<&SourceId> {
        match &self.state {
            State::Active(source_id) => Some(source_id),
            State::Inactive => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn original_volume(&self) -> Volume {
        self.original_volume
    }

    pub fn tracked(&self) -> &AudibleSnapshot {
        &self.tracked
    }

    pub fn is_ducked(&self) -> bool {
        self.ducked
    }

    /// Whether `generation` still describes the current activation
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && matches!(self.state, State::Active(_))
    }

    fn ducked_volume(&self) -> Volume {
        self.original_volume.scaled(self.duck_factor)
    }

    fn reset_session(&mut self) {
        self.generation += 1;
        self.tracked = AudibleSnapshot::default();
        self.ducked = false;
        self.redispatch = false;
    }

    /// Toggle protection for `source_id`
    pub fn toggle(&mut self, source_id: &SourceId) -> Vec<Effect> {
        let old_state = self.state.clone();
        let mut effects = Vec::new();

        match &old_state {
            State::Active(current) if current == source_id => {
                effects.push(Effect::StopMonitor);
                effects.push(Effect::SetVolume {
                    source_id: source_id.clone(),
                    volume: self.original_volume,
                    retry_on_failure: false,
                });
                self.state = State::Inactive;
                self.reset_session();
                effects.push(Effect::Persist(self.snapshot()));
                effects.push(Effect::Emit(CoordinatorEvent::ProtectionDisabled {
                    source_id: source_id.clone(),
                }));
            }
            _ => {
                if let State::Active(previous) = &old_state {
                    effects.push(Effect::StopMonitor);
                    if self.ducked {
                        // The old source must not stay ducked once unprotected
                        effects.push(Effect::SetVolume {
                            source_id: previous.clone(),
                            volume: self.original_volume,
                            retry_on_failure: false,
                        });
                        effects.push(Effect::Emit(CoordinatorEvent::Restored {
                            source_id: previous.clone(),
                            volume: self.original_volume,
                        }));
                    }
                }
                self.state = State::Active(source_id.clone());
                self.original_volume = Volume::FULL;
                self.reset_session();
                effects.push(Effect::QueryVolume(source_id.clone()));
                effects.push(Effect::StartMonitor);
                effects.push(Effect::Persist(self.snapshot()));
            }
        }

        info!(
            from = %old_state,
            to = %self.state,
            generation = self.generation,
            "protection toggled"
        );
        effects
    }

    /// Replay activation side effects for a state loaded from the store
    pub fn resume(&mut self) -> Vec<Effect> {
        let State::Active(source_id) = self.state.clone() else {
            return Vec::new();
        };
        self.original_volume = Volume::FULL;
        self.reset_session();
        info!(%source_id, generation = self.generation, "resuming protection");
        vec![Effect::QueryVolume(source_id), Effect::StartMonitor]
    }

    /// Record the volume captured for the activation identified by `generation`
    ///
    /// Until a snapshot arrives the original volume is full scale, which is
    /// also what a failed snapshot leaves behind.
    ///
    /// Replies belonging to a superseded activation are discarded.
    pub fn record_original_volume(
        &mut self,
        generation: u64,
        volume: Volume,
    ) -> Option<CoordinatorEvent> {
        if !self.is_current(generation) {
            debug!(generation, current = self.generation, "discarding stale volume snapshot");
            return None;
        }
        self.original_volume = volume;
        let source_id = self.protected()?.clone();
        Some(CoordinatorEvent::ProtectionEnabled {
            source_id,
            original_volume: volume,
        })
    }

    /// The host destroyed a source
    pub fn source_destroyed(&mut self, source_id: &SourceId) -> Vec<Effect> {
        if self.protected() != Some(source_id) {
            return Vec::new();
        }

        self.state = State::Inactive;
        self.reset_session();
        info!(%source_id, "protected source destroyed, deactivating");

        vec![
            Effect::StopMonitor,
            Effect::Persist(self.snapshot()),
            Effect::Emit(CoordinatorEvent::ProtectedSourceLost {
                source_id: source_id.clone(),
            }),
        ]
    }

    /// Should `source_id` be ducked right now
    pub fn should_duck(&self, source_id: &SourceId) -> DuckAdvice {
        if self.protected() == Some(source_id) && !self.tracked.is_empty() {
            DuckAdvice::duck_to(self.ducked_volume())
        } else {
            DuckAdvice::hold()
        }
    }

    /// Apply one poll tick's audibility snapshot
    pub fn observe(&mut self, generation: u64, current: BTreeSet<SourceId>) -> Vec<Effect> {
        if !self.is_current(generation) {
            debug!(generation, current = self.generation, "discarding stale tick");
            return Vec::new();
        }
        let Some(protected) = self.protected().cloned() else {
            return Vec::new();
        };

        let mut decision = monitor::decide(&self.tracked, &current);
        if decision == Decision::Hold && self.redispatch {
            decision = monitor::settle(&current);
            debug!(?decision, "re-issuing undelivered command");
        }
        self.tracked = Arc::new(current);

        match decision {
            Decision::Hold => Vec::new(),
            Decision::Duck => {
                self.ducked = true;
                self.redispatch = false;
                let volume = self.ducked_volume();
                vec![
                    Effect::SetVolume {
                        source_id: protected.clone(),
                        volume,
                        retry_on_failure: true,
                    },
                    Effect::Emit(CoordinatorEvent::Ducked {
                        source_id: protected,
                        volume,
                        audible: self.tracked.iter().cloned().collect(),
                    }),
                ]
            }
            Decision::Restore => {
                self.ducked = false;
                self.redispatch = false;
                let volume = self.original_volume;
                vec![
                    Effect::SetVolume {
                        source_id: protected.clone(),
                        volume,
                        retry_on_failure: true,
                    },
                    Effect::Emit(CoordinatorEvent::Restored {
                        source_id: protected,
                        volume,
                    }),
                ]
            }
        }
    }

    /// Record whether a tick command reached the source's link
    pub fn record_dispatch(&mut self, generation: u64, delivered: bool) {
        if self.is_current(generation) {
            self.redispatch = !delivered;
        }
    }

    /// Stop monitoring and un-duck before the process exits
    ///
    /// The protection itself is kept so it resumes after a restart.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        let was_ducked = self.ducked;
        self.reset_session();

        let mut effects = vec![Effect::StopMonitor];
        if let (true, Some(source_id)) = (was_ducked, self.protected().cloned()) {
            effects.push(Effect::SetVolume {
                source_id: source_id.clone(),
                volume: self.original_volume,
                retry_on_failure: false,
            });
            effects.push(Effect::Emit(CoordinatorEvent::Restored {
                source_id,
                volume: self.original_volume,
            }));
        }
        effects
    }
}
