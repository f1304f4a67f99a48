//! Per-source agent
//!
//! Tracks the media elements of one source and talks to the coordinator
//! only through agent frames: it answers requests, executes volume
//! commands, and on playback or volume changes sends a report plus a
//! local duck check, so a freshly started element is ducked without
//! waiting for the next poll tick.

mod media;

pub use media::{ElementId, MediaElement, MediaTracker};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::{
    AgentCommand, AgentFrame, AgentReply, AgentRequest, AgentUpstream, MediaReport, SourceId,
    Volume,
};
use crate::config::DEFAULT_VOLUME;
use crate::coordinator::{AgentBridge, Coordinator};

/// Capacity of the in-process frame and upstream queues
const QUEUE_CAPACITY: usize = 64;

/// Changes observed in the source's content
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// A new element appeared in the source
    Discovered(MediaElement),
    Removed(ElementId),
    Played(ElementId),
    Paused(ElementId),
    /// Volume changed by something other than a coordinator command
    VolumeChanged { id: ElementId, volume: Volume },
    MutedChanged { id: ElementId, muted: bool },
    MetadataLoaded { id: ElementId, duration: f64 },
}

/// Agent for a single source
pub struct Agent {
    source_id: SourceId,
    tracker: MediaTracker,
    default_volume: Volume,
    last_check: u64,
    /// Id of the newest duck check still waiting for advice
    awaiting: Option<u64>,
}

impl Agent {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            tracker: MediaTracker::new(),
            default_volume: Volume::new(DEFAULT_VOLUME),
            last_check: 0,
            awaiting: None,
        }
    }

    /// Seed the tracker with the elements found by the initial scan
    pub fn with_elements(mut self, elements: impl IntoIterator<Item = MediaElement>) -> Self {
        for element in elements {
            self.tracker.track(element);
        }
        self
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn tracker(&self) -> &MediaTracker {
        &self.tracker
    }

    /// Serve frames and media events until the link or the event feed closes
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<AgentFrame>,
        upstream: mpsc::Sender<AgentUpstream>,
        mut media_rx: mpsc::Receiver<MediaEvent>,
    ) -> Self {
        info!(source_id = %self.source_id, elements = self.tracker.len(), "agent started");

        'serve: loop {
            let outgoing = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).into_iter().collect(),
                    None => break,
                },
                event = media_rx.recv() => match event {
                    Some(event) => self.handle_media_event(event),
                    None => break,
                },
            };

            for message in outgoing {
                if upstream.send(message).await.is_err() {
                    break 'serve;
                }
            }
        }

        info!(source_id = %self.source_id, "agent stopped");
        self
    }

    /// Handle one frame from the coordinator side, returning the reply if any
    pub fn handle_frame(&mut self, frame: AgentFrame) -> Option<AgentUpstream> {
        match frame {
            AgentFrame::Request { id, request } => {
                let reply = self.answer(request);
                debug!(source_id = %self.source_id, id, ?request, ?reply, "answering request");
                Some(AgentUpstream::Reply { id, reply })
            }
            AgentFrame::Command { command } => {
                self.apply(command);
                None
            }
            AgentFrame::DuckAdvice { id, advice } => {
                if self.awaiting != Some(id) {
                    debug!(source_id = %self.source_id, id, "ignoring superseded duck advice");
                    return None;
                }
                self.awaiting = None;
                if let (true, Some(volume)) = (advice.duck, advice.volume) {
                    let changed = self.tracker.set_all(volume);
                    debug!(source_id = %self.source_id, %volume, changed, "ducked locally");
                }
                None
            }
        }
    }

    fn answer(&self, request: AgentRequest) -> AgentReply {
        match request {
            AgentRequest::GetCurrentVolume => AgentReply::Volume {
                volume: self.tracker.representative_volume(self.default_volume),
            },
            AgentRequest::QueryAudible => AgentReply::Audible {
                audible: self.tracker.is_audible(),
            },
        }
    }

    fn apply(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::SetVolume { volume } => {
                let changed = self.tracker.set_all(volume);
                debug!(source_id = %self.source_id, %volume, changed, "volume set");
            }
        }
    }

    /// Apply a content change, returning the messages it produces
    pub fn handle_media_event(&mut self, event: MediaEvent) -> Vec<AgentUpstream> {
        match event {
            MediaEvent::Discovered(element) => {
                let playing = element.is_audible();
                let (id, volume) = (element.id, element.volume);
                if !self.tracker.track(element) {
                    return Vec::new();
                }
                debug!(source_id = %self.source_id, id, "media element attached");
                if playing {
                    return self.activity(MediaReport::MediaPlayed {
                        volume: Some(volume),
                    });
                }
            }
            MediaEvent::Removed(id) => {
                self.tracker.forget(id);
            }
            MediaEvent::Played(id) => {
                let Some(element) = self.tracker.get_mut(id) else {
                    debug!(source_id = %self.source_id, id, "play from unknown element");
                    return Vec::new();
                };
                element.paused = false;
                let volume = element.volume;
                return self.activity(MediaReport::MediaPlayed {
                    volume: Some(volume),
                });
            }
            MediaEvent::Paused(id) => {
                if let Some(element) = self.tracker.get_mut(id) {
                    element.paused = true;
                }
            }
            MediaEvent::VolumeChanged { id, volume } => {
                let Some(element) = self.tracker.get_mut(id) else {
                    return Vec::new();
                };
                if element.volume == volume {
                    return Vec::new();
                }
                element.volume = volume;
                return self.activity(MediaReport::MediaVolumeChanged {
                    volume: Some(volume),
                });
            }
            MediaEvent::MutedChanged { id, muted } => {
                if let Some(element) = self.tracker.get_mut(id) {
                    element.muted = muted;
                }
            }
            MediaEvent::MetadataLoaded { id, duration } => {
                if let Some(element) = self.tracker.get_mut(id) {
                    element.duration = Some(duration);
                }
            }
        }
        Vec::new()
    }

    /// Fire-and-forget report followed by a local duck check
    fn activity(&mut self, report: MediaReport) -> Vec<AgentUpstream> {
        self.last_check += 1;
        self.awaiting = Some(self.last_check);
        vec![
            AgentUpstream::Report { report },
            AgentUpstream::ShouldDuck {
                id: self.last_check,
            },
        ]
    }
}

/// A running in-process agent and its coordinator-side bridge
pub struct AgentHandle {
    media_tx: mpsc::Sender<MediaEvent>,
    agent: JoinHandle<Agent>,
    bridge: JoinHandle<()>,
}

impl AgentHandle {
    /// Register `agent` with the coordinator and run both ends of its link
    pub async fn spawn(agent: Agent, coordinator: &Coordinator) -> Self {
        let bridge = AgentBridge::register(coordinator.clone(), agent.source_id.clone()).await;
        let (frames_tx, frames_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (upstream_tx, upstream_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (media_tx, media_rx) = mpsc::channel(QUEUE_CAPACITY);

        Self {
            media_tx,
            bridge: tokio::spawn(bridge.run(frames_tx, upstream_rx)),
            agent: tokio::spawn(agent.run(frames_rx, upstream_tx, media_rx)),
        }
    }

    /// Feed a content change to the agent; false if the agent has stopped
    pub async fn media(&self, event: MediaEvent) -> bool {
        self.media_tx.send(event).await.is_ok()
    }

    /// Stop the agent and wait for its link to close
    pub async fn stop(self) -> Option<Agent> {
        drop(self.media_tx);
        let agent = self.agent.await.ok();
        let _ = self.bridge.await;
        agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use crate::channel::DuckAdvice;
    use crate::config::CoordinatorSettings;
    use crate::state::ProtectionState;
    use crate::store::MemoryStore;

    fn coordinator() -> Coordinator {
        let (events, _) = broadcast::channel(64);
        Coordinator::new(
            CoordinatorSettings {
                poll_interval: Duration::from_secs(3600),
                query_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            crate::channel::SourceRouter::new(),
            events,
        )
    }

    fn music() -> MediaElement {
        MediaElement::new(1)
            .with_volume(Volume::new(0.8))
            .with_duration(240.0)
            .playing()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn request(agent: &mut Agent, request: AgentRequest) -> Option<AgentUpstream> {
        agent.handle_frame(AgentFrame::Request { id: 7, request })
    }

    fn set_volume(volume: Volume) -> AgentFrame {
        AgentFrame::Command {
            command: AgentCommand::SetVolume { volume },
        }
    }

    #[test]
    fn test_answers_queries() {
        let mut agent = Agent::new("tabA".into()).with_elements([music()]);

        assert_eq!(
            request(&mut agent, AgentRequest::GetCurrentVolume),
            Some(AgentUpstream::Reply {
                id: 7,
                reply: AgentReply::Volume {
                    volume: Volume::new(0.8)
                },
            })
        );
        assert_eq!(
            request(&mut agent, AgentRequest::QueryAudible),
            Some(AgentUpstream::Reply {
                id: 7,
                reply: AgentReply::Audible { audible: true },
            })
        );
    }

    #[test]
    fn test_empty_source_defaults() {
        let mut agent = Agent::new("blank".into());

        assert_eq!(
            request(&mut agent, AgentRequest::GetCurrentVolume),
            Some(AgentUpstream::Reply {
                id: 7,
                reply: AgentReply::Volume {
                    volume: Volume::new(0.5)
                },
            })
        );

        // Commands before any media exists are harmless
        assert!(agent.handle_frame(set_volume(Volume::SILENT)).is_none());
        assert!(agent.tracker().is_empty());
    }

    #[test]
    fn test_set_volume_reaches_discovered_elements() {
        let mut agent = Agent::new("tabA".into()).with_elements([music()]);
        assert!(agent
            .handle_media_event(MediaEvent::Discovered(MediaElement::new(2)))
            .is_empty());

        for _ in 0..2 {
            agent.handle_frame(set_volume(Volume::new(0.3)));
        }
        assert!(agent
            .tracker()
            .elements()
            .iter()
            .all(|e| e.volume == Volume::new(0.3)));
    }

    #[test]
    fn test_activity_sends_report_and_duck_check() {
        let mut agent = Agent::new("tabB".into()).with_elements([MediaElement::new(5)]);

        assert_eq!(
            agent.handle_media_event(MediaEvent::Played(5)),
            vec![
                AgentUpstream::Report {
                    report: MediaReport::MediaPlayed {
                        volume: Some(Volume::FULL)
                    },
                },
                AgentUpstream::ShouldDuck { id: 1 },
            ]
        );

        // Same volume again is not a change
        let same = MediaEvent::VolumeChanged {
            id: 5,
            volume: Volume::FULL,
        };
        assert!(agent.handle_media_event(same).is_empty());

        let quieter = MediaEvent::VolumeChanged {
            id: 5,
            volume: Volume::new(0.4),
        };
        assert_eq!(agent.handle_media_event(quieter).len(), 2);
    }

    #[test]
    fn test_only_newest_duck_advice_applies() {
        let mut agent = Agent::new("tabA".into()).with_elements([music()]);
        agent.handle_media_event(MediaEvent::Paused(1));
        agent.handle_media_event(MediaEvent::Played(1));
        agent.handle_media_event(MediaEvent::Paused(1));
        agent.handle_media_event(MediaEvent::Played(1));

        let stale = AgentFrame::DuckAdvice {
            id: 1,
            advice: DuckAdvice::duck_to(Volume::new(0.05)),
        };
        assert!(agent.handle_frame(stale).is_none());
        assert_eq!(agent.tracker().elements()[0].volume, Volume::new(0.8));

        let current = AgentFrame::DuckAdvice {
            id: 2,
            advice: DuckAdvice::duck_to(Volume::new(0.08)),
        };
        agent.handle_frame(current);
        assert_eq!(agent.tracker().elements()[0].volume, Volume::new(0.08));
    }

    #[tokio::test]
    async fn test_end_to_end_duck_and_local_check() {
        let coordinator = coordinator();
        let music_tab = AgentHandle::spawn(
            Agent::new("tabA".into()).with_elements([music()]),
            &coordinator,
        )
        .await;
        let video = MediaElement::new(9).with_duration(30.0);
        let video_agent = Agent::new("tabB".into()).with_elements([video]);
        let video_tab = AgentHandle::spawn(video_agent, &coordinator).await;

        let state = coordinator.toggle_protected_source("tabA".into()).await;
        assert_eq!(state, ProtectionState::active("tabA".into()));
        assert_eq!(coordinator.status().await.connected_sources, 2);

        // The video starts; its report wakes the monitor, which ducks the music tab
        assert!(video_tab.media(MediaEvent::Played(9)).await);
        settle().await;
        assert!(coordinator.status().await.ducked);

        // A new element appears in the music tab and starts playing
        let late = MediaElement::new(2).with_duration(100.0);
        assert!(music_tab.media(MediaEvent::Discovered(late)).await);
        assert!(music_tab.media(MediaEvent::Played(2)).await);
        settle().await;

        let music = music_tab.stop().await.unwrap();
        assert!(music
            .tracker()
            .elements()
            .iter()
            .all(|e| (e.volume.get() - 0.08).abs() < 1e-9));
        assert!(!coordinator.router().contains(&"tabA".into()).await);

        video_tab.stop().await.unwrap();
    }
}
