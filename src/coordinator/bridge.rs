//! Coordinator side of one agent link
//!
//! Router envelopes become [`AgentFrame`]s keyed by request id, and the
//! agent's [`AgentUpstream`] messages are answered here. Socket agents and
//! in-process agents speak the same frames through this type.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::channel::{
    AgentEndpoint, AgentFrame, AgentReply, AgentUpstream, Envelope, SourceId,
};

use super::Coordinator;

pub struct AgentBridge {
    coordinator: Coordinator,
    endpoint: AgentEndpoint,
    pending: HashMap<u64, oneshot::Sender<AgentReply>>,
    next_id: u64,
}

impl AgentBridge {
    /// Register `source_id` with the coordinator's router
    pub async fn register(coordinator: Coordinator, source_id: SourceId) -> Self {
        let endpoint = coordinator.router().register(source_id).await;
        Self {
            coordinator,
            endpoint,
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.endpoint.source_id
    }

    /// Next frame to deliver; `None` once the link was replaced or removed
    ///
    /// Cancel safe.
    pub async fn next_frame(&mut self) -> Option<AgentFrame> {
        let envelope = self.endpoint.recv().await?;
        Some(self.to_frame(envelope))
    }

    /// Commands already queued on the link, for a final flush
    ///
    /// Queued requests are dropped; their callers see the source as
    /// unreachable.
    pub fn drain(&mut self) -> Vec<AgentFrame> {
        let mut frames = Vec::new();
        while let Some(envelope) = self.endpoint.try_recv() {
            match envelope {
                Envelope::Command(command) => frames.push(AgentFrame::Command { command }),
                Envelope::Request { request, .. } => {
                    debug!(source_id = %self.source_id(), ?request, "dropping queued request");
                }
            }
        }
        frames
    }

    fn to_frame(&mut self, envelope: Envelope) -> AgentFrame {
        match envelope {
            Envelope::Request { request, reply_tx } => {
                let id = self.next_id;
                self.next_id += 1;
                // Callers that already timed out
                self.pending.retain(|_, tx| !tx.is_closed());
                self.pending.insert(id, reply_tx);
                AgentFrame::Request { id, request }
            }
            Envelope::Command(command) => AgentFrame::Command { command },
        }
    }

    /// Handle one message from the agent, returning the frame to send back
    pub async fn handle_upstream(&mut self, message: AgentUpstream) -> Option<AgentFrame> {
        match message {
            AgentUpstream::Reply { id, reply } => {
                match self.pending.remove(&id) {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(reply);
                    }
                    None => {
                        let source_id = self.source_id();
                        debug!(%source_id, id, "reply to unknown or expired request");
                    }
                }
                None
            }
            AgentUpstream::ShouldDuck { id } => {
                let advice = self.coordinator.should_duck(self.source_id()).await;
                Some(AgentFrame::DuckAdvice { id, advice })
            }
            AgentUpstream::Report { report } => {
                let coordinator = self.coordinator.clone();
                let source_id = self.source_id().clone();
                tokio::spawn(async move {
                    coordinator.on_media_report(&source_id, report).await;
                });
                None
            }
        }
    }

    /// Serve an in-process agent until either side closes
    pub async fn run(
        mut self,
        frames: mpsc::Sender<AgentFrame>,
        mut upstream: mpsc::Receiver<AgentUpstream>,
    ) {
        loop {
            let outgoing = tokio::select! {
                frame = self.next_frame() => match frame {
                    Some(frame) => Some(frame),
                    None => break,
                },
                message = upstream.recv() => match message {
                    Some(message) => self.handle_upstream(message).await,
                    None => break,
                },
            };

            if let Some(frame) = outgoing {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
        }
        self.close().await;
    }

    /// Drop the router link unless a newer connection replaced it
    ///
    /// A closed link is not a destroyed source.
    pub async fn close(self) {
        self.coordinator.router().unregister(&self.endpoint).await;
        info!(source_id = %self.endpoint.source_id, "agent link closed");
    }
}
