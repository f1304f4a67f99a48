//! Routing of requests and commands to per-source agents
//!
//! Each registered source owns an mpsc link. Requests carry a oneshot
//! reply sender and are bounded by a timeout; commands are pushed with
//! `try_send` and never wait on the agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use super::protocol::{AgentCommand, AgentReply, AgentRequest, SourceId, Volume};

/// Capacity of each agent link
const LINK_CAPACITY: usize = 32;

/// Message delivered to an agent
#[derive(Debug)]
pub enum Envelope {
    /// Request expecting a reply on `reply_tx`
    Request {
        request: AgentRequest,
        reply_tx: oneshot::Sender<AgentReply>,
    },
    /// Fire-and-forget command
    Command(AgentCommand),
}

/// Errors that can occur while talking to an agent
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("source {0} is unreachable")]
    SourceUnreachable(SourceId),

    #[error("source {0} did not answer in time")]
    Timeout(SourceId),

    #[error("source {0} link is backlogged")]
    Backlogged(SourceId),

    #[error("source {source_id} sent an unexpected reply: {reply:?}")]
    UnexpectedReply {
        source_id: SourceId,
        reply: AgentReply,
    },
}

/// Receiving side of a registered source
#[derive(Debug)]
pub struct AgentEndpoint {
    pub source_id: SourceId,
    connection: u64,
    rx: mpsc::Receiver<Envelope>,
}

impl AgentEndpoint {
    /// Receive the next envelope; `None` once the source was unregistered
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Take an envelope that is already queued, without waiting
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }
}

struct Link {
    tx: mpsc::Sender<Envelope>,
    connection: u64,
}

/// Registry of connected sources
#[derive(Clone)]
pub struct SourceRouter {
    links: Arc<RwLock<HashMap<SourceId, Link>>>,
    registered: Arc<Notify>,
    next_connection: Arc<AtomicU64>,
}

impl Default for SourceRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRouter {
    pub fn new() -> Self {
        Self {
            links: Arc::new(RwLock::new(HashMap::new())),
            registered: Arc::new(Notify::new()),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a source, replacing any previous link for the same id
    pub async fn register(&self, source_id: SourceId) -> AgentEndpoint {
        let (tx, rx) = mpsc::channel(LINK_CAPACITY);
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);

        let replaced = self
            .links
            .write()
            .await
            .insert(source_id.clone(), Link { tx, connection })
            .is_some();

        info!(%source_id, connection, replaced, "source registered");
        self.registered.notify_waiters();

        AgentEndpoint {
            source_id,
            connection,
            rx,
        }
    }

    /// Drop the link of an endpoint, unless it was already replaced
    pub async fn unregister(&self, endpoint: &AgentEndpoint) {
        let mut links = self.links.write().await;
        if links
            .get(&endpoint.source_id)
            .is_some_and(|link| link.connection == endpoint.connection)
        {
            links.remove(&endpoint.source_id);
            info!(source_id = %endpoint.source_id, "source unregistered");
        }
    }

    /// Forget a source entirely, whichever connection owns it
    pub async fn remove(&self, source_id: &SourceId) -> bool {
        let removed = self.links.write().await.remove(source_id).is_some();
        if removed {
            debug!(%source_id, "source removed from router");
        }
        removed
    }

    pub async fn contains(&self, source_id: &SourceId) -> bool {
        self.links.read().await.contains_key(source_id)
    }

    pub async fn sources(&self) -> Vec<SourceId> {
        self.links.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    /// Wait until `source_id` registers or `timeout` elapses
    pub async fn wait_for(&self, source_id: &SourceId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.registered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.contains(source_id).await {
                return true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.contains(source_id).await;
                }
            }
        }
    }

    /// Send a request and wait for the reply, bounded by `timeout`
    pub async fn request(
        &self,
        source_id: &SourceId,
        request: AgentRequest,
        timeout: Duration,
    ) -> Result<AgentReply, ChannelError> {
        let tx = self.link(source_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();

        let exchange = async {
            tx.send(Envelope::Request { request, reply_tx })
                .await
                .map_err(|_| ChannelError::SourceUnreachable(source_id.clone()))?;
            reply_rx
                .await
                .map_err(|_| ChannelError::SourceUnreachable(source_id.clone()))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(source_id.clone())),
        }
    }

    pub async fn query_volume(
        &self,
        source_id: &SourceId,
        timeout: Duration,
    ) -> Result<Volume, ChannelError> {
        match self.request(source_id, AgentRequest::GetCurrentVolume, timeout).await? {
            AgentReply::Volume { volume } => Ok(volume),
            reply => Err(ChannelError::UnexpectedReply {
                source_id: source_id.clone(),
                reply,
            }),
        }
    }

    pub async fn query_audible(
        &self,
        source_id: &SourceId,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        match self.request(source_id, AgentRequest::QueryAudible, timeout).await? {
            AgentReply::Audible { audible } => Ok(audible),
            reply => Err(ChannelError::UnexpectedReply {
                source_id: source_id.clone(),
                reply,
            }),
        }
    }

    /// Hand a one-way command to the source's link without waiting
    pub async fn send(
        &self,
        source_id: &SourceId,
        command: AgentCommand,
    ) -> Result<(), ChannelError> {
        let tx = self.link(source_id).await?;
        tx.try_send(Envelope::Command(command)).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::Backlogged(source_id.clone()),
            TrySendError::Closed(_) => ChannelError::SourceUnreachable(source_id.clone()),
        })
    }

    async fn link(&self, source_id: &SourceId) -> Result<mpsc::Sender<Envelope>, ChannelError> {
        self.links
            .read()
            .await
            .get(source_id)
            .map(|link| link.tx.clone())
            .ok_or_else(|| ChannelError::SourceUnreachable(source_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answer every request on the endpoint with a fixed reply
    fn answer_with(mut endpoint: AgentEndpoint, reply: AgentReply) {
        tokio::spawn(async move {
            while let Some(envelope) = endpoint.recv().await {
                if let Envelope::Request { reply_tx, .. } = envelope {
                    let _ = reply_tx.send(reply);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_reply() {
        let router = SourceRouter::new();
        let endpoint = router.register("tabA".into()).await;
        answer_with(endpoint, AgentReply::Volume { volume: Volume::new(0.8) });

        let volume = router
            .query_volume(&"tabA".into(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(volume, Volume::new(0.8));
    }

    #[tokio::test]
    async fn test_unknown_source_is_unreachable() {
        let router = SourceRouter::new();
        let err = router
            .query_audible(&"ghost".into(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::SourceUnreachable(_)));

        let err = router
            .send(&"ghost".into(), AgentCommand::SetVolume { volume: Volume::FULL })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::SourceUnreachable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_times_out() {
        let router = SourceRouter::new();
        let _endpoint = router.register("tabB".into()).await;

        let err = router
            .query_audible(&"tabB".into(), Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_wrong_reply_kind() {
        let router = SourceRouter::new();
        let endpoint = router.register("tabC".into()).await;
        answer_with(endpoint, AgentReply::Audible { audible: true });

        let err = router
            .query_volume(&"tabC".into(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnexpectedReply { .. }));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_new_link() {
        let router = SourceRouter::new();
        let old = router.register("tabA".into()).await;
        let mut new = router.register("tabA".into()).await;

        router.unregister(&old).await;
        assert!(router.contains(&"tabA".into()).await);

        router
            .send(&"tabA".into(), AgentCommand::SetVolume { volume: Volume::SILENT })
            .await
            .unwrap();
        assert!(matches!(new.recv().await, Some(Envelope::Command(_))));

        router.unregister(&new).await;
        assert_eq!(router.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_registration() {
        let router = SourceRouter::new();
        let late = router.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _endpoint = late.register("tabA".into()).await;
            std::future::pending::<()>().await;
        });

        assert!(router.wait_for(&"tabA".into(), Duration::from_secs(1)).await);
        assert!(!router.wait_for(&"tabZ".into(), Duration::from_millis(300)).await);
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_register() {
        use tokio_test::{assert_pending, assert_ready_eq};

        let router = SourceRouter::new();
        let source_id = SourceId::from("tabA");
        let wait = router.wait_for(&source_id, Duration::from_secs(60));
        let mut waiting = tokio_test::task::spawn(wait);
        assert_pending!(waiting.poll());

        let _endpoint = router.register(source_id.clone()).await;
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), true);
    }

    #[tokio::test]
    async fn test_full_link_is_backlogged() {
        let router = SourceRouter::new();
        let _endpoint = router.register("tabA".into()).await;
        let command = AgentCommand::SetVolume { volume: Volume::FULL };

        for _ in 0..LINK_CAPACITY {
            tokio_test::assert_ok!(router.send(&"tabA".into(), command).await);
        }
        let err = tokio_test::assert_err!(router.send(&"tabA".into(), command).await);
        assert!(matches!(err, ChannelError::Backlogged(_)));
    }
}
