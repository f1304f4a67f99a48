//! Unix domain socket server for IPC
//!
//! Control clients get request-response plus push notifications of
//! coordinator events. A client that sends `RegisterAgent` becomes the
//! link of that source: the daemon forwards router traffic as
//! [`AgentFrame`]s and accepts [`AgentUpstream`] frames back.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channel::{AgentFrame, AgentUpstream};
use crate::coordinator::{AgentBridge, Coordinator};
use crate::events::CoordinatorEvent;

use super::protocol::{DaemonStatus, Notification, Request, Response, MAX_FRAME_LEN};

/// How long shutdown waits for client handlers to flush and exit
const HANDLER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    coordinator: Coordinator,
    start_time: Instant,
    shutdown_tx: broadcast::Sender<()>,
    handlers: Mutex<JoinSet<()>>,
}

impl Server {
    /// Create a new IPC server
    pub fn new(socket_path: &Path, coordinator: Coordinator) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            coordinator,
            start_time: Instant::now(),
            shutdown_tx,
            handlers: Mutex::new(JoinSet::new()),
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let coordinator = self.coordinator.clone();
                    let started = self.start_time;
                    let shutdown_rx = self.shutdown_tx.subscribe();

                    let mut handlers = self.handlers.lock().await;
                    // Reap finished connections
                    while handlers.try_join_next().is_some() {}
                    handlers.spawn(async move {
                        let result =
                            Self::handle_client(stream, coordinator, started, shutdown_rx).await;
                        if let Err(e) = result {
                            warn!(error = %e, "client handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection in control mode
    async fn handle_client(
        stream: UnixStream,
        coordinator: Coordinator,
        started: Instant,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let (frames_tx, mut frames) = mpsc::channel(16);
        let reader = tokio::spawn(read_frames(read_half, frames_tx));

        let mut events: Option<broadcast::Receiver<CoordinatorEvent>> = None;

        let result = loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break Ok(()) };

                    let request: Request = match serde_json::from_slice(&frame) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(error = %e, "malformed request");
                            let response = Response::error("bad_request", e.to_string());
                            send_message(&mut writer, &response).await?;
                            continue;
                        }
                    };
                    debug!(?request, "received request");

                    match request {
                        Request::RegisterAgent { source_id } => {
                            let bridge = AgentBridge::register(coordinator, source_id).await;
                            break Self::serve_agent(bridge, frames, writer, shutdown).await;
                        }
                        Request::Subscribe => {
                            events = Some(coordinator.subscribe());
                            debug!("client subscribed to notifications");
                            send_message(&mut writer, &Response::Subscribed).await?;
                        }
                        request => {
                            let response =
                                Self::process_request(request, &coordinator, started).await;
                            send_message(&mut writer, &response).await?;
                        }
                    }
                }
                event = next_event(&mut events) => match event {
                    Ok(event) => {
                        send_message(&mut writer, &Notification::Event { event }).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "notification receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                },
                _ = shutdown.recv() => {
                    debug!("client handler shutting down");
                    break Ok(());
                }
            }
        };

        reader.abort();
        result
    }

    /// Carry a registered source's link over the socket
    ///
    /// On shutdown, commands still queued on the link are written out
    /// before the connection closes.
    async fn serve_agent(
        mut bridge: AgentBridge,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut writer: OwnedWriteHalf,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let registered = Response::Registered {
            source_id: bridge.source_id().clone(),
        };
        if let Err(e) = send_message(&mut writer, &registered).await {
            bridge.close().await;
            return Err(e);
        }

        let result = loop {
            tokio::select! {
                frame = bridge.next_frame() => {
                    let Some(frame) = frame else {
                        debug!(source_id = %bridge.source_id(), "agent link replaced or removed");
                        break Ok(());
                    };
                    if let Err(e) = send_message(&mut writer, &frame).await {
                        break Err(e);
                    }
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else { break Ok(()) };

                    let message = match serde_json::from_slice::<AgentUpstream>(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            let source_id = bridge.source_id();
                            warn!(%source_id, error = %e, "malformed agent frame");
                            continue;
                        }
                    };
                    if let Some(reply) = bridge.handle_upstream(message).await {
                        if let Err(e) = send_message(&mut writer, &reply).await {
                            break Err(e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    break flush(&mut writer, bridge.drain()).await;
                }
            }
        };

        bridge.close().await;
        result
    }

/// Process a control request and return a response
    async fn process_request(
        request: Request,
        coordinator: &Coordinator,
        started: Instant,
    ) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => {
                let status = coordinator.status().await;
                Response::Status(DaemonStatus::new(status, started.elapsed().as_secs()))
            }

            Request::GetState => Response::State(coordinator.get_state().await),

            Request::ToggleProtectedSource { source_id } => {
                info!(%source_id, "protection toggled via IPC");
                Response::State(coordinator.toggle_protected_source(source_id).await)
            }

            Request::SourceDestroyed { source_id } => {
                coordinator.on_source_destroyed(source_id).await;
                Response::Ack
            }

            Request::Subscribe | Request::RegisterAgent { .. } => {
                Response::error("unsupported", "request changes connection mode")
            }
        }
    }

    /// Gracefully shutdown the server
    ///
    /// Waits briefly for client handlers to flush queued agent commands.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let mut handlers = self.handlers.lock().await;
        let drained = tokio::time::timeout(HANDLER_DRAIN_TIMEOUT, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = handlers.len(), "client handlers still busy, aborting");
            handlers.abort_all();
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

async fn flush(writer: &mut OwnedWriteHalf, frames: Vec<AgentFrame>) -> Result<()> {
    for frame in &frames {
        send_message(writer, frame).await?;
    }
    if !frames.is_empty() {
        debug!(count = frames.len(), "flushed queued agent commands");
    }
    Ok(())
}

/// Forward frames from the socket until EOF or a protocol violation
async fn read_frames(mut reader: OwnedReadHalf, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("client disconnected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "dropping client");
                break;
            }
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<CoordinatorEvent>>,
) -> Result<CoordinatorEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Read one length-prefixed frame; `None` on a clean EOF
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame of {len} bytes exceeds limit");
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Send a length-prefixed JSON message
pub async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    let msg_len = (msg_bytes.len() as u32).to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde::de::DeserializeOwned;

    use crate::channel::{
        AgentCommand, AgentReply, AgentRequest, MediaReport, SourceRouter, Volume,
    };
    use crate::config::CoordinatorSettings;
    use crate::state::ProtectionState;
    use crate::store::MemoryStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        socket_path: PathBuf,
        server: Arc<Server>,
        coordinator: Coordinator,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("ducking.sock");
        let (events, _) = broadcast::channel(64);
        let coordinator = Coordinator::new(
            CoordinatorSettings {
                poll_interval: Duration::from_secs(3600),
                query_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            SourceRouter::new(),
            events,
        );

        let server = Arc::new(Server::new(&socket_path, coordinator.clone()).unwrap());
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        Fixture {
            _dir: dir,
            socket_path,
            server,
            coordinator,
        }
    }

    async fn connect(fixture: &Fixture) -> UnixStream {
        UnixStream::connect(&fixture.socket_path).await.unwrap()
    }

    async fn recv<T: DeserializeOwned>(stream: &mut UnixStream) -> T {
        let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    async fn call(stream: &mut UnixStream, request: &Request) -> Response {
        send_message(stream, request).await.unwrap();
        recv(stream).await
    }

    async fn register_agent(fixture: &Fixture, source_id: &str) -> UnixStream {
        let mut agent = connect(fixture).await;
        let request = Request::RegisterAgent {
            source_id: source_id.into(),
        };
        let response = call(&mut agent, &request).await;
        assert!(matches!(response, Response::Registered { .. }));
        agent
    }

    /// Read the next request on an agent link and answer it
    async fn answer(agent: &mut UnixStream, expected: AgentRequest, reply: AgentReply) {
        let frame: AgentFrame = recv(agent).await;
        let id = match frame {
            AgentFrame::Request { id, request } if request == expected => id,
            other => panic!("expected {expected:?}, got {other:?}"),
        };
        send_message(agent, &AgentUpstream::Reply { id, reply })
            .await
            .unwrap();
    }

    async fn expect_set_volume(agent: &mut UnixStream, expected: f64) {
        let frame: AgentFrame = recv(agent).await;
        match frame {
            AgentFrame::Command {
                command: AgentCommand::SetVolume { volume },
            } => assert!((volume.get() - expected).abs() < 1e-9, "got {volume}"),
            other => panic!("expected a volume command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_and_state() {
        let fixture = fixture().await;
        let mut client = connect(&fixture).await;

        assert!(matches!(call(&mut client, &Request::Ping).await, Response::Pong));
        match call(&mut client, &Request::GetState).await {
            Response::State(state) => assert_eq!(state, ProtectionState::inactive()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        let fixture = fixture().await;
        let mut client = connect(&fixture).await;

        send_message(&mut client, &serde_json::json!({"type": "launch_rockets"}))
            .await
            .unwrap();
        let response: Response = recv(&mut client).await;
        assert!(matches!(response, Response::Error { ref code, .. } if code == "bad_request"));

        assert!(matches!(call(&mut client, &Request::Ping).await, Response::Pong));
    }

    #[tokio::test]
    async fn test_toggle_through_socket_agent() {
        let fixture = fixture().await;
        let mut agent = register_agent(&fixture, "tabA").await;
        let mut client = connect(&fixture).await;
        let toggle = Request::ToggleProtectedSource {
            source_id: "tabA".into(),
        };

        send_message(&mut client, &toggle).await.unwrap();

        // The daemon snapshots the volume through the agent link
        let reply = AgentReply::Volume {
            volume: Volume::new(0.8),
        };
        answer(&mut agent, AgentRequest::GetCurrentVolume, reply).await;

        match recv::<Response>(&mut client).await {
            Response::State(state) => assert_eq!(state, ProtectionState::active("tabA".into())),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(fixture.coordinator.original_volume().await, Volume::new(0.8));

        match call(&mut client, &Request::GetStatus).await {
            Response::Status(status) => {
                assert!(status.active);
                assert!(!status.ducked);
                assert_eq!(status.connected_sources, 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Toggling off restores the original volume
        send_message(&mut client, &toggle).await.unwrap();
        let _: Response = recv(&mut client).await;
        expect_set_volume(&mut agent, 0.8).await;
    }

    #[tokio::test]
    async fn test_shutdown_restore_reaches_socket_agent() {
        let fixture = fixture().await;
        let mut music = register_agent(&fixture, "tabA").await;
        let mut video = register_agent(&fixture, "tabB").await;

        let coordinator = fixture.coordinator.clone();
        let toggle =
            tokio::spawn(async move { coordinator.toggle_protected_source("tabA".into()).await });
        let reply = AgentReply::Volume {
            volume: Volume::new(0.8),
        };
        answer(&mut music, AgentRequest::GetCurrentVolume, reply).await;
        assert!(toggle.await.unwrap().active);

        // The video starts playing and the music tab gets ducked
        let played = MediaReport::MediaPlayed { volume: None };
        fixture.coordinator.on_media_report(&"tabB".into(), played).await;
        let audible = AgentReply::Audible { audible: true };
        answer(&mut video, AgentRequest::QueryAudible, audible).await;
        expect_set_volume(&mut music, 0.08).await;
        assert!(fixture.coordinator.status().await.ducked);

        fixture.coordinator.shutdown().await;
        fixture.server.shutdown().await;

        // The restore queued by the coordinator is written before the link closes
        expect_set_volume(&mut music, 0.8).await;
        let closed = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut music))
            .await
            .unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let fixture = fixture().await;
        let mut subscriber = connect(&fixture).await;
        let response = call(&mut subscriber, &Request::Subscribe).await;
        assert!(matches!(response, Response::Subscribed));

        // No agent for tabA: the volume snapshot falls back to full volume
        fixture.coordinator.toggle_protected_source("tabA".into()).await;

        let notification: Notification = recv(&mut subscriber).await;
        assert!(matches!(
            notification,
            Notification::Event {
                event: CoordinatorEvent::ProtectionEnabled { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_agent_disconnect_is_not_destruction() {
        let fixture = fixture().await;
        let agent = register_agent(&fixture, "tabA").await;
        fixture.coordinator.toggle_protected_source("tabA".into()).await;

        drop(agent);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!fixture.coordinator.router().contains(&"tabA".into()).await);
        assert_eq!(
            fixture.coordinator.get_state().await,
            ProtectionState::active("tabA".into())
        );
    }

    #[tokio::test]
    async fn test_agent_should_duck() {
        let fixture = fixture().await;
        let mut agent = register_agent(&fixture, "tabB").await;

        send_message(&mut agent, &AgentUpstream::ShouldDuck { id: 3 })
            .await
            .unwrap();
        let frame: AgentFrame = recv(&mut agent).await;
        assert!(matches!(
            frame,
            AgentFrame::DuckAdvice { id: 3, advice } if !advice.duck
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let fixture = fixture().await;
        let mut client = connect(&fixture).await;

        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_socket_permissions_and_cleanup() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = fixture().await;
        let mode = std::fs::metadata(&fixture.socket_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        fixture.server.shutdown().await;
        assert!(!fixture.socket_path.exists());
    }
}
