//! Loopback reference engine.
//!
//! A small in-process peer speaking the ngsock wire protocol, for exercising
//! the dispatcher without the real engine. It keeps a [`Graph`] of hub nodes
//! and answers every request with a status reply on the control socket.
//! Deliveries go out on the data socket without blocking: when the client
//! has not drained it and the socket is full, the send fails with `ENOBUFS`.
//!
//! Runs either on an in-process socket pair ([`spawn`]) or bound to the
//! filesystem paths of a [`ChannelConfig`] ([`LoopbackEngine::bind`]). A
//! bound engine serves one client at a time: whoever greeted it last gets
//! the replies, and a new client starts from an empty graph.

pub mod graph;

pub use graph::Graph;

use bytes::Bytes;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::unix::SocketAddr;
use tokio::net::UnixDatagram;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{BoundPaths, Channels};
use crate::types::{ChannelConfig, EngineErrno, Error, HookName, Result};
use crate::wire::codec::{self, Frame};
use crate::wire::{cmd, EngineMessage, StatusReply, GENERIC_COOKIE};

/// How long a delivery may wait on stale writability before it counts as a
/// full queue.
const SEND_GRACE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Port {
    Control,
    Data,
}

/// Where replies on one port go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Client {
    /// Socket pair; the engine socket is already connected.
    Paired,
    /// Filesystem-bound client socket, addressed per send.
    Bound(PathBuf),
}

/// Handle to an engine started with [`spawn`].
#[derive(Debug)]
pub struct LoopbackHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LoopbackHandle {
    /// Stop the engine and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Loopback engine task failed: {}", e);
        }
    }
}

/// Start an engine on an in-process socket pair and return the client side.
///
/// Must be called from within a tokio runtime.
pub fn spawn(config: &ChannelConfig) -> Result<(Channels, LoopbackHandle)> {
    let (channels, sockets) = Channels::pair(config.max_datagram_bytes)?;
    let engine = LoopbackEngine {
        control: sockets.control,
        data: sockets.data,
        control_client: Some(Client::Paired),
        data_client: Some(Client::Paired),
        graph: Graph::new(),
        max_datagram: config.max_datagram_bytes,
        _bound: None,
    };
    let cancel = CancellationToken::new();
    let task = tokio::spawn(engine.run(cancel.clone()));
    Ok((channels, LoopbackHandle { cancel, task }))
}

/// Bind to the configured engine paths and serve until `cancel` fires.
pub async fn serve(config: &ChannelConfig, cancel: CancellationToken) -> Result<()> {
    let engine = LoopbackEngine::bind(config)?;
    engine.run(cancel).await;
    Ok(())
}

#[derive(Debug)]
pub struct LoopbackEngine {
    control: UnixDatagram,
    data: UnixDatagram,
    control_client: Option<Client>,
    data_client: Option<Client>,
    graph: Graph,
    max_datagram: usize,
    _bound: Option<BoundPaths>,
}

impl LoopbackEngine {
    /// Bind the engine's control and data sockets at the configured paths.
    /// The client is adopted from its HELLO frames.
    pub fn bind(config: &ChannelConfig) -> Result<Self> {
        for path in [&config.engine_control, &config.engine_data] {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let bound = BoundPaths::files(vec![
            config.engine_control.clone(),
            config.engine_data.clone(),
        ]);
        let control = UnixDatagram::bind(&config.engine_control)?;
        let data = UnixDatagram::bind(&config.engine_data)?;
        tracing::info!(
            "Loopback engine listening on {} (control), {} (data)",
            config.engine_control.display(),
            config.engine_data.display(),
        );
        Ok(Self {
            control,
            data,
            control_client: None,
            data_client: None,
            graph: Graph::new(),
            max_datagram: config.max_datagram_bytes,
            _bound: Some(bound),
        })
    }

    /// Serve requests until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut control_buf = vec![0u8; self.max_datagram];
        let mut data_buf = vec![0u8; self.max_datagram];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Loopback engine shutting down");
                    break;
                }
                r = self.control.recv_from(&mut control_buf) => (Port::Control, r),
                r = self.data.recv_from(&mut data_buf) => (Port::Data, r),
            };

            match received {
                (Port::Control, Ok((len, addr))) => {
                    self.on_control(&control_buf[..len], &addr).await;
                }
                (Port::Data, Ok((len, addr))) => {
                    self.on_data(&data_buf[..len], &addr).await;
                }
                (port, Err(e)) => {
                    tracing::warn!("Loopback engine {:?} receive failed: {}", port, e);
                }
            }
        }
    }

    async fn on_control(&mut self, datagram: &[u8], addr: &SocketAddr) {
        let frame = match codec::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed control frame: {}", e);
                return;
            }
        };

        match frame {
            Frame::Hello { token } => {
                self.adopt(Port::Control, addr);
                self.reply(token, StatusReply::ok(0)).await;
            }
            Frame::Control { token, request } => {
                let status = match request.command() {
                    Ok(command) => {
                        match self.graph.apply(request.path.as_str(), &command) {
                            Ok(()) => StatusReply::ok(0),
                            Err(errno) => StatusReply::err(errno),
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Rejecting control request: {}", e);
                        StatusReply::err(e.errno())
                    }
                };
                tracing::debug!(
                    "cmd {} on {} -> {}",
                    request.cmd,
                    request.path,
                    status.errno.map_or("ok", |e| e.as_str())
                );
                self.reply(token, status).await;
            }
            Frame::Text { token, request } => {
                match self.graph.text(request.path.as_str(), &request.text) {
                    Ok(node) => {
                        let message = EngineMessage {
                            path: self.graph.display_path(node),
                            cookie: GENERIC_COOKIE,
                            cmd: cmd::TEXT_REPLY,
                            text: request.text,
                        };
                        self.notify(message).await;
                        // Text commands answer with their token.
                        self.reply(token, StatusReply::ok(text_result(token))).await;
                    }
                    Err(errno) => self.reply(token, StatusReply::err(errno)).await,
                }
            }
            other => {
                tracing::warn!("Unexpected {} frame on engine control socket", other.kind());
            }
        }
    }

    async fn on_data(&mut self, datagram: &[u8], addr: &SocketAddr) {
        let frame = match codec::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed data frame: {}", e);
                return;
            }
        };

        match frame {
            Frame::Hello { token } => {
                self.adopt(Port::Data, addr);
                self.reply(token, StatusReply::ok(0)).await;
            }
            Frame::Data {
                token,
                hook,
                payload,
            } => {
                let status = match self.graph.route(hook.as_str()) {
                    Ok(targets) => self.deliver(&targets, payload).await,
                    Err(errno) => StatusReply::err(errno),
                };
                self.reply(token, status).await;
            }
            other => {
                tracing::warn!("Unexpected {} frame on engine data socket", other.kind());
            }
        }
    }

    /// Address replies on `port` to the client that greeted it.
    ///
    /// Clients greet once per open, so a control greeting starts a new
    /// session with an empty graph.
    fn adopt(&mut self, port: Port, addr: &SocketAddr) {
        let current = match port {
            Port::Control => &mut self.control_client,
            Port::Data => &mut self.data_client,
        };
        if *current == Some(Client::Paired) {
            return;
        }
        let Some(path) = addr.as_pathname() else {
            tracing::warn!("Ignoring {:?} hello from unnamed socket", port);
            return;
        };
        *current = Some(Client::Bound(path.to_path_buf()));
        tracing::info!("Adopted client {:?} socket {}", port, path.display());

        if port == Port::Control {
            self.graph = Graph::new();
        }
    }

    async fn deliver(&mut self, targets: &[HookName], payload: Bytes) -> StatusReply {
        let mut delivered = 0;
        let mut failure = None;
        for hook in targets {
            let frame = Frame::Data {
                token: 0,
                hook: hook.clone(),
                payload: payload.clone(),
            };
            if let Err(err) = self.send_now(&frame).await {
                tracing::debug!(
                    "Delivery on {} failed after {} of {} copies: {}",
                    hook,
                    delivered,
                    targets.len(),
                    err
                );
                failure = Some(err.errno());
                break;
            }
            delivered += 1;
        }
        delivery_status(delivered, failure)
    }

    /// Non-blocking send on the data socket; a full queue is `ENOBUFS`.
    async fn send_now(&self, frame: &Frame) -> Result<()> {
        let Some(client) = &self.data_client else {
            return Err(Error::engine("deliver", EngineErrno::NotConnected));
        };
        let datagram = codec::encode(frame)?;
        match self.try_send_data(client, &datagram) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        // Writability may just not have been observed yet.
        match tokio::time::timeout(SEND_GRACE, self.data.writable()).await {
            Ok(Ok(())) => match self.try_send_data(client, &datagram) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    Err(Error::engine("deliver", EngineErrno::NoBufferSpace))
                }
                Err(e) => Err(e.into()),
            },
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(Error::engine("deliver", EngineErrno::NoBufferSpace)),
        }
    }

    fn try_send_data(&self, client: &Client, datagram: &[u8]) -> io::Result<usize> {
        match client {
            Client::Paired => self.data.try_send(datagram),
            Client::Bound(path) => self.data.try_send_to(datagram, path),
        }
    }

    async fn reply(&self, token: u32, reply: StatusReply) {
        self.send_control(Frame::Status { token, reply }).await;
    }

    async fn notify(&self, message: EngineMessage) {
        self.send_control(Frame::Message { token: 0, message })
            .await;
    }

    async fn send_control(&self, frame: Frame) {
        let Some(client) = &self.control_client else {
            tracing::warn!("No client on control socket, dropping {} frame", frame.kind());
            return;
        };
        let datagram = match codec::encode(&frame) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::error!("Encoding {} frame failed: {}", frame.kind(), e);
                return;
            }
        };
        let sent = match client {
            Client::Paired => self.control.send(&datagram).await,
            Client::Bound(path) => self.control.send_to(&datagram, path).await,
        };
        if let Err(e) = sent {
            tracing::warn!("Control send failed: {}", e);
        }
    }
}

/// Verdict on a fan-out. A frame at least one target took is accepted, with
/// the number of copies as the result; only a frame nobody took fails.
fn delivery_status(delivered: i32, failure: Option<EngineErrno>) -> StatusReply {
    match failure {
        Some(errno) if delivered == 0 => StatusReply::err(errno),
        _ => StatusReply::ok(delivered),
    }
}

/// Result code of an accepted text command: its token, clamped to stay
/// positive.
fn text_result(token: u32) -> i32 {
    i32::try_from(token).unwrap_or(i32::MAX)
}
