//! Control/data endpoint pair.
//!
//! Both channels are Unix datagram sockets. Every request travels on one of
//! them and is answered by a status reply on the control socket. Engine
//! messages that show up while a reply is awaited are kept in a backlog and
//! handed out before anything else is read from the control socket.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::time::Instant;

use crate::types::{ChannelConfig, EngineErrno, Error, HookName, NodePath, Result};
use crate::wire::codec::{self, Frame};
use crate::wire::{ControlCommand, ControlRequest, EngineMessage, StatusReply, TextRequest};

static LOCAL_DIR_SEQ: AtomicU32 = AtomicU32::new(0);

/// Engine-side ends of an in-process channel pair.
#[derive(Debug)]
pub struct EngineSockets {
    pub control: UnixDatagram,
    pub data: UnixDatagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Via {
    Control,
    Data,
}

/// Socket files bound by this process, removed on drop along with the
/// directory holding them when this process created it.
#[derive(Debug)]
pub(crate) struct BoundPaths {
    files: Vec<PathBuf>,
    dir: Option<PathBuf>,
}

impl BoundPaths {
    pub(crate) fn files(files: Vec<PathBuf>) -> Self {
        Self { files, dir: None }
    }

    fn owning_dir(mut self, dir: PathBuf) -> Self {
        self.dir = Some(dir);
        self
    }
}

impl Drop for BoundPaths {
    fn drop(&mut self) {
        for path in &self.files {
            let _ = std::fs::remove_file(path);
        }
        if let Some(dir) = &self.dir {
            if let Err(e) = std::fs::remove_dir(dir) {
                tracing::debug!("Leaving {}: {}", dir.display(), e);
            }
        }
    }
}

/// The open control and data channels of one dispatcher.
#[derive(Debug)]
pub struct Channels {
    control: UnixDatagram,
    data: UnixDatagram,
    backlog: VecDeque<EngineMessage>,
    next_token: u32,
    max_datagram: usize,
    local_dir: Option<PathBuf>,
    control_buf: Vec<u8>,
    data_buf: Vec<u8>,
    _bound: Option<BoundPaths>,
}

impl Channels {
    /// Bind local sockets and connect them to the engine's socket paths.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: &ChannelConfig) -> Result<Self> {
        let (dir, owned) = match &config.local_dir {
            Some(dir) => (dir.clone(), false),
            None => {
                let dir = std::env::temp_dir().join(format!(
                    "ngsock-{}-{}",
                    std::process::id(),
                    LOCAL_DIR_SEQ.fetch_add(1, Ordering::Relaxed)
                ));
                (dir, true)
            }
        };
        std::fs::create_dir_all(&dir)?;

        let control_path = dir.join("control.sock");
        let data_path = dir.join("data.sock");
        for path in [&control_path, &data_path] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let mut bound = BoundPaths::files(vec![control_path.clone(), data_path.clone()]);
        if owned {
            bound = bound.owning_dir(dir.clone());
        }

        let control = UnixDatagram::bind(&control_path)?;
        control.connect(&config.engine_control)?;
        let data = UnixDatagram::bind(&data_path)?;
        data.connect(&config.engine_data)?;

        tracing::info!(
            "Opened channels in {} (engine control={}, data={})",
            dir.display(),
            config.engine_control.display(),
            config.engine_data.display(),
        );
        let mut channels = Self::from_sockets(control, data, config.max_datagram_bytes, Some(bound));
        channels.local_dir = Some(dir);
        Ok(channels)
    }

    /// In-process channels; the engine side gets the returned sockets.
    pub fn pair(max_datagram: usize) -> Result<(Self, EngineSockets)> {
        let (control, engine_control) = UnixDatagram::pair()?;
        let (data, engine_data) = UnixDatagram::pair()?;
        Ok((
            Self::from_sockets(control, data, max_datagram, None),
            EngineSockets {
                control: engine_control,
                data: engine_data,
            },
        ))
    }

    fn from_sockets(
        control: UnixDatagram,
        data: UnixDatagram,
        max_datagram: usize,
        bound: Option<BoundPaths>,
    ) -> Self {
        Self {
            control,
            data,
            backlog: VecDeque::new(),
            next_token: 1,
            max_datagram,
            local_dir: None,
            control_buf: vec![0u8; max_datagram],
            data_buf: vec![0u8; max_datagram],
            _bound: bound,
        }
    }

    /// Directory holding the local socket files, if bound to the filesystem.
    pub fn local_dir(&self) -> Option<&Path> {
        self.local_dir.as_deref()
    }

    /// Tokens stay within `1..=i32::MAX` so they survive as a positive
    /// text-command result.
    fn next_token(&mut self) -> u32 {
        let token = self.next_token;
        self.next_token = if token >= i32::MAX as u32 { 1 } else { token + 1 };
        token
    }

    /// Greet the engine on both sockets so it can address replies.
    pub async fn hello(&mut self, reply_timeout: Duration) -> Result<()> {
        let token = self.next_token();
        self.transact(Via::Control, Frame::Hello { token }, reply_timeout)
            .await?
            .into_result("hello")?;
        let token = self.next_token();
        self.transact(Via::Data, Frame::Hello { token }, reply_timeout)
            .await?
            .into_result("hello")?;
        Ok(())
    }

    pub async fn send_control(
        &mut self,
        path: NodePath,
        command: &ControlCommand,
        reply_timeout: Duration,
    ) -> Result<StatusReply> {
        let request = ControlRequest::new(path, command)?;
        let token = self.next_token();
        self.transact(Via::Control, Frame::Control { token, request }, reply_timeout)
            .await
    }

    pub async fn send_text(
        &mut self,
        path: NodePath,
        text: &str,
        reply_timeout: Duration,
    ) -> Result<StatusReply> {
        let request = TextRequest {
            path,
            text: text.to_string(),
        };
        let token = self.next_token();
        self.transact(Via::Control, Frame::Text { token, request }, reply_timeout)
            .await
    }

    pub async fn send_data(
        &mut self,
        hook: &HookName,
        payload: &[u8],
        reply_timeout: Duration,
    ) -> Result<StatusReply> {
        let token = self.next_token();
        let frame = Frame::Data {
            token,
            hook: hook.clone(),
            payload: Bytes::copy_from_slice(payload),
        };
        self.transact(Via::Data, frame, reply_timeout).await
    }

    async fn transact(
        &mut self,
        via: Via,
        frame: Frame,
        reply_timeout: Duration,
    ) -> Result<StatusReply> {
        let token = frame.token();
        let datagram = codec::encode(&frame)?;
        if datagram.len() > self.max_datagram {
            return Err(Error::engine(frame.kind(), EngineErrno::MessageTooLong));
        }
        let socket = match via {
            Via::Control => &self.control,
            Via::Data => &self.data,
        };
        socket.send(&datagram).await?;
        self.await_status(token, reply_timeout).await
    }

    async fn await_status(&mut self, token: u32, reply_timeout: Duration) -> Result<StatusReply> {
        let deadline = Instant::now() + reply_timeout;
        loop {
            let len = match tokio::time::timeout_at(
                deadline,
                self.control.recv(&mut self.control_buf),
            )
            .await
            {
                Err(_elapsed) => {
                    return Err(Error::timeout(format!(
                        "no status reply for token {} within {:?}",
                        token, reply_timeout
                    )));
                }
                Ok(result) => result.map_err(Error::receive)?,
            };

            match codec::decode(&self.control_buf[..len]).map_err(Error::receive)? {
                Frame::Status { token: got, reply } if got == token => return Ok(reply),
                Frame::Status { token: got, .. } => {
                    tracing::warn!(
                        "Discarding stale status reply (token={}, awaiting {})",
                        got,
                        token
                    );
                }
                Frame::Message { message, .. } => self.backlog.push_back(message),
                other => {
                    return Err(Error::receive(format!(
                        "Unexpected {} frame on control socket",
                        other.kind()
                    )));
                }
            }
        }
    }

    /// Wait until either socket, or the message backlog, has something.
    ///
    /// Readiness can be spurious: the following `try_recv_*` calls may both
    /// come back empty.
    pub async fn readable(&self) -> Result<()> {
        if !self.backlog.is_empty() {
            return Ok(());
        }
        tokio::select! {
            ready = self.control.readable() => ready?,
            ready = self.data.readable() => ready?,
        }
        Ok(())
    }

    /// Take one engine message without blocking.
    pub fn try_recv_message(&mut self) -> Result<Option<EngineMessage>> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(Some(message));
        }
        let len = match self.control.try_recv(&mut self.control_buf) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(Error::receive(e)),
        };
        match codec::decode(&self.control_buf[..len]).map_err(Error::receive)? {
            Frame::Message { message, .. } => Ok(Some(message)),
            Frame::Status { token, .. } => {
                tracing::debug!("Discarding unsolicited status reply (token={})", token);
                Ok(None)
            }
            other => Err(Error::receive(format!(
                "Unexpected {} frame on control socket",
                other.kind()
            ))),
        }
    }

    /// Take one data frame without blocking.
    pub fn try_recv_data(&mut self) -> Result<Option<(HookName, Bytes)>> {
        let len = match self.data.try_recv(&mut self.data_buf) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(Error::receive(e)),
        };
        match codec::decode(&self.data_buf[..len]).map_err(Error::receive)? {
            Frame::Data { hook, payload, .. } => Ok(Some((hook, payload))),
            other => Err(Error::receive(format!(
                "Unexpected {} frame on data socket",
                other.kind()
            ))),
        }
    }

    /// Engine messages received while awaiting replies, not yet handed out.
    pub fn pending_messages(&self) -> usize {
        self.backlog.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::FRAME_STATUS;
    use crate::wire::GENERIC_COOKIE;

    async fn reply(engine: &UnixDatagram, frame: Frame) {
        engine.send(&codec::encode(&frame).unwrap()).await.unwrap();
    }

    async fn recv(engine: &UnixDatagram) -> Frame {
        let mut buf = vec![0u8; 4096];
        let len = engine.recv(&mut buf).await.unwrap();
        codec::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_messages_received_while_awaiting_reply_are_backlogged() {
        let (mut channels, engine) = Channels::pair(4096).unwrap();

        let peer = tokio::spawn(async move {
            let frame = recv(&engine.control).await;
            reply(
                &engine.control,
                Frame::Message {
                    token: 0,
                    message: EngineMessage {
                        path: "[1]:".to_string(),
                        cookie: GENERIC_COOKIE,
                        cmd: 0,
                        text: String::new(),
                    },
                },
            )
            .await;
            reply(
                &engine.control,
                Frame::Status {
                    token: frame.token(),
                    reply: StatusReply::ok(frame.token() as i32),
                },
            )
            .await;
            engine
        });

        let status = channels
            .send_text(NodePath::new(".").unwrap(), "ping", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status.result, 1);
        assert_eq!(channels.pending_messages(), 1);

        channels.readable().await.unwrap();
        let message = channels.try_recv_message().unwrap().unwrap();
        assert_eq!(message.path, "[1]:");
        assert!(channels.try_recv_message().unwrap().is_none());
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let (mut channels, _engine) = Channels::pair(4096).unwrap();
        let err = channels
            .send_control(
                NodePath::new(".").unwrap(),
                &ControlCommand::Shutdown,
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.errno(), EngineErrno::TimedOut);
    }

    #[tokio::test]
    async fn test_oversized_data_is_refused_locally() {
        let (mut channels, _engine) = Channels::pair(64).unwrap();
        let err = channels
            .send_data(
                &HookName::new("a").unwrap(),
                &[0u8; 128],
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.errno(), EngineErrno::MessageTooLong);
    }

    #[tokio::test]
    async fn test_stale_status_is_skipped() {
        let (mut channels, engine) = Channels::pair(4096).unwrap();
        reply(
            &engine.control,
            Frame::Status {
                token: 999,
                reply: StatusReply::ok(0),
            },
        )
        .await;
        channels.readable().await.unwrap();
        assert!(channels.try_recv_message().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_data_socket_rejects_control_frames() {
        let (mut channels, engine) = Channels::pair(4096).unwrap();
        reply(&engine.data, Frame::Hello { token: 1 }).await;
        channels.readable().await.unwrap();
        let err = channels.try_recv_data().unwrap_err();
        assert!(matches!(err, Error::Receive(_)));
        assert!(err.to_string().contains("Unexpected hello frame on data socket"));
    }

    #[tokio::test]
    async fn test_malformed_reply_is_a_receive_failure() {
        let (mut channels, engine) = Channels::pair(4096).unwrap();
        let peer = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            engine.control.recv(&mut buf).await.unwrap();
            engine.control.send(&[FRAME_STATUS, 0, 0, 0, 1, b'{']).await.unwrap();
            engine
        });

        let err = channels
            .send_text(NodePath::new(".").unwrap(), "x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Receive(_)), "got {:?}", err);
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_tokens_stay_positive_as_i32() {
        let (mut channels, _engine) = Channels::pair(64).unwrap();
        channels.next_token = i32::MAX as u32;
        assert_eq!(channels.next_token(), i32::MAX as u32);
        assert_eq!(channels.next_token(), 1);
    }

    #[tokio::test]
    async fn test_owned_local_dir_removed_on_drop() {
        let engine_dir = tempfile::tempdir().unwrap();
        let engine_control = engine_dir.path().join("control.sock");
        let engine_data = engine_dir.path().join("data.sock");
        let _control = UnixDatagram::bind(&engine_control).unwrap();
        let _data = UnixDatagram::bind(&engine_data).unwrap();

        let config = ChannelConfig {
            engine_control,
            engine_data,
            local_dir: None,
            ..ChannelConfig::default()
        };
        let channels = Channels::open(&config).unwrap();
        let dir = channels.local_dir().unwrap().to_path_buf();
        assert!(dir.join("control.sock").exists());

        drop(channels);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_caller_local_dir_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let engine_control = dir.path().join("engine-control.sock");
        let engine_data = dir.path().join("engine-data.sock");
        let _control = UnixDatagram::bind(&engine_control).unwrap();
        let _data = UnixDatagram::bind(&engine_data).unwrap();

        let local = dir.path().join("client");
        let config = ChannelConfig {
            engine_control,
            engine_data,
            local_dir: Some(local.clone()),
            ..ChannelConfig::default()
        };
        drop(Channels::open(&config).unwrap());
        assert!(local.exists());
        assert!(!local.join("control.sock").exists());
    }
}
