//! Named, nested, bidirectional sub-channels over one duplex message connection.
//!
//! Every frame on the wire is one encoded sequence whose first element is the
//! operation: `message`, `open-channel(name)`, `close-channel(name, code,
//! reason)` or `channel(name, ...frame)`. A routed frame carries a complete
//! frame for the named child, so channels nest to any depth.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::codec::{self, CodecError};
use crate::emitter::{Emitter, Subscription, lock};
use crate::value::Value;
use crate::watchdog::Watchdog;

pub const OP_MESSAGE: &str = "message";
pub const OP_OPEN: &str = "open-channel";
pub const OP_CLOSE: &str = "close-channel";
pub const OP_ROUTE: &str = "channel";

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_UNAUTHORIZED: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// The peer stayed silent for a full liveness window.
pub const CLOSE_TIMEOUT: u16 = 4000;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Transport-level unit exchanged with the physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("`{0}` is already closed")]
    AlreadyClosed(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Both directions of a physical connection as frame queues.
pub struct Wire {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Wire {
    /// Two ends of an in-memory connection.
    pub fn pair() -> (Wire, Wire) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        (
            Wire {
                outbound: left_tx,
                inbound: right_rx,
            },
            Wire {
                outbound: right_tx,
                inbound: left_rx,
            },
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Silence after which the peer is considered dead. Pings go out after half of it.
    pub timeout: Duration,
    /// Bearer token sent in the `Auth-Token` header when dialing.
    pub auth_token: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            auth_token: None,
        }
    }
}

impl ConnectOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A plain message addressed to this channel.
    Message(Vec<Value>),
    /// A sub-channel was opened, locally or by the peer.
    Channel(Channel),
    Close(CloseFrame),
}

struct Node {
    name: String,
    path: Vec<String>,
    parent: Option<Weak<Node>>,
    outbound: mpsc::UnboundedSender<Frame>,
    state: Mutex<NodeState>,
    events: Emitter<ChannelEvent>,
    closed: watch::Sender<Option<CloseFrame>>,
}

struct NodeState {
    open: bool,
    children: BTreeMap<String, Channel>,
}

/// One end of a named virtual duplex. The root channel of a connection has an
/// empty name and path.
#[derive(Clone)]
pub struct Channel {
    node: Arc<Node>,
}

impl Channel {
    fn build(
        name: String,
        path: Vec<String>,
        parent: Option<Weak<Node>>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            node: Arc::new(Node {
                name,
                path,
                parent,
                outbound,
                state: Mutex::new(NodeState {
                    open: true,
                    children: BTreeMap::new(),
                }),
                events: Emitter::new(),
                closed,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn path(&self) -> &[String] {
        &self.node.path
    }

    pub fn is_closed(&self) -> bool {
        !lock(&self.node.state).open
    }

    pub fn close_frame(&self) -> Option<CloseFrame> {
        self.node.closed.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Live sub-channels, ordered by name.
    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.node.state).children.values().cloned().collect()
    }

    pub fn child(&self, name: &str) -> Option<Channel> {
        lock(&self.node.state).children.get(name).cloned()
    }

    /// Sends a plain message to the peer's mirror of this channel.
    pub fn send(&self, args: Vec<Value>) -> Result<(), MuxError> {
        self.ensure_open()?;
        let mut frame = Vec::with_capacity(args.len() + 1);
        frame.push(Value::from(OP_MESSAGE));
        frame.extend(args);
        self.transmit(frame)
    }

    /// Returns the live sub-channel called `name`, opening and announcing it
    /// on first use.
    pub fn channel(&self, name: &str) -> Result<Channel, MuxError> {
        self.materialize(name, true)
    }

    pub fn on<F>(&self, handler: F) -> Result<Subscription, MuxError>
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        Ok(self.node.events.on(handler))
    }

    pub fn on_message<F>(&self, handler: F) -> Result<Subscription, MuxError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.on(move |event| {
            if let ChannelEvent::Message(args) = event {
                handler(args);
            }
        })
    }

    /// Closes this channel and, recursively, everything below it.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), MuxError> {
        self.ensure_open()?;
        let frame = CloseFrame::new(code, reason);
        match &self.node.parent {
            None => {
                let _ = self.node.outbound.send(Frame::Close(Some(frame.clone())));
            }
            Some(parent) => {
                if let Some(parent) = parent.upgrade() {
                    let parent = Channel { node: parent };
                    let _ = parent.transmit(vec![
                        Value::from(OP_CLOSE),
                        Value::from(self.name()),
                        Value::Int(i32::from(code)),
                        Value::from(reason),
                    ]);
                    parent.forget(self);
                }
            }
        }
        self.shut(frame);
        Ok(())
    }

    /// Resolves with the close frame once this channel is closed.
    pub async fn closed(&self) -> CloseFrame {
        let mut rx = self.node.closed.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(frame) = current {
                return frame;
            }
            if rx.changed().await.is_err() {
                return CloseFrame::new(CLOSE_ABNORMAL, "channel dropped");
            }
        }
    }

    fn describe(&self) -> String {
        if self.node.path.is_empty() {
            "connection".to_string()
        } else {
            format!("channel {}", self.node.path.join("/"))
        }
    }

    fn ensure_open(&self) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::AlreadyClosed(self.describe()));
        }
        Ok(())
    }

    fn transmit(&self, mut frame: Vec<Value>) -> Result<(), MuxError> {
        for name in self.node.path.iter().rev() {
            let mut routed = Vec::with_capacity(frame.len() + 2);
            routed.push(Value::from(OP_ROUTE));
            routed.push(Value::from(name.as_str()));
            routed.extend(frame);
            frame = routed;
        }
        let bytes = codec::encode(&Value::seq(frame));
        self.node
            .outbound
            .send(Frame::Binary(bytes))
            .map_err(|_| MuxError::AlreadyClosed(self.describe()))
    }

    fn materialize(&self, name: &str, announce: bool) -> Result<Channel, MuxError> {
        let created = {
            let mut state = lock(&self.node.state);
            if !state.open {
                return Err(MuxError::AlreadyClosed(self.describe()));
            }
            if let Some(existing) = state.children.get(name) {
                return Ok(existing.clone());
            }
            let mut path = self.node.path.clone();
            path.push(name.to_string());
            let child = Channel::build(
                name.to_string(),
                path,
                Some(Arc::downgrade(&self.node)),
                self.node.outbound.clone(),
            );
            state.children.insert(name.to_string(), child.clone());
            child
        };
        if announce {
            self.transmit(vec![Value::from(OP_OPEN), Value::from(name)])?;
        }
        self.node.events.emit(&ChannelEvent::Channel(created.clone()));
        Ok(created)
    }

    fn forget(&self, child: &Channel) {
        let mut state = lock(&self.node.state);
        if state
            .children
            .get(child.name())
            .is_some_and(|existing| existing.ptr_eq(child))
        {
            state.children.remove(child.name());
        }
    }

    /// Marks this subtree closed locally without telling the peer.
    fn shut(&self, frame: CloseFrame) {
        let children = {
            let mut state = lock(&self.node.state);
            if !state.open {
                return;
            }
            state.open = false;
            std::mem::take(&mut state.children)
        };
        for child in children.into_values() {
            child.shut(frame.clone());
        }
        self.node.closed.send_replace(Some(frame.clone()));
        self.node.events.emit(&ChannelEvent::Close(frame));
        self.node.events.clear();
    }

    fn receive(&self, bytes: &[u8]) -> Result<(), MuxError> {
        let value = codec::decode(bytes)?;
        let frame = value.to_vec().ok_or_else(|| {
            MuxError::Protocol(format!("frame is a {}, expected a sequence", value.kind()))
        })?;
        self.dispatch(frame)
    }

    fn dispatch(&self, frame: Vec<Value>) -> Result<(), MuxError> {
        let mut parts = frame.into_iter();
        let op = parts
            .next()
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| MuxError::Protocol("frame without an operation".to_string()))?;
        match op.as_str() {
            OP_MESSAGE => {
                if !self.is_closed() {
                    self.node.events.emit(&ChannelEvent::Message(parts.collect()));
                }
                Ok(())
            }
            OP_OPEN => {
                let name = channel_name(parts.next())?;
                if !self.is_closed() {
                    self.materialize(&name, false)?;
                }
                Ok(())
            }
            OP_CLOSE => {
                let name = channel_name(parts.next())?;
                let code = parts
                    .next()
                    .and_then(|v| v.as_i32())
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(CLOSE_NO_STATUS);
                let reason = parts
                    .next()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                if let Some(child) = self.child(&name) {
                    self.forget(&child);
                    child.shut(CloseFrame { code, reason });
                }
                Ok(())
            }
            OP_ROUTE => {
                let name = channel_name(parts.next())?;
                let inner: Vec<Value> = parts.collect();
                let target = match self.child(&name) {
                    Some(child) => child,
                    // nothing to close on a channel this side never saw
                    None if inner.first().and_then(Value::as_str) == Some(OP_CLOSE) => return Ok(()),
                    None if self.is_closed() => return Ok(()),
                    None => self.materialize(&name, false)?,
                };
                target.dispatch(inner)
            }
            other => Err(MuxError::Protocol(format!("unknown operation `{other}`"))),
        }
    }
}

fn channel_name(value: Option<Value>) -> Result<String, MuxError> {
    value
        .and_then(|v| v.as_str().map(str::to_owned))
        .ok_or_else(|| MuxError::Protocol("missing channel name".to_string()))
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("path", &self.node.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A physical connection with its root channel. Derefs to the root.
#[derive(Clone, Debug)]
pub struct Connection {
    root: Channel,
    ready: Arc<watch::Sender<bool>>,
}

impl Connection {
    /// Starts multiplexing over `wire`. Must be called inside a tokio runtime.
    pub fn attach(wire: Wire, options: &ConnectOptions) -> Self {
        let conn = Self::attach_paused(wire, options);
        conn.resume();
        conn
    }

    /// Like [`Connection::attach`], but inbound frames wait until
    /// [`Connection::resume`] so handlers can be installed first.
    pub fn attach_paused(wire: Wire, options: &ConnectOptions) -> Self {
        let root = Channel::build(String::new(), Vec::new(), None, wire.outbound);
        let (ready, waiting) = watch::channel(false);
        tokio::spawn(pump(root.clone(), wire.inbound, options.timeout, waiting));
        Self {
            root,
            ready: Arc::new(ready),
        }
    }

    /// Starts delivering inbound frames. Idempotent.
    pub fn resume(&self) {
        self.ready.send_replace(true);
    }

    /// Two connected in-memory endpoints.
    pub fn pair(options: &ConnectOptions) -> (Connection, Connection) {
        let (left, right) = Wire::pair();
        (Self::attach(left, options), Self::attach(right, options))
    }

    /// Like [`Connection::pair`], but the second end starts paused.
    pub fn pair_paused(options: &ConnectOptions) -> (Connection, Connection) {
        let (left, right) = Wire::pair();
        (Self::attach(left, options), Self::attach_paused(right, options))
    }

    pub fn root(&self) -> &Channel {
        &self.root
    }
}

impl Deref for Connection {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.root
    }
}

/// Reads inbound frames until either side closes, running the liveness
/// watchdogs alongside.
async fn pump(
    root: Channel,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    timeout: Duration,
    mut ready: watch::Receiver<bool>,
) {
    // a dropped sender means every handle is gone; drain and close as usual
    let _ = ready.wait_for(|ready| *ready).await;

    let activity = Watchdog::new(timeout / 2);
    let termination = Watchdog::new(timeout);
    activity.tick();
    termination.tick();

    let remote = loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else {
                    break Some(CloseFrame::new(CLOSE_ABNORMAL, "connection lost"));
                };
                activity.tick();
                termination.tick();
                match frame {
                    Frame::Binary(bytes) => {
                        if let Err(err) = root.receive(&bytes) {
                            warn!(error = %err, "closing connection after a bad frame");
                            let _ = root.close(CLOSE_PROTOCOL_ERROR, &err.to_string());
                            break None;
                        }
                    }
                    Frame::Ping(payload) => {
                        let _ = root.node.outbound.send(Frame::Pong(payload));
                    }
                    Frame::Pong(_) => {}
                    Frame::Close(frame) => {
                        break Some(frame.unwrap_or_else(|| CloseFrame::new(CLOSE_NO_STATUS, "")));
                    }
                }
            }
            _ = activity.alerted() => {
                let _ = root.node.outbound.send(Frame::Ping(Vec::new()));
                activity.tick();
            }
            _ = termination.alerted() => {
                warn!(timeout_ms = timeout.as_millis() as u64, "peer went silent, closing connection");
                let _ = root.close(CLOSE_TIMEOUT, "Connection timed out");
                break None;
            }
            _ = root.closed() => break None,
        }
    };

    activity.stop();
    termination.stop();
    if let Some(frame) = remote {
        debug!(code = frame.code, reason = %frame.reason, "connection closed by peer");
        // echo so the transport writer can finish
        let _ = root.node.outbound.send(Frame::Close(Some(frame.clone())));
        root.shut(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn decode_frame(frame: Frame) -> Vec<Value> {
        match frame {
            Frame::Binary(bytes) => codec::decode(&bytes).unwrap().to_vec().unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    /// Forwards every message of every channel the peer opens, tagged with its path.
    fn record_messages(conn: &Channel) -> mpsc::UnboundedReceiver<(Vec<String>, Vec<Value>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        fn watch(channel: &Channel, tx: mpsc::UnboundedSender<(Vec<String>, Vec<Value>)>) {
            let path = channel.path().to_vec();
            let _ = channel.on(move |event| match event {
                ChannelEvent::Message(args) => {
                    let _ = tx.send((path.clone(), args.clone()));
                }
                ChannelEvent::Channel(child) => watch(child, tx.clone()),
                ChannelEvent::Close(_) => {}
            });
        }
        watch(conn, tx);
        rx
    }

    #[tokio::test]
    async fn test_channel_is_idempotent_and_announced_once() {
        let (wire, mut peer) = Wire::pair();
        let conn = Connection::attach(wire, &ConnectOptions::default());

        let first = conn.channel("jobs").unwrap();
        let second = conn.channel("jobs").unwrap();
        assert!(first.ptr_eq(&second));

        let frame = decode_frame(peer.inbound.recv().await.unwrap());
        assert_eq!(frame, vec![Value::from(OP_OPEN), Value::from("jobs")]);
        assert!(peer.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_nested_frames_are_routed() {
        let (wire, mut peer) = Wire::pair();
        let conn = Connection::attach(wire, &ConnectOptions::default());
        let inner = conn.channel("a").unwrap().channel("b").unwrap();
        inner.send(vec![Value::from(7)]).unwrap();

        let _open_a = peer.inbound.recv().await.unwrap();
        let open_b = decode_frame(peer.inbound.recv().await.unwrap());
        assert_eq!(
            open_b,
            vec![Value::from(OP_ROUTE), Value::from("a"), Value::from(OP_OPEN), Value::from("b")]
        );
        let message = decode_frame(peer.inbound.recv().await.unwrap());
        assert_eq!(
            message,
            vec![
                Value::from(OP_ROUTE),
                Value::from("a"),
                Value::from(OP_ROUTE),
                Value::from("b"),
                Value::from(OP_MESSAGE),
                Value::from(7),
            ]
        );
    }

    #[tokio::test]
    async fn test_peer_materializes_shadow_channels() {
        let (left, right) = Connection::pair(&ConnectOptions::default());
        let mut seen = record_messages(&right);

        left.send(vec![Value::from("top")]).unwrap();
        left.channel("x").unwrap().channel("y").unwrap().send(vec![Value::from(1)]).unwrap();

        let (path, args) = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        assert!(path.is_empty());
        assert_eq!(args, vec![Value::from("top")]);

        let (path, args) = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        assert_eq!(path, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(args, vec![Value::from(1)]);
        assert!(right.child("x").unwrap().child("y").is_some());
    }

    #[tokio::test]
    async fn test_routed_message_without_open_creates_the_channel() {
        let (wire, peer) = Wire::pair();
        let conn = Connection::attach(wire, &ConnectOptions::default());
        let mut seen = record_messages(&conn);

        let frame = Value::seq(vec![
            Value::from(OP_ROUTE),
            Value::from("late"),
            Value::from(OP_MESSAGE),
            Value::from("hi"),
        ]);
        peer.outbound.send(Frame::Binary(codec::encode(&frame))).unwrap();

        let (path, args) = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        assert_eq!(path, vec!["late".to_string()]);
        assert_eq!(args, vec![Value::from("hi")]);
    }

    #[tokio::test]
    async fn test_child_close_reaches_the_peer() {
        let (left, right) = Connection::pair(&ConnectOptions::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = right
            .on(move |event| {
                if let ChannelEvent::Channel(child) = event {
                    let tx = tx.clone();
                    let _ = child.on(move |event| {
                        if let ChannelEvent::Close(frame) = event {
                            let _ = tx.send(frame.clone());
                        }
                    });
                }
            })
            .unwrap();

        let child = left.channel("session").unwrap();
        child.close(4001, "bye").unwrap();
        assert!(child.is_closed());
        assert!(left.child("session").is_none());
        assert!(matches!(child.send(vec![]), Err(MuxError::AlreadyClosed(_))));

        let frame = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame, CloseFrame::new(4001, "bye"));
        assert!(right.child("session").is_none());
        assert!(!right.is_closed());
    }

    #[tokio::test]
    async fn test_connection_close_propagates_to_children() {
        let (left, right) = Connection::pair(&ConnectOptions::default());
        let child = left.channel("a").unwrap();
        let grandchild = child.channel("b").unwrap();

        left.close(CLOSE_NORMAL, "done").unwrap();
        assert!(child.is_closed());
        assert!(grandchild.is_closed());
        assert!(matches!(left.channel("c"), Err(MuxError::AlreadyClosed(_))));
        assert!(matches!(left.close(CLOSE_NORMAL, ""), Err(MuxError::AlreadyClosed(_))));

        let frame = timeout(WAIT, right.closed()).await.unwrap();
        assert_eq!(frame, CloseFrame::new(CLOSE_NORMAL, "done"));
    }

    #[tokio::test]
    async fn test_garbage_closes_with_protocol_error() {
        let (wire, peer) = Wire::pair();
        let conn = Connection::attach(wire, &ConnectOptions::default());
        peer.outbound.send(Frame::Binary(b"a\x01?".to_vec())).unwrap();
        let frame = timeout(WAIT, conn.closed()).await.unwrap();
        assert_eq!(frame.code, CLOSE_PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (wire, mut peer) = Wire::pair();
        let options = ConnectOptions::default().with_timeout(Duration::from_millis(200));
        let conn = Connection::attach(wire, &options);

        let frame = timeout(WAIT, conn.closed()).await.unwrap();
        assert_eq!(frame.code, CLOSE_TIMEOUT);

        let mut pinged = false;
        while let Ok(frame) = peer.inbound.try_recv() {
            pinged |= matches!(frame, Frame::Ping(_));
        }
        assert!(pinged);
    }

    #[tokio::test]
    async fn test_pongs_keep_an_idle_connection_alive() {
        let (wire, mut peer) = Wire::pair();
        let options = ConnectOptions::default().with_timeout(Duration::from_millis(200));
        let conn = Connection::attach(wire, &options);

        let responder = tokio::spawn(async move {
            while let Some(frame) = peer.inbound.recv().await {
                if let Frame::Ping(payload) = frame {
                    let _ = peer.outbound.send(Frame::Pong(payload));
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!conn.is_closed());
        conn.close(CLOSE_NORMAL, "").unwrap();
        responder.abort();
    }

    #[tokio::test]
    async fn test_paused_connection_holds_frames_until_resumed() {
        let (client, server) = Connection::pair_paused(&ConnectOptions::default());
        client.send(vec![Value::from("early")]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .on_message(move |args| {
                let _ = tx.send(args.to_vec());
            })
            .unwrap();
        server.resume();
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), vec![Value::from("early")]);
    }
}
