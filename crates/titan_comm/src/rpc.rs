//! Remote calls, property access and event forwarding over a [`Channel`].
//!
//! An endpoint uses five sub-channels of the channel it is built on:
//! `events/<name>` carries emitted events in both directions, `call`, `get`
//! and `set` carry requests whose replies travel on a per-request
//! `<op>/<uuid>` channel, and `sentinels/<uuid>` holds one marker per live
//! endpoint. The shared channel is closed once no sentinel is left.

use std::collections::HashSet;
use std::future::IntoFuture;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Notify, RwLock, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::emitter::{Emitter, Owner, Subscription, lock};
use crate::mux::{CLOSE_NORMAL, Channel, ChannelEvent, MuxError};
use crate::value::Value;

/// Path segments that are never resolved on a host.
pub const RESERVED_SEGMENTS: [&str; 3] = ["__proto__", "prototype", "constructor"];

const EVENTS: &str = "events";
const SENTINELS: &str = "sentinels";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC channel already closed")]
    AlreadyClosed,
    #[error("RPC channel closed prematurely")]
    ChannelClosedPrematurely,
    #[error("Invalid path {0}")]
    InvalidPath(String),
    #[error("Invalid property {0}")]
    Forbidden(String),
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Mux(MuxError),
}

impl From<MuxError> for RpcError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::AlreadyClosed(_) => RpcError::AlreadyClosed,
            other => RpcError::Mux(other),
        }
    }
}

/// Rejects paths that touch a reserved segment.
pub fn sanitize_path(path: &[String]) -> Result<(), RpcError> {
    if path.iter().any(|segment| RESERVED_SEGMENTS.contains(&segment.as_str())) {
        return Err(RpcError::Forbidden(format!("ipc.{}", path.join("."))));
    }
    Ok(())
}

fn parse_path(value: Option<Value>) -> Result<Vec<String>, RpcError> {
    let items = value
        .as_ref()
        .and_then(Value::to_vec)
        .ok_or_else(|| RpcError::InvalidPath(format!("{value:?}")))?;
    let path = items
        .iter()
        .map(|item| item.as_str().map(str::to_owned))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| RpcError::InvalidPath(format!("{items:?}")))?;
    sanitize_path(&path)?;
    Ok(path)
}

fn path_value(path: &[String]) -> Value {
    Value::seq(path.iter().map(|segment| Value::from(segment.as_str())).collect())
}

pub type EventSink = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// The object a host exposes. Paths arrive sanitized; anything a target does
/// not recognise should be reported as an error.
#[async_trait]
pub trait RpcTarget: Send + Sync + 'static {
    async fn call(&self, path: &[String], args: Vec<Value>) -> anyhow::Result<Value>;

    async fn get(&self, path: &[String]) -> anyhow::Result<Value> {
        anyhow::bail!("Cannot read ipc.{}", path.join("."))
    }

    async fn set(&self, path: &[String], _value: Value) -> anyhow::Result<()> {
        anyhow::bail!("Cannot assign ipc.{}", path.join("."))
    }

    /// Called once per event name the first time a peer listens for it.
    fn subscribe(&self, _event: &str, _sink: EventSink) -> Option<Subscription> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcEvent {
    pub name: String,
    pub args: Vec<Value>,
}

/// Lifecycle shared by hosts and clients.
pub struct RpcEndpoint {
    channel: Channel,
    events: Channel,
    sentinel: Channel,
    lock: Arc<RwLock<()>>,
    closing: AtomicBool,
    local: Emitter<RpcEvent>,
    wired: Mutex<HashSet<String>>,
    owner: Owner,
}

impl RpcEndpoint {
    fn open(channel: Channel) -> Result<Arc<Self>, RpcError> {
        let events = channel.channel(EVENTS)?;
        let sentinels = channel.channel(SENTINELS)?;
        let sentinel = sentinels.channel(&Uuid::new_v4().to_string())?;
        let endpoint = Arc::new(Self {
            channel: channel.clone(),
            events: events.clone(),
            sentinel,
            lock: Arc::new(RwLock::new(())),
            closing: AtomicBool::new(false),
            local: Emitter::new(),
            wired: Mutex::new(HashSet::new()),
            owner: Owner::new(),
        });

        let weak = Arc::downgrade(&endpoint);
        endpoint.owner.own(events.on(move |event| {
            if let (ChannelEvent::Channel(child), Some(endpoint)) = (event, weak.upgrade()) {
                endpoint.wire(child);
            }
        })?);
        for child in events.channels() {
            endpoint.wire(&child);
        }

        let local = endpoint.local.clone();
        endpoint.owner.own(channel.on(move |event| {
            if let ChannelEvent::Close(_) = event {
                local.clear();
            }
        })?);

        watch_sentinels(channel, sentinels)?;
        Ok(endpoint)
    }

    /// Republishes messages on an `events/<name>` channel as local events.
    fn wire(&self, child: &Channel) {
        let name = child.name().to_string();
        if !lock(&self.wired).insert(name.clone()) {
            return;
        }
        let local = self.local.clone();
        if let Ok(subscription) = child.on_message(move |args| {
            local.emit(&RpcEvent {
                name: name.clone(),
                args: args.to_vec(),
            });
        }) {
            self.owner.own(subscription);
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Close has been requested but the channel is still open.
    pub fn is_closing(&self) -> bool {
        !self.is_closed() && self.closing.load(Ordering::SeqCst)
    }

    /// Listens for `name`, announcing interest to the peer.
    pub fn on<F>(&self, name: &str, handler: F) -> Result<Subscription, RpcError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let child = self.events.channel(name)?;
        self.wire(&child);
        let name = name.to_string();
        Ok(self.local.on(move |event| {
            if event.name == name {
                handler(&event.args);
            }
        }))
    }

    /// Sends an event to the peer and delivers it to local listeners.
    pub fn emit(&self, name: &str, args: Vec<Value>) {
        if !self.is_closed() {
            if let Err(err) = self.events.channel(name).and_then(|child| child.send(args.clone())) {
                debug!(event = name, error = %err, "event not forwarded");
            }
        }
        self.local.emit(&RpcEvent {
            name: name.to_string(),
            args,
        });
    }

    /// Withdraws this endpoint's sentinel once in-flight requests finish and
    /// waits for the shared channel to close. With `kill_after`, the channel
    /// is closed outright when the other endpoints take longer than that.
    pub async fn close(&self, kill_after: Option<Duration>) {
        if self.is_closed() {
            return;
        }
        if !self.closing.swap(true, Ordering::SeqCst) {
            let lock = Arc::clone(&self.lock);
            let sentinel = self.sentinel.clone();
            tokio::spawn(async move {
                let _exclusive = lock.write().await;
                let _ = sentinel.close(CLOSE_NORMAL, "");
            });
        }
        if let Some(grace) = kill_after {
            let channel = self.channel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(grace) => {
                        if !channel.is_closed() {
                            warn!(path = ?channel.path(), "peer endpoints did not close in time, killing channel");
                            let _ = channel.close(CLOSE_NORMAL, "killed");
                        }
                    }
                    _ = channel.closed() => {}
                }
            });
        }
        self.channel.closed().await;
    }

    /// Closes the shared channel without waiting for the other endpoints.
    pub fn kill(&self) {
        let _ = self.channel.close(CLOSE_NORMAL, "killed");
    }

    pub async fn closed(&self) {
        self.channel.closed().await;
    }
}

/// Closes `channel` once the last child of `sentinels` is gone.
fn watch_sentinels(channel: Channel, sentinels: Channel) -> Result<(), RpcError> {
    let notify = Arc::new(Notify::new());
    let watch_one = {
        let notify = Arc::clone(&notify);
        move |sentinel: &Channel| {
            let wake = Arc::clone(&notify);
            let watched = sentinel.on(move |event| {
                if let ChannelEvent::Close(_) = event {
                    wake.notify_one();
                }
            });
            if watched.is_err() {
                notify.notify_one();
            }
        }
    };

    // register before the snapshot so a sentinel opened in between is not missed
    let _ = sentinels.on({
        let watch_one = watch_one.clone();
        move |event| {
            if let ChannelEvent::Channel(sentinel) = event {
                watch_one(sentinel);
            }
        }
    })?;
    for sentinel in sentinels.channels() {
        watch_one(&sentinel);
    }

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    if sentinels.channels().is_empty() {
                        debug!(path = ?channel.path(), "last sentinel gone, closing channel");
                        let _ = channel.close(CLOSE_NORMAL, "");
                        break;
                    }
                }
                _ = channel.closed() => break,
            }
        }
    });
    Ok(())
}

// -----------------------------------------------------------------------------
// Host
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Call,
    Get,
    Set,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Call => "call",
            Op::Get => "get",
            Op::Set => "set",
        }
    }
}

/// Serves an [`RpcTarget`] to the peer.
#[derive(Clone)]
pub struct RpcHost {
    endpoint: Arc<RpcEndpoint>,
}

impl RpcHost {
    pub fn new(channel: Channel, target: Arc<dyn RpcTarget>) -> Result<Self, RpcError> {
        let endpoint = RpcEndpoint::open(channel.clone())?;

        for op in [Op::Call, Op::Get, Op::Set] {
            let base = channel.channel(op.name())?;
            let weak = Arc::downgrade(&endpoint);
            let target = Arc::clone(&target);
            let requests = base.clone();
            endpoint.owner.own(base.on_message(move |args| {
                if let Some(endpoint) = weak.upgrade() {
                    tokio::spawn(serve(
                        endpoint,
                        requests.clone(),
                        Arc::clone(&target),
                        op,
                        args.to_vec(),
                    ));
                }
            })?);
        }

        let forwarded = Arc::new(Mutex::new(HashSet::new()));
        let forward = {
            let weak = Arc::downgrade(&endpoint);
            move |child: &Channel| {
                if let Some(endpoint) = weak.upgrade() {
                    forward_target_event(&endpoint, &target, &forwarded, child.name());
                }
            }
        };
        endpoint.owner.own(endpoint.events.on({
            let forward = forward.clone();
            move |event| {
                if let ChannelEvent::Channel(child) = event {
                    forward(child);
                }
            }
        })?);
        for child in endpoint.events.channels() {
            forward(&child);
        }

        Ok(Self { endpoint })
    }
}

impl Deref for RpcHost {
    type Target = RpcEndpoint;

    fn deref(&self) -> &RpcEndpoint {
        &self.endpoint
    }
}

fn forward_target_event(
    endpoint: &Arc<RpcEndpoint>,
    target: &Arc<dyn RpcTarget>,
    forwarded: &Mutex<HashSet<String>>,
    name: &str,
) {
    if !lock(forwarded).insert(name.to_string()) {
        return;
    }
    let weak: Weak<RpcEndpoint> = Arc::downgrade(endpoint);
    let event = name.to_string();
    let sink: EventSink = Arc::new(move |args| {
        if let Some(endpoint) = weak.upgrade() {
            endpoint.emit(&event, args);
        }
    });
    if let Some(subscription) = target.subscribe(name, sink) {
        endpoint.owner.own(subscription);
    }
}

async fn serve(
    endpoint: Arc<RpcEndpoint>,
    requests: Channel,
    target: Arc<dyn RpcTarget>,
    op: Op,
    args: Vec<Value>,
) {
    let _shared = Arc::clone(&endpoint.lock).read_owned().await;
    if endpoint.is_closed() {
        return;
    }
    let mut args = args.into_iter();
    let Some(id) = args.next().and_then(|id| id.as_str().map(str::to_owned)) else {
        warn!(op = op.name(), "request without an id");
        return;
    };
    let Ok(reply) = requests.channel(&id) else {
        return;
    };

    let outcome = match parse_path(args.next()) {
        Err(err) => Err(err.to_string()),
        Ok(path) => match op {
            Op::Call => target.call(&path, args.collect()).await.map_err(|e| e.to_string()),
            Op::Get => target.get(&path).await.map_err(|e| e.to_string()),
            Op::Set if path.is_empty() => Err("Invalid set target".to_string()),
            Op::Set => target
                .set(&path, args.next().unwrap_or(Value::Undefined))
                .await
                .map(|()| Value::Undefined)
                .map_err(|e| e.to_string()),
        },
    };

    let message = match outcome {
        Ok(value) => vec![Value::from("ok"), value],
        Err(message) => {
            debug!(op = op.name(), error = %message, "request failed");
            vec![Value::from("error"), Value::from(message)]
        }
    };
    let _ = reply.send(message);
    let _ = reply.close(CLOSE_NORMAL, "");
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

/// Drives a remote [`RpcHost`].
#[derive(Clone)]
pub struct RpcClient {
    endpoint: Arc<RpcEndpoint>,
    call: Channel,
    get: Channel,
    set: Channel,
}

impl RpcClient {
    pub fn new(channel: Channel) -> Result<Self, RpcError> {
        let endpoint = RpcEndpoint::open(channel.clone())?;
        Ok(Self {
            call: channel.channel(Op::Call.name())?,
            get: channel.channel(Op::Get.name())?,
            set: channel.channel(Op::Set.name())?,
            endpoint,
        })
    }

    pub async fn call(&self, path: &[&str], args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_path(&owned(path), args).await
    }

    pub async fn get(&self, path: &[&str]) -> Result<Value, RpcError> {
        self.get_path(&owned(path)).await
    }

    pub async fn set(&self, path: &[&str], value: Value) -> Result<(), RpcError> {
        self.set_path(&owned(path), value).await
    }

    /// A remote member view rooted at `segment`.
    pub fn at(&self, segment: &str) -> RemotePath {
        RemotePath {
            client: self.clone(),
            path: vec![segment.to_string()],
        }
    }

    async fn call_path(&self, path: &[String], args: Vec<Value>) -> Result<Value, RpcError> {
        let mut frame = Vec::with_capacity(args.len() + 1);
        frame.push(path_value(path));
        frame.extend(args);
        self.request(&self.call, frame).await
    }

    async fn get_path(&self, path: &[String]) -> Result<Value, RpcError> {
        self.request(&self.get, vec![path_value(path)]).await
    }

    async fn set_path(&self, path: &[String], value: Value) -> Result<(), RpcError> {
        self.request(&self.set, vec![path_value(path), value]).await.map(|_| ())
    }

    async fn request(&self, base: &Channel, args: Vec<Value>) -> Result<Value, RpcError> {
        let _shared = Arc::clone(&self.endpoint.lock).read_owned().await;
        if self.endpoint.is_closed() {
            return Err(RpcError::AlreadyClosed);
        }
        let id = Uuid::new_v4().to_string();
        let reply = base.channel(&id)?;

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _reply = reply.on(move |event| {
            let settled = match event {
                ChannelEvent::Message(args) => settle(args),
                ChannelEvent::Close(_) => Err(RpcError::ChannelClosedPrematurely),
                ChannelEvent::Channel(_) => return,
            };
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(settled);
            }
        })?;

        let mut frame = Vec::with_capacity(args.len() + 1);
        frame.push(Value::from(id));
        frame.extend(args);
        base.send(frame)?;
        rx.await.unwrap_or(Err(RpcError::ChannelClosedPrematurely))
    }
}

fn settle(reply: &[Value]) -> Result<Value, RpcError> {
    match reply {
        [status, value, ..] if status.as_str() == Some("ok") => Ok(value.clone()),
        [status] if status.as_str() == Some("ok") => Ok(Value::Undefined),
        [_, message, ..] => Err(RpcError::Remote(
            message.as_str().unwrap_or("unknown error").to_string(),
        )),
        _ => Err(RpcError::Remote("malformed reply".to_string())),
    }
}

fn owned(path: &[&str]) -> Vec<String> {
    path.iter().map(|segment| segment.to_string()).collect()
}

impl Deref for RpcClient {
    type Target = RpcEndpoint;

    fn deref(&self) -> &RpcEndpoint {
        &self.endpoint
    }
}

/// Member access on the remote target. Awaiting it reads the value.
#[derive(Clone)]
pub struct RemotePath {
    client: RpcClient,
    path: Vec<String>,
}

impl RemotePath {
    pub fn at(mut self, segment: &str) -> Self {
        self.path.push(segment.to_string());
        self
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        self.client.call_path(&self.path, args).await
    }

    pub async fn set(&self, value: Value) -> Result<(), RpcError> {
        self.client.set_path(&self.path, value).await
    }
}

impl IntoFuture for RemotePath {
    type Output = Result<Value, RpcError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.client.get_path(&self.path).await })
    }
}
