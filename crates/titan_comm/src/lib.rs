//! Protocol stack shared by the cloudtitan server, its device workers and the
//! command line client.
//!
//! Layers, leaf first: [`value`] and [`codec`] for the byte format, [`mux`] for
//! named sub-channels over one duplex connection, [`ws`] to carry it over a
//! WebSocket, [`rpc`] for remote calls and event forwarding on top of a channel.

pub mod codec;
pub mod emitter;
pub mod mux;
pub mod rpc;
pub mod value;
pub mod watchdog;
pub mod ws;

pub use codec::{CodecError, decode, encode};
pub use emitter::{Emitter, Owner, Subscription};
pub use mux::{Channel, ChannelEvent, CloseFrame, ConnectOptions, Connection, MuxError};
pub use rpc::{EventSink, RemotePath, RpcClient, RpcEndpoint, RpcError, RpcEvent, RpcHost, RpcTarget};
pub use value::{BufferKind, Shared, TypedBuffer, Value};
pub use watchdog::{Watchdog, WatchdogStatus};
pub use ws::Handshake;
