//! cloudtitan: runs hardware jobs on remote devices.
//!
//! Clients submit sessions (binaries plus device commands) to a [`server`],
//! which queues them and hands them to connected [`worker`]s one at a time.
//! All three talk over the `titan_comm` protocol stack.

pub mod auth;
pub mod client;
pub mod config;
pub mod executor;
pub mod logger;
pub mod queue;
pub mod server;
pub mod session;
pub mod worker;
