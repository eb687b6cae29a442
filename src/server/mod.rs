//! The orchestration server: authenticates sockets and routes them to the
//! worker link, the client API or a session watch stream.

pub mod client_api;
pub mod registry;
pub mod worker_link;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use titan_comm::mux::{CLOSE_PROTOCOL_ERROR, CLOSE_UNAUTHORIZED};
use titan_comm::ws::{self, Handshake};
use titan_comm::{ConnectOptions, Connection};

use crate::auth::{Authenticator, StaticTokens};
use crate::config::ServerConfig;
use crate::session::store::FileSessionStore;
use crate::session::{Healthcheck, ManagerOptions, SessionManager};
use crate::worker::WORKER_PATH;
use client_api::{CLIENT_PATH, ClientApi, SESSION_PATH_PREFIX, serve_client, stream_session};
use registry::WorkerRegistry;
use worker_link::WorkerLink;

pub struct Server {
    config: ServerConfig,
    manager: Arc<SessionManager>,
    registry: WorkerRegistry,
    clients: Arc<dyn Authenticator>,
    workers: Arc<dyn Authenticator>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        manager: Arc<SessionManager>,
        clients: Arc<dyn Authenticator>,
        workers: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            registry: WorkerRegistry::new(),
            clients,
            workers,
        })
    }

    /// Opens the state directory, loads the health check and re-queues
    /// sessions a previous run left unfinished.
    pub async fn bootstrap(config: ServerConfig) -> Result<Arc<Self>> {
        let store = FileSessionStore::open(&config.state_dir)
            .await
            .with_context(|| format!("opening state directory {}", config.state_dir.display()))?;
        let healthcheck = Healthcheck::load(&config.healthcheck_binaries).await?;
        let manager = SessionManager::new(
            store,
            ManagerOptions {
                default_timeout: config.session_timeout,
                finished_ttl: config.finished_ttl,
                healthcheck,
            },
        );
        manager.restore().await.context("restoring sessions")?;
        let clients = Arc::new(StaticTokens::new(config.client_tokens.clone()));
        let workers = Arc::new(StaticTokens::new(config.worker_tokens.clone()));
        Ok(Self::new(config, manager, clients, workers))
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::default().with_timeout(self.config.connection_timeout)
    }

    pub async fn listen(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("binding {}", self.config.listen))?;
        info!(addr = %self.config.listen, "listening");
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("accepting connection")?;
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.handle(stream, peer).await });
        }
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        match ws::accept(stream, &self.connect_options()).await {
            Ok((conn, handshake)) => {
                debug!(%peer, path = %handshake.path, "socket upgraded");
                self.route(conn, handshake).await;
            }
            Err(err) => debug!(%peer, error = %err, "upgrade failed"),
        }
    }

    /// Dispatches an upgraded connection by request path and resumes it once
    /// its handlers are in place. Returns when the connection is done.
    pub async fn route(&self, conn: Connection, handshake: Handshake) {
        let token = handshake.auth_token.as_deref().unwrap_or_default();
        let path = handshake.path.as_str();

        if path == WORKER_PATH {
            let Some(name) = self.workers.verify(token).await else {
                return reject(&conn, path);
            };
            info!(worker = %name, "worker connected");
            conn.resume();
            WorkerLink::new(
                conn,
                &name,
                Arc::clone(&self.manager),
                self.registry.clone(),
                self.config.healthcheck_cooldown,
            )
            .run()
            .await;
            return;
        }

        let Some(user) = self.clients.verify(token).await else {
            return reject(&conn, path);
        };
        if path == CLIENT_PATH {
            let api = ClientApi::new(user, Arc::clone(&self.manager), self.registry.clone());
            serve_client(conn, api).await;
        } else if let Some(id) = path.strip_prefix(SESSION_PATH_PREFIX) {
            match self.manager.get(&user, id).await {
                Ok(Some(session)) => stream_session(conn, session).await,
                Ok(None) => refuse(&conn, CLOSE_UNAUTHORIZED, "Unknown session"),
                Err(err) => {
                    warn!(session = id, error = %err, "session lookup failed");
                    refuse(&conn, CLOSE_PROTOCOL_ERROR, "Session unavailable");
                }
            }
        } else {
            refuse(&conn, CLOSE_PROTOCOL_ERROR, "Unknown endpoint");
        }
    }
}

fn refuse(conn: &Connection, code: u16, reason: &str) {
    let _ = conn.close(code, reason);
    conn.resume();
}

fn reject(conn: &Connection, path: &str) {
    warn!(path, "rejected connection with a bad token");
    refuse(conn, CLOSE_UNAUTHORIZED, "Unauthorized");
}
