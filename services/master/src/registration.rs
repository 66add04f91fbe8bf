//! Worker registration: port manager, per-port dispatchers, registrations.
//!
//! A single [`Dispatcher`] listens on one port and serves many worker
//! identities. The [`PortManager`] lazily creates a dispatcher the first time
//! a port specifier is used and tears it down when its last user
//! unregisters. [`Registration`] is the per-worker handle returned to the
//! caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{encode_frame, MasterFrame, WireSession, WorkerFrame};

/// Builds a [`crate::connection::Connection`] from an authenticated session
/// and decides whether it is accepted. Registered per worker identity.
pub type ConnectionFactory =
    Arc<dyn Fn(WireSession, String) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Registration and listener errors.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The port specifier is not of the form `tcp:<port>` or `<port>`.
    #[error("invalid port specifier: {0}")]
    InvalidPortSpecifier(String),

    /// The username is already registered on this dispatcher.
    #[error("username {username} already registered on {port_spec}")]
    DuplicateUsername { username: String, port_spec: String },

    /// `unregister()` was called twice on the same registration.
    #[error("registration already unregistered")]
    AlreadyUnregistered,

    /// No dispatcher exists for the port.
    #[error("no dispatcher for port {0}")]
    UnknownPort(String),

    /// The username is not registered on the dispatcher.
    #[error("username {0} not registered")]
    UnknownUser(String),

    /// The listener could not be bound or accepted on.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Canonicalize a port specifier. Bare port numbers mean `tcp:<port>`;
/// `tcp:0` requests an OS-assigned port.
pub fn normalize_port_spec(spec: &str) -> Result<String, RegistrationError> {
    let port_str = spec.strip_prefix("tcp:").unwrap_or(spec);
    let port: u16 = port_str
        .parse()
        .map_err(|_| RegistrationError::InvalidPortSpecifier(spec.to_string()))?;
    Ok(format!("tcp:{port}"))
}

#[derive(Clone)]
struct UserEntry {
    password: String,
    factory: ConnectionFactory,
}

/// Per-port listener serving many worker identities.
pub struct Dispatcher {
    port_spec: String,
    bound_port: u16,
    users: Arc<RwLock<HashMap<String, UserEntry>>>,
    accept_task: JoinHandle<()>,
}

impl Dispatcher {
    async fn bind(port_spec: &str) -> Result<Arc<Self>, RegistrationError> {
        let port: u16 = port_spec
            .strip_prefix("tcp:")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| RegistrationError::InvalidPortSpecifier(port_spec.to_string()))?;

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound_port = listener.local_addr()?.port();
        let users: Arc<RwLock<HashMap<String, UserEntry>>> = Arc::new(RwLock::new(HashMap::new()));

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&users)));

        info!(port_spec = %port_spec, bound_port, "dispatcher listening");
        Ok(Arc::new(Self {
            port_spec: port_spec.to_string(),
            bound_port,
            users,
            accept_task,
        }))
    }

    /// The actually-bound port, meaningful when `tcp:0` was requested.
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    async fn add_user(
        &self,
        username: &str,
        password: &str,
        factory: ConnectionFactory,
    ) -> Result<(), RegistrationError> {
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(RegistrationError::DuplicateUsername {
                username: username.to_string(),
                port_spec: self.port_spec.clone(),
            });
        }
        users.insert(
            username.to_string(),
            UserEntry {
                password: password.to_string(),
                factory,
            },
        );
        Ok(())
    }

    /// Remove a username; returns how many users remain.
    async fn remove_user(&self, username: &str) -> Result<usize, RegistrationError> {
        let mut users = self.users.write().await;
        if users.remove(username).is_none() {
            return Err(RegistrationError::UnknownUser(username.to_string()));
        }
        Ok(users.len())
    }

    fn shutdown(&self) {
        self.accept_task.abort();
        info!(port_spec = %self.port_spec, "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, users: Arc<RwLock<HashMap<String, UserEntry>>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let users = Arc::clone(&users);
                tokio::spawn(async move {
                    if let Err(e) = handle_session(stream, peer, users).await {
                        debug!(peer = %peer, error = %e, "session ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

/// Authenticate one inbound session and hand it to the registered factory.
async fn handle_session(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    users: Arc<RwLock<HashMap<String, UserEntry>>>,
) -> anyhow::Result<()> {
    // The reader stays with the session from here on; bytes a worker
    // pipelines behind its auth frame are sitting in its buffer.
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let frame: WorkerFrame = serde_json::from_str(&line)?;
    let WorkerFrame::Auth { username, password } = frame else {
        anyhow::bail!("expected auth frame, got {}", json!(line));
    };

    // Exact match only; a single generic rejection for both unknown user and
    // bad password.
    let entry = {
        let users = users.read().await;
        users
            .get(&username)
            .filter(|entry| entry.password == password)
            .cloned()
    };

    let Some(entry) = entry else {
        debug!(peer = %peer, username = %username, "authentication rejected");
        write_half
            .write_all(encode_frame(&MasterFrame::AuthErr)?.as_bytes())
            .await?;
        return Ok(());
    };

    write_half
        .write_all(encode_frame(&MasterFrame::AuthOk)?.as_bytes())
        .await?;

    let session = WireSession {
        reader,
        writer: write_half,
        peer,
    };
    let accepted = (entry.factory)(session, username.clone()).await?;
    if accepted {
        info!(peer = %peer, worker = %username, "worker session established");
    } else {
        debug!(peer = %peer, worker = %username, "worker session rejected after authentication");
    }
    Ok(())
}

/// Table of dispatchers keyed by normalized port specifier.
pub struct PortManager {
    dispatchers: Mutex<HashMap<String, Arc<Dispatcher>>>,
}

impl PortManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatchers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a worker identity, lazily creating the port's dispatcher.
    pub async fn register(
        self: &Arc<Self>,
        port_spec: &str,
        username: &str,
        password: &str,
        factory: ConnectionFactory,
    ) -> Result<Registration, RegistrationError> {
        let spec = normalize_port_spec(port_spec)?;
        let mut dispatchers = self.dispatchers.lock().await;

        let (dispatcher, created) = match dispatchers.get(&spec) {
            Some(d) => (Arc::clone(d), false),
            None => {
                let d = Dispatcher::bind(&spec).await?;
                dispatchers.insert(spec.clone(), Arc::clone(&d));
                (d, true)
            }
        };

        if let Err(e) = dispatcher.add_user(username, password, factory).await {
            if created {
                dispatcher.shutdown();
                dispatchers.remove(&spec);
            }
            return Err(e);
        }

        debug!(worker = %username, port_spec = %spec, "worker registered");
        Ok(Registration {
            manager: Arc::clone(self),
            port_spec: spec,
            username: Some(username.to_string()),
        })
    }

    async fn unregister(&self, port_spec: &str, username: &str) -> Result<(), RegistrationError> {
        let mut dispatchers = self.dispatchers.lock().await;
        let dispatcher = dispatchers
            .get(port_spec)
            .cloned()
            .ok_or_else(|| RegistrationError::UnknownPort(port_spec.to_string()))?;

        let remaining = dispatcher.remove_user(username).await?;
        if remaining == 0 {
            dispatcher.shutdown();
            dispatchers.remove(port_spec);
        }
        debug!(worker = %username, port_spec = %port_spec, "worker unregistered");
        Ok(())
    }

    /// The bound port of the dispatcher for `port_spec`, if one exists.
    pub async fn bound_port(&self, port_spec: &str) -> Option<u16> {
        let dispatchers = self.dispatchers.lock().await;
        dispatchers.get(port_spec).map(|d| d.bound_port())
    }

    /// Number of live dispatchers.
    pub async fn dispatcher_count(&self) -> usize {
        self.dispatchers.lock().await.len()
    }
}

/// Per-worker handle returned by [`PortManager::register`]; unregister-once.
pub struct Registration {
    manager: Arc<PortManager>,
    port_spec: String,
    username: Option<String>,
}

impl Registration {
    /// Remove this worker identity from its dispatcher, tearing down the
    /// dispatcher when its user table empties. A second call is an error.
    pub async fn unregister(&mut self) -> Result<(), RegistrationError> {
        let username = self
            .username
            .take()
            .ok_or(RegistrationError::AlreadyUnregistered)?;
        self.manager.unregister(&self.port_spec, &username).await
    }

    /// Normalized port specifier this registration is bound to.
    pub fn port_spec(&self) -> &str {
        &self.port_spec
    }

    /// Resolved listener port for this registration's dispatcher.
    pub async fn bound_port(&self) -> Option<u16> {
        self.manager.bound_port(&self.port_spec).await
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("port_spec", &self.port_spec)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
