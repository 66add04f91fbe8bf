//! Top-level table of worker identities and the duplicate-connection
//! arbitration protocol.
//!
//! At most one live connection exists per worker name. When a second
//! connection claims an already-connected identity, the existing connection
//! is pinged; if it answers within the timeout it stays authoritative and
//! the newcomer is rejected, otherwise it is presumed half-open and torn
//! down in favor of the newcomer. This lets a worker that restarted after a
//! network blip reconnect without waiting for the master to notice the dead
//! TCP session on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::protocol::TcpConnection;
use crate::registration::{
    normalize_port_spec, ConnectionFactory, PortManager, Registration, RegistrationError,
};

/// How long the existing connection gets to answer the duplicate ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Arbitration failure.
#[derive(Debug, Error)]
pub enum WorkerManagerError {
    /// The existing connection for this identity is alive; the new one is
    /// rejected.
    #[error("rejecting duplicate worker connection for {0}")]
    DuplicateWorker(String),
}

struct RegisteredWorker {
    password: String,
    port_spec: String,
    registration: Registration,
}

/// Registry of configured worker identities and their live connections.
pub struct WorkerManager {
    port_manager: Arc<PortManager>,
    ping_timeout: Duration,
    connections: Mutex<HashMap<String, Arc<dyn Connection>>>,
    registrations: Mutex<HashMap<String, RegisteredWorker>>,
    /// Serializes arbitration per worker identity.
    arbitration_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkerManager {
    pub fn new(port_manager: Arc<PortManager>, ping_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            port_manager,
            ping_timeout,
            connections: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            arbitration_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn identity_lock(&self, worker_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.arbitration_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(worker_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Arbitrate an inbound connection claiming `worker_name`.
    ///
    /// Returns `Ok(true)` on acceptance, `Ok(false)` when the new connection
    /// failed its own attach round-trips, and `Err(DuplicateWorker)` when an
    /// existing live connection keeps the identity.
    pub async fn new_connection(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        worker_name: &str,
    ) -> Result<bool, WorkerManagerError> {
        let lock = self.identity_lock(worker_name);
        let _guard = lock.lock().await;

        let existing = {
            let connections = self.connections.lock().await;
            connections.get(worker_name).cloned()
        };

        if let Some(old) = existing {
            match timeout(
                self.ping_timeout,
                old.remote_print("master got a duplicate connection"),
            )
            .await
            {
                Ok(Ok(())) => {
                    // The old connection answered; it stays authoritative.
                    info!(
                        worker = %worker_name,
                        "duplicate connection rejected, existing connection is alive"
                    );
                    return Err(WorkerManagerError::DuplicateWorker(
                        worker_name.to_string(),
                    ));
                }
                Ok(Err(e)) => {
                    warn!(
                        worker = %worker_name,
                        error = %e,
                        "duplicate ping failed, disconnecting stale connection"
                    );
                    old.lose_connection().await;
                }
                Err(_) => {
                    warn!(
                        worker = %worker_name,
                        timeout_secs = self.ping_timeout.as_secs_f64(),
                        "duplicate ping timed out, disconnecting stale connection"
                    );
                    old.lose_connection().await;
                }
            }
        }

        if let Err(e) = conn.remote_print("attached").await {
            warn!(worker = %worker_name, error = %e, "attach message failed, rejecting connection");
            return Ok(false);
        }
        let worker_info = match conn.remote_get_worker_info().await {
            Ok(worker_info) => worker_info,
            Err(e) => {
                warn!(worker = %worker_name, error = %e, "worker info fetch failed, rejecting connection");
                return Ok(false);
            }
        };
        conn.set_info(worker_info);

        {
            let mut connections = self.connections.lock().await;
            connections.insert(worker_name.to_string(), Arc::clone(&conn));
        }
        info!(worker = %worker_name, "worker attached");

        // Cleanup is keyed to this exact connection instance, so a newer
        // replacement for the same name is never removed by a stale watcher.
        let manager = Arc::clone(self);
        let name = worker_name.to_string();
        let watched = Arc::clone(&conn);
        tokio::spawn(async move {
            watched.wait_shutdown().await;
            let mut connections = manager.connections.lock().await;
            if let Some(current) = connections.get(&name) {
                if Arc::ptr_eq(current, &watched) {
                    connections.remove(&name);
                    info!(worker = %name, "worker detached");
                }
            }
        });

        Ok(true)
    }

    /// The live connection for a worker, if any.
    pub async fn connection(&self, worker_name: &str) -> Option<Arc<dyn Connection>> {
        let connections = self.connections.lock().await;
        connections.get(worker_name).cloned()
    }

    /// Names of currently connected workers.
    pub async fn connected_workers(&self) -> Vec<String> {
        let connections = self.connections.lock().await;
        connections.keys().cloned().collect()
    }

    /// Register a worker identity, or bring an existing registration up to
    /// date. Re-registering with unchanged password and port is a no-op.
    pub async fn update_registration(
        self: &Arc<Self>,
        worker_name: &str,
        password: &str,
        port_spec: &str,
    ) -> Result<(), RegistrationError> {
        let spec = normalize_port_spec(port_spec)?;
        let mut registrations = self.registrations.lock().await;

        if let Some(existing) = registrations.get_mut(worker_name) {
            if existing.password == password && existing.port_spec == spec {
                debug!(worker = %worker_name, "registration unchanged");
                return Ok(());
            }
            existing.registration.unregister().await?;
            registrations.remove(worker_name);
        }

        let factory = self.connection_factory();
        let registration = self
            .port_manager
            .register(&spec, worker_name, password, factory)
            .await?;
        registrations.insert(
            worker_name.to_string(),
            RegisteredWorker {
                password: password.to_string(),
                port_spec: spec,
                registration,
            },
        );
        Ok(())
    }

    /// Drop a worker's registration. Unknown names are a no-op.
    pub async fn remove_registration(&self, worker_name: &str) -> Result<(), RegistrationError> {
        let mut registrations = self.registrations.lock().await;
        if let Some(mut registered) = registrations.remove(worker_name) {
            registered.registration.unregister().await?;
        }
        Ok(())
    }

    /// Names of currently registered workers.
    pub async fn registered_workers(&self) -> Vec<String> {
        let registrations = self.registrations.lock().await;
        registrations.keys().cloned().collect()
    }

    /// Resolved listener port for a registered worker.
    pub async fn registration_port(&self, worker_name: &str) -> Option<u16> {
        let registrations = self.registrations.lock().await;
        let registered = registrations.get(worker_name)?;
        registered.registration.bound_port().await
    }

    /// The dispatcher-side factory: wraps an authenticated socket in a
    /// [`TcpConnection`] and runs arbitration on it.
    fn connection_factory(self: &Arc<Self>) -> ConnectionFactory {
        let manager = Arc::downgrade(self);
        Arc::new(move |session, username| {
            let manager = manager.clone();
            Box::pin(async move {
                let Some(manager) = manager.upgrade() else {
                    return Ok(false);
                };
                let conn: Arc<dyn Connection> = TcpConnection::spawn(session, username.clone());
                match manager.new_connection(Arc::clone(&conn), &username).await {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        conn.lose_connection().await;
                        Ok(false)
                    }
                    Err(e) => {
                        debug!(worker = %username, error = %e, "connection rejected by arbitration");
                        conn.lose_connection().await;
                        Ok(false)
                    }
                }
            })
        })
    }
}
