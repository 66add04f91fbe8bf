//! Worker connection abstraction.
//!
//! A [`Connection`] represents one live session with one worker identity.
//! The master talks to workers exclusively through this trait; the concrete
//! transport lives in [`crate::protocol`]. Tests substitute their own
//! implementations.

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::protocol::ProtocolError;

/// Worker-reported capability and version metadata, fetched right after a
/// connection is accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Operating system, e.g. "linux".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Worker software version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Anything else the worker reports.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One live session with one worker identity.
///
/// All remote operations surface failures as `Err`, never as panics; the
/// caller decides whether a failure tears the connection down.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The worker identity this session authenticated as.
    fn worker_name(&self) -> &str;

    /// Best-effort diagnostic line delivered to the worker's log.
    async fn remote_print(&self, message: &str) -> Result<(), ProtocolError>;

    /// Fetch worker capability/version info.
    async fn remote_get_worker_info(&self) -> Result<WorkerInfo, ProtocolError>;

    /// Tell the worker which builders it is assigned to.
    async fn remote_set_builder_list(&self, builders: Vec<String>) -> Result<(), ProtocolError>;

    /// Announce the start of a build on one of the worker's builders.
    async fn remote_start_build(&self, builder: &str) -> Result<(), ProtocolError>;

    /// Start a command on the worker.
    async fn remote_start_command(
        &self,
        command_id: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Result<(), ProtocolError>;

    /// Interrupt a running command.
    async fn remote_interrupt_command(
        &self,
        command_id: &str,
        why: &str,
    ) -> Result<(), ProtocolError>;

    /// Ask the worker process to shut itself down.
    async fn remote_shutdown(&self) -> Result<(), ProtocolError>;

    /// Actively terminate the transport. Disconnect subscribers are notified
    /// exactly once, whether the loss was graceful or not.
    async fn lose_connection(&self);

    /// Subscribe to the connection's eventual loss. The receiver observes a
    /// single `false` -> `true` edge; every subscriber sees it exactly once.
    fn subscribe_disconnect(&self) -> watch::Receiver<bool>;

    /// Store metadata fetched at acceptance time.
    fn set_info(&self, info: WorkerInfo);

    /// Metadata stored by [`set_info`](Self::set_info), if any.
    fn info(&self) -> Option<WorkerInfo>;

    /// Wait until the connection is lost.
    async fn wait_shutdown(&self) {
        let mut rx = self.subscribe_disconnect();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Shared storage for [`Connection::set_info`] implementations.
#[derive(Debug, Default)]
pub struct InfoCell {
    info: RwLock<Option<WorkerInfo>>,
}

impl InfoCell {
    pub fn set(&self, info: WorkerInfo) {
        *self.info.write().unwrap() = Some(info);
    }

    pub fn get(&self) -> Option<WorkerInfo> {
        self.info.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_info_roundtrip_preserves_extras() {
        let json = r#"{"system":"linux","version":"2.1.0","numcpus":8}"#;
        let info: WorkerInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.system.as_deref(), Some("linux"));
        assert_eq!(info.version.as_deref(), Some("2.1.0"));
        assert_eq!(info.extra.get("numcpus"), Some(&serde_json::json!(8)));

        let back = serde_json::to_value(&info).unwrap();
        assert_eq!(back["numcpus"], serde_json::json!(8));
    }

    #[test]
    fn info_cell_set_and_get() {
        let cell = InfoCell::default();
        assert!(cell.get().is_none());
        cell.set(WorkerInfo {
            system: Some("linux".into()),
            ..Default::default()
        });
        assert_eq!(cell.get().unwrap().system.as_deref(), Some("linux"));
    }
}
