//! Lifecycle notifications for embedders (vhost muxer, metrics, audit).

use rift_core::ProxyType;
use tokio::sync::broadcast;

/// Events the server publishes as sessions and proxies come and go.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ProxyRegistered {
        run_id: String,
        proxy_name: String,
        proxy_type: ProxyType,
        remote_addr: String,
        /// Allocated vhost domains for http and https proxies.
        domains: Vec<String>,
        locations: Vec<String>,
    },
    ProxyUnregistered {
        run_id: String,
        proxy_name: String,
    },
    /// A work connection was bound to a user or visitor connection.
    WorkConnBound {
        run_id: String,
        proxy_name: String,
        src_addr: String,
        use_encryption: bool,
        use_compression: bool,
    },
    SessionEnded {
        run_id: String,
        reason: String,
    },
}

/// Fan-out channel for [`ServerEvent`]s. Events with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
