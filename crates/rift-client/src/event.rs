//! Notifications from the client runtime to whoever embeds it.

use rift_core::PunchOutcome;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    LoggedIn {
        run_id: String,
        server_udp_port: u16,
    },
    ProxyStarted {
        name: String,
        remote_addr: String,
    },
    ProxyFailed {
        name: String,
        error: String,
    },
    /// A hole punch finished, on either side.
    PunchResolved(PunchOutcome),
    SessionEnded {
        run_id: String,
        reason: String,
    },
}

/// Fan-out channel for [`ClientEvent`]s. Events with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            tx: broadcast::channel(256).0,
        }
    }
}
