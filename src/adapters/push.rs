//! Per-user push channel.
//!
//! The engine broadcasts fired alerts here; the websocket gateway (out of
//! scope) subscribes and routes each record to the owning user's connections.

use crate::domain::UserAlert;
use tokio::sync::broadcast;
use tracing::debug;

/// Fan-out bus for user-facing alert records.
pub struct PushHub {
    tx: broadcast::Sender<UserAlert>,
}

impl PushHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Broadcast an alert record on the user's push channel. Delivery is
    /// best-effort; with no gateway attached the record is dropped.
    pub fn send_alert_to_user(&self, alert: UserAlert) {
        let user_id = alert.user_id;
        match self.tx.send(alert) {
            Ok(receivers) => debug!("pushed alert to user {user_id} ({receivers} receivers)"),
            Err(_) => debug!("no push receivers attached, dropped alert for user {user_id}"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserAlert> {
        self.tx.subscribe()
    }
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}
