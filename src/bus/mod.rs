//! Transport-agnostic notification fan-out.
//!
//! Producers (the watcher, the kernel) push [`Notification`]s into a
//! [`NotificationHub`]; each live transport subscribes independently and
//! applies its own queueing policy.  The hub is an explicit value with
//! `new()`, handed around at startup — no lazy module-level state, so
//! tests stay hermetic.

use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the in-process fan-out channel.
const HUB_CAPACITY: usize = 256;

/// JSON-RPC method for tool-surface changes.
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/listChanged";

/// A server→client notification.  Never carries an `id`.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn tools_list_changed() -> Self {
        Self {
            method: TOOLS_LIST_CHANGED.into(),
            params: Value::Null,
        }
    }

    /// Wire form: `{"jsonrpc": "2.0", "method": …, "params": …}`.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": self.method,
            "params": self.params,
        })
    }
}

/// Broadcast hub connecting producers to transports.
#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Fan a notification out to every subscriber.  Best-effort: with no
    /// live transports the notification is dropped silently.
    pub fn broadcast(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    /// Independent receiver seeing everything sent after subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Number of live subscribers (diagnostics).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_broadcasts() {
        let hub = NotificationHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.broadcast(Notification::tools_list_changed());

        assert_eq!(rx1.recv().await.unwrap().method, TOOLS_LIST_CHANGED);
        assert_eq!(rx2.recv().await.unwrap().method, TOOLS_LIST_CHANGED);
    }

    #[test]
    fn wire_form_has_no_id() {
        let json = Notification::tools_list_changed().to_json();
        assert!(json.get("id").is_none());
        assert_eq!(json["method"], TOOLS_LIST_CHANGED);
        assert_eq!(json["params"], Value::Null);
        assert_eq!(json["jsonrpc"], "2.0");
    }

    #[test]
    fn broadcast_without_subscribers_is_fine() {
        let hub = NotificationHub::new();
        hub.broadcast(Notification::tools_list_changed());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
