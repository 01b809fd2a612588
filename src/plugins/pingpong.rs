use super::Plugin;
use crate::connection::{Connection, Event, Payload};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Keepalive: answers `comm_ping` with `comm_pong` and records pongs
/// for the supervisor task. Both commands are consumed before they
/// reach the reader.
pub struct PingPongPlugin {
    connection: Connection,
    last_pong_ms: AtomicU64,
}

impl PingPongPlugin {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            last_pong_ms: AtomicU64::new(now_ms()),
        }
    }

    fn last_pong_age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_pong_ms.load(Ordering::Relaxed)))
    }
}

impl Plugin for PingPongPlugin {
    fn name(&self) -> &'static str {
        "pingpong"
    }

    fn incoming(&self, event: Event) -> Option<Event> {
        if let Event::Message(Payload::Text(text)) = &event {
            let command = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("command").and_then(|c| c.as_str()).map(str::to_owned));
            match command.as_deref() {
                Some("comm_ping") => {
                    let connection = self.connection.clone();
                    tokio::spawn(async move {
                        connection.send_json(&json!({"command": "comm_pong"})).await.ok();
                    });
                    return None;
                }
                Some("comm_pong") => {
                    self.last_pong_ms.store(now_ms(), Ordering::Relaxed);
                    return None;
                }
                _ => {}
            }
        }
        Some(event)
    }

    fn outgoing(&self, event: Event) -> Option<Event> {
        Some(event)
    }
}

/// Installs the ping plugin and starts the supervisor: a ping every
/// `interval`, and a local close with reason `ping-timeout` when no
/// pong arrived for two intervals.
pub fn start_keepalive(connection: &Connection, interval: Duration) {
    let plugin = Arc::new(PingPongPlugin::new(connection.clone()));
    connection.add_plugin(plugin.clone());
    let connection = connection.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if connection.is_closed() {
                break;
            }
            if plugin.last_pong_age() > interval * 2 {
                tracing::info!("ping timeout, closing");
                connection.close("ping-timeout").await;
                break;
            }
            if connection
                .send_json(&json!({"command": "comm_ping"}))
                .await
                .is_err()
            {
                break;
            }
        }
    });
}
