use super::Plugin;
use crate::connection::{Event, Payload};
use crate::error::{CloseOrigin, NetError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;

/// Converts the incoming event stream into awaitable reads.
///
/// Messages queue into a bounded channel; closing the connection drops
/// the sender so every pending read resolves with the close reason.
pub struct PromisePlugin {
    tx: Mutex<Option<mpsc::Sender<Payload>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Payload>>,
    closed: Mutex<Option<(String, CloseOrigin)>>,
}

impl PromisePlugin {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: Mutex::new(None),
        }
    }

    fn closed_error(&self) -> NetError {
        let (reason, origin) = self
            .closed
            .lock()
            .clone()
            .unwrap_or_else(|| ("closed".to_owned(), CloseOrigin::Remote));
        NetError::ConnectionClosed { reason, origin }
    }

    /// Awaits the next message. `None` waits forever; an elapsed
    /// timeout surfaces as [`NetError::ReadTimeout`] without touching
    /// the connection.
    pub async fn read_any(&self, timeout: Option<Duration>) -> Result<Payload> {
        let mut rx = self.rx.lock().await;
        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx.recv())
                .await
                .map_err(|_| NetError::ReadTimeout)?,
            None => rx.recv().await,
        };
        received.ok_or_else(|| self.closed_error())
    }

    pub async fn read_text(&self, timeout: Option<Duration>) -> Result<String> {
        match self.read_any(timeout).await? {
            Payload::Text(s) => Ok(s),
            Payload::Binary(_) => Err(NetError::handshake("expected a text message")),
        }
    }

    pub async fn read_binary(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        match self.read_any(timeout).await? {
            Payload::Binary(b) => Ok(b),
            Payload::Text(_) => Err(NetError::handshake("expected a binary message")),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T> {
        let text = self.read_text(timeout).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Reads a JSON message whose `command` field equals `expected`.
    /// Anything else is a protocol deviation.
    pub async fn read_command<T: DeserializeOwned>(
        &self,
        expected: &str,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let text = self.read_text(timeout).await?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        match value.get("command").and_then(|c| c.as_str()) {
            Some(command) if command == expected => {}
            Some(command) => {
                return Err(NetError::handshake(format!(
                    "expected command {:?}, got {:?}",
                    expected, command
                )))
            }
            None => return Err(NetError::handshake("message without command")),
        }
        Ok(serde_json::from_value(value)?)
    }
}

impl Plugin for PromisePlugin {
    fn name(&self) -> &'static str {
        "promise"
    }

    fn incoming(&self, event: Event) -> Option<Event> {
        match event {
            Event::Message(payload) => {
                if let Some(tx) = &*self.tx.lock() {
                    if tx.try_send(payload).is_err() {
                        tracing::warn!("promise queue full, dropping message");
                    }
                }
                None
            }
            Event::Closed { reason, origin } => {
                let mut closed = self.closed.lock();
                if closed.is_none() {
                    *closed = Some((reason.clone(), origin));
                }
                // dropping the sender resolves pending reads
                *self.tx.lock() = None;
                Some(Event::Closed { reason, origin })
            }
            other => Some(other),
        }
    }

    fn outgoing(&self, event: Event) -> Option<Event> {
        Some(event)
    }
}
