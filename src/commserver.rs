//! Comm-server client protocol.
//!
//! A peer behind NAT registers its listening key at the relay and
//! keeps the registration socket alive with comm pings. When a client
//! asks the relay for that key, the relay authenticates the
//! registration, sends `connection_handover` and from then on pipes
//! frames between the two sockets; the registered side re-registers on
//! a fresh socket so one spare is always available.

use crate::connection::{Connection, WsTransport};
use crate::error::{NetError, Result};
use chum_core::CryptoApi;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Register {
    command: String,
    public_key: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticationRequest {
    command: String,
    public_key: String,
    challenge: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticationResponse {
    command: String,
    response: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthenticationSuccess {
    pub command: String,
    pub ping_interval: u64,
}

/// Opens a websocket connection to `url`.
pub async fn connect(url: &str) -> Result<Connection> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(NetError::transport)?;
    Ok(Connection::new(Box::new(WsTransport(ws))))
}

/// A running comm-server registration. Dropping the handle stops it.
pub struct CommServerListener {
    stop: watch::Sender<bool>,
}

impl CommServerListener {
    pub fn stop(&self) {
        self.stop.send(true).ok();
    }
}

impl Drop for CommServerListener {
    fn drop(&mut self) {
        self.stop.send(true).ok();
    }
}

/// Registers `instance_api`'s public key at the relay and yields one
/// connection per handover. Registration reconnects with backoff while
/// the listener is alive.
pub fn listen(
    url: String,
    instance_api: CryptoApi,
    connections: mpsc::Sender<Connection>,
) -> CommServerListener {
    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(listen_loop(url, instance_api, connections, stop_rx));
    CommServerListener { stop }
}

async fn listen_loop(
    url: String,
    instance_api: CryptoApi,
    connections: mpsc::Sender<Connection>,
    stop: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);
    while !*stop.borrow() {
        match register_once(&url, &instance_api, &stop).await {
            Ok(Some(connection)) => {
                backoff = Duration::from_secs(1);
                if connections.send(connection).await.is_err() {
                    break;
                }
                // loop around: open a fresh spare registration
                continue;
            }
            // stopped, or the relay went away cleanly
            Ok(None) => {}
            Err(err) => {
                tracing::debug!("comm-server registration failed: {}", err);
            }
        }
        if *stop.borrow() {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

/// One registration life: register, authenticate, answer pings until a
/// handover arrives. Returns the handed-over connection.
async fn register_once(
    url: &str,
    instance_api: &CryptoApi,
    stop: &watch::Receiver<bool>,
) -> Result<Option<Connection>> {
    let connection = connect(url).await?;
    connection
        .send_json(&Register {
            command: "register".to_owned(),
            public_key: hex::encode(instance_api.public_encryption_key()),
        })
        .await?;

    // the relay proves we own the registered key: it seals a challenge
    // to the key and expects the plaintext back
    let request: AuthenticationRequest = connection
        .reader()
        .read_command("authentication_request", Some(Duration::from_secs(20)))
        .await?;
    let relay_key: [u8; 32] = hex::decode(&request.public_key)
        .map_err(|_| NetError::handshake("bad relay key"))?
        .try_into()
        .map_err(|_| NetError::handshake("bad relay key length"))?;
    let sealed =
        hex::decode(&request.challenge).map_err(|_| NetError::handshake("bad challenge hex"))?;
    let challenge = instance_api
        .decrypt_from(&relay_key, &sealed)
        .map_err(NetError::Core)?;
    connection
        .send_json(&AuthenticationResponse {
            command: "authentication_response".to_owned(),
            response: hex::encode(challenge),
        })
        .await?;
    let success: AuthenticationSuccess = connection
        .reader()
        .read_command("authentication_success", Some(Duration::from_secs(20)))
        .await?;
    let ping_interval = Duration::from_secs(success.ping_interval.max(1));

    let mut stop = stop.clone();
    loop {
        let read = connection
            .reader()
            .read_text(Some(ping_interval * 3));
        let text = tokio::select! {
            _ = stop.changed() => {
                connection.close("stopped").await;
                return Ok(None);
            }
            text = read => text?,
        };
        let value: serde_json::Value = serde_json::from_str(&text)?;
        match value.get("command").and_then(|c| c.as_str()) {
            Some("comm_ping") => {
                connection
                    .send_json(&serde_json::json!({"command": "comm_pong"}))
                    .await?;
            }
            Some("connection_handover") => {
                // from here on the socket belongs to the peer handshake
                return Ok(Some(connection));
            }
            other => {
                tracing::debug!("unexpected relay command {:?}", other);
            }
        }
    }
}
