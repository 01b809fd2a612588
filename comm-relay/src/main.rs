//! The chum comm-server: a relay for peers behind NAT.
//!
//! Listeners register their public key and stay connected; the relay
//! proves key ownership by sealing a random challenge to the key.
//! When a client sends a `communication_request` for a registered key,
//! the relay hands the spare listener socket over and from then on
//! pipes frames between the two sockets without looking inside.

use anyhow::{Context, Result};
use chum_core::{CryptoApi, EncryptionKeypair};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type Socket = WebSocketStream<TcpStream>;

#[derive(Parser)]
struct Opts {
    /// Address to listen on.
    #[clap(long, default_value = "0.0.0.0:8765")]
    listen: String,
    /// Seconds between comm pings to registered listeners.
    #[clap(long, default_value = "25")]
    ping_interval: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Register {
    command: String,
    public_key: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommunicationRequest {
    command: String,
    source_public_key: String,
    target_public_key: String,
}

/// A handover: the client socket plus the first frame to replay.
struct Handover {
    client: Socket,
    request: String,
}

#[derive(Default)]
struct Registry {
    /// Spare listener sockets by registered key, as handover channels.
    spares: Mutex<HashMap<String, Vec<oneshot::Sender<Handover>>>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            warn!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(opts: Opts) -> Result<()> {
    let listener = TcpListener::bind(&opts.listen)
        .await
        .with_context(|| format!("binding {}", opts.listen))?;
    info!("comm-server listening on {}", opts.listen);
    let registry = Arc::new(Registry::default());
    let ping_interval = Duration::from_secs(opts.ping_interval.max(1));
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            debug!("connection from {}", peer);
            if let Err(err) = handle_socket(stream, registry, ping_interval).await {
                debug!("connection from {} ended: {:#}", peer, err);
            }
        });
    }
}

async fn read_text(socket: &mut Socket, timeout: Duration) -> Result<String> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => anyhow::bail!("read timed out"),
            message = socket.next() => match message.context("socket closed")?? {
                Message::Text(text) => return Ok(text),
                Message::Close(_) => anyhow::bail!("socket closed"),
                _ => continue,
            },
        }
    }
}

async fn handle_socket(
    stream: TcpStream,
    registry: Arc<Registry>,
    ping_interval: Duration,
) -> Result<()> {
    let mut socket = tokio_tungstenite::accept_async(stream).await?;
    let first = read_text(&mut socket, Duration::from_secs(20)).await?;
    let value: serde_json::Value = serde_json::from_str(&first)?;
    match value.get("command").and_then(|c| c.as_str()) {
        Some("register") => {
            let register: Register = serde_json::from_value(value)?;
            handle_register(socket, register, registry, ping_interval).await
        }
        Some("communication_request") => {
            let request: CommunicationRequest = serde_json::from_value(value)?;
            handle_client(socket, first, request, registry).await
        }
        other => anyhow::bail!("unexpected first command {:?}", other),
    }
}

/// Challenge-authenticates a listener, then keeps it registered and
/// pinged until a handover arrives.
async fn handle_register(
    mut socket: Socket,
    register: Register,
    registry: Arc<Registry>,
    ping_interval: Duration,
) -> Result<()> {
    let target: [u8; 32] = hex::decode(&register.public_key)
        .ok()
        .and_then(|k| k.try_into().ok())
        .context("bad registration key")?;

    // seal a challenge to the registered key; only its owner can
    // answer with the plaintext
    let ephemeral = EncryptionKeypair::generate();
    let mut challenge = [0u8; 32];
    OsRng.fill_bytes(&mut challenge);
    let sealed = CryptoApi::new(ephemeral.clone(), None)
        .symmetric_key_for(&target)
        .encrypt(&challenge)?;
    socket
        .send(Message::Text(
            json!({
                "command": "authentication_request",
                "publicKey": hex::encode(ephemeral.public_bytes()),
                "challenge": hex::encode(sealed),
            })
            .to_string(),
        ))
        .await?;
    let response = read_text(&mut socket, Duration::from_secs(20)).await?;
    let response: serde_json::Value = serde_json::from_str(&response)?;
    let answer = response
        .get("response")
        .and_then(|r| r.as_str())
        .context("authentication response without response")?;
    if answer != hex::encode(challenge) {
        socket.close(None).await.ok();
        anyhow::bail!("challenge failed for {}", register.public_key);
    }
    socket
        .send(Message::Text(
            json!({
                "command": "authentication_success",
                "pingInterval": ping_interval.as_secs(),
            })
            .to_string(),
        ))
        .await?;
    info!("registered listener for {}", register.public_key);

    let (handover_tx, mut handover_rx) = oneshot::channel::<Handover>();
    registry
        .spares
        .lock()
        .await
        .entry(register.public_key.clone())
        .or_default()
        .push(handover_tx);

    // ping until a handover (or the listener goes away)
    let mut ticker = tokio::time::interval(ping_interval);
    let handover = loop {
        tokio::select! {
            handover = &mut handover_rx => match handover {
                Ok(handover) => break handover,
                // the registry dropped us (shutdown)
                Err(_) => return Ok(()),
            },
            _ = ticker.tick() => {
                socket
                    .send(Message::Text(json!({"command": "comm_ping"}).to_string()))
                    .await?;
            }
            message = socket.next() => {
                // pongs and noise; a closed socket unregisters
                match message.context("listener went away")?? {
                    Message::Close(_) => anyhow::bail!("listener went away"),
                    _ => continue,
                }
            }
        }
    };

    socket
        .send(Message::Text(
            json!({"command": "connection_handover"}).to_string(),
        ))
        .await?;
    // replay the communication request so the listener's handshake
    // sees the stream from its beginning
    socket.send(Message::Text(handover.request)).await?;
    info!("handover for {}", register.public_key);
    pipe(socket, handover.client).await;
    Ok(())
}

/// Pairs a client with a spare listener for the requested key.
async fn handle_client(
    socket: Socket,
    first: String,
    request: CommunicationRequest,
    registry: Arc<Registry>,
) -> Result<()> {
    let spare = {
        let mut spares = registry.spares.lock().await;
        let entry = spares.entry(request.target_public_key.clone()).or_default();
        // drop handovers whose listener died
        loop {
            match entry.pop() {
                Some(tx) if tx.is_closed() => continue,
                other => break other,
            }
        }
    };
    let spare = match spare {
        Some(spare) => spare,
        None => {
            let mut socket = socket;
            socket.close(None).await.ok();
            anyhow::bail!("no listener for {}", request.target_public_key);
        }
    };
    spare
        .send(Handover {
            client: socket,
            request: first,
        })
        .ok();
    Ok(())
}

/// Moves frames between two sockets until either side closes.
async fn pipe(a: Socket, b: Socket) {
    let (mut a_tx, mut a_rx) = a.split();
    let (mut b_tx, mut b_rx) = b.split();
    let a_to_b = async {
        while let Some(Ok(message)) = a_rx.next().await {
            if matches!(message, Message::Close(_)) || b_tx.send(message).await.is_err() {
                break;
            }
        }
        b_tx.close().await.ok();
    };
    let b_to_a = async {
        while let Some(Ok(message)) = b_rx.next().await {
            if matches!(message, Message::Close(_)) || a_tx.send(message).await.is_err() {
                break;
            }
        }
        a_tx.close().await.ok();
    };
    tokio::join!(a_to_b, b_to_a);
    debug!("pipe ended");
}
