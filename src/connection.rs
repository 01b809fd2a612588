//! Message-oriented duplex connections with a plugin chain.
//!
//! A [`Connection`] pumps a framed [`Transport`] through an ordered
//! list of plugins. Incoming events traverse the chain front to back,
//! outgoing events back to front; a plugin may transform an event or
//! consume it. The standard chain is statistics, encryption (inactive
//! until a key is installed), promise (the awaitable reader).

use crate::error::{CloseOrigin, NetError, Result};
use crate::plugins::{EncryptionPlugin, Plugin, PromisePlugin, StatisticsPlugin};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// One message payload; the transport keeps text and bytes apart.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection lifecycle events as seen by plugins.
#[derive(Clone, Debug)]
pub enum Event {
    Opened,
    Message(Payload),
    Closed { reason: String, origin: CloseOrigin },
}

/// A duplex byte transport preserving message boundaries. Splitting
/// into independent halves lets sends and receives run concurrently.
pub trait Transport: Send {
    fn split(self: Box<Self>) -> (Box<dyn TransportSend>, Box<dyn TransportRecv>);
}

#[async_trait]
pub trait TransportSend: Send {
    async fn send(&mut self, payload: Payload) -> Result<()>;
    async fn close(&mut self);
}

#[async_trait]
pub trait TransportRecv: Send {
    /// `None` means the remote closed cleanly.
    async fn recv(&mut self) -> Result<Option<Payload>>;
}

/// WebSocket transport; the framing is the transport's own.
pub struct WsTransport<S>(pub WebSocketStream<S>);

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn TransportSend>, Box<dyn TransportRecv>) {
        let (sink, stream) = self.0.split();
        (Box::new(WsSender(sink)), Box::new(WsReceiver(stream)))
    }
}

struct WsSender<S>(futures::stream::SplitSink<WebSocketStream<S>, Message>);

#[async_trait]
impl<S> TransportSend for WsSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, payload: Payload) -> Result<()> {
        let message = match payload {
            Payload::Text(s) => Message::Text(s),
            Payload::Binary(b) => Message::Binary(b),
        };
        self.0.send(message).await.map_err(NetError::transport)
    }

    async fn close(&mut self) {
        self.0.close().await.ok();
    }
}

struct WsReceiver<S>(futures::stream::SplitStream<WebSocketStream<S>>);

#[async_trait]
impl<S> TransportRecv for WsReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Payload>> {
        while let Some(message) = self.0.next().await {
            match message.map_err(NetError::transport)? {
                Message::Text(s) => return Ok(Some(Payload::Text(s))),
                Message::Binary(b) => return Ok(Some(Payload::Binary(b))),
                Message::Close(_) => return Ok(None),
                // ping/pong handled by the websocket layer
                _ => continue,
            }
        }
        Ok(None)
    }
}

const FRAME_TEXT: u8 = 1;
const FRAME_BINARY: u8 = 0;
const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Length-prefixed framing over any byte stream, with a prefix byte
/// keeping text and binary payloads apart. Used for in-memory pipes
/// and non-websocket transports.
pub struct FramedTransport<T>(pub T);

impl<T> Transport for FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn TransportSend>, Box<dyn TransportRecv>) {
        let (read, write) = tokio::io::split(self.0);
        (Box::new(FramedSender(write)), Box::new(FramedReceiver(read)))
    }
}

struct FramedSender<T>(tokio::io::WriteHalf<T>);

#[async_trait]
impl<T> TransportSend for FramedSender<T>
where
    T: AsyncWrite + Send,
{
    async fn send(&mut self, payload: Payload) -> Result<()> {
        let (kind, bytes) = match &payload {
            Payload::Text(s) => (FRAME_TEXT, s.as_bytes()),
            Payload::Binary(b) => (FRAME_BINARY, b.as_slice()),
        };
        let len = (bytes.len() + 1) as u32;
        self.0
            .write_all(&len.to_be_bytes())
            .await
            .map_err(NetError::transport)?;
        self.0.write_all(&[kind]).await.map_err(NetError::transport)?;
        self.0.write_all(bytes).await.map_err(NetError::transport)?;
        self.0.flush().await.map_err(NetError::transport)?;
        Ok(())
    }

    async fn close(&mut self) {
        self.0.shutdown().await.ok();
    }
}

struct FramedReceiver<T>(tokio::io::ReadHalf<T>);

#[async_trait]
impl<T> TransportRecv for FramedReceiver<T>
where
    T: AsyncRead + Send,
{
    async fn recv(&mut self) -> Result<Option<Payload>> {
        let mut len = [0u8; 4];
        match self.0.read_exact(&mut len).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(NetError::transport(err)),
        }
        let len = u32::from_be_bytes(len) as usize;
        if len == 0 || len > MAX_FRAME {
            return Err(NetError::transport(format!("bad frame length {}", len)));
        }
        let mut frame = vec![0u8; len];
        self.0
            .read_exact(&mut frame)
            .await
            .map_err(NetError::transport)?;
        let kind = frame.remove(0);
        match kind {
            FRAME_TEXT => String::from_utf8(frame)
                .map(|s| Some(Payload::Text(s)))
                .map_err(|_| NetError::transport("text frame is not utf-8")),
            FRAME_BINARY => Ok(Some(Payload::Binary(frame))),
            other => Err(NetError::transport(format!("bad frame kind {}", other))),
        }
    }
}

enum Command {
    Send(Payload),
    Close(String),
}

struct Shared {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    statistics: Arc<StatisticsPlugin>,
    encryption: Arc<EncryptionPlugin>,
    promise: Arc<PromisePlugin>,
    closed: AtomicBool,
    closed_rx: watch::Receiver<Option<String>>,
}

/// A pumped connection. Cloning shares the underlying transport.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Takes ownership of a transport and starts the pump task with the
    /// standard plugin chain.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let statistics = Arc::new(StatisticsPlugin::default());
        let encryption = Arc::new(EncryptionPlugin::default());
        let promise = Arc::new(PromisePlugin::new(1024));
        let plugins: Vec<Arc<dyn Plugin>> =
            vec![statistics.clone(), encryption.clone(), promise.clone()];
        let (commands, commands_rx) = mpsc::channel(64);
        let (closed_tx, closed_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            plugins: RwLock::new(plugins),
            statistics,
            encryption,
            promise,
            closed: AtomicBool::new(false),
            closed_rx,
        });
        tokio::spawn(pump(transport, commands_rx, shared.clone(), closed_tx));
        Self { commands, shared }
    }

    /// Inserts a plugin in front of the promise reader.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        let mut plugins = self.shared.plugins.write();
        let at = plugins.len().saturating_sub(1);
        plugins.insert(at, plugin);
    }

    /// Queues an outgoing message. The plugin chain runs on the
    /// caller's task, so a key installed before `send` returns is
    /// guaranteed to cover the next message. Fails synchronously once
    /// the connection is closed.
    pub async fn send(&self, payload: Payload) -> Result<()> {
        self.send_inner(payload, false).await
    }

    /// Sends one message past the encryption plugin. Only the first
    /// handshake message travels this way; the peer cannot have the
    /// shared key before seeing it.
    pub(crate) async fn send_unsealed(&self, payload: Payload) -> Result<()> {
        self.send_inner(payload, true).await
    }

    async fn send_inner(&self, payload: Payload, unsealed: bool) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let payload = match run_outgoing(&self.shared, payload, unsealed) {
            Some(payload) => payload,
            None => return Ok(()),
        };
        self.commands
            .send(Command::Send(payload))
            .await
            .map_err(|_| self.closed_error())
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send(Payload::Text(serde_json::to_string(value)?)).await
    }

    pub(crate) async fn send_json_unsealed<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send_unsealed(Payload::Text(serde_json::to_string(value)?))
            .await
    }

    /// Closes locally; pending reads are cancelled with the reason.
    pub async fn close(&self, reason: &str) {
        self.commands.send(Command::Close(reason.to_owned())).await.ok();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> NetError {
        let reason = self
            .shared
            .closed_rx
            .borrow()
            .clone()
            .unwrap_or_else(|| "closed".to_owned());
        NetError::ConnectionClosed {
            reason,
            origin: CloseOrigin::Local,
        }
    }

    /// Resolves when the connection has closed, with the reason.
    pub async fn wait_closed(&self) -> String {
        let mut rx = self.shared.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "closed".to_owned();
            }
        }
    }

    /// The awaitable message reader.
    pub fn reader(&self) -> &PromisePlugin {
        &self.shared.promise
    }

    pub fn statistics(&self) -> &StatisticsPlugin {
        &self.shared.statistics
    }

    pub fn encryption(&self) -> &EncryptionPlugin {
        &self.shared.encryption
    }
}

/// Marks the connection closed exactly once: the plugins observe the
/// close event and pending reads resolve.
fn finalize(shared: &Shared, closed_tx: &watch::Sender<Option<String>>, reason: String, origin: CloseOrigin) {
    if shared.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    run_incoming(
        shared,
        Event::Closed {
            reason: reason.clone(),
            origin,
        },
    );
    closed_tx.send(Some(reason)).ok();
}

async fn pump(
    transport: Box<dyn Transport>,
    mut commands: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    closed_tx: watch::Sender<Option<String>>,
) {
    let (mut sender, mut receiver) = transport.split();
    let closed_tx = Arc::new(closed_tx);

    let reader = {
        let shared = shared.clone();
        let closed_tx = closed_tx.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(Some(payload)) => {
                        if let Some(Event::Closed { reason, origin }) =
                            run_incoming(&shared, Event::Message(payload))
                        {
                            finalize(&shared, &closed_tx, reason, origin);
                            break;
                        }
                    }
                    Ok(None) => {
                        finalize(
                            &shared,
                            &closed_tx,
                            "closed by remote".to_owned(),
                            CloseOrigin::Remote,
                        );
                        break;
                    }
                    Err(err) => {
                        finalize(&shared, &closed_tx, err.to_string(), CloseOrigin::Remote);
                        break;
                    }
                }
            }
        })
    };

    let mut closed = closed_tx.subscribe();
    loop {
        let command = tokio::select! {
            command = commands.recv() => command,
            // the reader finalized (remote close, frame failure): shut
            // the write half down as well
            _ = closed.changed() => {
                sender.close().await;
                break;
            }
        };
        match command {
            Some(Command::Send(payload)) => {
                if let Err(err) = sender.send(payload).await {
                    tracing::debug!("send failed: {}", err);
                    finalize(&shared, &closed_tx, err.to_string(), CloseOrigin::Remote);
                    reader.abort();
                    sender.close().await;
                    break;
                }
            }
            Some(Command::Close(reason)) => {
                sender.close().await;
                finalize(&shared, &closed_tx, reason, CloseOrigin::Local);
                reader.abort();
                break;
            }
            // every handle dropped
            None => {
                sender.close().await;
                finalize(&shared, &closed_tx, "dropped".to_owned(), CloseOrigin::Local);
                reader.abort();
                break;
            }
        }
    }
}

/// Runs an incoming event through the chain front to back. Returns the
/// event if it survives (a close surfaced by a plugin, for instance).
fn run_incoming(shared: &Shared, event: Event) -> Option<Event> {
    let plugins = shared.plugins.read().clone();
    let mut event = Some(event);
    for plugin in plugins.iter() {
        event = match event {
            Some(ev) => plugin.incoming(ev),
            None => return None,
        };
    }
    event
}

fn run_outgoing(shared: &Shared, payload: Payload, unsealed: bool) -> Option<Payload> {
    let plugins = shared.plugins.read().clone();
    let mut event = Some(Event::Message(payload));
    for plugin in plugins.iter().rev() {
        if unsealed && plugin.name() == "encryption" {
            continue;
        }
        event = match event {
            Some(ev) => plugin.outgoing(ev),
            None => return None,
        };
    }
    match event {
        Some(Event::Message(payload)) => Some(payload),
        _ => None,
    }
}
