//! Multi-route connection groups.
//!
//! A group is keyed by `(groupName, localPubKey, remotePubKey)` and
//! drives a set of routes towards the same peer. At most one
//! connection is active per group; a second connection contends during
//! a short grace window after the first was adopted and is dropped
//! once the window has run out. Routes that lose their connection
//! reconnect with bounded exponential backoff while they stay enabled.
//! A verified-but-wrong signature key marks the route failed without
//! touching the others.

use crate::commserver;
use crate::connection::{Connection, WsTransport};
use crate::error::{NetError, Result};
use crate::handshake::{self, HandshakeConfig, LocalIdentity, PeerIdentity};
use crate::plugins::start_keepalive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};

/// One concrete way of reaching (or being reached by) the peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteSpec {
    /// Dial a websocket url.
    OutgoingDirect { url: String },
    /// Listen on `host:port` for the peer to dial us.
    IncomingDirect { addr: String },
    /// Dial through a comm-server relay.
    OutgoingCommServer { url: String },
    /// Register at a comm-server relay and wait for handovers.
    IncomingCommServer { url: String },
}

/// The identity of a group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupKey {
    pub group: String,
    pub local_key: [u8; 32],
    pub remote_key: [u8; 32],
}

#[derive(Clone, Debug)]
pub enum GroupEvent {
    Connected {
        route: usize,
        peer: PeerIdentity,
        connection: Connection,
    },
    Disconnected {
        reason: String,
    },
    RouteFailed {
        route: usize,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct GroupOptions {
    pub reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Grace window after a connection is adopted. A duplicate arriving
    /// inside the window is held until the window closes and only then
    /// dropped (or promoted, when the adopted connection already died);
    /// later arrivals are dropped on sight.
    pub dedup_grace: Duration,
    /// Keepalive ping interval on established connections.
    pub keepalive: Option<Duration>,
    /// Pin for the peer's person sign key.
    pub expected_person_sign_key: Option<[u8; 32]>,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            dedup_grace: Duration::from_secs(1),
            keepalive: Some(Duration::from_secs(25)),
            expected_person_sign_key: None,
        }
    }
}

struct RouteState {
    spec: RouteSpec,
    disabled: AtomicBool,
    failed: AtomicBool,
}

struct ActiveConnection {
    connection: Connection,
    established: tokio::time::Instant,
}

impl ActiveConnection {
    fn in_grace_window(&self, grace: Duration) -> bool {
        self.established.elapsed() < grace
    }
}

struct GroupShared {
    key: GroupKey,
    local: LocalIdentity,
    options: GroupOptions,
    routes: Vec<RouteState>,
    active: Mutex<Option<ActiveConnection>>,
    /// The duplicate-drop handle: the timer spanning the dedup grace
    /// window of the most recently adopted connection.
    duplicate_drop: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    events: mpsc::Sender<GroupEvent>,
    stop: watch::Receiver<bool>,
}

pub struct ConnectionRoutesGroup {
    shared: Arc<GroupShared>,
    stop: watch::Sender<bool>,
    events: parking_lot::Mutex<Option<mpsc::Receiver<GroupEvent>>>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ConnectionRoutesGroup {
    pub fn new(
        key: GroupKey,
        local: LocalIdentity,
        routes: Vec<RouteSpec>,
        options: GroupOptions,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(64);
        let shared = Arc::new(GroupShared {
            key,
            local,
            options,
            routes: routes
                .into_iter()
                .map(|spec| RouteState {
                    spec,
                    disabled: AtomicBool::new(false),
                    failed: AtomicBool::new(false),
                })
                .collect(),
            active: Mutex::new(None),
            duplicate_drop: parking_lot::Mutex::new(None),
            events: events_tx,
            stop: stop_rx,
        });
        Self {
            shared,
            stop: stop_tx,
            events: parking_lot::Mutex::new(Some(events_rx)),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// The group's event stream; can be taken once.
    pub fn events(&self) -> Option<mpsc::Receiver<GroupEvent>> {
        self.events.lock().take()
    }

    pub fn key(&self) -> &GroupKey {
        &self.shared.key
    }

    /// Starts all enabled routes.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for index in 0..self.shared.routes.len() {
            let shared = self.shared.clone();
            tasks.push(tokio::spawn(run_route(shared, index)));
        }
    }

    /// Administratively disables one route; its connection, if active,
    /// is closed.
    pub async fn disable_route(&self, index: usize) {
        if let Some(route) = self.shared.routes.get(index) {
            route.disabled.store(true, Ordering::SeqCst);
        }
        if let Some(active) = self.shared.active.lock().await.take() {
            active.connection.close("route-disabled").await;
        }
    }

    pub fn route_failed(&self, index: usize) -> bool {
        self.shared
            .routes
            .get(index)
            .map(|r| r.failed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Stops all routes and closes the active connection.
    pub async fn stop(&self) {
        self.stop.send(true).ok();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(timer) = self.shared.duplicate_drop.lock().take() {
            timer.abort();
        }
        if let Some(active) = self.shared.active.lock().await.take() {
            active.connection.close("stopped").await;
        }
    }
}

fn handshake_config(shared: &GroupShared) -> HandshakeConfig {
    let mut config =
        HandshakeConfig::new(shared.key.group.clone()).expect_instance_key(shared.key.remote_key);
    if let Some(pin) = shared.options.expected_person_sign_key {
        config = config.expect_person_sign_key(pin);
    }
    config
}

async fn run_route(shared: Arc<GroupShared>, index: usize) {
    match shared.routes[index].spec.clone() {
        RouteSpec::OutgoingDirect { url } => run_outgoing(shared, index, url, false).await,
        RouteSpec::OutgoingCommServer { url } => run_outgoing(shared, index, url, true).await,
        RouteSpec::IncomingDirect { addr } => run_incoming_direct(shared, index, addr).await,
        RouteSpec::IncomingCommServer { url } => run_incoming_commserver(shared, index, url).await,
    }
}

/// Hands a freshly handshaken connection to the group. At most one
/// connection stays active. A duplicate arriving while the active
/// connection's grace window is still open waits the window out and is
/// promoted if the active connection died in the meantime; otherwise,
/// and always after the window, the duplicate is closed and dropped.
async fn adopt(
    shared: &Arc<GroupShared>,
    index: usize,
    connection: Connection,
    peer: PeerIdentity,
) {
    let grace = shared.options.dedup_grace;
    loop {
        let mut active = shared.active.lock().await;
        match &*active {
            Some(existing) if !existing.connection.is_closed() => {
                if existing.in_grace_window(grace) {
                    // simultaneous open: hold the newcomer until the
                    // window closes, then decide again
                    let remaining = grace.saturating_sub(existing.established.elapsed());
                    drop(active);
                    tokio::time::sleep(remaining).await;
                    continue;
                }
                drop(active);
                tracing::debug!("dropping duplicate connection for {:?}", shared.key.group);
                connection.close("duplicate").await;
                return;
            }
            _ => {
                *active = Some(ActiveConnection {
                    connection: connection.clone(),
                    established: tokio::time::Instant::now(),
                });
                break;
            }
        }
    }
    arm_duplicate_drop(shared);

    if let Some(interval) = shared.options.keepalive {
        start_keepalive(&connection, interval);
    }
    shared
        .events
        .send(GroupEvent::Connected {
            route: index,
            peer,
            connection: connection.clone(),
        })
        .await
        .ok();
    let reason = connection.wait_closed().await;
    {
        let mut active = shared.active.lock().await;
        if matches!(&*active, Some(a) if a.connection.is_closed()) {
            *active = None;
        }
    }
    shared
        .events
        .send(GroupEvent::Disconnected { reason })
        .await
        .ok();
}

/// Re-arms the duplicate-drop handle: a timer spanning the grace window
/// of the connection just adopted. While it runs, contenders wait on
/// the window; once it has run out, they are dropped on sight.
fn arm_duplicate_drop(shared: &Arc<GroupShared>) {
    let grace = shared.options.dedup_grace;
    let group = shared.key.group.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        tracing::trace!("dedup grace window for {:?} closed", group);
    });
    if let Some(previous) = shared.duplicate_drop.lock().replace(timer) {
        previous.abort();
    }
}

/// One dial attempt: connect, handshake, adopt.
async fn attempt_outgoing(shared: &Arc<GroupShared>, index: usize, url: &str) -> Result<()> {
    let connection = commserver::connect(url).await?;
    let peer = handshake::initiate(&connection, &shared.local, &handshake_config(shared)).await?;
    adopt(shared, index, connection, peer).await;
    Ok(())
}

async fn run_outgoing(shared: Arc<GroupShared>, index: usize, url: String, _relayed: bool) {
    let mut stop = shared.stop.clone();
    let mut backoff = shared.options.initial_backoff;
    loop {
        if *stop.borrow() || shared.routes[index].disabled.load(Ordering::SeqCst) {
            return;
        }
        match attempt_outgoing(&shared, index, &url).await {
            Ok(()) => {
                backoff = shared.options.initial_backoff;
            }
            Err(NetError::KeyMismatch) => {
                // impersonation attempt: this route is done
                fail_route(&shared, index, "key-mismatch").await;
                return;
            }
            Err(err) => {
                tracing::debug!("route {} attempt failed: {}", index, err);
            }
        }
        if !shared.options.reconnect {
            fail_route(&shared, index, "reconnect disabled").await;
            return;
        }
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(shared.options.max_backoff);
    }
}

async fn run_incoming_direct(shared: Arc<GroupShared>, index: usize, addr: String) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            fail_route(&shared, index, &format!("bind {}: {}", addr, err)).await;
            return;
        }
    };
    let mut stop = shared.stop.clone();
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => return,
            accepted = listener.accept() => accepted,
        };
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::debug!("accept failed: {}", err);
                continue;
            }
        };
        if shared.routes[index].failed.load(Ordering::SeqCst) {
            return;
        }
        if shared.routes[index].disabled.load(Ordering::SeqCst) {
            continue;
        }
        // handshakes run concurrently so simultaneous opens contend in
        // the group's dedup window rather than in the accept queue
        let shared = shared.clone();
        tokio::spawn(async move {
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(err) => {
                    tracing::debug!("websocket accept failed: {}", err);
                    return;
                }
            };
            let connection = Connection::new(Box::new(WsTransport(ws)));
            match handshake::accept(&connection, &shared.local, &handshake_config(&shared)).await {
                Ok(peer) => adopt(&shared, index, connection, peer).await,
                Err(NetError::KeyMismatch) => {
                    fail_route(&shared, index, "key-mismatch").await;
                }
                Err(err) => tracing::debug!("incoming handshake failed: {}", err),
            }
        });
    }
}

async fn run_incoming_commserver(shared: Arc<GroupShared>, index: usize, url: String) {
    let (connections_tx, mut connections) = mpsc::channel(4);
    let listener = commserver::listen(
        url,
        shared.local.instance_api.clone(),
        connections_tx,
    );
    let mut stop = shared.stop.clone();
    loop {
        let connection = tokio::select! {
            _ = stop.changed() => break,
            connection = connections.recv() => match connection {
                Some(connection) => connection,
                None => break,
            },
        };
        if shared.routes[index].disabled.load(Ordering::SeqCst) {
            continue;
        }
        match handshake::accept(&connection, &shared.local, &handshake_config(&shared)).await {
            Ok(peer) => adopt(&shared, index, connection, peer).await,
            Err(NetError::KeyMismatch) => {
                fail_route(&shared, index, "key-mismatch").await;
                break;
            }
            Err(err) => tracing::debug!("relayed handshake failed: {}", err),
        }
    }
    listener.stop();
}

async fn fail_route(shared: &Arc<GroupShared>, index: usize, reason: &str) {
    shared.routes[index].failed.store(true, Ordering::SeqCst);
    shared
        .events
        .send(GroupEvent::RouteFailed {
            route: index,
            reason: reason.to_owned(),
        })
        .await
        .ok();
}
