//! Chum sync: bidirectional replication of reachable objects and
//! channel heads between two authenticated instances.
//!
//! Both sides advertise their channel heads, then pull the missing
//! object closure: an object imports only once everything it references
//! exists, so received encodings stage until their dependencies arrive
//! and the chain rebuilds bottom-up. When a remote head's closure is
//! complete the channel merges through the linked-list merge. A side
//! reports `chum_done` once it has nothing outstanding; the exchange
//! ends when both have.

use crate::connection::Connection;
use crate::error::{NetError, Result};
use chum_core::{Channels, Error as CoreError, Hash, IdHash};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A channel selected for replication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelSpec {
    pub id: String,
    pub owner: Option<IdHash>,
}

impl ChannelSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: None,
        }
    }

    pub fn owned_by(mut self, owner: IdHash) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// Counters of one chum run.
#[derive(Clone, Debug, Default)]
pub struct ChumProgress {
    pub objects_sent: u64,
    pub objects_received: u64,
    pub channels_merged: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelAdvert {
    id: String,
    owner: Option<String>,
    channel_hash: String,
    head: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChumChannels {
    command: String,
    channels: Vec<ChannelAdvert>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChumRequest {
    command: String,
    hashes: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectPayload {
    hash: String,
    encoded: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChumObjects {
    command: String,
    objects: Vec<ObjectPayload>,
    missing: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChumDone {
    command: String,
}

const READ_TIMEOUT: Duration = Duration::from_secs(30);

struct ChumState<'a> {
    connection: &'a Connection,
    channels: &'a Channels,
    specs: &'a [ChannelSpec],
    progress: ChumProgress,
    /// encodings waiting for their dependencies, by hash hex
    staging: HashMap<String, String>,
    /// hashes requested from the peer and not yet answered
    outstanding: HashSet<String>,
    /// remote heads waiting for their closure
    pending: Vec<(ChannelSpec, IdHash, Option<Hash>)>,
    adverts_received: bool,
    sent_done: bool,
    remote_done: bool,
}

/// Runs one side of a chum exchange over an established, handshaken
/// connection. Both peers run this concurrently.
pub async fn run_chum(
    connection: &Connection,
    channels: &Channels,
    specs: &[ChannelSpec],
) -> Result<ChumProgress> {
    let mut state = ChumState {
        connection,
        channels,
        specs,
        progress: ChumProgress::default(),
        staging: HashMap::new(),
        outstanding: HashSet::new(),
        pending: Vec::new(),
        adverts_received: false,
        sent_done: false,
        remote_done: false,
    };
    state.advertise().await?;
    loop {
        state.try_merge_pending().await;
        state.resolve_stuck();
        if state.adverts_received
            && !state.sent_done
            && state.outstanding.is_empty()
            && state.pending.is_empty()
        {
            connection
                .send_json(&ChumDone {
                    command: "chum_done".to_owned(),
                })
                .await?;
            state.sent_done = true;
        }
        if state.sent_done && state.remote_done {
            break;
        }
        let text = connection.reader().read_text(Some(READ_TIMEOUT)).await?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        match value.get("command").and_then(|c| c.as_str()) {
            Some("chum_channels") => {
                let message: ChumChannels = serde_json::from_value(value)?;
                state.handle_adverts(message.channels).await?;
            }
            Some("chum_request") => {
                let message: ChumRequest = serde_json::from_value(value)?;
                state.handle_request(message.hashes).await?;
            }
            Some("chum_objects") => {
                let message: ChumObjects = serde_json::from_value(value)?;
                state.handle_objects(message).await?;
            }
            Some("chum_done") => {
                state.remote_done = true;
            }
            other => {
                return Err(NetError::handshake(format!(
                    "unexpected chum command {:?}",
                    other
                )));
            }
        }
    }
    Ok(state.progress)
}

impl ChumState<'_> {
    async fn advertise(&mut self) -> Result<()> {
        let mut adverts = Vec::with_capacity(self.specs.len());
        for spec in self.specs {
            let channel_hash = self
                .channels
                .id_of(&spec.id, spec.owner)
                .map_err(NetError::Core)?;
            let head = self
                .channels
                .head(&spec.id, spec.owner)
                .await
                .map_err(NetError::Core)?;
            adverts.push(ChannelAdvert {
                id: spec.id.clone(),
                owner: spec.owner.map(|o| o.to_hex()),
                channel_hash: channel_hash.to_hex(),
                head: head.map(|h| h.to_hex()),
            });
        }
        self.connection
            .send_json(&ChumChannels {
                command: "chum_channels".to_owned(),
                channels: adverts,
            })
            .await
    }

    async fn handle_adverts(&mut self, adverts: Vec<ChannelAdvert>) -> Result<()> {
        self.adverts_received = true;
        let mut wanted = Vec::new();
        for advert in adverts {
            let spec = match self.specs.iter().find(|s| {
                s.id == advert.id && s.owner.map(|o| o.to_hex()) == advert.owner
            }) {
                Some(spec) => spec.clone(),
                None => {
                    tracing::debug!("peer advertised unknown channel {:?}", advert.id);
                    continue;
                }
            };
            let remote_channel =
                IdHash::from_hex(&advert.channel_hash).map_err(NetError::Core)?;
            let head = match &advert.head {
                Some(hex) => Some(Hash::from_hex(hex).map_err(NetError::Core)?),
                None => None,
            };
            if let Some(head) = head {
                if !self.channels.store().exists(&head).await {
                    wanted.push(head.to_hex());
                }
                self.pending.push((spec, remote_channel, Some(head)));
            }
        }
        self.request(wanted).await
    }

    async fn handle_request(&mut self, hashes: Vec<String>) -> Result<()> {
        let store = self.channels.store();
        let mut objects = Vec::new();
        let mut missing = Vec::new();
        for hex in hashes {
            let hash = match Hash::from_hex(&hex) {
                Ok(hash) => hash,
                Err(_) => {
                    missing.push(hex);
                    continue;
                }
            };
            match store.get_encoded(&hash).await {
                Ok(encoded) => {
                    self.progress.objects_sent += 1;
                    objects.push(ObjectPayload { hash: hex, encoded });
                }
                Err(CoreError::NotFound(_)) => missing.push(hex),
                Err(err) => return Err(NetError::Core(err)),
            }
        }
        self.connection
            .send_json(&ChumObjects {
                command: "chum_objects".to_owned(),
                objects,
                missing,
            })
            .await
    }

    async fn handle_objects(&mut self, message: ChumObjects) -> Result<()> {
        for hex in message.missing {
            self.outstanding.remove(&hex);
            self.progress
                .errors
                .push(format!("peer is missing {}", hex));
        }
        for object in message.objects {
            self.outstanding.remove(&object.hash);
            self.staging.insert(object.hash, object.encoded);
        }
        self.drain_staging().await
    }

    /// Imports every staged object whose references resolve, requesting
    /// the references that are still missing. Repeats until a pass
    /// makes no progress.
    async fn drain_staging(&mut self) -> Result<()> {
        let store = self.channels.store();
        let recipes = store.recipes().clone();
        let mut wanted = HashSet::new();
        loop {
            let mut imported = Vec::new();
            for (hex, encoded) in &self.staging {
                let obj = match chum_core::decode(encoded, &recipes) {
                    Ok(obj) => obj,
                    Err(err) => {
                        self.progress
                            .errors
                            .push(format!("undecodable object {}: {}", hex, err));
                        imported.push(hex.clone());
                        continue;
                    }
                };
                let mut ready = true;
                for target in obj.references() {
                    if let chum_core::RefTarget::Obj(hash) = target {
                        if !store.exists(&hash).await {
                            let target_hex = hash.to_hex();
                            if !self.staging.contains_key(&target_hex) {
                                wanted.insert(target_hex);
                            }
                            ready = false;
                        }
                    }
                }
                if !ready {
                    continue;
                }
                match store.import_encoded(encoded).await {
                    Ok(_) => {
                        self.progress.objects_received += 1;
                        imported.push(hex.clone());
                    }
                    Err(err) => {
                        self.progress
                            .errors
                            .push(format!("import of {} failed: {}", hex, err));
                        imported.push(hex.clone());
                    }
                }
            }
            if imported.is_empty() {
                break;
            }
            for hex in imported {
                self.staging.remove(&hex);
            }
        }
        let wanted: Vec<String> = wanted
            .into_iter()
            .filter(|hex| !self.outstanding.contains(hex))
            .collect();
        self.request(wanted).await
    }

    /// Gives up on work that can no longer make progress: staged
    /// objects whose dependencies the peer could not provide, and
    /// channels whose closure will therefore never complete.
    fn resolve_stuck(&mut self) {
        if !self.outstanding.is_empty() {
            return;
        }
        for hex in std::mem::take(&mut self.staging).into_keys() {
            self.progress
                .errors
                .push(format!("dependencies of {} unavailable", hex));
        }
        for (spec, _, _) in std::mem::take(&mut self.pending) {
            self.progress
                .errors
                .push(format!("closure of {:?} incomplete", spec.id));
        }
    }

    async fn request(&mut self, hashes: Vec<String>) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        for hex in &hashes {
            self.outstanding.insert(hex.clone());
        }
        self.connection
            .send_json(&ChumRequest {
                command: "chum_request".to_owned(),
                hashes,
            })
            .await
    }

    /// Merges every pending channel whose closure has arrived.
    async fn try_merge_pending(&mut self) {
        let mut remaining = Vec::new();
        for (spec, remote_channel, head) in self.pending.drain(..) {
            let complete = match head {
                Some(head) => self.channels.store().exists(&head).await,
                None => true,
            };
            if !complete {
                remaining.push((spec, remote_channel, head));
                continue;
            }
            match self
                .channels
                .merge_remote_head(&spec.id, spec.owner, remote_channel, head)
                .await
            {
                Ok(_) => {
                    self.progress.channels_merged += 1;
                    tracing::debug!("merged channel {:?}", spec.id);
                }
                Err(err) => {
                    self.progress
                        .errors
                        .push(format!("merge of {:?} failed: {}", spec.id, err));
                }
            }
        }
        self.pending = remaining;
    }
}
