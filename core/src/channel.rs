//! Append-only channel linked lists.
//!
//! A channel is a versioned `ChannelInfo` object whose `head` points at
//! a chain of `LinkedListEntry` objects, each wrapping a `CreationTime`
//! envelope. The chain's `(creationTime, creationTimeHash)` sequence is
//! non-increasing from head to tail, and an entry is only written after
//! its `previous` exists.

use crate::codec;
use crate::error::{Error, Result};
use crate::hash::{Hash, IdHash};
use crate::store::{now_ms, KeyedLocks, ObjectStore};
use crate::value::{Obj, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One loaded chain entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelEntry {
    pub entry_hash: Hash,
    /// Timestamp of the creation-time envelope, milliseconds.
    pub time: u64,
    /// Hash of the envelope; the ordering tie-break.
    pub time_hash: Hash,
    /// The wrapped data object.
    pub data: Hash,
    pub metadata: Vec<Hash>,
}

impl ChannelEntry {
    fn key(&self) -> (u64, Hash) {
        (self.time, self.time_hash)
    }
}

fn entry_obj(time_hash: Hash, metadata: &[Hash], previous: Option<Hash>) -> Obj {
    let mut obj = Obj::new("LinkedListEntry").with("data", Value::ObjRef(time_hash));
    if !metadata.is_empty() {
        obj.set(
            "metadata",
            Value::Array(metadata.iter().map(|h| Value::ObjRef(*h)).collect()),
        );
    }
    if let Some(previous) = previous {
        obj.set("previous", Value::ObjRef(previous));
    }
    obj
}

/// Loads one entry, returning it together with its `previous` link.
async fn load_entry(store: &ObjectStore, hash: Hash) -> Result<(ChannelEntry, Option<Hash>)> {
    let entry = store.get_object(&hash).await?;
    let time_hash = entry
        .get("data")
        .and_then(Value::as_obj_ref)
        .ok_or_else(|| Error::codec("linked list entry without data"))?;
    let previous = entry.get("previous").and_then(Value::as_obj_ref);
    let metadata = match entry.get("metadata") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_obj_ref).collect(),
        _ => Vec::new(),
    };
    let envelope = store.get_object(&time_hash).await?;
    let time = envelope
        .get("timestamp")
        .and_then(Value::as_integer)
        .ok_or_else(|| Error::codec("creation time without timestamp"))? as u64;
    let data = envelope
        .get("data")
        .and_then(Value::as_obj_ref)
        .ok_or_else(|| Error::codec("creation time without data"))?;
    Ok((
        ChannelEntry {
            entry_hash: hash,
            time,
            time_hash,
            data,
            metadata,
        },
        previous,
    ))
}

/// Walks a chain head to tail.
pub async fn chain_entries(store: &ObjectStore, head: Option<Hash>) -> Result<Vec<ChannelEntry>> {
    let mut out = Vec::new();
    let mut cursor = head;
    while let Some(hash) = cursor {
        let (entry, previous) = load_entry(store, hash).await?;
        out.push(entry);
        cursor = previous;
    }
    Ok(out)
}

/// Rebuilds a chain by appending `entries` (ascending key order) on top
/// of `tail`, returning the new head.
async fn rebuild(
    store: &ObjectStore,
    tail: Option<Hash>,
    entries: BTreeMap<(u64, Hash), Vec<Hash>>,
) -> Result<Option<Hash>> {
    let mut prev = tail;
    for ((_, time_hash), metadata) in entries {
        let result = store
            .store_unversioned(&entry_obj(time_hash, &metadata, prev))
            .await?;
        prev = Some(result.hash);
    }
    Ok(prev)
}

/// Merges two chain heads into one.
///
/// Both chains are walked simultaneously, always advancing the side
/// with the strictly larger `(creationTime, creationTimeHash)` tuple
/// and collecting the skipped envelopes, until the walkers land on the
/// same entry. That entry's tail is the unchanged common history; the
/// collected envelopes are rebuilt on top of it in ascending order.
pub async fn merge_chain_heads(
    store: &ObjectStore,
    a: Option<Hash>,
    b: Option<Hash>,
) -> Result<Option<Hash>> {
    if a == b || b.is_none() {
        return Ok(a);
    }
    if a.is_none() {
        return Ok(b);
    }
    let mut collected: BTreeMap<(u64, Hash), Vec<Hash>> = BTreeMap::new();
    let mut cur_a = a;
    let mut cur_b = b;
    let common = loop {
        if cur_a == cur_b {
            break cur_a;
        }
        match (cur_a, cur_b) {
            (Some(ha), Some(hb)) => {
                let (ea, prev_a) = load_entry(store, ha).await?;
                let (eb, prev_b) = load_entry(store, hb).await?;
                if ea.key() > eb.key() {
                    collected.entry(ea.key()).or_insert(ea.metadata);
                    cur_a = prev_a;
                } else if eb.key() > ea.key() {
                    collected.entry(eb.key()).or_insert(eb.metadata);
                    cur_b = prev_b;
                } else {
                    // same envelope reached through different histories
                    collected.entry(ea.key()).or_insert(ea.metadata);
                    cur_a = prev_a;
                    cur_b = prev_b;
                }
            }
            (Some(ha), None) => {
                let (ea, prev_a) = load_entry(store, ha).await?;
                collected.entry(ea.key()).or_insert(ea.metadata);
                cur_a = prev_a;
            }
            (None, Some(hb)) => {
                let (eb, prev_b) = load_entry(store, hb).await?;
                collected.entry(eb.key()).or_insert(eb.metadata);
                cur_b = prev_b;
            }
            (None, None) => break None,
        }
    };
    rebuild(store, common, collected).await
}

/// Inserts one envelope into a chain, returning the new head.
async fn insert_into_chain(
    store: &ObjectStore,
    head: Option<Hash>,
    data: Hash,
    metadata: Vec<Hash>,
    time: u64,
) -> Result<Hash> {
    let envelope = Obj::new("CreationTime")
        .with("timestamp", time as i64)
        .with("data", Value::ObjRef(data));
    let time_hash = store.store_unversioned(&envelope).await?.hash;
    let key = (time, time_hash);

    // collect entries newer than the envelope, stop at the splice point
    let mut collected: BTreeMap<(u64, Hash), Vec<Hash>> = BTreeMap::new();
    let mut cursor = head;
    while let Some(hash) = cursor {
        let (entry, previous) = load_entry(store, hash).await?;
        if entry.key() == key {
            // the envelope is already in the chain
            return head.ok_or_else(|| Error::codec("empty chain"));
        }
        if entry.key() < key {
            break;
        }
        collected.entry(entry.key()).or_insert(entry.metadata);
        cursor = previous;
    }
    let inserted = store
        .store_unversioned(&entry_obj(time_hash, &metadata, cursor))
        .await?;
    let head = rebuild(store, Some(inserted.hash), collected).await?;
    head.ok_or_else(|| Error::codec("empty chain"))
}

fn channel_info_obj(id: &str, owner: Option<IdHash>) -> Obj {
    let mut obj = Obj::new("ChannelInfo").with("id", id);
    if let Some(owner) = owner {
        obj.set("owner", Value::IdRef(owner));
    }
    obj
}

/// Channel registry over an object store. Inserts into the same channel
/// serialize; different channels are independent.
#[derive(Clone)]
pub struct Channels {
    store: ObjectStore,
    locks: Arc<KeyedLocks>,
}

impl Channels {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            store,
            locks: Arc::new(KeyedLocks::default()),
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The id-hash identifying the `(channelId, owner)` pair.
    pub fn id_of(&self, id: &str, owner: Option<IdHash>) -> Result<IdHash> {
        self.channel_id(id, owner)
    }

    fn channel_id(&self, id: &str, owner: Option<IdHash>) -> Result<IdHash> {
        codec::id_hash_of(&channel_info_obj(id, owner), self.store.recipes())
    }

    /// Creates a channel without entries. Idempotent.
    pub async fn create(
        &self,
        id: &str,
        owner: Option<IdHash>,
    ) -> Result<IdHash> {
        let result = self.store.store_versioned(&channel_info_obj(id, owner)).await?;
        Ok(result.id_hash)
    }

    /// Appends a data object to the channel. `time` defaults to the
    /// wall clock. Returns the new chain head.
    pub async fn insert(
        &self,
        id: &str,
        owner: Option<IdHash>,
        data: Hash,
        metadata: Vec<Hash>,
        time: Option<u64>,
    ) -> Result<Hash> {
        let channel = self.channel_id(id, owner)?;
        let lock = self.locks.get(channel.as_ref());
        let _guard = lock.lock().await;

        let head = self.head_unlocked(id, owner).await?;
        let time = time.unwrap_or_else(now_ms);
        let new_head = insert_into_chain(&self.store, head, data, metadata, time).await?;
        let mut info = channel_info_obj(id, owner);
        info.set("head", Value::ObjRef(new_head));
        self.store.store_versioned(&info).await?;
        Ok(new_head)
    }

    async fn head_unlocked(
        &self,
        id: &str,
        owner: Option<IdHash>,
    ) -> Result<Option<Hash>> {
        let channel = self.channel_id(id, owner)?;
        match self.store.get_by_id_hash(&channel).await {
            Ok((_, info)) => Ok(info.get("head").and_then(Value::as_obj_ref)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The current chain head of a channel.
    pub async fn head(
        &self,
        id: &str,
        owner: Option<IdHash>,
    ) -> Result<Option<Hash>> {
        self.head_unlocked(id, owner).await
    }

    /// All entries of a channel, head to tail.
    pub async fn entries(
        &self,
        id: &str,
        owner: Option<IdHash>,
    ) -> Result<Vec<ChannelEntry>> {
        let head = self.head_unlocked(id, owner).await?;
        chain_entries(&self.store, head).await
    }

    /// Merges a replicated head of the same channel into the local one.
    /// The remote channel identity must match, otherwise the chains are
    /// disjoint by construction.
    pub async fn merge_remote_head(
        &self,
        id: &str,
        owner: Option<IdHash>,
        remote_channel: IdHash,
        remote_head: Option<Hash>,
    ) -> Result<Option<Hash>> {
        let channel = self.channel_id(id, owner)?;
        if remote_channel != channel {
            return Err(Error::DisjointChannels);
        }
        let lock = self.locks.get(channel.as_ref());
        let _guard = lock.lock().await;

        let local = self.head_unlocked(id, owner).await?;
        let merged = merge_chain_heads(&self.store, local, remote_head).await?;
        if merged != local {
            let mut info = channel_info_obj(id, owner);
            if let Some(head) = merged {
                info.set("head", Value::ObjRef(head));
            }
            self.store.store_versioned(&info).await?;
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{ItemType, Recipe, RecipeRegistry, Rule};

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let recipes = RecipeRegistry::new();
        recipes
            .register(Recipe::new(
                "Note",
                vec![Rule::new("text", ItemType::String)],
            ))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), recipes).unwrap();
        (dir, store)
    }

    async fn note(store: &ObjectStore, text: &str) -> Hash {
        store
            .store_unversioned(&Obj::new("Note").with("text", text))
            .await
            .unwrap()
            .hash
    }

    #[tokio::test]
    async fn insert_into_empty_channel_yields_single_entry() {
        let (_dir, store) = store();
        let channels = Channels::new(store.clone());
        let data = note(&store, "first").await;
        let head = channels
            .insert("feed", None, data, vec![], Some(100))
            .await
            .unwrap();
        let entries = channels.entries("feed", None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_hash, head);
        assert_eq!(entries[0].time, 100);
        assert_eq!(entries[0].data, data);
        // the single entry has no previous
        let obj = store.get_object(&head).await.unwrap();
        assert!(obj.get("previous").is_none());
    }

    #[tokio::test]
    async fn chain_times_are_non_increasing() {
        let (_dir, store) = store();
        let channels = Channels::new(store.clone());
        for (text, time) in [("a", 200), ("b", 100), ("c", 300)] {
            let data = note(&store, text).await;
            channels
                .insert("feed", None, data, vec![], Some(time))
                .await
                .unwrap();
        }
        let times: Vec<u64> = channels
            .entries("feed", None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.time)
            .collect();
        assert_eq!(times, vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn merge_interleaves_two_sides() {
        let (_dir, store) = store();
        let channels = Channels::new(store.clone());
        // side A: 100, 200, 300
        let mut head_a = None;
        for time in [100, 200, 300] {
            let data = note(&store, &format!("a{}", time)).await;
            head_a = Some(
                insert_into_chain(&store, head_a, data, vec![], time)
                    .await
                    .unwrap(),
            );
        }
        // side B: 150, 250
        let mut head_b = None;
        for time in [150, 250] {
            let data = note(&store, &format!("b{}", time)).await;
            head_b = Some(
                insert_into_chain(&store, head_b, data, vec![], time)
                    .await
                    .unwrap(),
            );
        }
        let merged = merge_chain_heads(&store, head_a, head_b).await.unwrap();
        let times: Vec<u64> = chain_entries(&store, merged)
            .await
            .unwrap()
            .iter()
            .map(|e| e.time)
            .collect();
        assert_eq!(times, vec![300, 250, 200, 150, 100]);

        // commutative and idempotent on the set of envelopes
        let swapped = merge_chain_heads(&store, head_b, head_a).await.unwrap();
        assert_eq!(merged, swapped);
        let again = merge_chain_heads(&store, merged, head_b).await.unwrap();
        assert_eq!(again, merged);
    }

    #[tokio::test]
    async fn merge_extension_fast_forwards() {
        let (_dir, store) = store();
        let data1 = note(&store, "one").await;
        let tail = insert_into_chain(&store, None, data1, vec![], 100)
            .await
            .unwrap();
        let data2 = note(&store, "two").await;
        let head = insert_into_chain(&store, Some(tail), data2, vec![], 200)
            .await
            .unwrap();
        let merged = merge_chain_heads(&store, Some(head), Some(tail))
            .await
            .unwrap();
        assert_eq!(merged, Some(head));
    }

    #[tokio::test]
    async fn duplicate_envelope_is_dropped() {
        let (_dir, store) = store();
        let channels = Channels::new(store.clone());
        let data = note(&store, "same").await;
        let head1 = channels
            .insert("feed", None, data, vec![], Some(100))
            .await
            .unwrap();
        let head2 = channels
            .insert("feed", None, data, vec![], Some(100))
            .await
            .unwrap();
        assert_eq!(head1, head2);
        assert_eq!(channels.entries("feed", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mismatched_channel_identity_is_disjoint() {
        let (_dir, store) = store();
        let channels = Channels::new(store.clone());
        let other = channels.create("other", None).await.unwrap();
        assert!(matches!(
            channels.merge_remote_head("feed", None, other, None).await,
            Err(Error::DisjointChannels)
        ));
    }
}
