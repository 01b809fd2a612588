//! File-backed content-addressed object store.
//!
//! Layout under the instance base directory: `objects/` (one file per
//! content hash, filename = hex, content = canonical encoding),
//! `blobs/`, `tmp/` (staging for atomic renames), `private/`, `rmaps/`
//! (reverse-map index files `<targetHex>.<Type>`), `vmaps/` (version
//! DAG per id-hash, one JSON node per line). All writes go to `tmp/`
//! first and are renamed into place, so a failed write leaves nothing
//! behind.

use crate::codec;
use crate::error::{Error, Result};
use crate::hash::{sha256, Hash, IdHash};
use crate::recipe::RecipeRegistry;
use crate::value::{Obj, RefTarget};
use crate::version::{VersionGraph, VersionNode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Outcome of a store operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteStatus {
    New,
    Exists,
    Updated,
}

#[derive(Clone, Copy, Debug)]
pub struct StoreResult {
    pub hash: Hash,
    pub status: WriteStatus,
}

#[derive(Clone, Copy, Debug)]
pub struct VersionedResult {
    pub id_hash: IdHash,
    pub hash: Hash,
    pub status: WriteStatus,
}

/// Hands out one async mutex per 32-byte key, so writes to the same
/// hash serialize while unrelated writes proceed.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    map: Mutex<HashMap<[u8; 32], Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) fn get(&self, key: &[u8; 32]) -> Arc<tokio::sync::Mutex<()>> {
        self.map.lock().entry(*key).or_default().clone()
    }
}

struct StoreInner {
    base: PathBuf,
    recipes: RecipeRegistry,
    write_locks: KeyedLocks,
    id_locks: KeyedLocks,
    rmap_locks: KeyedLocks,
    tmp_seq: AtomicU64,
}

/// The shared object store of one instance.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ObjectStore {
    /// Opens (creating if necessary) a store under `base`.
    pub fn open(base: impl Into<PathBuf>, recipes: RecipeRegistry) -> Result<Self> {
        let base = base.into();
        for dir in ["objects", "blobs", "tmp", "private", "rmaps", "vmaps"] {
            std::fs::create_dir_all(base.join(dir))?;
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                base,
                recipes,
                write_locks: KeyedLocks::default(),
                id_locks: KeyedLocks::default(),
                rmap_locks: KeyedLocks::default(),
                tmp_seq: AtomicU64::new(0),
            }),
        })
    }

    pub fn recipes(&self) -> &RecipeRegistry {
        &self.inner.recipes
    }

    pub fn base(&self) -> &Path {
        &self.inner.base
    }

    fn object_path(&self, hash: &Hash) -> PathBuf {
        self.inner.base.join("objects").join(hash.to_hex())
    }

    fn blob_path(&self, hash: &Hash) -> PathBuf {
        self.inner.base.join("blobs").join(hash.to_hex())
    }

    fn rmap_path(&self, target_hex: &str, referring_type: &str) -> PathBuf {
        self.inner
            .base
            .join("rmaps")
            .join(format!("{}.{}", target_hex, referring_type))
    }

    fn vmap_path(&self, id: &IdHash) -> PathBuf {
        self.inner.base.join("vmaps").join(id.to_hex())
    }

    /// Write-to-tmp then rename. Retried once on io failure.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        match self.write_atomic_once(path, bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!("write {} failed, retrying once: {}", path.display(), err);
                self.write_atomic_once(path, bytes).await
            }
        }
    }

    async fn write_atomic_once(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let seq = self.inner.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::codec("bad store path"))?;
        let tmp = self.inner.base.join("tmp").join(format!("{}.{}", name, seq));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Stores an immutable object identified only by its content hash.
    /// Idempotent: an identical object is a no-op reporting `Exists`.
    pub async fn store_unversioned(&self, obj: &Obj) -> Result<StoreResult> {
        let recipe = self.inner.recipes.get(obj.type_name())?;
        if recipe.has_id() {
            return Err(Error::codec(format!(
                "{} is versioned, use store_versioned",
                recipe.name
            )));
        }
        let encoded = codec::encode(obj, &self.inner.recipes)?;
        let hash = Hash::digest(encoded.as_bytes());
        let status = self.write_object(obj, &encoded, hash).await?;
        Ok(StoreResult { hash, status })
    }

    /// Stores a new version of an object identified by its id-hash,
    /// linking the previous current version.
    pub async fn store_versioned(&self, obj: &Obj) -> Result<VersionedResult> {
        self.store_versioned_at(obj, now_ms()).await
    }

    /// As [`store_versioned`](Self::store_versioned) with an explicit
    /// version creation time.
    pub async fn store_versioned_at(&self, obj: &Obj, time: u64) -> Result<VersionedResult> {
        let recipe = self.inner.recipes.get(obj.type_name())?;
        if !recipe.has_id() {
            return Err(Error::codec(format!(
                "{} has no id fields, use store_unversioned",
                recipe.name
            )));
        }
        let id_hash = codec::id_hash_of(obj, &self.inner.recipes)?;
        let id_lock = self.inner.id_locks.get(id_hash.as_ref());
        let _guard = id_lock.lock().await;

        let encoded = codec::encode(obj, &self.inner.recipes)?;
        let hash = Hash::digest(encoded.as_bytes());
        let graph = self.version_graph(&id_hash).await?;
        let current = graph.current();
        if current == Some(hash) {
            return Ok(VersionedResult {
                id_hash,
                hash,
                status: WriteStatus::Exists,
            });
        }
        self.write_object(obj, &encoded, hash).await?;
        self.append_version_node(
            &id_hash,
            &VersionNode {
                hash,
                previous: current.into_iter().collect(),
                time,
            },
        )
        .await?;
        let status = if current.is_some() {
            WriteStatus::Updated
        } else {
            WriteStatus::New
        };
        Ok(VersionedResult {
            id_hash,
            hash,
            status,
        })
    }

    /// Writes the object file and its reverse-map entries under the
    /// per-hash write lock. Fails without side effects when a reference
    /// does not resolve.
    async fn write_object(&self, obj: &Obj, encoded: &str, hash: Hash) -> Result<WriteStatus> {
        let write_lock = self.inner.write_locks.get(hash.as_ref());
        let _guard = write_lock.lock().await;
        let path = self.object_path(&hash);
        if path_exists(&path).await {
            return Ok(WriteStatus::Exists);
        }
        for target in obj.references() {
            match target {
                RefTarget::Obj(h) => {
                    if !path_exists(&self.object_path(&h)).await {
                        return Err(Error::DanglingReference {
                            referrer: hash.to_hex(),
                            target: h.to_hex(),
                        });
                    }
                }
                RefTarget::Id(id) => {
                    if !path_exists(&self.vmap_path(&id)).await {
                        return Err(Error::DanglingReference {
                            referrer: hash.to_hex(),
                            target: id.to_hex(),
                        });
                    }
                }
                // blob and clob references are checked lazily on read
                RefTarget::Clob(_) | RefTarget::Blob(_) => {}
            }
        }
        self.write_atomic(&path, encoded.as_bytes()).await?;
        tracing::debug!("stored {} {}", obj.type_name(), hash);
        self.update_reverse_maps(obj, hash).await?;
        Ok(WriteStatus::New)
    }

    /// Reverse-map maintenance for the fields the recipe marks. Runs in
    /// the forward write's critical section; each target file is guarded
    /// by its own lock so concurrent referrers serialize per target.
    async fn update_reverse_maps(&self, obj: &Obj, own: Hash) -> Result<()> {
        let recipe = self.inner.recipes.get(obj.type_name())?;
        for itemprop in &recipe.reverse_maps {
            for target in obj.field_references(itemprop) {
                let target_hex = match target {
                    RefTarget::Obj(h) | RefTarget::Clob(h) | RefTarget::Blob(h) => h.to_hex(),
                    RefTarget::Id(h) => h.to_hex(),
                };
                let key = match target {
                    RefTarget::Obj(h) | RefTarget::Clob(h) | RefTarget::Blob(h) => *h.as_ref(),
                    RefTarget::Id(h) => *h.as_ref(),
                };
                let rmap_lock = self.inner.rmap_locks.get(&key);
                let _guard = rmap_lock.lock().await;
                let path = self.rmap_path(&target_hex, &recipe.name);
                let mut entries = match tokio::fs::read_to_string(&path).await {
                    Ok(text) => text.lines().map(str::to_owned).collect::<Vec<_>>(),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                    Err(err) => return Err(err.into()),
                };
                let own_hex = own.to_hex();
                if !entries.contains(&own_hex) {
                    entries.push(own_hex);
                    entries.sort();
                    let mut text = entries.join("\n");
                    text.push('\n');
                    self.write_atomic(&path, text.as_bytes()).await?;
                }
            }
        }
        Ok(())
    }

    /// Hashes of all objects of `referring_type` that reference `target`
    /// through a reverse-mapped field.
    pub async fn reverse_lookup(&self, target: &Hash, referring_type: &str) -> Result<Vec<Hash>> {
        self.reverse_lookup_hex(&target.to_hex(), referring_type)
            .await
    }

    /// Reverse lookup keyed by an id-hash target.
    pub async fn reverse_lookup_id(
        &self,
        target: &IdHash,
        referring_type: &str,
    ) -> Result<Vec<Hash>> {
        self.reverse_lookup_hex(&target.to_hex(), referring_type)
            .await
    }

    async fn reverse_lookup_hex(&self, target_hex: &str, referring_type: &str) -> Result<Vec<Hash>> {
        let path = self.rmap_path(target_hex, referring_type);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        text.lines().map(Hash::from_hex).collect()
    }

    pub async fn exists(&self, hash: &Hash) -> bool {
        path_exists(&self.object_path(hash)).await
    }

    /// Loads and decodes an object, verifying its hash.
    pub async fn get_object(&self, hash: &Hash) -> Result<Obj> {
        let encoded = self.get_encoded(hash).await?;
        codec::decode(&encoded, &self.inner.recipes)
    }

    /// Loads the canonical encoding of an object, verifying that the
    /// content still hashes to the file name.
    pub async fn get_encoded(&self, hash: &Hash) -> Result<String> {
        let path = self.object_path(hash);
        let encoded = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(hash.to_hex()))
            }
            Err(err) => return Err(err.into()),
        };
        let computed = Hash::new(sha256(encoded.as_bytes()));
        if computed != *hash {
            return Err(Error::HashMismatch {
                expected: hash.to_hex(),
                computed: computed.to_hex(),
            });
        }
        Ok(encoded)
    }

    /// Imports a canonical encoding received from a peer. The text must
    /// already be in canonical form.
    pub async fn import_encoded(&self, encoded: &str) -> Result<StoreResult> {
        let obj = codec::decode(encoded, &self.inner.recipes)?;
        let canonical = codec::encode(&obj, &self.inner.recipes)?;
        if canonical != encoded {
            return Err(Error::codec("import is not in canonical form"));
        }
        let hash = Hash::digest(encoded.as_bytes());
        let status = self.write_object(&obj, encoded, hash).await?;
        Ok(StoreResult { hash, status })
    }

    /// The current version of an id-hash with the object it points at.
    pub async fn get_by_id_hash(&self, id: &IdHash) -> Result<(Hash, Obj)> {
        let hash = self
            .current_version(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_hex()))?;
        let obj = self.get_object(&hash).await?;
        Ok((hash, obj))
    }

    pub async fn current_version(&self, id: &IdHash) -> Result<Option<Hash>> {
        Ok(self.version_graph(id).await?.current())
    }

    /// Loads the version DAG of an id-hash.
    pub async fn version_graph(&self, id: &IdHash) -> Result<VersionGraph> {
        let text = match tokio::fs::read_to_string(self.vmap_path(id)).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(VersionGraph::default())
            }
            Err(err) => return Err(err.into()),
        };
        let mut nodes = Vec::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            nodes.push(serde_json::from_str::<VersionNode>(line)?);
        }
        Ok(VersionGraph::from_nodes(nodes))
    }

    /// Appends a version node. Callers hold the id lock or are the merge
    /// driver, which runs under it.
    pub(crate) async fn append_version_node(
        &self,
        id: &IdHash,
        node: &VersionNode,
    ) -> Result<()> {
        let mut line = serde_json::to_string(node)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.vmap_path(id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub(crate) fn id_lock(&self, id: &IdHash) -> Arc<tokio::sync::Mutex<()>> {
        self.inner.id_locks.get(id.as_ref())
    }

    /// Records a version node received from a peer, keeping the DAG
    /// append-only. A node already present is left untouched.
    pub async fn record_version(&self, id: &IdHash, node: &VersionNode) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;
        let graph = self.version_graph(id).await?;
        if !graph.contains(&node.hash) {
            self.append_version_node(id, node).await?;
        }
        Ok(())
    }

    /// Writes an object's content file without touching version maps.
    /// Used by the merge driver for rebuilt subobjects.
    pub(crate) async fn put_object(&self, obj: &Obj) -> Result<Hash> {
        let encoded = codec::encode(obj, &self.inner.recipes)?;
        let hash = Hash::digest(encoded.as_bytes());
        self.write_object(obj, &encoded, hash).await?;
        Ok(hash)
    }

    /// Stores raw bytes addressed by their SHA-256.
    pub async fn store_blob(&self, bytes: &[u8]) -> Result<Hash> {
        let hash = Hash::digest(bytes);
        let lock = self.inner.write_locks.get(hash.as_ref());
        let _guard = lock.lock().await;
        let path = self.blob_path(&hash);
        if !path_exists(&path).await {
            self.write_atomic(&path, bytes).await?;
        }
        Ok(hash)
    }

    pub async fn read_blob(&self, hash: &Hash) -> Result<Vec<u8>> {
        let bytes = match tokio::fs::read(self.blob_path(hash)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(hash.to_hex()))
            }
            Err(err) => return Err(err.into()),
        };
        let computed = Hash::digest(&bytes);
        if computed != *hash {
            return Err(Error::HashMismatch {
                expected: hash.to_hex(),
                computed: computed.to_hex(),
            });
        }
        Ok(bytes)
    }

    /// Stores a UTF-8 stream addressed by the SHA-256 of its bytes.
    pub async fn store_clob(&self, text: &str) -> Result<Hash> {
        self.store_blob(text.as_bytes()).await
    }

    pub async fn read_clob(&self, hash: &Hash) -> Result<String> {
        let bytes = self.read_blob(hash).await?;
        String::from_utf8(bytes).map_err(|_| Error::codec("clob is not valid utf-8"))
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{ItemType, Recipe, Rule};
    use crate::value::Value;

    fn registry() -> RecipeRegistry {
        let recipes = RecipeRegistry::new();
        recipes
            .register(Recipe::new(
                "Note",
                vec![Rule::new("text", ItemType::String)],
            ))
            .unwrap();
        recipes
            .register(
                Recipe::new(
                    "Link",
                    vec![Rule::new(
                        "target",
                        ItemType::ReferenceToObj(vec!["Note".to_owned()]),
                    )],
                )
                .with_reverse_map("target"),
            )
            .unwrap();
        recipes
            .register(Recipe::new(
                "Profile",
                vec![
                    Rule::new("name", ItemType::String).id(),
                    Rule::new("bio", ItemType::String).optional(),
                ],
            ))
            .unwrap();
        recipes
    }

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), registry()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn unversioned_write_is_idempotent() {
        let (_dir, store) = store();
        let note = Obj::new("Note").with("text", "hi");
        let first = store.store_unversioned(&note).await.unwrap();
        assert_eq!(first.status, WriteStatus::New);
        let second = store.store_unversioned(&note).await.unwrap();
        assert_eq!(second.status, WriteStatus::Exists);
        assert_eq!(first.hash, second.hash);
        assert!(store.exists(&first.hash).await);
        assert_eq!(store.get_object(&first.hash).await.unwrap(), note);
    }

    #[tokio::test]
    async fn concurrent_writes_leave_one_file() {
        let (dir, store) = store();
        let note = Obj::new("Note").with("text", "race");
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let note = note.clone();
            tasks.push(tokio::spawn(
                async move { store.store_unversioned(&note).await },
            ));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let files = std::fs::read_dir(dir.path().join("objects")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn dangling_reference_fails_without_side_effects() {
        let (dir, store) = store();
        let link = Obj::new("Link").with("target", Value::ObjRef(Hash::digest(b"nowhere")));
        assert!(matches!(
            store.store_unversioned(&link).await,
            Err(Error::DanglingReference { .. })
        ));
        let files = std::fs::read_dir(dir.path().join("objects")).unwrap().count();
        assert_eq!(files, 0);
    }

    #[tokio::test]
    async fn reverse_lookup_is_exact_and_stable() {
        let (_dir, store) = store();
        let note = store
            .store_unversioned(&Obj::new("Note").with("text", "target"))
            .await
            .unwrap();
        let link = Obj::new("Link").with("target", Value::ObjRef(note.hash));
        let stored = store.store_unversioned(&link).await.unwrap();
        let refs = store.reverse_lookup(&note.hash, "Link").await.unwrap();
        assert_eq!(refs, vec![stored.hash]);
        // storing again leaves the set unchanged
        store.store_unversioned(&link).await.unwrap();
        let refs = store.reverse_lookup(&note.hash, "Link").await.unwrap();
        assert_eq!(refs, vec![stored.hash]);
        assert!(store
            .reverse_lookup(&note.hash, "Note")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn versioned_writes_advance_the_current_pointer() {
        let (_dir, store) = store();
        let v1 = Obj::new("Profile").with("name", "ada");
        let first = store.store_versioned(&v1).await.unwrap();
        assert_eq!(first.status, WriteStatus::New);
        let v2 = Obj::new("Profile").with("name", "ada").with("bio", "maths");
        let second = store.store_versioned(&v2).await.unwrap();
        assert_eq!(second.status, WriteStatus::Updated);
        assert_eq!(second.id_hash, first.id_hash);
        assert_ne!(second.hash, first.hash);

        let again = store.store_versioned(&v2).await.unwrap();
        assert_eq!(again.status, WriteStatus::Exists);

        let (current, obj) = store.get_by_id_hash(&first.id_hash).await.unwrap();
        assert_eq!(current, second.hash);
        assert_eq!(obj, v2);

        let graph = store.version_graph(&first.id_hash).await.unwrap();
        let node = graph.node(&second.hash).unwrap();
        assert_eq!(node.previous, vec![first.hash]);
    }

    #[tokio::test]
    async fn tampered_object_fails_hash_check() {
        let (dir, store) = store();
        let note = store
            .store_unversioned(&Obj::new("Note").with("text", "x"))
            .await
            .unwrap();
        let path = dir.path().join("objects").join(note.hash.to_hex());
        std::fs::write(&path, "<Note>{text:\"y\";}").unwrap();
        assert!(matches!(
            store.get_object(&note.hash).await,
            Err(Error::HashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn blob_round_trip() {
        let (_dir, store) = store();
        let hash = store.store_blob(&[1, 2, 3]).await.unwrap();
        assert_eq!(store.read_blob(&hash).await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            store.read_blob(&Hash::digest(b"missing")).await,
            Err(Error::NotFound(_))
        ));
        let clob = store.store_clob("héllo").await.unwrap();
        assert_eq!(store.read_clob(&clob).await.unwrap(), "héllo");
    }
}
