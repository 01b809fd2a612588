//! Diff-objects and version-tree merge.
//!
//! The differ walks two objects of the same recipe in parallel,
//! selecting the algorithm per path, and accumulates transformations
//! keyed `path#algorithm`. The merge driver projects the child version
//! tree of an id-hash onto every recipe path, runs each path's
//! algorithm and rebuilds the merged object, descending into referenced
//! objects or channel chains when an algorithm says so.

use crate::channel;
use crate::crdt::{
    algorithm, BranchState, Change, MergeInput, MergeOutcome, RefTypes, Transformation,
};
use crate::error::{Error, Result};
use crate::hash::{Hash, IdHash};
use crate::recipe::{
    default_algorithm, path_string, AlgorithmId, ItemType, PathSeg, Recipe, Rule,
};
use crate::recipe::RecipeRegistry;
use crate::store::{now_ms, ObjectStore};
use crate::value::{Obj, Value};
use crate::version::{VersionGraph, VersionNode};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Transformations keyed by `path#algorithm`.
pub type TransformationMap = BTreeMap<String, Vec<Transformation>>;

fn rule_seg(rule: &Rule) -> PathSeg {
    match rule.itemtype.reference_target() {
        Some(ty) => PathSeg::typed(rule.itemprop.clone(), ty),
        None => PathSeg::new(rule.itemprop.clone()),
    }
}

fn entry_seg(name: &str, element: &ItemType) -> PathSeg {
    match element.reference_target() {
        Some(ty) => PathSeg::typed(name, ty),
        None => PathSeg::new(name),
    }
}

/// Optional fields are presence-aware; everything else follows the
/// element-type default.
fn rule_default(rule: &Rule) -> AlgorithmId {
    if rule.optional {
        AlgorithmId::OptionalValue
    } else {
        default_algorithm(&rule.itemtype)
    }
}

/// Transformations creating `new` from nothing.
pub fn initial_diff(recipes: &RecipeRegistry, new: &Obj) -> Result<TransformationMap> {
    diff_objects(recipes, None, new)
}

/// Walks the recipe tree over `(old, new)` and accumulates the
/// per-path transformations.
pub fn diff_objects(
    recipes: &RecipeRegistry,
    old: Option<&Obj>,
    new: &Obj,
) -> Result<TransformationMap> {
    if let Some(old) = old {
        if old.type_name() != new.type_name() {
            return Err(Error::codec(format!(
                "cannot diff {} against {}",
                old.type_name(),
                new.type_name()
            )));
        }
    }
    let recipe = recipes.get(new.type_name())?;
    let mut out = TransformationMap::new();
    let mut path = Vec::new();
    for rule in &recipe.rules {
        path.push(rule_seg(rule));
        diff_value(
            &recipe,
            &rule.itemtype,
            old.and_then(|o| o.get(&rule.itemprop)),
            new.get(&rule.itemprop),
            rule_default(rule),
            &mut path,
            &mut out,
        )?;
        path.pop();
    }
    Ok(out)
}

fn diff_value(
    recipe: &Recipe,
    itemtype: &ItemType,
    old: Option<&Value>,
    new: Option<&Value>,
    default: AlgorithmId,
    path: &mut Vec<PathSeg>,
    out: &mut TransformationMap,
) -> Result<()> {
    let configured = recipe.crdt_config.configured(path);
    match itemtype {
        // maps and nested objects descend into their entries unless the
        // container path is explicitly configured
        ItemType::Map(element) if configured.is_none() => {
            let empty = BTreeMap::new();
            let old_map = match old {
                Some(Value::Map(m)) => m,
                _ => &empty,
            };
            let new_map = match new {
                Some(Value::Map(m)) => m,
                _ => &empty,
            };
            let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
            for key in keys {
                path.push(entry_seg(key, element));
                diff_value(
                    recipe,
                    element,
                    old_map.get(key.as_str()),
                    new_map.get(key.as_str()),
                    AlgorithmId::OptionalValue,
                    path,
                    out,
                )?;
                path.pop();
            }
        }
        ItemType::Object(rules) if configured.is_none() => {
            let empty = BTreeMap::new();
            let old_map = match old {
                Some(Value::Object(m)) => m,
                _ => &empty,
            };
            let new_map = match new {
                Some(Value::Object(m)) => m,
                _ => &empty,
            };
            for rule in rules {
                path.push(rule_seg(rule));
                diff_value(
                    recipe,
                    &rule.itemtype,
                    old_map.get(&rule.itemprop),
                    new_map.get(&rule.itemprop),
                    AlgorithmId::OptionalValue,
                    path,
                    out,
                )?;
                path.pop();
            }
        }
        _ => {
            let id = configured.unwrap_or(default);
            let ops = algorithm(id).diff(old, new);
            if !ops.is_empty() {
                out.insert(format!("{}#{}", path_string(path), id), ops);
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct EntryMeta {
    time: u64,
    hash: Hash,
}

/// One path of the child version tree: the value at the lowest common
/// ancestor and at every version along both branches, oldest first.
#[derive(Clone, Debug, Default)]
struct Projected {
    ancestor: Option<Value>,
    left: Vec<(EntryMeta, Option<Value>)>,
    right: Vec<(EntryMeta, Option<Value>)>,
}

fn child_of(value: &Option<Value>, key: &str) -> Option<Value> {
    match value {
        Some(Value::Object(m)) | Some(Value::Map(m)) => m.get(key).cloned(),
        _ => None,
    }
}

impl Projected {
    fn descend(&self, key: &str) -> Projected {
        Projected {
            ancestor: child_of(&self.ancestor, key),
            left: self
                .left
                .iter()
                .map(|(m, v)| (*m, child_of(v, key)))
                .collect(),
            right: self
                .right
                .iter()
                .map(|(m, v)| (*m, child_of(v, key)))
                .collect(),
        }
    }

    fn left_state(&self) -> BranchState {
        branch_state(&self.ancestor, &self.left)
    }

    fn right_state(&self) -> BranchState {
        branch_state(&self.ancestor, &self.right)
    }

    fn keys(&self) -> BTreeSet<String> {
        fn add(value: &Option<Value>, out: &mut BTreeSet<String>) {
            if let Some(Value::Map(m)) | Some(Value::Object(m)) = value {
                out.extend(m.keys().cloned());
            }
        }
        let mut out = BTreeSet::new();
        add(&self.ancestor, &mut out);
        for (_, value) in self.left.iter().chain(&self.right) {
            add(value, &mut out);
        }
        out
    }
}

/// Finds the last version of a branch that wrote the path.
fn branch_state(ancestor: &Option<Value>, entries: &[(EntryMeta, Option<Value>)]) -> BranchState {
    let mut change = None;
    let mut prev = ancestor.as_ref();
    for (meta, value) in entries {
        let value = value.as_ref();
        if value != prev {
            change = Some(Change {
                time: meta.time,
                hash: meta.hash,
                deleted: value.is_none(),
            });
            prev = value;
        }
    }
    BranchState {
        value: entries.last().and_then(|(_, v)| v.clone()),
        change,
    }
}

struct MergeCx<'a> {
    store: &'a ObjectStore,
}

/// Merges two heads of an id-hash's version DAG into a new version
/// whose ancestor list is `[h1, h2]`. Fast-forwards when one head
/// descends from the other; reuses an existing merge node of the same
/// pair, making the operation idempotent.
pub async fn merge_versions(
    store: &ObjectStore,
    id: &IdHash,
    h1: Hash,
    h2: Hash,
) -> Result<Hash> {
    let lock = store.id_lock(id);
    let _guard = lock.lock().await;

    let graph = store.version_graph(id).await?;
    for h in [h1, h2] {
        if !graph.contains(&h) {
            return Err(Error::NotFound(h.to_hex()));
        }
    }
    if h1 == h2 {
        return Ok(h1);
    }
    if graph.is_ancestor(&h1, &h2) {
        return Ok(h2);
    }
    if graph.is_ancestor(&h2, &h1) {
        return Ok(h1);
    }
    for node in graph.nodes() {
        if node.previous.len() == 2 && node.previous.contains(&h1) && node.previous.contains(&h2) {
            return Ok(node.hash);
        }
    }

    let lca = graph.lowest_common_ancestor(&h1, &h2);
    let ancestor = match &lca {
        Some(h) => Some(store.get_object(h).await?),
        None => None,
    };
    let left = load_branch(store, &graph, lca.as_ref(), &h1).await?;
    let right = load_branch(store, &graph, lca.as_ref(), &h2).await?;
    let left_type = branch_type(&left)?;
    let right_type = branch_type(&right)?;
    if left_type != right_type {
        return Err(Error::MergeConflict(format!(
            "heads have different types {} and {}",
            left_type, right_type
        )));
    }
    let recipe = store.recipes().get(left_type)?;

    let proj = Projected {
        ancestor: ancestor.map(|o| Value::Object(o.fields().clone())),
        left: project_branch(&left),
        right: project_branch(&right),
    };
    let cx = MergeCx { store };
    let merged = merge_obj(&cx, recipe, proj).await?;
    tracing::debug!("merged {} heads {:?} {:?}", id, h1, h2);
    let hash = store.put_object(&merged).await?;
    store
        .append_version_node(
            id,
            &VersionNode {
                hash,
                previous: vec![h1, h2],
                time: now_ms(),
            },
        )
        .await?;
    Ok(hash)
}

struct BranchEntry {
    meta: EntryMeta,
    obj: Obj,
}

fn branch_type(entries: &[BranchEntry]) -> Result<&str> {
    entries
        .last()
        .map(|e| e.obj.type_name())
        .ok_or_else(|| Error::MergeConflict("empty branch".to_owned()))
}

fn project_branch(entries: &[BranchEntry]) -> Vec<(EntryMeta, Option<Value>)> {
    entries
        .iter()
        .map(|e| (e.meta, Some(Value::Object(e.obj.fields().clone()))))
        .collect()
}

async fn load_branch(
    store: &ObjectStore,
    graph: &VersionGraph,
    lca: Option<&Hash>,
    head: &Hash,
) -> Result<Vec<BranchEntry>> {
    let mut out = Vec::new();
    for hash in graph.branch_of(lca, head) {
        let node = graph
            .node(&hash)
            .ok_or_else(|| Error::NotFound(hash.to_hex()))?;
        let obj = store.get_object(&hash).await?;
        out.push(BranchEntry {
            meta: EntryMeta {
                time: node.time,
                hash,
            },
            obj,
        });
    }
    Ok(out)
}

fn merge_obj<'a>(
    cx: &'a MergeCx<'a>,
    recipe: Arc<Recipe>,
    proj: Projected,
) -> BoxFuture<'a, Result<Obj>> {
    async move {
        let mut obj = Obj::new(recipe.name.clone());
        for rule in &recipe.rules {
            let path = vec![rule_seg(rule)];
            let merged = merge_value(
                cx,
                recipe.clone(),
                rule.itemtype.clone(),
                proj.descend(&rule.itemprop),
                rule_default(rule),
                path,
            )
            .await?;
            if let Some(value) = merged {
                obj.set(rule.itemprop.clone(), value);
            }
        }
        Ok(obj)
    }
    .boxed()
}

fn merge_value<'a>(
    cx: &'a MergeCx<'a>,
    recipe: Arc<Recipe>,
    itemtype: ItemType,
    proj: Projected,
    default: AlgorithmId,
    path: Vec<PathSeg>,
) -> BoxFuture<'a, Result<Option<Value>>> {
    async move {
        let configured = recipe.crdt_config.configured(&path);
        match &itemtype {
            ItemType::Map(element) if configured.is_none() => {
                let mut merged = BTreeMap::new();
                for key in proj.keys() {
                    let mut entry_path = path.clone();
                    entry_path.push(entry_seg(&key, element));
                    let value = merge_value(
                        cx,
                        recipe.clone(),
                        (**element).clone(),
                        proj.descend(&key),
                        AlgorithmId::OptionalValue,
                        entry_path,
                    )
                    .await?;
                    if let Some(value) = value {
                        merged.insert(key, value);
                    }
                }
                Ok(container_presence(&proj, Value::Map(merged)))
            }
            ItemType::Object(rules) if configured.is_none() => {
                let mut merged = BTreeMap::new();
                for rule in rules {
                    let mut entry_path = path.clone();
                    entry_path.push(rule_seg(rule));
                    let value = merge_value(
                        cx,
                        recipe.clone(),
                        rule.itemtype.clone(),
                        proj.descend(&rule.itemprop),
                        AlgorithmId::OptionalValue,
                        entry_path,
                    )
                    .await?;
                    if let Some(value) = value {
                        merged.insert(rule.itemprop.clone(), value);
                    }
                }
                Ok(container_presence(&proj, Value::Object(merged)))
            }
            _ => {
                let id = configured.unwrap_or(default);
                let mut input = MergeInput {
                    path: path_string(&path),
                    ancestor: proj.ancestor.clone(),
                    left: proj.left_state(),
                    right: proj.right_state(),
                    ref_types: None,
                };
                if id == AlgorithmId::ReferenceToObject {
                    input.ref_types = Some(resolve_ref_types(cx, &input).await?);
                }
                match algorithm(id).merge(&input)? {
                    MergeOutcome::Value(value) => Ok(value),
                    MergeOutcome::MergeChains => {
                        let left = input.left.value.as_ref().and_then(Value::as_obj_ref);
                        let right = input.right.value.as_ref().and_then(Value::as_obj_ref);
                        let merged = channel::merge_chain_heads(cx.store, left, right).await?;
                        Ok(merged.map(Value::ObjRef))
                    }
                    MergeOutcome::Iterate => {
                        let type_name = input
                            .ref_types
                            .as_ref()
                            .and_then(|t| t.left.clone())
                            .ok_or_else(|| {
                                Error::MergeConflict(format!(
                                    "{}: referenced type unknown",
                                    input.path
                                ))
                            })?;
                        let child_recipe = cx.store.recipes().get(&type_name)?;
                        let child = deref_projection(cx, &proj).await?;
                        let merged = merge_obj(cx, child_recipe, child).await?;
                        let hash = cx.store.put_object(&merged).await?;
                        Ok(Some(Value::ObjRef(hash)))
                    }
                }
            }
        }
    }
    .boxed()
}

/// A container exists in the merge when either head still carries it.
fn container_presence(proj: &Projected, merged: Value) -> Option<Value> {
    let left_present = proj.left.last().map_or(false, |(_, v)| v.is_some());
    let right_present = proj.right.last().map_or(false, |(_, v)| v.is_some());
    if left_present || right_present {
        Some(merged)
    } else {
        None
    }
}

async fn ref_type(cx: &MergeCx<'_>, value: &Option<Value>) -> Option<String> {
    let hash = value.as_ref().and_then(Value::as_obj_ref)?;
    cx.store
        .get_object(&hash)
        .await
        .ok()
        .map(|o| o.type_name().to_owned())
}

async fn resolve_ref_types(cx: &MergeCx<'_>, input: &MergeInput) -> Result<RefTypes> {
    Ok(RefTypes {
        ancestor: ref_type(cx, &input.ancestor).await,
        left: ref_type(cx, &input.left.value).await,
        right: ref_type(cx, &input.right.value).await,
    })
}

async fn deref_one(cx: &MergeCx<'_>, value: &Option<Value>) -> Result<Option<Value>> {
    match value.as_ref().and_then(Value::as_obj_ref) {
        Some(hash) => match cx.store.get_object(&hash).await {
            Ok(obj) => Ok(Some(Value::Object(obj.fields().clone()))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        },
        None => Ok(None),
    }
}

/// Builds the child version tree of a referenced object by
/// dereferencing the outer reference at every version (the child
/// version tree of the reference).
async fn deref_projection(cx: &MergeCx<'_>, proj: &Projected) -> Result<Projected> {
    let mut left = Vec::with_capacity(proj.left.len());
    for (meta, value) in &proj.left {
        left.push((*meta, deref_one(cx, value).await?));
    }
    let mut right = Vec::with_capacity(proj.right.len());
    for (meta, value) in &proj.right {
        right.push((*meta, deref_one(cx, value).await?));
    }
    Ok(Projected {
        ancestor: deref_one(cx, &proj.ancestor).await?,
        left,
        right,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::recipe::{CrdtConfig, Recipe};

    fn registry() -> RecipeRegistry {
        let recipes = RecipeRegistry::new();
        recipes
            .register(Recipe::new(
                "Inner",
                vec![
                    Rule::new("a", ItemType::Integer),
                    Rule::new("b", ItemType::Integer),
                ],
            ))
            .unwrap();
        recipes
            .register(Recipe::new(
                "Doc",
                vec![
                    Rule::new("name", ItemType::String).id(),
                    Rule::new("body", ItemType::String),
                    Rule::new("tags", ItemType::Set(Box::new(ItemType::String))),
                    Rule::new(
                        "inner",
                        ItemType::ReferenceToObj(vec!["Inner".to_owned()]),
                    )
                    .optional(),
                    Rule::new("meta", ItemType::Map(Box::new(ItemType::String))).optional(),
                ],
            ))
            .unwrap();
        recipes
            .register(
                Recipe::new(
                    "Pinned",
                    vec![
                        Rule::new("name", ItemType::String).id(),
                        Rule::new("data", ItemType::Map(Box::new(ItemType::String))),
                    ],
                )
                .with_crdt_config(
                    CrdtConfig::new()
                        .with("data", AlgorithmId::NotAvailable)
                        .unwrap(),
                ),
            )
            .unwrap();
        recipes
    }

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), registry()).unwrap();
        (dir, store)
    }

    fn tags(items: &[&str]) -> Value {
        Value::Set(items.iter().map(|s| Value::String((*s).to_owned())).collect())
    }

    fn doc(body: &str) -> Obj {
        Obj::new("Doc")
            .with("name", "d")
            .with("body", body)
            .with("tags", tags(&[]))
    }

    /// Writes a version as if it had been replicated from a peer: the
    /// content file plus a version node with explicit parents and time.
    async fn fork(store: &ObjectStore, obj: &Obj, previous: Vec<Hash>, time: u64) -> Hash {
        let encoded = codec::encode(obj, store.recipes()).unwrap();
        let hash = store.import_encoded(&encoded).await.unwrap().hash;
        let id = codec::id_hash_of(obj, store.recipes()).unwrap();
        store
            .record_version(
                &id,
                &VersionNode {
                    hash,
                    previous,
                    time,
                },
            )
            .await
            .unwrap();
        hash
    }

    #[test]
    fn diff_keys_carry_path_and_algorithm() {
        let recipes = registry();
        let old = doc("one").with("meta", Value::Map(BTreeMap::new()));
        let mut meta = BTreeMap::new();
        meta.insert("k".to_owned(), Value::String("v".to_owned()));
        let new = Obj::new("Doc")
            .with("name", "d")
            .with("body", "two")
            .with("tags", tags(&["t"]))
            .with("meta", Value::Map(meta));
        let diff = diff_objects(&recipes, Some(&old), &new).unwrap();
        assert!(diff.contains_key("body#Register"), "{:?}", diff.keys());
        assert!(diff.contains_key("tags#Set"));
        assert!(diff.contains_key("meta.k#OptionalValue"));
        assert!(!diff.contains_key("name#Register"));
    }

    #[test]
    fn initial_diff_creates_every_field() {
        let recipes = registry();
        let diff = initial_diff(&recipes, &doc("hello")).unwrap();
        assert!(diff.contains_key("name#Register"));
        assert!(diff.contains_key("body#Register"));
    }

    #[tokio::test]
    async fn equal_time_merge_takes_the_greater_hash() {
        let (_dir, store) = store();
        let ha = fork(&store, &doc("from a"), vec![], 1000).await;
        let hb = fork(&store, &doc("from b"), vec![], 1000).await;
        let id = codec::id_hash_of(&doc("from a"), store.recipes()).unwrap();
        let merged = merge_versions(&store, &id, ha, hb).await.unwrap();
        assert_eq!(merged, ha.max(hb));
        // merging again reuses the merge node
        assert_eq!(merge_versions(&store, &id, ha, hb).await.unwrap(), merged);
        let graph = store.version_graph(&id).await.unwrap();
        assert_eq!(graph.node(&merged).unwrap().previous, vec![ha, hb]);
        assert_eq!(graph.current(), Some(merged));
    }

    #[tokio::test]
    async fn merge_commutes_across_replicas() {
        let (_dir, store_1) = store();
        let (_dir2, store_2) = store();
        let a = doc("from a");
        let b = doc("from b");
        let id = codec::id_hash_of(&a, store_1.recipes()).unwrap();

        let ha_1 = fork(&store_1, &a, vec![], 1000).await;
        let hb_1 = fork(&store_1, &b, vec![], 1000).await;
        let hb_2 = fork(&store_2, &b, vec![], 1000).await;
        let ha_2 = fork(&store_2, &a, vec![], 1000).await;

        let m1 = merge_versions(&store_1, &id, ha_1, hb_1).await.unwrap();
        let m2 = merge_versions(&store_2, &id, hb_2, ha_2).await.unwrap();
        assert_eq!(m1, m2);
    }

    #[tokio::test]
    async fn merge_is_associative_up_to_hash() {
        let (_dir, store_1) = store();
        let (_dir2, store_2) = store();
        let a = doc("from a");
        let b = doc("from b");
        let c = doc("from c");
        let id = codec::id_hash_of(&a, store_1.recipes()).unwrap();

        // ((a ∪ b) ∪ c) on one replica, (a ∪ (b ∪ c)) on the other
        let ha = fork(&store_1, &a, vec![], 1000).await;
        let hb = fork(&store_1, &b, vec![], 1000).await;
        let hc = fork(&store_1, &c, vec![], 1000).await;
        let ab = merge_versions(&store_1, &id, ha, hb).await.unwrap();
        let abc = merge_versions(&store_1, &id, ab, hc).await.unwrap();

        let ha2 = fork(&store_2, &a, vec![], 1000).await;
        let hb2 = fork(&store_2, &b, vec![], 1000).await;
        let hc2 = fork(&store_2, &c, vec![], 1000).await;
        let bc = merge_versions(&store_2, &id, hb2, hc2).await.unwrap();
        let abc2 = merge_versions(&store_2, &id, ha2, bc).await.unwrap();

        assert_eq!(abc, abc2);
    }

    #[tokio::test]
    async fn set_union_and_optional_delete() {
        let (_dir, store) = store();
        let mut meta = BTreeMap::new();
        meta.insert("k".to_owned(), Value::String("v".to_owned()));
        let base = Obj::new("Doc")
            .with("name", "d")
            .with("body", "base")
            .with("tags", tags(&["one", "two"]))
            .with("meta", Value::Map(meta));
        let h0 = fork(&store, &base, vec![], 1000).await;
        let id = codec::id_hash_of(&base, store.recipes()).unwrap();

        // left adds a tag and deletes meta.k, right removes a tag
        let left = Obj::new("Doc")
            .with("name", "d")
            .with("body", "base")
            .with("tags", tags(&["one", "two", "three"]));
        let mut meta = BTreeMap::new();
        meta.insert("k".to_owned(), Value::String("v".to_owned()));
        let right = Obj::new("Doc")
            .with("name", "d")
            .with("body", "base")
            .with("tags", tags(&["two"]))
            .with("meta", Value::Map(meta));
        let hl = fork(&store, &left, vec![h0], 2000).await;
        let hr = fork(&store, &right, vec![h0], 2001).await;

        let merged = merge_versions(&store, &id, hl, hr).await.unwrap();
        let obj = store.get_object(&merged).await.unwrap();
        assert_eq!(obj.get("body"), Some(&Value::String("base".to_owned())));
        match obj.get("tags") {
            Some(Value::Set(items)) => {
                let mut names: Vec<&str> =
                    items.iter().filter_map(|v| v.as_str()).collect();
                names.sort_unstable();
                assert_eq!(names, vec!["three", "two"]);
            }
            other => panic!("unexpected tags {:?}", other),
        }
        // left deleted the map entry while right kept it untouched
        let meta = obj.get("meta");
        let has_k = matches!(meta, Some(Value::Map(m)) if m.contains_key("k"));
        assert!(!has_k, "{:?}", meta);
    }

    #[tokio::test]
    async fn reference_merge_recurses_into_referenced_objects() {
        let (_dir, store) = store();
        let inner = |a: i64, b: i64| Obj::new("Inner").with("a", a).with("b", b);
        let i0 = store.store_unversioned(&inner(1, 1)).await.unwrap().hash;
        let i1 = store.store_unversioned(&inner(2, 1)).await.unwrap().hash;
        let i2 = store.store_unversioned(&inner(1, 3)).await.unwrap().hash;

        let with_inner = |h: Hash| doc("base").with("inner", Value::ObjRef(h));
        let h0 = fork(&store, &with_inner(i0), vec![], 1000).await;
        let hl = fork(&store, &with_inner(i1), vec![h0], 2000).await;
        let hr = fork(&store, &with_inner(i2), vec![h0], 2001).await;
        let id = codec::id_hash_of(&with_inner(i0), store.recipes()).unwrap();

        let merged = merge_versions(&store, &id, hl, hr).await.unwrap();
        let obj = store.get_object(&merged).await.unwrap();
        let inner_ref = obj.get("inner").and_then(Value::as_obj_ref).unwrap();
        let merged_inner = store.get_object(&inner_ref).await.unwrap();
        assert_eq!(merged_inner.get("a"), Some(&Value::Integer(2)));
        assert_eq!(merged_inner.get("b"), Some(&Value::Integer(3)));
    }

    #[tokio::test]
    async fn not_available_surfaces_no_algorithm() {
        let (_dir, store) = store();
        let pinned = |v: &str| {
            let mut data = BTreeMap::new();
            data.insert("k".to_owned(), Value::String(v.to_owned()));
            Obj::new("Pinned")
                .with("name", "p")
                .with("data", Value::Map(data))
        };
        let h0 = fork(&store, &pinned("base"), vec![], 1000).await;
        let hl = fork(&store, &pinned("left"), vec![h0], 2000).await;
        let hr = fork(&store, &pinned("right"), vec![h0], 2001).await;
        let id = codec::id_hash_of(&pinned("base"), store.recipes()).unwrap();
        assert!(matches!(
            merge_versions(&store, &id, hl, hr).await,
            Err(Error::NoAlgorithm(_))
        ));
    }
}
