//! # The chum core
//!
//! ## Content addressing
//! Every typed object has a canonical text encoding fixed by its
//! recipe; the object's identity is the SHA-256 of that encoding.
//! Unversioned objects are immutable and identified only by their
//! content hash. Versioned objects are additionally identified by an
//! *id-hash*, the hash over only their id-marked fields; each write
//! produces a new content hash, and the store tracks the current
//! version per id-hash in a version DAG whose multi-parent nodes record
//! merges of concurrent writes.
//!
//! ## Recipes
//! A recipe names a type and lists its rules: field name, field type,
//! id and optional markers. Container types carry their element type
//! recursively. The registry refuses unknown types, and the crdt
//! configuration of a recipe maps path patterns to merge algorithms.
//!
//! ## Merging
//! Divergent versions of the same id-hash merge per field: the child
//! version tree between the lowest common ancestor and the two heads is
//! projected onto every recipe path, and the path's algorithm
//! (Register, Set, OptionalValue, ReferenceToObject, LinkedList)
//! decides the merged value or directs the traversal deeper. The merge
//! result is itself a version whose ancestor list names both heads, so
//! replicas converge on the same hash regardless of merge order.
//!
//! ## Channels
//! A channel is an append-only log: `CreationTime` envelopes chained
//! through `LinkedListEntry` objects in non-increasing
//! `(creationTime, creationTimeHash)` order. Concurrent heads merge by
//! walking both chains to their common entry and rebuilding the
//! interleaved history above it.
//!
//! ## Keys
//! Every Person and Instance owns an X25519 encryption keypair and an
//! Ed25519 sign keypair. Secret halves exist only for local identities,
//! wrapped under a scrypt passphrase key. Peers derive a shared
//! symmetric key from their static keys and seal frames with
//! XChaCha20-Poly1305.

mod channel;
mod codec;
mod crdt;
mod crypto;
mod diff;
mod error;
mod hash;
mod keychain;
mod recipe;
mod settings;
mod store;
mod value;
mod version;

pub use crate::channel::{chain_entries, merge_chain_heads, ChannelEntry, Channels};
pub use crate::codec::{decode, encode, encode_id, hash_of, id_hash_of};
pub use crate::crdt::{
    algorithm, BranchState, Change, CrdtAlgorithm, LinkedList, MergeInput, MergeOutcome,
    NotAvailable, Op, OptionalValue, RefTypes, Register, Set, Transformation,
};
pub use crate::crypto::{
    create_recovery_information, derive_symmetric_key, derive_wrapping_key, recover_secret,
    recover_secret_as_string, CryptoApi, EncryptionKeypair, RecoveryInformation, SignKeypair,
    SymmetricKey, NONCE_LEN,
};
pub use crate::diff::{diff_objects, initial_diff, merge_versions, TransformationMap};
pub use crate::error::{Error, Result};
pub use crate::hash::{sha256, Hash, IdHash};
pub use crate::keychain::{Keychain, PublicKeys};
pub use crate::recipe::{
    default_algorithm, path_string, AlgorithmId, CrdtConfig, ItemType, PathPattern, PathSeg,
    Recipe, RecipeRegistry, Rule,
};
pub use crate::settings::Settings;
pub use crate::store::{ObjectStore, StoreResult, VersionedResult, WriteStatus};
pub use crate::value::{Obj, RefTarget, Value};
pub use crate::version::{VersionGraph, VersionNode};
