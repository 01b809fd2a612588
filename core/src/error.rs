use thiserror::Error;

/// Errors surfaced by the core store, codec and crdt engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A value violates its recipe rule or an encoding is malformed.
    #[error("codec: {0}")]
    Codec(String),
    /// The requested hash or id-hash is not in the store.
    #[error("not found: {0}")]
    NotFound(String),
    /// Recomputing the hash of a loaded object disagrees with its file name.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    /// A recipe name is not registered.
    #[error("unknown recipe {0}")]
    UnknownRecipe(String),
    /// An object references a hash that does not resolve.
    #[error("dangling reference {target} in {referrer}")]
    DanglingReference { referrer: String, target: String },
    /// A merge algorithm returned an undecidable result.
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    /// Merge reached a path whose algorithm is `NotAvailable`.
    #[error("no crdt algorithm configured for {0}")]
    NoAlgorithm(String),
    /// Key derivation, decryption or signature verification failed.
    #[error("crypto: {0}")]
    Crypto(String),
    /// Signing was requested on an encryption-only crypto api.
    #[error("no sign key")]
    NoSignKey,
    /// A concurrent writer holds the settings store.
    #[error("settings store locked")]
    SettingsLocked,
    /// Two channel heads share no history and refer to different channels.
    #[error("channels are disjoint")]
    DisjointChannels,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub(crate) fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
