//! # chum
//!
//! A content-addressed object store with peer-to-peer replication.
//! Typed, schema-validated objects are identified by the SHA-256 of
//! their canonical encoding, linked into append-only per-channel
//! lists, merged per field by crdt algorithms over a version DAG, and
//! replicated between instances that authenticate each other with
//! long-term keypairs.
//!
//! The [`Instance`] is the entry point: it owns the on-disk store, the
//! keychain and the channel registry of one device. Connections to
//! peers run over websocket (or any framed byte stream) through a
//! plugin chain, are sealed by an encrypted handshake, and grouped
//! into multi-route [`routes::ConnectionRoutesGroup`]s with dedup and
//! reconnect. Replication itself is the chum protocol in [`chum`].

pub mod chum;
pub mod commserver;
pub mod connection;
mod error;
pub mod handshake;
pub mod identity;
pub mod invitation;
pub mod plugins;
pub mod routes;

pub use crate::chum::{run_chum, ChannelSpec, ChumProgress};
pub use crate::connection::{Connection, Event, FramedTransport, Payload, Transport, WsTransport};
pub use crate::error::{CloseOrigin, NetError};
pub use crate::handshake::{HandshakeConfig, LocalIdentity, PeerIdentity};
pub use crate::identity::{Identity, IdentityWithSecrets};
pub use crate::invitation::Invitation;
pub use crate::routes::{ConnectionRoutesGroup, GroupEvent, GroupKey, GroupOptions, RouteSpec};
pub use chum_core::{
    Channels, CryptoApi, Error as CoreError, Hash, IdHash, Keychain, Obj, ObjectStore, Recipe,
    RecipeRegistry, Settings, Value,
};

use anyhow::Result;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::PathBuf;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// One device: its object store, keychain, settings and channels.
pub struct Instance {
    store: ObjectStore,
    channels: Channels,
    keychain: Keychain,
    settings: Settings,
    person: IdHash,
    instance: IdHash,
}

/// Unwraps the keychain off the async runtime; scrypt derivation is
/// deliberately slow.
async fn login_keychain(base: &std::path::Path, passphrase: &str) -> Result<Keychain> {
    let private_dir = base.join("private");
    let passphrase = passphrase.to_owned();
    Ok(tokio::task::spawn_blocking(move || Keychain::login(private_dir, &passphrase)).await??)
}

/// Reads an id-hash the settings store recorded at creation time.
fn stored_id(settings: &Settings, key: &str) -> Result<Option<IdHash>> {
    match settings.get(key)? {
        Some(serde_json::Value::String(hex)) => Ok(Some(IdHash::from_hex(&hex)?)),
        Some(other) => anyhow::bail!("settings entry {:?} is not an id-hash: {}", key, other),
        None => Ok(None),
    }
}

impl Instance {
    /// Creates a fresh instance under `base`: keychain, Person and
    /// Instance objects and their public `Keys`. The identity id-hashes
    /// are recorded in the settings store so [`open`](Self::open) can
    /// find them again. Fails when `base` already hosts an instance.
    pub async fn create(
        base: impl Into<PathBuf>,
        email: &str,
        instance_name: &str,
        passphrase: &str,
    ) -> Result<Self> {
        init_tracing();
        let base = base.into();
        let settings = Settings::new(base.join("private").join("settings.json"));
        if stored_id(&settings, "instance")?.is_some() {
            anyhow::bail!(
                "an instance already exists at {}, use Instance::open",
                base.display()
            );
        }
        let recipes = RecipeRegistry::new();
        let store = ObjectStore::open(&base, recipes)?;
        let keychain = login_keychain(&base, passphrase).await?;

        let person_obj = Obj::new("Person").with("email", email);
        let person = store.store_versioned(&person_obj).await?.id_hash;
        let instance_obj = Obj::new("Instance")
            .with("name", instance_name)
            .with("owner", Value::IdRef(person));
        let instance = store.store_versioned(&instance_obj).await?.id_hash;

        for owner in [person, instance] {
            if !keychain.is_local(&owner) {
                let keys = keychain.create_keys(&owner)?;
                let keys_obj = Obj::new("Keys")
                    .with("owner", Value::IdRef(owner))
                    .with("publicKey", keys.encryption_hex())
                    .with("publicSignKey", keys.sign_hex());
                store.store_versioned(&keys_obj).await?;
            }
        }
        settings.set("person", serde_json::Value::String(person.to_hex()))?;
        settings.set("instance", serde_json::Value::String(instance.to_hex()))?;
        tracing::info!("instance {} of {} created", instance, person);

        Ok(Self {
            channels: Channels::new(store.clone()),
            store,
            keychain,
            settings,
            person,
            instance,
        })
    }

    /// Opens the instance previously created under `base`. The
    /// passphrase unwraps the keychain. Fails when no instance exists
    /// there or the keychain lost its keys.
    pub async fn open(base: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        init_tracing();
        let base = base.into();
        let settings = Settings::new(base.join("private").join("settings.json"));
        let (person, instance) = match (
            stored_id(&settings, "person")?,
            stored_id(&settings, "instance")?,
        ) {
            (Some(person), Some(instance)) => (person, instance),
            _ => anyhow::bail!("no instance at {}, use Instance::create", base.display()),
        };
        let store = ObjectStore::open(&base, RecipeRegistry::new())?;
        let keychain = login_keychain(&base, passphrase).await?;
        for owner in [person, instance] {
            if !keychain.is_local(&owner) {
                anyhow::bail!("keychain at {} is missing the keys for {}", base.display(), owner);
            }
        }
        tracing::info!("instance {} of {} opened", instance, person);

        Ok(Self {
            channels: Channels::new(store.clone()),
            store,
            keychain,
            settings,
            person,
            instance,
        })
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn keychain(&self) -> &Keychain {
        &self.keychain
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn person_id(&self) -> IdHash {
        self.person
    }

    pub fn instance_id(&self) -> IdHash {
        self.instance
    }

    /// The identity bundle handshakes run under.
    pub fn local_identity(&self) -> Result<LocalIdentity, CoreError> {
        Ok(LocalIdentity {
            person_id: self.person,
            instance_id: self.instance,
            person_api: self.keychain.crypto_api(&self.person)?,
            instance_api: self.keychain.crypto_api(&self.instance)?,
        })
    }

    /// An invitation other instances can accept to reach this one at
    /// `url`.
    pub fn create_invitation(&self, url: &str) -> Result<Invitation, CoreError> {
        let keys = self.keychain.public_keys(&self.instance)?;
        let mut token = [0u8; 16];
        OsRng.fill_bytes(&mut token);
        Ok(Invitation::new(
            url,
            hex::encode(keys.encryption),
            hex::encode(token),
        ))
    }

    /// Dials an invitation and runs the initiating handshake.
    pub async fn accept_invitation(
        &self,
        invitation: &Invitation,
        group: &str,
    ) -> Result<(Connection, PeerIdentity), NetError> {
        let local = self.local_identity().map_err(NetError::Core)?;
        let config =
            HandshakeConfig::new(group).expect_instance_key(invitation.instance_key()?);
        let connection = commserver::connect(&invitation.url).await?;
        let peer = handshake::initiate(&connection, &local, &config).await?;
        Ok((connection, peer))
    }

    /// Exports this instance's identity, including secrets.
    pub fn export_identity(
        &self,
        email: &str,
        name: &str,
        url: &str,
    ) -> Result<IdentityWithSecrets> {
        let person_keys = self.keychain.public_keys(&self.person)?;
        let instance_keys = self.keychain.public_keys(&self.instance)?;
        let (person_secret, person_sign_secret) =
            self.keychain.export_secret_keys(&self.person)?;
        let (instance_secret, instance_sign_secret) =
            self.keychain.export_secret_keys(&self.instance)?;
        Ok(IdentityWithSecrets {
            public: Identity {
                person_email: email.to_owned(),
                instance_name: name.to_owned(),
                person_key_public: hex::encode(person_keys.encryption),
                person_sign_key_public: hex::encode(person_keys.sign),
                instance_key_public: hex::encode(instance_keys.encryption),
                instance_sign_key_public: hex::encode(instance_keys.sign),
                url: url.to_owned(),
            },
            person_key_secret: hex::encode(person_secret),
            person_sign_key_secret: hex::encode(person_sign_secret),
            instance_key_secret: hex::encode(instance_secret),
            instance_sign_key_secret: hex::encode(instance_sign_secret),
        })
    }
}
