//! Keypair storage with passphrase-derived encryption.
//!
//! The keychain persists one encryption and one sign keypair per
//! Person/Instance id-hash. Secrets are wrapped under a scrypt-derived
//! key and live in `private/keychain.json`; they are decrypted once at
//! login, held in memory, and zeroed on logout. An identity is *local*
//! iff a complete keypair is stored for it.

use crate::crypto::{
    derive_wrapping_key, CryptoApi, EncryptionKeypair, SignKeypair, SymmetricKey,
};
use crate::error::{Error, Result};
use crate::hash::IdHash;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The public halves of an identity's keypairs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PublicKeys {
    pub encryption: [u8; 32],
    pub sign: [u8; 32],
}

impl PublicKeys {
    pub fn encryption_hex(&self) -> String {
        hex::encode(self.encryption)
    }

    pub fn sign_hex(&self) -> String {
        hex::encode(self.sign)
    }
}

/// Decrypted secret material of one local identity.
#[derive(Clone, Deserialize, Serialize, Zeroize, ZeroizeOnDrop)]
struct LocalKeys {
    encryption_secret: [u8; 32],
    sign_secret: [u8; 32],
}

#[derive(Deserialize, Serialize)]
struct KeychainFile {
    salt: String,
    /// owner id-hash hex -> wrapped `LocalKeys` json, hex encoded
    keys: BTreeMap<String, String>,
}

pub struct Keychain {
    path: PathBuf,
    salt: Vec<u8>,
    wrapping: SymmetricKey,
    keys: Mutex<BTreeMap<String, LocalKeys>>,
}

impl Keychain {
    /// Opens the keychain, creating an empty one on first login. Fails
    /// with a crypto error when the passphrase does not unwrap the
    /// stored secrets.
    pub fn login(private_dir: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        let private_dir = private_dir.into();
        std::fs::create_dir_all(&private_dir)?;
        let path = private_dir.join("keychain.json");
        let file = match std::fs::read_to_string(&path) {
            Ok(text) => Some(serde_json::from_str::<KeychainFile>(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        let salt = match &file {
            Some(file) => hex::decode(&file.salt).map_err(|err| Error::crypto(format!("{}", err)))?,
            None => {
                let mut salt = vec![0u8; 16];
                OsRng.fill_bytes(&mut salt);
                salt
            }
        };
        let wrapping = derive_wrapping_key(passphrase, &salt)?;
        let mut keys = BTreeMap::new();
        if let Some(file) = file {
            for (owner, wrapped) in file.keys {
                let sealed =
                    hex::decode(&wrapped).map_err(|err| Error::crypto(format!("{}", err)))?;
                let plain = wrapping.decrypt(&sealed)?;
                keys.insert(owner, serde_json::from_slice::<LocalKeys>(&plain)?);
            }
        }
        let keychain = Self {
            path,
            salt,
            wrapping,
            keys: Mutex::new(keys),
        };
        keychain.persist()?;
        Ok(keychain)
    }

    fn persist(&self) -> Result<()> {
        let keys = self.keys.lock();
        let mut wrapped = BTreeMap::new();
        for (owner, local) in keys.iter() {
            let plain = serde_json::to_vec(local)?;
            wrapped.insert(owner.clone(), hex::encode(self.wrapping.encrypt(&plain)?));
        }
        let file = KeychainFile {
            salt: hex::encode(&self.salt),
            keys: wrapped,
        };
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Generates and stores both keypairs for an identity, making it
    /// local. Refuses to overwrite existing secrets.
    pub fn create_keys(&self, owner: &IdHash) -> Result<PublicKeys> {
        let encryption = EncryptionKeypair::generate();
        let sign = SignKeypair::generate();
        self.import_keys(owner, encryption.secret_bytes(), sign.secret_bytes())?;
        Ok(PublicKeys {
            encryption: encryption.public_bytes(),
            sign: sign.public_bytes(),
        })
    }

    /// Stores externally provided secret keys (identity import).
    pub fn import_keys(
        &self,
        owner: &IdHash,
        encryption_secret: [u8; 32],
        sign_secret: [u8; 32],
    ) -> Result<()> {
        {
            let mut keys = self.keys.lock();
            if keys.contains_key(&owner.to_hex()) {
                return Err(Error::crypto(format!("keys for {} already exist", owner)));
            }
            keys.insert(
                owner.to_hex(),
                LocalKeys {
                    encryption_secret,
                    sign_secret,
                },
            );
        }
        self.persist()
    }

    /// An identity is local iff a complete keypair is stored for it.
    pub fn is_local(&self, owner: &IdHash) -> bool {
        self.keys.lock().contains_key(&owner.to_hex())
    }

    pub fn owners(&self) -> Vec<IdHash> {
        self.keys
            .lock()
            .keys()
            .filter_map(|hex| IdHash::from_hex(hex).ok())
            .collect()
    }

    pub fn public_keys(&self, owner: &IdHash) -> Result<PublicKeys> {
        let keys = self.keys.lock();
        let local = keys
            .get(&owner.to_hex())
            .ok_or_else(|| Error::NotFound(owner.to_hex()))?;
        Ok(PublicKeys {
            encryption: EncryptionKeypair::from_secret_bytes(local.encryption_secret)
                .public_bytes(),
            sign: SignKeypair::from_secret_bytes(local.sign_secret).public_bytes(),
        })
    }

    /// A crypto api for a local identity, with signing.
    pub fn crypto_api(&self, owner: &IdHash) -> Result<CryptoApi> {
        let keys = self.keys.lock();
        let local = keys
            .get(&owner.to_hex())
            .ok_or_else(|| Error::NotFound(owner.to_hex()))?;
        Ok(CryptoApi::new(
            EncryptionKeypair::from_secret_bytes(local.encryption_secret),
            Some(SignKeypair::from_secret_bytes(local.sign_secret)),
        ))
    }

    /// Exports the secret bytes for an identity file with secrets.
    pub fn export_secret_keys(&self, owner: &IdHash) -> Result<([u8; 32], [u8; 32])> {
        let keys = self.keys.lock();
        let local = keys
            .get(&owner.to_hex())
            .ok_or_else(|| Error::NotFound(owner.to_hex()))?;
        Ok((local.encryption_secret, local.sign_secret))
    }

    /// Drops the keychain; decrypted secrets are zeroed.
    pub fn logout(self) {}
}
