//! Identity files.
//!
//! The public variant names a person, an instance and their four
//! public keys; the with-secrets variant adds the corresponding
//! private keys and is what moves an identity to a new device.

use crate::error::{NetError, Result};
use chum_core::{EncryptionKeypair, Keychain, SignKeypair};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub person_email: String,
    pub instance_name: String,
    pub person_key_public: String,
    pub person_sign_key_public: String,
    pub instance_key_public: String,
    pub instance_sign_key_public: String,
    pub url: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityWithSecrets {
    #[serde(flatten)]
    pub public: Identity,
    pub person_key_secret: String,
    pub person_sign_key_secret: String,
    pub instance_key_secret: String,
    pub instance_sign_key_secret: String,
}

fn decode_key(hex_key: &str) -> Result<[u8; 32]> {
    hex::decode(hex_key)
        .map_err(|_| NetError::handshake("bad identity key hex"))?
        .try_into()
        .map_err(|_| NetError::handshake("bad identity key length"))
}

impl Identity {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(NetError::transport)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?).map_err(NetError::transport)
    }
}

impl IdentityWithSecrets {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(NetError::transport)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?).map_err(NetError::transport)
    }

    /// Installs the secrets into a keychain under the given owner
    /// id-hashes, making the person and instance local.
    pub fn import_into(
        &self,
        keychain: &Keychain,
        person_id: &chum_core::IdHash,
        instance_id: &chum_core::IdHash,
    ) -> Result<()> {
        keychain
            .import_keys(
                person_id,
                decode_key(&self.person_key_secret)?,
                decode_key(&self.person_sign_key_secret)?,
            )
            .map_err(NetError::Core)?;
        keychain
            .import_keys(
                instance_id,
                decode_key(&self.instance_key_secret)?,
                decode_key(&self.instance_sign_key_secret)?,
            )
            .map_err(NetError::Core)?;
        Ok(())
    }

    /// Checks that every secret matches its public counterpart.
    pub fn verify(&self) -> Result<()> {
        let pairs = [
            (&self.person_key_secret, &self.public.person_key_public),
            (&self.instance_key_secret, &self.public.instance_key_public),
        ];
        for (secret, public) in pairs {
            let keypair = EncryptionKeypair::from_secret_bytes(decode_key(secret)?);
            if hex::encode(keypair.public_bytes()) != *public {
                return Err(NetError::handshake("encryption key mismatch in identity"));
            }
        }
        let sign_pairs = [
            (
                &self.person_sign_key_secret,
                &self.public.person_sign_key_public,
            ),
            (
                &self.instance_sign_key_secret,
                &self.public.instance_sign_key_public,
            ),
        ];
        for (secret, public) in sign_pairs {
            let keypair = SignKeypair::from_secret_bytes(decode_key(secret)?);
            if hex::encode(keypair.public_bytes()) != *public {
                return Err(NetError::handshake("sign key mismatch in identity"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IdentityWithSecrets {
        let person = EncryptionKeypair::generate();
        let person_sign = SignKeypair::generate();
        let instance = EncryptionKeypair::generate();
        let instance_sign = SignKeypair::generate();
        IdentityWithSecrets {
            public: Identity {
                person_email: "a@b.c".to_owned(),
                instance_name: "laptop".to_owned(),
                person_key_public: hex::encode(person.public_bytes()),
                person_sign_key_public: hex::encode(person_sign.public_bytes()),
                instance_key_public: hex::encode(instance.public_bytes()),
                instance_sign_key_public: hex::encode(instance_sign.public_bytes()),
                url: "wss://example.com".to_owned(),
            },
            person_key_secret: hex::encode(person.secret_bytes()),
            person_sign_key_secret: hex::encode(person_sign.secret_bytes()),
            instance_key_secret: hex::encode(instance.secret_bytes()),
            instance_sign_key_secret: hex::encode(instance_sign.secret_bytes()),
        }
    }

    #[test]
    fn identity_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let identity = sample();
        identity.verify().unwrap();

        let secret_path = dir.path().join("identity_secret.json");
        identity.write(&secret_path).unwrap();
        assert_eq!(IdentityWithSecrets::read(&secret_path).unwrap(), identity);

        let public_path = dir.path().join("identity.json");
        identity.public.write(&public_path).unwrap();
        assert_eq!(Identity::read(&public_path).unwrap(), identity.public);
    }

    #[test]
    fn mismatched_secret_fails_verification() {
        let mut identity = sample();
        identity.person_key_secret =
            hex::encode(EncryptionKeypair::generate().secret_bytes());
        assert!(identity.verify().is_err());
    }
}
