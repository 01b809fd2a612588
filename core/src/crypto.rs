//! Crypto primitives: X25519 key agreement, Ed25519 detached
//! signatures, XChaCha20-Poly1305 envelopes and scrypt passphrase
//! wrapping.
//!
//! The [`CryptoApi`] is keyed by an owned keypair and never surfaces
//! the secret bytes.

use crate::error::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce length of the symmetric envelopes.
pub const NONCE_LEN: usize = 24;

/// A 32-byte symmetric key, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut key = [0; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Embedded-nonce envelope: `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))?;
        let mut out = nonce.to_vec();
        out.extend(ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::crypto("envelope too short"));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::crypto("decryption failed"))
    }

    /// Explicit-nonce envelope: caller transports the nonce.
    pub fn encrypt_with_nonce(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    pub fn decrypt_with_nonce(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::crypto("decryption failed"))
    }
}

/// X25519 keypair used for key agreement.
#[derive(Clone)]
pub struct EncryptionKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EncryptionKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// The secret bytes, for keychain persistence and identity export.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// Ed25519 keypair used for detached signatures.
#[derive(Clone)]
pub struct SignKeypair {
    secret: SigningKey,
}

impl SignKeypair {
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.secret.verifying_key().to_bytes()
    }

    /// The secret bytes, for keychain persistence and identity export.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// Derives the symmetric key two peers share: X25519 scalar
/// multiplication expanded through HKDF-SHA256. Both directions yield
/// the same key.
pub fn derive_symmetric_key(secret: &StaticSecret, peer_public: &[u8; 32]) -> SymmetricKey {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 32];
    hkdf.expand(b"chum.symmetric.v1", &mut okm)
        .unwrap_or_else(|_| unreachable!("okm length is valid"));
    SymmetricKey(okm)
}

/// Derives a wrapping key from a passphrase with the fixed scrypt
/// tuple `(N=1024, r=8, p=1, dkLen=32)`. Passphrases are NFKC
/// normalized first.
pub fn derive_wrapping_key(passphrase: &str, salt: &[u8]) -> Result<SymmetricKey> {
    let normalized: String = passphrase.nfkc().collect();
    let params =
        scrypt::Params::new(10, 8, 1, 32).map_err(|err| Error::crypto(format!("{}", err)))?;
    let mut out = [0u8; 32];
    scrypt::scrypt(normalized.as_bytes(), salt, &params, &mut out)
        .map_err(|err| Error::crypto(format!("{}", err)))?;
    Ok(SymmetricKey(out))
}

/// Crypto operations keyed by an owned keypair. Signing is only
/// available when the owner's sign keypair is present.
#[derive(Clone)]
pub struct CryptoApi {
    encryption: EncryptionKeypair,
    sign: Option<SignKeypair>,
}

impl CryptoApi {
    pub fn new(encryption: EncryptionKeypair, sign: Option<SignKeypair>) -> Self {
        Self { encryption, sign }
    }

    pub fn public_encryption_key(&self) -> [u8; 32] {
        self.encryption.public_bytes()
    }

    pub fn public_sign_key(&self) -> Option<[u8; 32]> {
        self.sign.as_ref().map(SignKeypair::public_bytes)
    }

    /// The symmetric key shared with a peer's public encryption key.
    pub fn symmetric_key_for(&self, peer_public: &[u8; 32]) -> SymmetricKey {
        derive_symmetric_key(&self.encryption.secret, peer_public)
    }

    pub fn encrypt_for(&self, peer_public: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.symmetric_key_for(peer_public).encrypt(plaintext)
    }

    pub fn decrypt_from(&self, peer_public: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
        self.symmetric_key_for(peer_public).decrypt(data)
    }

    /// Detached signature over a message.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64]> {
        let sign = self.sign.as_ref().ok_or(Error::NoSignKey)?;
        Ok(sign.secret.sign(message).to_bytes())
    }

    /// Verifies a detached signature against a public sign key.
    pub fn verify(public_sign_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
        let key = VerifyingKey::from_bytes(public_sign_key)
            .map_err(|_| Error::crypto("bad public sign key"))?;
        key.verify(message, &Signature::from_bytes(signature))
            .map_err(|_| Error::crypto("signature verification failed"))
    }
}

/// A secret sealed to a recipient's public key through an ephemeral
/// X25519 keypair. Only the matching private key recovers it.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryInformation {
    pub identity: String,
    pub ephemeral_public_key: String,
    pub encrypted_secret: String,
}

pub fn create_recovery_information(
    recipient_public_key: &[u8; 32],
    secret: &[u8],
    identity: &str,
) -> Result<RecoveryInformation> {
    let ephemeral = EncryptionKeypair::generate();
    let key = derive_symmetric_key(&ephemeral.secret, recipient_public_key);
    let encrypted = key.encrypt(secret)?;
    Ok(RecoveryInformation {
        identity: identity.to_owned(),
        ephemeral_public_key: hex::encode(ephemeral.public_bytes()),
        encrypted_secret: hex::encode(encrypted),
    })
}

pub fn recover_secret(info: &RecoveryInformation, api: &CryptoApi) -> Result<Vec<u8>> {
    let ephemeral: [u8; 32] = hex::decode(&info.ephemeral_public_key)
        .map_err(|err| Error::crypto(format!("{}", err)))?
        .try_into()
        .map_err(|_| Error::crypto("bad ephemeral key length"))?;
    let encrypted =
        hex::decode(&info.encrypted_secret).map_err(|err| Error::crypto(format!("{}", err)))?;
    api.symmetric_key_for(&ephemeral).decrypt(&encrypted)
}

pub fn recover_secret_as_string(info: &RecoveryInformation, api: &CryptoApi) -> Result<String> {
    String::from_utf8(recover_secret(info, api)?)
        .map_err(|_| Error::crypto("recovered secret is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_round_trip_both_nonce_modes() {
        let key = SymmetricKey::generate();
        let sealed = key.encrypt(b"payload").unwrap();
        assert_eq!(key.decrypt(&sealed).unwrap(), b"payload");

        let nonce = [7u8; NONCE_LEN];
        let sealed = key.encrypt_with_nonce(&nonce, b"payload").unwrap();
        assert_eq!(key.decrypt_with_nonce(&nonce, &sealed).unwrap(), b"payload");

        let other = SymmetricKey::generate();
        assert!(other.decrypt(&key.encrypt(b"payload").unwrap()).is_err());
    }

    #[test]
    fn key_agreement_is_symmetric() {
        let a = EncryptionKeypair::generate();
        let b = EncryptionKeypair::generate();
        let ab = derive_symmetric_key(&a.secret, &b.public_bytes());
        let ba = derive_symmetric_key(&b.secret, &a.public_bytes());
        let sealed = ab.encrypt(b"hello").unwrap();
        assert_eq!(ba.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn signature_verifies_only_with_matching_key() {
        let keys = SignKeypair::generate();
        let api = CryptoApi::new(EncryptionKeypair::generate(), Some(keys.clone()));
        let sig = api.sign(b"challenge").unwrap();
        assert!(CryptoApi::verify(&keys.public_bytes(), b"challenge", &sig).is_ok());

        let other = SignKeypair::generate();
        assert!(CryptoApi::verify(&other.public_bytes(), b"challenge", &sig).is_err());
        assert!(CryptoApi::verify(&keys.public_bytes(), b"different", &sig).is_err());
    }

    #[test]
    fn encryption_only_api_has_no_sign_key() {
        let api = CryptoApi::new(EncryptionKeypair::generate(), None);
        assert!(matches!(api.sign(b"x"), Err(Error::NoSignKey)));
    }

    #[test]
    fn scrypt_is_deterministic() {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let a = derive_wrapping_key("", &salt).unwrap();
        let b = derive_wrapping_key("", &salt).unwrap();
        // identical inputs are bit-identical keys
        let sealed = a.encrypt(b"probe").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"probe");
        // normalization applies before derivation
        let c = derive_wrapping_key("Å", &salt).unwrap();
        let d = derive_wrapping_key("A\u{30a}", &salt).unwrap();
        let sealed = c.encrypt(b"probe").unwrap();
        assert_eq!(d.decrypt(&sealed).unwrap(), b"probe");
    }

    #[test]
    fn recovery_round_trip() {
        let recipient = EncryptionKeypair::generate();
        let api = CryptoApi::new(recipient.clone(), None);
        let info =
            create_recovery_information(&recipient.public_bytes(), b"abfuqlwkeu", "test@me")
                .unwrap();
        assert_eq!(info.identity, "test@me");
        assert_eq!(recover_secret_as_string(&info, &api).unwrap(), "abfuqlwkeu");

        let wrong = CryptoApi::new(EncryptionKeypair::generate(), None);
        assert!(recover_secret(&info, &wrong).is_err());
    }
}
