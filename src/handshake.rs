//! Encrypted peer handshake.
//!
//! Both sides exchange static instance public keys (the initiator
//! already knows the responder's from an invitation), derive the
//! shared symmetric key and seal the channel. The initiator then names
//! the connection group and waits for the responder's `sync` reply, so
//! `connected` never fires before the responder agreed. Person
//! identities are verified with a signature challenge both ways; a
//! signature that verifies against a different key than expected is an
//! impersonation attempt and fatal. Finally both sides exchange their
//! instance-id objects.

use crate::connection::Connection;
use crate::error::{NetError, Result};
use chum_core::{CryptoApi, IdHash};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// What the handshake needs from the local keychain.
#[derive(Clone)]
pub struct LocalIdentity {
    pub person_id: IdHash,
    pub instance_id: IdHash,
    pub person_api: CryptoApi,
    pub instance_api: CryptoApi,
}

/// The verified remote identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerIdentity {
    pub person_id: IdHash,
    pub instance_id: IdHash,
    pub instance_key: [u8; 32],
    pub person_sign_key: [u8; 32],
}

#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// Connection group this handshake negotiates (`chum`, `video`, …).
    pub group: String,
    pub timeout: Duration,
    /// The responder's instance encryption key; initiators must know it.
    pub expected_instance_key: Option<[u8; 32]>,
    /// Pin for the peer's person sign key, when already known.
    pub expected_person_sign_key: Option<[u8; 32]>,
}

impl HandshakeConfig {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            expected_instance_key: None,
            expected_person_sign_key: None,
        }
    }

    pub fn expect_instance_key(mut self, key: [u8; 32]) -> Self {
        self.expected_instance_key = Some(key);
        self
    }

    pub fn expect_person_sign_key(mut self, key: [u8; 32]) -> Self {
        self.expected_person_sign_key = Some(key);
        self
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommunicationRequest {
    command: String,
    source_public_key: String,
    target_public_key: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionGroupName {
    command: String,
    group_name: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncMessage {
    command: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticationRequest {
    command: String,
    public_key: String,
    challenge: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticationResponse {
    command: String,
    response: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceIdObject {
    command: String,
    person_id: String,
    instance_id: String,
}

fn parse_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).map_err(|_| NetError::handshake("bad hex key"))?;
    bytes
        .try_into()
        .map_err(|_| NetError::handshake("bad key length"))
}

fn random_challenge() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Runs the initiator side. On success the connection is sealed and the
/// peer verified; on any failure the connection is closed.
pub async fn initiate(
    connection: &Connection,
    local: &LocalIdentity,
    config: &HandshakeConfig,
) -> Result<PeerIdentity> {
    run_with_timeout(connection, config, initiate_inner(connection, local, config)).await
}

/// Runs the responder side.
pub async fn accept(
    connection: &Connection,
    local: &LocalIdentity,
    config: &HandshakeConfig,
) -> Result<PeerIdentity> {
    run_with_timeout(connection, config, accept_inner(connection, local, config)).await
}

async fn run_with_timeout(
    connection: &Connection,
    config: &HandshakeConfig,
    handshake: impl std::future::Future<Output = Result<PeerIdentity>>,
) -> Result<PeerIdentity> {
    match tokio::time::timeout(config.timeout, handshake).await {
        Ok(Ok(peer)) => Ok(peer),
        Ok(Err(err)) => {
            let reason = match &err {
                NetError::KeyMismatch => "key-mismatch",
                _ => "handshake-failed",
            };
            connection.close(reason).await;
            Err(err)
        }
        Err(_) => {
            connection.close("handshake-timeout").await;
            Err(NetError::HandshakeTimeout)
        }
    }
}

async fn initiate_inner(
    connection: &Connection,
    local: &LocalIdentity,
    config: &HandshakeConfig,
) -> Result<PeerIdentity> {
    let target_key = config
        .expected_instance_key
        .ok_or_else(|| NetError::handshake("initiator needs the responder's instance key"))?;
    let source_key = local.instance_api.public_encryption_key();
    // seal before speaking; the request itself travels unsealed since
    // the responder derives the key from it
    connection
        .encryption()
        .set_key(local.instance_api.symmetric_key_for(&target_key));
    connection
        .send_json_unsealed(&CommunicationRequest {
            command: "communication_request".to_owned(),
            source_public_key: hex::encode(source_key),
            target_public_key: hex::encode(target_key),
        })
        .await?;

    // the responder acknowledges the sealed channel
    let _: SyncMessage = connection.reader().read_command("sync", None).await?;

    connection
        .send_json(&ConnectionGroupName {
            command: "connection_group_name".to_owned(),
            group_name: config.group.clone(),
        })
        .await?;
    // the responder's second sync is the agreement to proceed
    let _: SyncMessage = connection.reader().read_command("sync", None).await?;

    let peer = authenticate(connection, local, config, true).await?;
    Ok(PeerIdentity {
        instance_key: target_key,
        ..peer
    })
}

async fn accept_inner(
    connection: &Connection,
    local: &LocalIdentity,
    config: &HandshakeConfig,
) -> Result<PeerIdentity> {
    let request: CommunicationRequest = connection
        .reader()
        .read_command("communication_request", None)
        .await?;
    let own_key = local.instance_api.public_encryption_key();
    if parse_key(&request.target_public_key)? != own_key {
        return Err(NetError::handshake("we are not the requested target"));
    }
    let source_key = parse_key(&request.source_public_key)?;
    if let Some(expected) = config.expected_instance_key {
        if source_key != expected {
            return Err(NetError::KeyMismatch);
        }
    }
    // key installed before the ack leaves, so everything the initiator
    // sends after the ack is decryptable
    connection
        .encryption()
        .set_key(local.instance_api.symmetric_key_for(&source_key));
    connection
        .send_json(&SyncMessage {
            command: "sync".to_owned(),
        })
        .await?;

    let group: ConnectionGroupName = connection
        .reader()
        .read_command("connection_group_name", None)
        .await?;
    if group.group_name != config.group {
        return Err(NetError::handshake(format!(
            "group {:?} not accepted",
            group.group_name
        )));
    }
    connection
        .send_json(&SyncMessage {
            command: "sync".to_owned(),
        })
        .await?;

    let peer = authenticate(connection, local, config, false).await?;
    Ok(PeerIdentity {
        instance_key: source_key,
        ..peer
    })
}

/// The person-level signature challenge, then the instance-id exchange.
/// The initiator speaks first at every step.
async fn authenticate(
    connection: &Connection,
    local: &LocalIdentity,
    config: &HandshakeConfig,
    initiator: bool,
) -> Result<PeerIdentity> {
    let own_sign_key = local
        .person_api
        .public_sign_key()
        .ok_or(chum_core::Error::NoSignKey)
        .map_err(NetError::Core)?;
    let challenge = random_challenge();
    let own_request = AuthenticationRequest {
        command: "authentication_request".to_owned(),
        public_key: hex::encode(own_sign_key),
        challenge: challenge.clone(),
    };

    let peer_request: AuthenticationRequest = if initiator {
        connection.send_json(&own_request).await?;
        connection
            .reader()
            .read_command("authentication_request", None)
            .await?
    } else {
        let request = connection
            .reader()
            .read_command("authentication_request", None)
            .await?;
        connection.send_json(&own_request).await?;
        request
    };

    let claimed_sign_key = parse_key(&peer_request.public_key)?;
    let own_response = AuthenticationResponse {
        command: "authentication_response".to_owned(),
        response: hex::encode(
            local
                .person_api
                .sign(peer_request.challenge.as_bytes())
                .map_err(NetError::Core)?,
        ),
    };
    let peer_response: AuthenticationResponse = if initiator {
        connection.send_json(&own_response).await?;
        connection
            .reader()
            .read_command("authentication_response", None)
            .await?
    } else {
        let response = connection
            .reader()
            .read_command("authentication_response", None)
            .await?;
        connection.send_json(&own_response).await?;
        response
    };

    let signature: [u8; 64] = hex::decode(&peer_response.response)
        .map_err(|_| NetError::handshake("bad signature hex"))?
        .try_into()
        .map_err(|_| NetError::handshake("bad signature length"))?;
    CryptoApi::verify(&claimed_sign_key, challenge.as_bytes(), &signature)
        .map_err(|_| NetError::handshake("challenge signature does not verify"))?;
    // the signature is genuine; now it must belong to who we expected
    if let Some(expected) = config.expected_person_sign_key {
        if claimed_sign_key != expected {
            return Err(NetError::KeyMismatch);
        }
    }

    let own_identity = InstanceIdObject {
        command: "instance_id_object".to_owned(),
        person_id: local.person_id.to_hex(),
        instance_id: local.instance_id.to_hex(),
    };
    let peer_identity: InstanceIdObject = if initiator {
        connection.send_json(&own_identity).await?;
        connection
            .reader()
            .read_command("instance_id_object", None)
            .await?
    } else {
        let identity = connection
            .reader()
            .read_command("instance_id_object", None)
            .await?;
        connection.send_json(&own_identity).await?;
        identity
    };

    Ok(PeerIdentity {
        person_id: IdHash::from_hex(&peer_identity.person_id).map_err(NetError::Core)?,
        instance_id: IdHash::from_hex(&peer_identity.instance_id).map_err(NetError::Core)?,
        instance_key: [0; 32],
        person_sign_key: claimed_sign_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, FramedTransport};
    use chum_core::{EncryptionKeypair, SignKeypair};

    fn identity(seed: &[u8]) -> LocalIdentity {
        LocalIdentity {
            person_id: IdHash::digest(&[seed, b".person"].concat()),
            instance_id: IdHash::digest(&[seed, b".instance"].concat()),
            person_api: CryptoApi::new(
                EncryptionKeypair::generate(),
                Some(SignKeypair::generate()),
            ),
            instance_api: CryptoApi::new(
                EncryptionKeypair::generate(),
                Some(SignKeypair::generate()),
            ),
        }
    }

    fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (
            Connection::new(Box::new(FramedTransport(a))),
            Connection::new(Box::new(FramedTransport(b))),
        )
    }

    #[tokio::test]
    async fn successful_handshake_verifies_both_sides() {
        let alice = identity(b"alice");
        let bob = identity(b"bob");
        let (ca, cb) = pair();
        let initiator_config = HandshakeConfig::new("chum")
            .expect_instance_key(bob.instance_api.public_encryption_key())
            .expect_person_sign_key(bob.person_api.public_sign_key().unwrap());
        let responder_config = HandshakeConfig::new("chum");

        let (from_a, from_b) = tokio::join!(
            initiate(&ca, &alice, &initiator_config),
            accept(&cb, &bob, &responder_config),
        );
        let seen_by_alice = from_a.unwrap();
        let seen_by_bob = from_b.unwrap();
        assert_eq!(seen_by_alice.person_id, bob.person_id);
        assert_eq!(seen_by_alice.instance_id, bob.instance_id);
        assert_eq!(
            seen_by_alice.instance_key,
            bob.instance_api.public_encryption_key()
        );
        assert_eq!(seen_by_bob.person_id, alice.person_id);
        assert_eq!(
            seen_by_bob.person_sign_key,
            alice.person_api.public_sign_key().unwrap()
        );
        // the channel stays usable and sealed
        assert!(ca.encryption().is_active());
        assert!(cb.encryption().is_active());
    }

    #[tokio::test]
    async fn impersonation_is_rejected_with_key_mismatch() {
        let alice = identity(b"alice");
        let bob = identity(b"bob");
        let expected = SignKeypair::generate();
        let (ca, cb) = pair();
        // alice expects a person key bob does not hold; bob's signature
        // verifies against bob's own key, which is not the expected one
        let initiator_config = HandshakeConfig::new("chum")
            .expect_instance_key(bob.instance_api.public_encryption_key())
            .expect_person_sign_key(expected.public_bytes());

        let responder_config = HandshakeConfig::new("chum");
        let (from_a, _from_b) = tokio::join!(
            initiate(&ca, &alice, &initiator_config),
            accept(&cb, &bob, &responder_config),
        );
        assert!(matches!(from_a.unwrap_err(), NetError::KeyMismatch));
        assert_eq!(ca.wait_closed().await, "key-mismatch");
    }

    #[tokio::test]
    async fn group_name_mismatch_fails() {
        let alice = identity(b"alice");
        let bob = identity(b"bob");
        let (ca, cb) = pair();
        let initiator_config = HandshakeConfig::new("video")
            .expect_instance_key(bob.instance_api.public_encryption_key());

        let responder_config = HandshakeConfig::new("chum");
        let (from_a, from_b) = tokio::join!(
            initiate(&ca, &alice, &initiator_config),
            accept(&cb, &bob, &responder_config),
        );
        assert!(from_b.is_err());
        assert!(from_a.is_err());
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let alice = identity(b"alice");
        let bob = identity(b"bob");
        let (ca, _cb) = pair();
        let config = HandshakeConfig {
            timeout: Duration::from_millis(100),
            ..HandshakeConfig::new("chum")
                .expect_instance_key(bob.instance_api.public_encryption_key())
        };
        let err = initiate(&ca, &alice, &config).await.unwrap_err();
        assert!(matches!(err, NetError::HandshakeTimeout));
        assert!(ca.is_closed() || ca.wait_closed().await == "handshake-timeout");
    }
}
