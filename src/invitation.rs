//! Invitation urls.
//!
//! An invitation is a url whose fragment carries a url-encoded JSON
//! object `{url, publicKey, token}`. Accepting one dials `url` and
//! runs an outgoing handshake pinned to `publicKey`.

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    /// Websocket url of the inviting instance or its comm-server.
    pub url: String,
    /// Hex of the inviting instance's public encryption key.
    pub public_key: String,
    /// One-time token the inviter hands out.
    pub token: String,
}

impl Invitation {
    pub fn new(
        url: impl Into<String>,
        public_key: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            public_key: public_key.into(),
            token: token.into(),
        }
    }

    /// The instance key as raw bytes.
    pub fn instance_key(&self) -> Result<[u8; 32]> {
        hex::decode(&self.public_key)
            .map_err(|_| NetError::handshake("bad invitation key hex"))?
            .try_into()
            .map_err(|_| NetError::handshake("bad invitation key length"))
    }

    /// Renders the invitation into `base#<urlencoded json>`.
    pub fn to_url(&self, base: &str) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}#{}", base, urlencoding::encode(&json)))
    }

    /// Parses an invitation url.
    pub fn parse(url: &str) -> Result<Self> {
        let (_, fragment) = url
            .split_once('#')
            .ok_or_else(|| NetError::handshake("invitation url without fragment"))?;
        let json = urlencoding::decode(fragment)
            .map_err(|_| NetError::handshake("bad invitation encoding"))?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invitation_url_round_trip() {
        let invitation = Invitation::new(
            "wss://example.com/chum",
            hex::encode([7u8; 32]),
            "one-time-token",
        );
        let url = invitation.to_url("https://app.example.com/invite").unwrap();
        assert!(url.starts_with("https://app.example.com/invite#"));
        let parsed = Invitation::parse(&url).unwrap();
        assert_eq!(parsed, invitation);
        assert_eq!(parsed.instance_key().unwrap(), [7u8; 32]);
    }

    #[test]
    fn malformed_invitations_are_rejected() {
        assert!(Invitation::parse("https://example.com/no-fragment").is_err());
        assert!(Invitation::parse("https://example.com#not-json").is_err());
        let bad_key = Invitation::new("wss://x", "zz", "t");
        assert!(bad_key.instance_key().is_err());
    }
}
