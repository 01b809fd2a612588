use super::Plugin;
use crate::connection::{Event, Payload};
use crate::error::CloseOrigin;
use chum_core::SymmetricKey;
use parking_lot::RwLock;

const FRAME_TEXT: u8 = 1;
const FRAME_BINARY: u8 = 0;

/// Transparently seals outgoing frames and opens incoming ones once a
/// symmetric key is installed after the handshake. A frame that fails
/// to open closes the connection.
#[derive(Default)]
pub struct EncryptionPlugin {
    key: RwLock<Option<SymmetricKey>>,
}

impl EncryptionPlugin {
    pub fn set_key(&self, key: SymmetricKey) {
        *self.key.write() = Some(key);
    }

    pub fn is_active(&self) -> bool {
        self.key.read().is_some()
    }
}

impl Plugin for EncryptionPlugin {
    fn name(&self) -> &'static str {
        "encryption"
    }

    fn incoming(&self, event: Event) -> Option<Event> {
        let key = self.key.read();
        let key = match &*key {
            Some(key) => key,
            None => return Some(event),
        };
        match event {
            Event::Message(Payload::Binary(sealed)) => match key.decrypt(&sealed) {
                Ok(mut frame) if !frame.is_empty() => {
                    let kind = frame.remove(0);
                    let payload = match kind {
                        FRAME_TEXT => match String::from_utf8(frame) {
                            Ok(s) => Payload::Text(s),
                            Err(_) => {
                                return Some(close("encrypted frame is not utf-8"));
                            }
                        },
                        _ => Payload::Binary(frame),
                    };
                    Some(Event::Message(payload))
                }
                _ => Some(close("decryption failed")),
            },
            Event::Message(Payload::Text(_)) => Some(close("unencrypted frame on sealed channel")),
            other => Some(other),
        }
    }

    fn outgoing(&self, event: Event) -> Option<Event> {
        let key = self.key.read();
        let key = match &*key {
            Some(key) => key,
            None => return Some(event),
        };
        match event {
            Event::Message(payload) => {
                let frame = match payload {
                    Payload::Text(s) => {
                        let mut f = vec![FRAME_TEXT];
                        f.extend(s.into_bytes());
                        f
                    }
                    Payload::Binary(b) => {
                        let mut f = vec![FRAME_BINARY];
                        f.extend(b);
                        f
                    }
                };
                let sealed = match key.encrypt(&frame) {
                    Ok(sealed) => sealed,
                    Err(err) => {
                        tracing::warn!("sealing frame failed: {}", err);
                        return None;
                    }
                };
                Some(Event::Message(Payload::Binary(sealed)))
            }
            other => Some(other),
        }
    }
}

fn close(reason: &str) -> Event {
    Event::Closed {
        reason: reason.to_owned(),
        origin: CloseOrigin::Local,
    }
}
