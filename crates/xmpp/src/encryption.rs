//! Boundary to the end-to-end encryption layer.
//!
//! The engine only moves envelopes on and off the wire; key management and
//! the cipher live behind [`PayloadEncryption`].

use base64::Engine;
use base64::prelude::BASE64_STANDARD;

use crate::element::{Element, ElementExt};
use crate::error::XmppError;
use crate::ns;

/// Body sent alongside an encrypted payload for clients that cannot read it.
pub const FALLBACK_BODY: &str =
    "I sent you an OMEMO encrypted message but your client doesn't seem to support that.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptionError {
    #[error("encryption is not available")]
    Unavailable,
    #[error("no session with device {0}")]
    NoSession(u32),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub device: u32,
    pub prekey: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub sender_device: u32,
    pub iv: Vec<u8>,
    pub keys: Vec<WrappedKey>,
    /// Absent for key-transport messages.
    pub payload: Option<Vec<u8>>,
}

impl EncryptedEnvelope {
    pub fn from_element(element: &Element) -> Result<Self, XmppError> {
        let header = element
            .get_child("header", ns::OMEMO)
            .ok_or_else(|| XmppError::decode("encrypted payload without header"))?;
        let sender_device = header
            .attr("sid")
            .and_then(|sid| sid.parse().ok())
            .ok_or_else(|| XmppError::decode("encrypted header without valid sid"))?;

        let mut keys = Vec::new();
        for key in header.children().filter(|c| c.is("key", ns::OMEMO)) {
            let Some(device) = key.attr("rid").and_then(|rid| rid.parse().ok()) else {
                continue;
            };
            keys.push(WrappedKey {
                device,
                prekey: matches!(key.attr("prekey"), Some("true" | "1")),
                data: decode_base64(&key.text())?,
            });
        }

        let iv = header
            .child_text("iv", ns::OMEMO)
            .ok_or_else(|| XmppError::decode("encrypted header without iv"))?;

        let payload = element
            .child_text("payload", ns::OMEMO)
            .map(|text| decode_base64(&text))
            .transpose()?;

        Ok(Self {
            sender_device,
            iv: decode_base64(&iv)?,
            keys,
            payload,
        })
    }

    pub fn to_element(&self) -> Element {
        let keys = self.keys.iter().map(|key| {
            Element::builder("key", ns::OMEMO)
                .attr("prekey", key.prekey.then_some("true"))
                .attr("rid", key.device.to_string())
                .append(BASE64_STANDARD.encode(&key.data))
                .build()
        });

        let header = Element::builder("header", ns::OMEMO)
            .attr("sid", self.sender_device.to_string())
            .append_all(keys)
            .append(
                Element::builder("iv", ns::OMEMO)
                    .append(BASE64_STANDARD.encode(&self.iv))
                    .build(),
            )
            .build();

        let mut encrypted = Element::builder("encrypted", ns::OMEMO).append(header);
        if let Some(payload) = &self.payload {
            encrypted = encrypted.append(
                Element::builder("payload", ns::OMEMO)
                    .append(BASE64_STANDARD.encode(payload))
                    .build(),
            );
        }
        encrypted.build()
    }
}

fn decode_base64(text: &str) -> Result<Vec<u8>, XmppError> {
    BASE64_STANDARD
        .decode(text.trim())
        .map_err(|e| XmppError::decode(format!("invalid base64: {e}")))
}

#[cfg_attr(test, mockall::automock)]
pub trait PayloadEncryption: Send + Sync {
    fn own_device_id(&self) -> Option<u32>;

    /// Device ids with an established session for `bare_jid`.
    fn known_devices(&self, bare_jid: &str) -> Vec<u32>;

    fn encrypt(&self, plaintext: &str, devices: &[u32])
    -> Result<EncryptedEnvelope, EncryptionError>;

    fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<String, EncryptionError>;
}

/// Collaborator used when no encryption layer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl PayloadEncryption for NoEncryption {
    fn own_device_id(&self) -> Option<u32> {
        None
    }

    fn known_devices(&self, _bare_jid: &str) -> Vec<u32> {
        Vec::new()
    }

    fn encrypt(
        &self,
        _plaintext: &str,
        _devices: &[u32],
    ) -> Result<EncryptedEnvelope, EncryptionError> {
        Err(EncryptionError::Unavailable)
    }

    fn decrypt(&self, _envelope: &EncryptedEnvelope) -> Result<String, EncryptionError> {
        Err(EncryptionError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let envelope = EncryptedEnvelope {
            sender_device: 27183,
            iv: vec![1, 2, 3],
            keys: vec![
                WrappedKey {
                    device: 31415,
                    prekey: false,
                    data: b"k1".to_vec(),
                },
                WrappedKey {
                    device: 12321,
                    prekey: true,
                    data: b"k2".to_vec(),
                },
            ],
            payload: Some(b"ciphertext".to_vec()),
        };

        let element = envelope.to_element();
        let header = element.get_child("header", ns::OMEMO).unwrap();
        assert_eq!(header.attr("sid"), Some("27183"));
        assert_eq!(header.children().filter(|c| c.name() == "key").count(), 2);
        assert_eq!(header.child_text("iv", ns::OMEMO).as_deref(), Some("AQID"));

        let parsed = EncryptedEnvelope::from_element(&element).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn missing_header_is_rejected() {
        let element = Element::bare("encrypted", ns::OMEMO);
        assert!(EncryptedEnvelope::from_element(&element).is_err());
    }

    #[test]
    fn no_encryption_yields_nothing() {
        let none = NoEncryption;
        assert!(none.known_devices("bob@example.com").is_empty());
        assert_eq!(none.encrypt("hi", &[1]), Err(EncryptionError::Unavailable));
    }
}
