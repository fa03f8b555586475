//! Signed envelopes and the payloads they carry

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;
use crate::crypto::{self, CryptoError};

/// `{"type":"signed_data","data":…,"counter":n,"signature":…}`
///
/// `data` stays an untyped JSON tree so the signature is checked over exactly
/// what the sender signed, including fields this node does not understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: Value,
    pub counter: u64,
    /// Base64 salted signature
    pub signature: String,
}

impl SignedEnvelope {
    /// Serialize `payload`, sign it with `counter`, and wrap it.
    pub fn seal(
        payload: &Payload,
        counter: u64,
        signing_key: &SigningKey,
    ) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(payload)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        let signature = crypto::sign(&data, counter, signing_key)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;

        Ok(Self {
            data,
            counter,
            signature: BASE64.encode(signature),
        })
    }

    /// Parse the inner payload.
    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        match serde_json::from_value::<Payload>(self.data.clone()) {
            Ok(Payload::Unknown) => Err(ProtocolError::UnknownPayload),
            Ok(payload) => Ok(payload),
            Err(e) => Err(ProtocolError::DeserializationError(e.to_string())),
        }
    }

    pub fn verify(&self, public_key: &VerifyingKey) -> Result<(), CryptoError> {
        let signature = BASE64
            .decode(&self.signature)
            .map_err(|_| CryptoError::VerificationFailed)?;
        crypto::verify(&self.data, self.counter, &signature, public_key)
    }
}

/// Inner payload of a signed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "hello")]
    Hello(Hello),
    #[serde(rename = "public_chat")]
    PublicChat(PublicChat),
    #[serde(rename = "chat")]
    PrivateChat(PrivateChat),
    #[serde(rename = "fileTransfer")]
    FileTransfer(FileTransfer),
    #[serde(other)]
    Unknown,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Hello(_) => "hello",
            Payload::PublicChat(_) => "public_chat",
            Payload::PrivateChat(_) => "chat",
            Payload::FileTransfer(_) => "fileTransfer",
            Payload::Unknown => "unknown",
        }
    }
}

/// Client registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Base64 Ed25519 public key; must verify this envelope
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// Display name
    #[serde(rename = "from", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Plaintext broadcast to everyone on the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicChat {
    /// Base64 Ed25519 public key of the sender
    pub sender: String,
    #[serde(rename = "from", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub message: String,
}

/// Recipient addressing of a private chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(rename = "client-id")]
    pub client_id: String,
    #[serde(rename = "server-id")]
    pub server_id: String,
}

/// Hybrid-encrypted message for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateChat {
    /// Addresses of the nodes hosting the recipient
    pub destination_servers: Vec<String>,
    /// Base64 iv of the body cipher
    pub iv: String,
    /// Base64 wrapped session keys, one per recipient
    pub symm_keys: Vec<String>,
    /// Base64 ciphertext
    pub chat: String,
    pub client_info: ClientInfo,
    pub sender_client_id: String,
    /// Unix milliseconds after which the envelope must not be delivered
    pub time_to_die: u64,
}

impl PrivateChat {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.time_to_die <= now_millis
    }
}

/// File share notice; the bytes live in the blob store behind `file_link`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// Sender client id
    pub from: String,
    /// Recipient client id; absent means everyone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Node hosting the recipient, when the sender already knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_server: Option<String>,
    #[serde(rename = "fileLink")]
    pub file_link: String,
    /// Unix milliseconds
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ClientKeys;
    use crate::protocol::WireMessage;

    fn hello_for(keys: &ClientKeys) -> Payload {
        Payload::Hello(Hello {
            public_key: keys.public_key_b64(),
            encryption_key: Some(keys.encryption_key_b64()),
            display_name: Some("alice".to_string()),
        })
    }

    #[test]
    fn test_seal_and_verify() {
        let keys = ClientKeys::generate();
        let envelope = SignedEnvelope::seal(&hello_for(&keys), 5, keys.signing_key()).unwrap();

        assert_eq!(envelope.counter, 5);
        assert!(envelope.verify(&keys.verifying_key()).is_ok());
        assert_eq!(envelope.payload().unwrap(), hello_for(&keys));
    }

    #[test]
    fn test_signature_survives_wire_roundtrip() {
        let keys = ClientKeys::generate();
        let envelope = SignedEnvelope::seal(&hello_for(&keys), 1, keys.signing_key()).unwrap();
        let raw = WireMessage::SignedData(envelope).to_json().unwrap();

        match WireMessage::from_json(&raw).unwrap() {
            WireMessage::SignedData(received) => {
                assert!(received.verify(&keys.verifying_key()).is_ok());
            }
            other => panic!("Wrong message type: {}", other.message_type()),
        }
    }

    #[test]
    fn test_tampered_counter_fails() {
        let keys = ClientKeys::generate();
        let mut envelope = SignedEnvelope::seal(&hello_for(&keys), 1, keys.signing_key()).unwrap();
        envelope.counter = 2;
        assert!(envelope.verify(&keys.verifying_key()).is_err());
    }

    #[test]
    fn test_tampered_data_fails() {
        let keys = ClientKeys::generate();
        let mut envelope = SignedEnvelope::seal(&hello_for(&keys), 1, keys.signing_key()).unwrap();
        envelope.data["from"] = Value::from("mallory");
        assert!(envelope.verify(&keys.verifying_key()).is_err());
    }

    #[test]
    fn test_hello_wire_shape() {
        let keys = ClientKeys::generate();
        let value = serde_json::to_value(hello_for(&keys)).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["public_key"], keys.public_key_b64().as_str());
    }

    #[test]
    fn test_private_chat_wire_shape() {
        let raw = r#"{
            "type": "chat",
            "destination_servers": ["127.0.0.1:3001"],
            "iv": "aXY=",
            "symm_keys": ["a2V5"],
            "chat": "Y2lwaGVy",
            "client_info": {"client-id": "bob", "server-id": "n2"},
            "sender_client_id": "alice",
            "time_to_die": 1700000000000
        }"#;
        let payload: Payload = serde_json::from_str(raw).unwrap();
        match payload {
            Payload::PrivateChat(chat) => {
                assert_eq!(chat.client_info.client_id, "bob");
                assert_eq!(chat.destination_servers, vec!["127.0.0.1:3001"]);
                assert!(chat.is_expired(1_700_000_000_000));
                assert!(!chat.is_expired(1_699_999_999_999));
            }
            other => panic!("Wrong payload: {}", other.kind()),
        }
    }

    #[test]
    fn test_file_transfer_wire_shape() {
        let payload = Payload::FileTransfer(FileTransfer {
            file_name: "notes.txt".to_string(),
            from: "alice".to_string(),
            to: None,
            destination_server: None,
            file_link: "blob://1/notes.txt".to_string(),
            timestamp: 10,
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "fileTransfer");
        assert_eq!(value["fileName"], "notes.txt");
        assert_eq!(value["fileLink"], "blob://1/notes.txt");
        assert!(value.get("to").is_none());
    }

    #[test]
    fn test_unknown_payload_rejected() {
        let envelope = SignedEnvelope {
            data: serde_json::json!({"type": "forwardMessage"}),
            counter: 1,
            signature: String::new(),
        };
        assert_eq!(envelope.payload(), Err(ProtocolError::UnknownPayload));
    }
}
