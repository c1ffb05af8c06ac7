use crate::{Kind, PubKey, Signature, Tags, Timestamp, ID};
use secp256k1::{schnorr, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// a signed nostr event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: ID,
    pub pubkey: PubKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Tags,
    pub content: String,
    pub sig: Signature,
}

impl Event {
    /// serialize the event for id computation:
    /// `[0,"<pubkey>",<created_at>,<kind>,<tags>,"<content>"]`
    pub fn serialize(&self) -> Vec<u8> {
        let array = serde_json::json!([
            0,
            self.pubkey,
            self.created_at.0,
            self.kind,
            self.tags.0,
            self.content
        ]);
        array.to_string().into_bytes()
    }

    /// recompute the canonical digest and compare it to the stored id
    pub fn check_id(&self) -> bool {
        let hash = Sha256::digest(self.serialize());
        ID::from_bytes(hash.into()) == self.id
    }

    /// verify the schnorr signature against the canonical digest
    pub fn verify_signature(&self) -> bool {
        let pubkey = match XOnlyPublicKey::from_byte_array(self.pubkey.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };

        let signature = schnorr::Signature::from_byte_array(self.sig.0);
        let hash = Sha256::digest(self.serialize());

        SECP256K1.verify_schnorr(&signature, &hash, &pubkey).is_ok()
    }

    /// id integrity plus signature validity, the full acceptance check
    /// applied to anything a relay hands us
    pub fn verify(&self) -> bool {
        self.check_id() && self.verify_signature()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(err) => write!(f, "Event({} >> {})", self.id, err),
        }
    }
}

// identity is the id; everything else is derived from it
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventTemplate, SecretKey};

    #[test]
    fn test_id_is_deterministic() {
        let sk = SecretKey::from_hex(
            "945e01e37662430162121b804d3645a86d97df9d256917d86735d0eb219393eb",
        )
        .unwrap();

        let template = EventTemplate {
            created_at: Timestamp(1700000000),
            kind: Kind(1),
            tags: Tags(vec![vec!["t".to_string(), "test".to_string()]]),
            content: "hello \"quoted\"\nworld\t!".to_string(),
        };

        let a = template.clone().finalize(&sk);
        let b = template.finalize(&sk);

        assert_eq!(a.id, b.id);
        assert!(a.check_id());
        assert!(a.verify_signature());

        // the digest is sha256 over exactly the canonical array
        let expected: [u8; 32] = Sha256::digest(a.serialize()).into();
        assert_eq!(a.id.as_bytes(), &expected);
    }

    #[test]
    fn test_tampering_breaks_verification() {
        let sk = SecretKey::generate();
        let mut event = EventTemplate {
            created_at: Timestamp(1700000000),
            kind: Kind(1),
            tags: Tags::default(),
            content: "original".to_string(),
        }
        .finalize(&sk);

        assert!(event.verify());

        event.content = "tampered".to_string();
        assert!(!event.check_id());
        assert!(!event.verify());
    }

    #[test]
    fn test_serde_round_trip() {
        let sk = SecretKey::generate();
        let event = EventTemplate {
            created_at: Timestamp(1712345678),
            kind: Kind::REMOTE_SIGNER,
            tags: Tags::pointing_at(&sk.pubkey()),
            content: "payload".to_string(),
        }
        .finalize(&sk);

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert!(back.verify());
    }
}
