use thiserror::Error;

use crate::{bunker::BunkerSession, Event, EventTemplate, PubKey, SecretKey};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no authenticated signer available")]
    NotAuthenticated,

    #[error("unsigned event json is invalid")]
    InvalidTemplate,

    #[error("remote signing failed: {0}")]
    Remote(#[from] crate::bunker::SignError),
}

/// the signing capability handed to features that publish events (chat,
/// zaps, presence): either a key held in this process or a session against
/// a remote signer
#[derive(Debug, Clone)]
pub enum Signer {
    Local(SecretKey),
    Remote(BunkerSession),
}

impl Signer {
    pub fn is_authenticated(&self) -> bool {
        match self {
            Self::Local(_) => true,
            Self::Remote(session) => session.is_authenticated(),
        }
    }

    pub async fn user_pubkey(&self) -> Option<PubKey> {
        match self {
            Self::Local(sk) => Some(sk.pubkey()),
            Self::Remote(session) => session.user_pubkey().await,
        }
    }

    pub async fn finalize_event(&self, template: EventTemplate) -> Result<Event, SignerError> {
        match self {
            Self::Local(sk) => Ok(template.finalize(sk)),
            Self::Remote(session) => {
                if !session.is_authenticated() {
                    return Err(SignerError::NotAuthenticated);
                }
                Ok(session.finalize_event(template).await?)
            }
        }
    }

    /// json in / json out variant of `finalize_event`
    pub async fn sign_event(&self, unsigned_event_json: &str) -> Result<String, SignerError> {
        match self {
            Self::Local(sk) => {
                let template: EventTemplate = serde_json::from_str(unsigned_event_json)
                    .map_err(|_| SignerError::InvalidTemplate)?;
                let event = template.finalize(sk);
                Ok(serde_json::to_string(&event).expect("events always encode as json"))
            }
            Self::Remote(session) => {
                if !session.is_authenticated() {
                    return Err(SignerError::NotAuthenticated);
                }
                Ok(session.sign_event(unsigned_event_json).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, Tags, Timestamp};

    #[tokio::test]
    async fn test_local_signer() {
        let sk = SecretKey::generate();
        let signer = Signer::Local(sk);

        assert!(signer.is_authenticated());
        assert_eq!(signer.user_pubkey().await, Some(sk.pubkey()));

        let event = signer
            .finalize_event(EventTemplate {
                created_at: Timestamp(1700000000),
                kind: Kind(1),
                tags: Tags::default(),
                content: "hi".to_string(),
            })
            .await
            .unwrap();

        assert!(event.verify());
        assert_eq!(event.pubkey, sk.pubkey());
    }

    #[tokio::test]
    async fn test_local_signer_json_round_trip() {
        let signer = Signer::Local(SecretKey::generate());

        let unsigned = r#"{"created_at":1700000000,"kind":1,"tags":[],"content":"hi"}"#;
        let signed = signer.sign_event(unsigned).await.unwrap();

        let event: Event = serde_json::from_str(&signed).unwrap();
        assert!(event.verify());
        assert_eq!(event.content, "hi");
    }
}
