//! # seance
//!
//! a nostr client core for applications that sign through a remote signer
//!
//! this library provides the protocol machinery such an application needs:
//! keys and the two content-encryption schemes, relay connections and a
//! multi-relay pool with a merged event stream, end-of-stored-events
//! aggregation with bounded timers, and the remote-signer ("bunker")
//! session handshake and rpc protocol.

pub mod bunker;
pub mod envelopes;
pub mod eose;
pub mod event;
pub mod event_template;
pub mod filter;
pub mod helpers;
pub mod keys;
pub mod nip04;
pub mod nip44;
pub mod pool;
pub mod relay;
pub mod signer;
pub mod tags;
pub mod timestamp;
pub mod types;

mod normalize;

// re-export commonly used types
pub use bunker::{AuthState, BunkerSession, SavedSession, SessionStore};
pub use eose::{EoseTracker, Phase, TimeoutConfig};
pub use event::Event;
pub use event_template::EventTemplate;
pub use filter::Filter;
pub use keys::{PubKey, SecretKey};
pub use normalize::normalize_url;
pub use pool::{ConnectionState, Frame, RelayPool};
pub use relay::{LinkEvent, RelayLink};
pub use signer::Signer;
pub use tags::{Tag, Tags};
pub use timestamp::Timestamp;
pub use types::{Kind, Signature, ID};
