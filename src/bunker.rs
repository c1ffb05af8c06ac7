use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use url::Url;

use crate::{
    envelopes::Envelope,
    filter::TagQuery,
    helpers, keys, nip44,
    pool::{ConnectionState, Frame, RelayPool},
    Event, EventTemplate, Filter, Kind, PubKey, SecretKey, Tags, Timestamp,
};

/// tolerated clock skew between us, the relay and the signer, in seconds
const CLOCK_DRIFT_BUFFER: u32 = 5;

/// how long a signer gets to answer an rpc before we give up
const RPC_TIMEOUT: Duration = Duration::from_secs(90);

/// how long sign_event waits for the signer subscription to be acknowledged
const SUBSCRIPTION_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// bounded wait for the relay link to open after a login or restore
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: &'a str,
    method: &'a str,
    params: &'a [String],
}

/// decrypted signer message: a response to one of our requests, or an
/// unsolicited handshake acknowledgment
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// invoked when the signer asks the user to visit an authorization page
/// before it will answer a request
pub struct AuthUrlHandler(Box<dyn Fn(&str) + Send + Sync>);

impl AuthUrlHandler {
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

impl Debug for AuthUrlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn")
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("no signer session or signer key yet")]
    NotConnected,

    #[error("no relay accepted the request")]
    NotDelivered,

    #[error("request was cancelled before the signer answered")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    #[error("request encryption failed: {0}")]
    Encryption(#[from] nip44::EncryptError),

    #[error("signer replied with an error: {0}")]
    Response(String),
}

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("invalid relay url")]
    InvalidRelayUrl(#[from] url::ParseError),

    #[error("a login is already in progress or a session is active")]
    AlreadyActive,
}

#[derive(Error, Debug)]
pub enum UriError {
    #[error("uri is invalid")]
    Parse(#[from] url::ParseError),

    #[error("uri is not a bunker:// uri")]
    WrongScheme,

    #[error("uri carries no signer public key")]
    MissingPublicKey,

    #[error("uri carries an invalid signer public key")]
    InvalidPublicKey(#[from] keys::PubKeyError),

    #[error("uri carries no relay")]
    MissingRelay,
}

#[derive(Error, Debug)]
pub enum SignError {
    #[error("signer subscription never became ready")]
    SubscriptionNotReady,

    #[error("rpc call failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("signer returned something that is not an event")]
    InvalidEvent,

    #[error("signer returned an event with a bad id or signature")]
    InvalidSignature,
}

#[derive(Error, Debug)]
pub enum GetPublicKeyError {
    #[error("rpc call failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("signer returned an invalid public key")]
    InvalidPublicKey(#[from] keys::PubKeyError),
}

/// where the remote-signer handshake currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    NotAuthenticated,
    /// the connection uri is being displayed, waiting for the signer to scan
    WaitingForScan { uri: String },
    /// the signer acknowledged, user pubkey not confirmed yet
    Connecting,
    Authenticated { user_pubkey: PubKey },
    Error { message: String },
}

/// the persisted shape of an authenticated session, handed to the store
/// collaborator on login and back to us on restore
#[derive(Debug, Clone)]
pub struct SavedSession {
    pub user_pubkey: PubKey,
    pub bunker_pubkey: PubKey,
    pub client_secret_key: SecretKey,
    pub relay_url: String,
    pub secret: String,
}

/// external persistence collaborator; this crate never touches storage itself
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &SavedSession);
    fn load(&self) -> Option<SavedSession>;
    fn clear(&self);
}

struct PendingRequest {
    issued_at: Timestamp,
    reply: oneshot::Sender<Response>,
}

struct LiveSession {
    client_secret_key: SecretKey,
    secret: String,
    relay_url: String,
    started_at: Timestamp,
    sub_id: String,
    bunker_pubkey: Option<PubKey>,
    conversation_key: Option<[u8; 32]>,
    user_pubkey: Option<PubKey>,
}

/// a client session against a remote signer ("bunker") that holds the user's
/// key. we hold only a throwaway client key; every signature is obtained by
/// sending an encrypted rpc event through the relay and waiting for the
/// matching encrypted response.
#[derive(Clone)]
pub struct BunkerSession {
    pool: RelayPool,
    store: Arc<dyn SessionStore>,
    app_name: String,
    state: Arc<watch::Sender<AuthState>>,
    session: Arc<Mutex<Option<LiveSession>>>,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    sub_ready: Arc<watch::Sender<bool>>,
    on_auth_url: Arc<Option<AuthUrlHandler>>,
}

impl BunkerSession {
    pub fn new(
        store: Arc<dyn SessionStore>,
        app_name: impl Into<String>,
        on_auth_url: Option<AuthUrlHandler>,
    ) -> Self {
        let (pool, frames) = RelayPool::new();
        let (state, _) = watch::channel(AuthState::NotAuthenticated);
        let (sub_ready, _) = watch::channel(false);

        let session = Self {
            pool,
            store,
            app_name: app_name.into(),
            state: Arc::new(state),
            session: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sub_ready: Arc::new(sub_ready),
            on_auth_url: Arc::new(on_auth_url),
        };

        let pump = session.clone();
        tokio::spawn(async move { pump.pump(frames).await });

        session
    }

    /// observe handshake progress
    pub fn state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn auth_state(&self) -> AuthState {
        self.state.subscribe().borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.auth_state(), AuthState::Authenticated { .. })
    }

    pub async fn user_pubkey(&self) -> Option<PubKey> {
        self.session.lock().await.as_ref()?.user_pubkey
    }

    pub async fn client_pubkey(&self) -> Option<PubKey> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|live| live.client_secret_key.pubkey())
    }

    /// begin a fresh login: generate a throwaway keypair and a secret, hand
    /// back the `nostrconnect://` uri to display, and start listening on the
    /// relay for the signer's acknowledgment
    pub async fn start_login(&self, relay_url: &str) -> Result<String, LoginError> {
        let relay_url = crate::normalize_url(relay_url)?.to_string();

        let client_secret_key = SecretKey::generate();
        let secret = helpers::random_secret();
        let uri = connect_uri(
            &client_secret_key.pubkey(),
            &relay_url,
            &secret,
            &self.app_name,
        );

        {
            let mut guard = self.session.lock().await;
            if guard.is_some() {
                return Err(LoginError::AlreadyActive);
            }
            *guard = Some(LiveSession {
                client_secret_key,
                secret,
                relay_url: relay_url.clone(),
                started_at: Timestamp::now(),
                sub_id: helpers::random_sub_id(),
                bunker_pubkey: None,
                conversation_key: None,
                user_pubkey: None,
            });
        }

        self.sub_ready.send_replace(false);
        self.state
            .send_replace(AuthState::WaitingForScan { uri: uri.clone() });

        let session = self.clone();
        tokio::spawn(async move { session.connect_and_subscribe().await });

        Ok(uri)
    }

    /// connect to a signer we already know, from a `bunker://` uri
    pub async fn login_with_bunker_uri(&self, uri: &str) -> Result<(), UriError> {
        let (bunker_pubkey, relay_url, secret) = parse_bunker_uri(uri)?;

        let client_secret_key = SecretKey::generate();
        let conversation_key = nip44::conversation_key(&bunker_pubkey, &client_secret_key);

        {
            let mut guard = self.session.lock().await;
            *guard = Some(LiveSession {
                client_secret_key,
                secret: secret.clone().unwrap_or_default(),
                relay_url: relay_url.clone(),
                started_at: Timestamp::now(),
                sub_id: helpers::random_sub_id(),
                bunker_pubkey: Some(bunker_pubkey),
                conversation_key: Some(conversation_key),
                user_pubkey: None,
            });
        }

        self.sub_ready.send_replace(false);
        self.state.send_replace(AuthState::Connecting);

        let session = self.clone();
        tokio::spawn(async move {
            session.connect_and_subscribe().await;

            let mut params = vec![bunker_pubkey.to_hex()];
            if let Some(secret) = secret {
                params.push(secret);
            }
            match session.call_method("connect", params).await {
                Ok(_) => session.finish_handshake().await,
                Err(err) => {
                    session.state.send_replace(AuthState::Error {
                        message: err.to_string(),
                    });
                }
            }
        });

        Ok(())
    }

    /// put a previously persisted session back in place: authenticated
    /// optimistically, relay reopened in the background; the signer's next
    /// ack is treated as a benign refresh
    pub async fn restore_session(&self, saved: SavedSession) {
        let conversation_key =
            nip44::conversation_key(&saved.bunker_pubkey, &saved.client_secret_key);

        {
            let mut guard = self.session.lock().await;
            *guard = Some(LiveSession {
                client_secret_key: saved.client_secret_key,
                secret: saved.secret,
                relay_url: saved.relay_url,
                started_at: Timestamp::now(),
                sub_id: helpers::random_sub_id(),
                bunker_pubkey: Some(saved.bunker_pubkey),
                conversation_key: Some(conversation_key),
                user_pubkey: Some(saved.user_pubkey),
            });
        }

        self.sub_ready.send_replace(false);
        self.state.send_replace(AuthState::Authenticated {
            user_pubkey: saved.user_pubkey,
        });

        let session = self.clone();
        tokio::spawn(async move { session.connect_and_subscribe().await });
    }

    /// abandon an in-progress login without touching persisted state
    pub async fn cancel_login(&self) {
        self.teardown().await;
    }

    /// end the session: drop key material and pending requests, clear the
    /// persisted record
    pub async fn logout(&self) {
        self.teardown().await;
        self.store.clear();
    }

    async fn teardown(&self) {
        self.pool.disconnect().await;
        // dropping the reply senders resolves outstanding rpcs as Cancelled
        self.pending.lock().await.clear();
        *self.session.lock().await = None;
        self.sub_ready.send_replace(false);
        self.state.send_replace(AuthState::NotAuthenticated);
    }

    /// ask the signer for the user's public key
    pub async fn get_public_key(&self) -> Result<PubKey, GetPublicKeyError> {
        let resp = self.call_method("get_public_key", vec![]).await?;
        Ok(PubKey::from_hex(&resp)?)
    }

    pub async fn ping(&self) -> Result<(), RpcError> {
        self.call_method("ping", vec![]).await?;
        Ok(())
    }

    /// have the signer sign an unsigned event, json in / json out
    pub async fn sign_event(&self, unsigned_event_json: &str) -> Result<String, SignError> {
        let event = self.request_signature(unsigned_event_json).await?;
        Ok(serde_json::to_string(&event).expect("events always encode as json"))
    }

    /// have the signer sign a template, returning the full event
    pub async fn finalize_event(&self, template: EventTemplate) -> Result<Event, SignError> {
        let json = serde_json::to_string(&template).expect("templates always encode as json");
        self.request_signature(&json).await
    }

    async fn request_signature(&self, unsigned_event_json: &str) -> Result<Event, SignError> {
        // don't fire a request the relay would never route back to us
        self.wait_subscription_ready().await?;

        let resp = self
            .call_method("sign_event", vec![unsigned_event_json.to_string()])
            .await?;

        let event: Event = serde_json::from_str(&resp).map_err(|_| SignError::InvalidEvent)?;
        if !event.verify() {
            return Err(SignError::InvalidSignature);
        }

        Ok(event)
    }

    /// send one encrypted rpc request and wait for the matching response.
    /// the pending entry is registered before the event leaves, and is
    /// removed exactly once: by the response, by cancellation or by the
    /// timeout, whichever comes first
    pub async fn call_method(
        &self,
        method: &str,
        params: Vec<String>,
    ) -> Result<String, RpcError> {
        let (client_secret_key, target, conversation_key) = {
            let guard = self.session.lock().await;
            let live = guard.as_ref().ok_or(RpcError::NotConnected)?;
            (
                live.client_secret_key,
                live.bunker_pubkey.ok_or(RpcError::NotConnected)?,
                live.conversation_key.ok_or(RpcError::NotConnected)?,
            )
        };

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<Response>();
        self.pending.lock().await.insert(
            id.clone(),
            PendingRequest {
                issued_at: Timestamp::now(),
                reply: tx,
            },
        );

        let request_json = serde_json::to_string(&Request {
            id: &id,
            method,
            params: &params,
        })
        .expect("requests always encode as json");

        let content = match nip44::encrypt(&request_json, &conversation_key, None) {
            Ok(content) => content,
            Err(err) => {
                self.pending.lock().await.remove(&id);
                return Err(err.into());
            }
        };

        let event = EventTemplate {
            created_at: Timestamp::now(),
            kind: Kind::REMOTE_SIGNER,
            tags: Tags::pointing_at(&target),
            content,
        }
        .finalize(&client_secret_key);

        if self.pool.publish(event).await == 0 {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::NotDelivered);
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(resp)) => match resp.error {
                Some(err) => Err(RpcError::Response(err)),
                None => Ok(resp.result.unwrap_or_default()),
            },
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::Cancelled)
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::Timeout)
            }
        }
    }

    async fn connect_and_subscribe(&self) {
        let (relay_url, sub_id, filter) = {
            let guard = self.session.lock().await;
            let Some(live) = guard.as_ref() else { return };
            let filter = Filter {
                kinds: Some(vec![Kind::REMOTE_SIGNER]),
                tags: Some(vec![TagQuery(
                    "p".to_string(),
                    vec![live.client_secret_key.pubkey().to_hex()],
                )]),
                since: Some(live.started_at.minus(CLOCK_DRIFT_BUFFER)),
                ..Default::default()
            };
            (live.relay_url.clone(), live.sub_id.clone(), filter)
        };

        self.pool.connect(&[relay_url.clone()]).await;

        let mut state = self.pool.state();
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                if *state.borrow_and_update() == ConnectionState::Connected {
                    return;
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && self.pool.connection_state() == ConnectionState::Connected;

        if !connected {
            // transient: surfaced through the pool's connection state, the
            // caller may retry or cancel
            log::warn!("[{}] signer relay did not open", relay_url);
            return;
        }

        self.pool.subscribe(&sub_id, &filter).await;
    }

    async fn wait_subscription_ready(&self) -> Result<(), SignError> {
        let mut rx = self.sub_ready.subscribe();
        tokio::time::timeout(SUBSCRIPTION_READY_TIMEOUT, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|_| SignError::SubscriptionNotReady)?;

        match *self.sub_ready.subscribe().borrow() {
            true => Ok(()),
            false => Err(SignError::SubscriptionNotReady),
        }
    }

    async fn pump(self, mut frames: mpsc::Receiver<Frame>) {
        while let Some(frame) = frames.recv().await {
            match frame.envelope {
                Envelope::Event { event, .. } => {
                    if event.kind != Kind::REMOTE_SIGNER {
                        continue;
                    }
                    self.handle_incoming(event).await;
                }
                Envelope::Eose { subscription_id } => {
                    let ours = {
                        let guard = self.session.lock().await;
                        guard
                            .as_ref()
                            .map(|live| live.sub_id == subscription_id)
                            .unwrap_or(false)
                    };
                    if ours {
                        self.sub_ready.send_replace(true);
                    }
                }
                Envelope::Closed {
                    subscription_id,
                    reason,
                } => {
                    log::info!(
                        "[{}] signer subscription {} closed: {}",
                        frame.relay.as_str(),
                        subscription_id,
                        reason
                    );
                }
                Envelope::Ok {
                    event_id,
                    ok,
                    reason,
                } => {
                    if !ok {
                        log::info!(
                            "[{}] relay refused request event {}: {}",
                            frame.relay.as_str(),
                            event_id,
                            reason
                        );
                    }
                }
                _ => {}
            }
        }
    }

    /// one candidate signer event off the relay: drop it if stale, decrypt
    /// it with the sender's key, then either complete the pending request it
    /// answers or treat it as the connect handshake acknowledgment
    pub(crate) async fn handle_incoming(&self, event: Event) {
        let (client_secret_key, secret, started_at) = {
            let guard = self.session.lock().await;
            let Some(live) = guard.as_ref() else { return };
            (
                live.client_secret_key,
                live.secret.clone(),
                live.started_at,
            )
        };

        // relays replay history; anything from before this session started
        // (minus clock drift) belongs to a previous one
        if event.created_at < started_at.minus(CLOCK_DRIFT_BUFFER) {
            log::debug!("ignoring stale signer event {}", event.id);
            return;
        }

        let conversation_key = nip44::conversation_key(&event.pubkey, &client_secret_key);
        let plain = match nip44::decrypt(&event.content, &conversation_key) {
            Ok(plain) => plain,
            Err(err) => {
                log::info!("cannot decrypt signer event {}: {}", event.id, err);
                return;
            }
        };

        let resp: Response = match serde_json::from_str(&plain) {
            Ok(resp) => resp,
            Err(err) => {
                log::info!("signer event {} is not a response: {}", event.id, err);
                return;
            }
        };

        // interim answer: the signer wants the user to authorize first, the
        // real response comes later so the request stays pending
        if resp.result.as_deref() == Some("auth_url") {
            if let (Some(handler), Some(auth_url)) = (self.on_auth_url.as_ref(), &resp.error) {
                handler.0(auth_url);
            }
            return;
        }

        if let Some(id) = resp.id.as_deref() {
            let mut pending = self.pending.lock().await;
            if let Some(entry) = pending.get(id) {
                // a response older than its own request is a stale duplicate
                // delivery; leave the request pending for the real one
                if entry.issued_at.0 as u64 > event.created_at.0 as u64 + CLOCK_DRIFT_BUFFER as u64
                {
                    log::debug!("ignoring stale response for request {}", id);
                    return;
                }

                let entry = pending.remove(id).expect("present, checked above");
                drop(pending);
                let _ = entry.reply.send(resp);
                return;
            }
        }

        // not a response we asked for: maybe the connect acknowledgment
        let is_ack = resp.result.as_deref() == Some("ack")
            || resp.result.as_deref() == Some(secret.as_str());
        if !is_ack {
            log::debug!("ignoring unmatched signer message from {}", event.pubkey);
            return;
        }

        let already_authenticated = self.is_authenticated();

        {
            let mut guard = self.session.lock().await;
            let Some(live) = guard.as_mut() else { return };
            live.bunker_pubkey = Some(event.pubkey);
            live.conversation_key = Some(conversation_key);
        }

        if already_authenticated {
            // the signer reconnected; nothing else changes
            log::debug!("signer {} re-acknowledged", event.pubkey);
            return;
        }

        self.state.send_replace(AuthState::Connecting);

        let session = self.clone();
        tokio::spawn(async move { session.finish_handshake().await });
    }

    async fn finish_handshake(&self) {
        match self.get_public_key().await {
            Ok(user_pubkey) => {
                let saved = {
                    let mut guard = self.session.lock().await;
                    let Some(live) = guard.as_mut() else { return };
                    live.user_pubkey = Some(user_pubkey);
                    live.bunker_pubkey.map(|bunker_pubkey| SavedSession {
                        user_pubkey,
                        bunker_pubkey,
                        client_secret_key: live.client_secret_key,
                        relay_url: live.relay_url.clone(),
                        secret: live.secret.clone(),
                    })
                };

                self.state
                    .send_replace(AuthState::Authenticated { user_pubkey });

                if let Some(saved) = saved {
                    self.store.save(&saved);
                }
            }
            Err(err) => {
                self.state.send_replace(AuthState::Error {
                    message: err.to_string(),
                });
            }
        }
    }
}

impl Debug for BunkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BunkerSession")
            .field("state", &self.auth_state())
            .finish()
    }
}

/// the uri a signer scans to start the handshake:
/// `nostrconnect://<client pubkey>?relay=…&secret=…&name=…`
pub fn connect_uri(client_pubkey: &PubKey, relay_url: &str, secret: &str, app_name: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("relay", relay_url)
        .append_pair("secret", secret)
        .append_pair("name", app_name)
        .finish();

    format!("nostrconnect://{}?{}", client_pubkey.to_hex(), query)
}

/// parse the legacy `bunker://<pubkey>?relay=…&secret=…` uri
pub fn parse_bunker_uri(uri: &str) -> Result<(PubKey, String, Option<String>), UriError> {
    let url = Url::parse(uri)?;
    if url.scheme() != "bunker" {
        return Err(UriError::WrongScheme);
    }

    let host = url.host_str().ok_or(UriError::MissingPublicKey)?;
    let pubkey = PubKey::from_hex(host)?;

    let relay = url
        .query_pairs()
        .find(|(k, _)| k == "relay")
        .map(|(_, v)| v.to_string())
        .ok_or(UriError::MissingRelay)?;

    let secret = url
        .query_pairs()
        .find(|(k, _)| k == "secret")
        .map(|(_, v)| v.to_string());

    Ok((pubkey, relay, secret))
}
