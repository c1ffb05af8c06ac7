use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, watch, Mutex};
use url::Url;

use crate::{
    envelopes::{self, Envelope},
    eose::{EoseTracker, TimeoutConfig},
    helpers,
    relay::{LinkEvent, RelayLink},
    Event, Filter, ID,
};

/// aggregate connectivity over every link in the pool: Connected once at
/// least one link is open, Disconnected once none remain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// one parsed inbound frame, tagged with the relay it came from
#[derive(Debug)]
pub struct Frame {
    pub relay: Url,
    pub envelope: Envelope,
}

/// fans subscriptions and publishes out to any number of relay links and
/// merges their inbound traffic into a single tagged stream.
///
/// writes are best effort: links that are not currently open silently drop
/// them, and the caller re-broadcasts after reconnecting when delivery
/// matters.
pub struct RelayPool {
    links: Arc<Mutex<HashMap<String, RelayLink>>>,
    frames: mpsc::Sender<Frame>,
    open_count: Arc<AtomicUsize>,
    state: Arc<watch::Sender<ConnectionState>>,
    // per-subscription ids already delivered, for cross-relay dedup
    seen: Arc<DashMap<String, Arc<DashSet<ID>>>>,
}

impl RelayPool {
    pub fn new() -> (Self, mpsc::Receiver<Frame>) {
        let (frames, frames_receiver) = mpsc::channel(256);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        (
            Self {
                links: Arc::new(Mutex::new(HashMap::new())),
                frames,
                open_count: Arc::new(AtomicUsize::new(0)),
                state: Arc::new(state),
                seen: Arc::new(DashMap::new()),
            },
            frames_receiver,
        )
    }

    /// observe aggregate connectivity
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.subscribe().borrow()
    }

    pub async fn relay_count(&self) -> usize {
        self.links.lock().await.len()
    }

    /// open one link per url (urls already tracked are left alone) and start
    /// pumping their traffic into the merged stream
    pub async fn connect(&self, urls: &[String]) {
        for url in urls {
            let normalized = match crate::normalize_url(url) {
                Ok(u) => u,
                Err(err) => {
                    log::warn!("refusing to connect to {}: {}", url, err);
                    continue;
                }
            };

            let mut links = self.links.lock().await;
            if links.contains_key(normalized.as_str()) {
                continue;
            }

            let (link, events) = RelayLink::new(normalized.clone());
            links.insert(normalized.to_string(), link.clone());
            drop(links);

            if self.connection_state() == ConnectionState::Disconnected {
                self.state.send_replace(ConnectionState::Connecting);
            }

            let pool = self.clone();
            tokio::spawn(async move {
                if link.connect().await.is_err() {
                    log::info!("[{}] connection failed", link.url.as_str());
                    pool.forget_link(link.url.as_str()).await;
                    return;
                }
                pool.pump_link(link, events).await;
            });
        }
    }

    async fn pump_link(&self, link: RelayLink, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Connected => {
                    self.open_count.fetch_add(1, Ordering::SeqCst);
                    self.state.send_replace(ConnectionState::Connected);
                }
                LinkEvent::Message { text } => {
                    if let Some(envelope) = self.accept_frame(&link.url, &text) {
                        if self
                            .frames
                            .send(Frame {
                                relay: link.url.clone(),
                                envelope,
                            })
                            .await
                            .is_err()
                        {
                            // merged stream dropped, nobody is listening anymore
                            return;
                        }
                    }
                }
                LinkEvent::Error { description } => {
                    log::info!("[{}] transport error: {}", link.url.as_str(), description);
                }
                LinkEvent::Disconnected { reason } => {
                    log::info!("[{}] disconnected: {}", link.url.as_str(), reason);
                    // saturating: an explicit pool disconnect may already have
                    // zeroed the counter before this notification drained
                    let prev = self
                        .open_count
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                            Some(n.saturating_sub(1))
                        })
                        .expect("fetch_update closure never returns None");
                    if prev <= 1 {
                        self.state.send_replace(ConnectionState::Disconnected);
                    }
                    self.forget_link(link.url.as_str()).await;
                    return;
                }
            }
        }
    }

    /// parse, validate and deduplicate one inbound frame; None means it was
    /// dropped (with a diagnostic) and must not reach consumers
    fn accept_frame(&self, relay: &Url, text: &str) -> Option<Envelope> {
        let envelope = match envelopes::parse_message(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::info!("[{}] unparsable frame: {}", relay.as_str(), err);
                return None;
            }
        };

        if let Envelope::Event {
            subscription_id,
            event,
        } = &envelope
        {
            if !event.verify() {
                log::info!(
                    "[{}] dropping event {} with bad id or signature",
                    relay.as_str(),
                    event.id
                );
                return None;
            }

            // the same event often arrives from several relays
            if let Some(seen) = self.seen.get(subscription_id) {
                if !seen.insert(event.id) {
                    return None;
                }
            }
        }

        if let Envelope::Notice { message } = &envelope {
            log::info!("[{}] notice: {}", relay.as_str(), message);
        }

        Some(envelope)
    }

    async fn forget_link(&self, url: &str) {
        let mut links = self.links.lock().await;
        links.remove(url);
        let empty = links.is_empty();
        drop(links);

        if empty && self.open_count.load(Ordering::SeqCst) == 0 {
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// write a raw frame to every tracked link; returns how many links
    /// accepted it
    pub async fn broadcast(&self, text: &str) -> usize {
        let links: Vec<RelayLink> = self.links.lock().await.values().cloned().collect();

        let mut accepted = 0;
        for link in links {
            if link.send(text).await {
                accepted += 1;
            }
        }
        accepted
    }

    /// publish an event to every tracked link, best effort
    pub async fn publish(&self, event: Event) -> usize {
        self.broadcast(&Envelope::Publish { event }.to_json()).await
    }

    /// open a subscription across the pool; events delivered for it are
    /// deduplicated by id across relays
    pub async fn subscribe(&self, subscription_id: &str, filter: &Filter) -> usize {
        self.seen
            .insert(subscription_id.to_string(), Arc::new(DashSet::new()));

        self.broadcast(
            &Envelope::Req {
                subscription_id: subscription_id.to_string(),
                filter: filter.clone(),
            }
            .to_json(),
        )
        .await
    }

    pub async fn unsubscribe(&self, subscription_id: &str) {
        self.broadcast(
            &Envelope::Close {
                subscription_id: subscription_id.to_string(),
            }
            .to_json(),
        )
        .await;
        self.seen.remove(subscription_id);
    }

    /// one-shot query: subscribe, collect events until the EOSE tracker
    /// declares the subscription complete, return them newest first
    pub async fn query(
        &self,
        frames: &mut mpsc::Receiver<Frame>,
        filter: Filter,
        config: TimeoutConfig,
    ) -> Vec<Event> {
        let sub_id = helpers::random_sub_id();
        let tracker = EoseTracker::new(self.relay_count().await, config);
        let mut events = Vec::with_capacity(filter.limit.unwrap_or(64));

        self.subscribe(&sub_id, &filter).await;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    match frame.envelope {
                        Envelope::Event { subscription_id, event } if subscription_id == sub_id => {
                            events.push(event);
                        }
                        Envelope::Eose { subscription_id } if subscription_id == sub_id => {
                            tracker.on_eose(frame.relay.as_str());
                        }
                        _ => {}
                    }
                }
                _ = tracker.wait_complete() => break,
            }
        }

        self.unsubscribe(&sub_id).await;

        glidesort::sort_by_key(&mut events, |event| u32::MAX - event.created_at.0);
        events
    }

    /// tear down every link and reset aggregate state
    pub async fn disconnect(&self) {
        let links: Vec<RelayLink> = self.links.lock().await.drain().map(|(_, l)| l).collect();
        for link in links {
            link.disconnect().await;
        }

        self.open_count.store(0, Ordering::SeqCst);
        self.seen.clear();
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

// cloning shares the pool, all fields are handles
impl Clone for RelayPool {
    fn clone(&self) -> Self {
        Self {
            links: self.links.clone(),
            frames: self.frames.clone(),
            open_count: self.open_count.clone(),
            state: self.state.clone(),
            seen: self.seen.clone(),
        }
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("state", &self.connection_state())
            .finish()
    }
}
