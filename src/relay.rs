use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{client::IntoClientRequest, Message},
};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("relay connection error")]
    Websocket,
}

/// lifecycle and traffic notifications for a single relay link, delivered in
/// order on the stream handed out at construction
#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    Disconnected { reason: String },
    Message { text: String },
    Error { description: String },
}

/// one persistent duplex connection to one relay endpoint.
///
/// reconnection is the caller's responsibility: after a `Disconnected`
/// notification the link stays usable and `connect` may be called again.
#[derive(Clone)]
pub struct RelayLink {
    pub url: Url,
    connected: Arc<AtomicBool>,
    dialing: Arc<AtomicBool>,
    events: Arc<RwLock<Option<mpsc::Sender<LinkEvent>>>>,
    write_queue: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    shutdown: watch::Sender<bool>,
}

impl RelayLink {
    /// create a link and the event stream its lifecycle will be reported on
    pub fn new(url: Url) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, events_receiver) = mpsc::channel(64);
        let (shutdown, _) = watch::channel(false);

        (
            Self {
                url,
                connected: Arc::new(AtomicBool::new(false)),
                dialing: Arc::new(AtomicBool::new(false)),
                events: Arc::new(RwLock::new(Some(events))),
                write_queue: Arc::new(RwLock::new(None)),
                shutdown,
            },
            events_receiver,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: LinkEvent) {
        if let Some(sender) = self.events.read().await.as_ref() {
            let _ = sender.send(event).await;
        }
    }

    /// open the websocket; a no-op when already open or mid-dial
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.connected.load(Ordering::SeqCst) || self.dialing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let request = match self.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(_) => {
                self.dialing.store(false, Ordering::SeqCst);
                return Err(ConnectError::Websocket);
            }
        };

        let (ws_stream, _) = match connect_async_tls_with_config(request, None, false, None).await
        {
            Ok(connected) => connected,
            Err(_) => {
                self.dialing.store(false, Ordering::SeqCst);
                return Err(ConnectError::Websocket);
            }
        };

        let (conn_write, mut conn_read) = ws_stream.split();
        let writer = Arc::new(Mutex::new(conn_write));

        let (write_sender, mut write_receiver) = mpsc::channel::<String>(16);
        *self.write_queue.write().await = Some(write_sender);
        self.connected.store(true, Ordering::SeqCst);
        self.dialing.store(false, Ordering::SeqCst);
        self.emit(LinkEvent::Connected).await;

        // write queue handler
        let queue_writer = writer.clone();
        tokio::spawn(async move {
            while let Some(text) = write_receiver.recv().await {
                let _ = queue_writer.lock().await.send(Message::text(text)).await;
            }
        });

        // ping handler, keeps intermediaries from timing the socket out
        let ping_writer = writer.clone();
        let mut ping_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ping_interval = interval(Duration::from_secs(29));
            loop {
                tokio::select! {
                    _ = ping_interval.tick() => {
                        if ping_writer
                            .lock()
                            .await
                            .send(Message::Ping(vec![].into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ = ping_shutdown.changed() => break,
                }
            }
        });

        // reader
        let link = self.clone();
        let pong_writer = writer;
        let mut read_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = conn_read.next() => msg,
                    _ = read_shutdown.changed() => return,
                };

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        link.emit(LinkEvent::Message {
                            text: text.to_string(),
                        })
                        .await;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        let _ = pong_writer
                            .lock()
                            .await
                            .send(Message::Pong(vec![].into()))
                            .await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or("broken close".to_string(), |c| {
                            format!("close ({}) {}", c.code, c.reason)
                        });
                        link.became_disconnected(reason).await;
                        return;
                    }
                    Some(Err(err)) => {
                        link.emit(LinkEvent::Error {
                            description: err.to_string(),
                        })
                        .await;
                        link.became_disconnected(format!("error: {}", err)).await;
                        return;
                    }
                    None => {
                        link.became_disconnected("stream ended".to_string()).await;
                        return;
                    }
                    _ => continue,
                }
            }
        });

        Ok(())
    }

    /// hand `text` to the transport; false when not connected or when the
    /// write queue refuses it. delivery is not acknowledged
    pub async fn send(&self, text: &str) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }

        match self.write_queue.read().await.as_ref() {
            Some(queue) => queue.send(text.to_string()).await.is_ok(),
            None => false,
        }
    }

    /// tear the connection down; the event stream closes and nothing is
    /// emitted afterwards
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.write_queue.write().await = None;
        *self.events.write().await = None;
        let _ = self.shutdown.send(true);
    }

    async fn became_disconnected(&self, reason: String) {
        // only a link that was live notifies its listener; after an explicit
        // disconnect() this is a no-op
        if self.connected.swap(false, Ordering::SeqCst) {
            *self.write_queue.write().await = None;
            self.emit(LinkEvent::Disconnected { reason }).await;
        }
    }
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("url", &self.url.as_str())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl std::fmt::Display for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<relay url={}>", self.url)
    }
}
