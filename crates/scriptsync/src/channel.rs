//! Channel owner and WebSocket broadcast server
//!
//! Exactly one process per machine owns the channel: whichever process binds
//! the well-known port first. The bind is attempted once; its outcome is the
//! only source of truth. `AddrInUse` means another process already owns the
//! channel and is an expected, quiet outcome. Any other bind error leaves this
//! process without a channel for its lifetime.
//!
//! The owner accepts WebSocket clients on any path and fans every broadcast
//! out to all connected clients. Inbound text frames are parsed as JSON and
//! handed to the registered message handlers.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scriptsync_core::ChannelState;

/// Well-known channel port shared by every process on the machine
pub const DEFAULT_PORT: u16 = 8642;

/// Broadcast channel capacity for outgoing messages
pub const BROADCAST_CAPACITY: usize = 256;

/// Callback invoked for every JSON message received from a channel client
pub type MessageHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Registration handle returned by [`ChannelOwner::add_message_handler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Another process owns the port
    #[error("port {0} is already in use")]
    AddressInUse(u16),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// A previous bind attempt failed; the channel stays down for this run
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("failed to serialize broadcast message: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct Inner {
    host: String,
    port: u16,
    state: Mutex<ChannelState>,
    start_lock: tokio::sync::Mutex<()>,
    running: watch::Sender<bool>,
    clients_tx: broadcast::Sender<String>,
    handlers: Mutex<Vec<(HandlerId, MessageHandler)>>,
    next_handler: AtomicU64,
    cancel: CancellationToken,
}

/// Process-wide handle on the shared broadcast channel
///
/// Cheap to clone; all clones share the same state. Create one per process
/// and hand it to the components that need it.
#[derive(Clone)]
pub struct ChannelOwner {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelOwner {
    /// Create an unbound channel owner for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (running, _) = watch::channel(false);
        let (clients_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                port,
                state: Mutex::new(ChannelState::Unbound),
                start_lock: tokio::sync::Mutex::new(()),
                running,
                clients_tx,
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Attempt to become the channel owner
    ///
    /// Binds the port on the first call only; later calls report the
    /// outcome of that first attempt.
    pub async fn start(&self) -> Result<u16, ChannelError> {
        let _guard = self.inner.start_lock.lock().await;

        match self.state() {
            ChannelState::Unbound => {}
            ChannelState::Owner(port) => return Ok(port),
            ChannelState::NonOwner => return Err(ChannelError::AddressInUse(self.inner.port)),
            ChannelState::BindError(msg) => return Err(ChannelError::Unavailable(msg)),
        }

        let addr = format!("{}:{}", self.inner.host, self.inner.port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                let port = listener
                    .local_addr()
                    .map(|a| a.port())
                    .unwrap_or(self.inner.port);
                *lock(&self.inner.state) = ChannelState::Owner(port);
                self.inner.running.send_replace(true);
                self.spawn_server(listener);
                info!(port, "channel: bound, this process owns the channel");
                Ok(port)
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                *lock(&self.inner.state) = ChannelState::NonOwner;
                debug!(port = self.inner.port, "channel: port in use, following");
                Err(ChannelError::AddressInUse(self.inner.port))
            }
            Err(e) => {
                *lock(&self.inner.state) = ChannelState::BindError(e.to_string());
                error!(addr = %addr, error = %e, "channel: bind failed");
                Err(ChannelError::Bind { addr, source: e })
            }
        }
    }

    fn spawn_server(&self, listener: TcpListener) {
        let app = Router::new()
            .route("/", get(ws_handler))
            .fallback(ws_handler)
            .with_state(self.clone());

        let owner = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;
            owner.inner.running.send_replace(false);
            match result {
                Ok(()) => info!("channel: server stopped"),
                Err(e) => error!(error = %e, "channel: server failed"),
            }
        });
    }

    /// Current ownership state
    pub fn state(&self) -> ChannelState {
        lock(&self.inner.state).clone()
    }

    /// True while this process owns the channel and its server is alive
    pub fn is_running(&self) -> bool {
        self.state().is_owner() && *self.inner.running.borrow()
    }

    /// Bound port if owner, `None` otherwise
    pub fn port(&self) -> Option<u16> {
        self.state().port()
    }

    /// Number of currently connected channel clients
    pub fn client_count(&self) -> usize {
        self.inner.clients_tx.receiver_count()
    }

    /// Send `message` as a JSON text frame to every connected client
    ///
    /// Returns the number of clients the message was queued for; zero
    /// clients is not an error. Callers check [`is_running`](Self::is_running)
    /// first.
    pub fn broadcast<T: Serialize>(&self, message: &T) -> Result<usize, ChannelError> {
        let text = serde_json::to_string(message)?;
        Ok(self.inner.clients_tx.send(text).unwrap_or(0))
    }

    /// Register a handler for inbound client messages
    pub fn add_message_handler(&self, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.handlers).push((id, handler));
        id
    }

    /// Unregister a handler; unknown or already-removed ids are ignored
    ///
    /// Returns whether a handler was removed.
    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    fn dispatch_inbound(&self, value: &serde_json::Value) {
        let handlers: Vec<MessageHandler> = lock(&self.inner.handlers)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(value);
        }
    }

    /// Stop the channel server and disconnect all clients
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
    }

    /// Resolve once the channel server is no longer running
    pub async fn stopped(&self) {
        let mut rx = self.inner.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }
}

impl std::fmt::Debug for ChannelOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOwner")
            .field("addr", &format!("{}:{}", self.inner.host, self.inner.port))
            .field("state", &self.state())
            .field("running", &*self.inner.running.borrow())
            .finish()
    }
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(owner): State<ChannelOwner>) -> Response {
    ws.on_upgrade(move |socket| handle_client(socket, owner))
}

/// Handle one channel client until it disconnects or the server stops
async fn handle_client(mut socket: WebSocket, owner: ChannelOwner) {
    let mut rx = owner.inner.clients_tx.subscribe();
    let cancel = owner.inner.cancel.clone();
    info!(clients = owner.client_count(), "channel: client connected");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }

            result = rx.recv() => {
                match result {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            info!("channel: client disconnected");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "channel: client lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(text.as_str()) {
                            Ok(value) => owner.dispatch_inbound(&value),
                            Err(e) => debug!(error = %e, "channel: ignoring non-JSON message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("channel: client disconnected");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "channel: websocket error");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use scriptsync_core::ChangeMessage;

    /// Reserve a free port by binding and releasing it
    pub(crate) fn reserve_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    pub(crate) async fn wait_for_clients(owner: &ChannelOwner, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while owner.client_count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client did not connect");
    }

    #[tokio::test]
    async fn test_single_owner_wins_race() {
        let port = reserve_port();
        let owners: Vec<ChannelOwner> = (0..4).map(|_| ChannelOwner::new("127.0.0.1", port)).collect();

        let results = futures::future::join_all(owners.iter().map(|o| o.start())).await;

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "exactly one process should own the port");
        for result in &results {
            match result {
                Ok(p) => assert_eq!(*p, port),
                Err(e) => assert!(matches!(e, ChannelError::AddressInUse(p) if *p == port)),
            }
        }

        let owner_states = owners.iter().filter(|o| o.state() == ChannelState::Owner(port)).count();
        let follower_states = owners.iter().filter(|o| o.state() == ChannelState::NonOwner).count();
        assert_eq!(owner_states, 1);
        assert_eq!(follower_states, 3);

        for o in &owners {
            o.dispose();
        }
    }

    #[tokio::test]
    async fn test_start_binds_once() {
        let owner = ChannelOwner::new("127.0.0.1", 0);
        let first = owner.start().await.unwrap();
        let second = owner.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(owner.port(), Some(first));
        owner.dispose();
    }

    #[tokio::test]
    async fn test_follower_stays_follower() {
        let port = reserve_port();
        let owner = ChannelOwner::new("127.0.0.1", port);
        owner.start().await.unwrap();

        let follower = ChannelOwner::new("127.0.0.1", port);
        assert!(matches!(follower.start().await, Err(ChannelError::AddressInUse(_))));
        assert!(!follower.is_running());
        assert_eq!(follower.port(), None);

        // No re-election: the follower does not take over after the owner exits
        owner.dispose();
        owner.stopped().await;
        assert!(matches!(follower.start().await, Err(ChannelError::AddressInUse(_))));
        assert_eq!(follower.state(), ChannelState::NonOwner);
    }

    #[tokio::test]
    async fn test_non_conflict_bind_error() {
        // TEST-NET-3 address is never assigned to a local interface
        let owner = ChannelOwner::new("203.0.113.7", 0);
        let result = owner.start().await;
        assert!(matches!(result, Err(ChannelError::Bind { .. })));
        assert!(matches!(owner.state(), ChannelState::BindError(_)));
        assert!(!owner.is_running());

        assert!(matches!(owner.start().await, Err(ChannelError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_broadcast_without_clients_is_noop() {
        let owner = ChannelOwner::new("127.0.0.1", 0);
        owner.start().await.unwrap();
        let sent = owner.broadcast(&ChangeMessage::new("x", "file:///x.user.js")).unwrap();
        assert_eq!(sent, 0);
        owner.dispose();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_client() {
        let owner = ChannelOwner::new("127.0.0.1", 0);
        let port = owner.start().await.unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        wait_for_clients(&owner, 1).await;

        let msg = ChangeMessage::new("console.log(1)", "file:///ws/foo.user.js");
        assert_eq!(owner.broadcast(&msg).unwrap(), 1);

        let received = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let decoded: ChangeMessage = serde_json::from_str(received.to_text().unwrap()).unwrap();
        assert_eq!(decoded, msg);

        owner.dispose();
    }

    #[tokio::test]
    async fn test_inbound_message_invokes_handlers() {
        let owner = ChannelOwner::new("127.0.0.1", 0);
        let port = owner.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        owner.add_message_handler(Arc::new(move |value: &serde_json::Value| {
            let _ = tx.send(value.clone());
        }));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/any/path"))
            .await
            .unwrap();
        wait_for_clients(&owner, 1).await;

        ws.send(WsMessage::text("not json")).await.unwrap();
        ws.send(WsMessage::text(r#"{"action":"hello"}"#)).await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["action"], "hello");

        owner.dispose();
    }

    #[test]
    fn test_remove_handler_is_idempotent() {
        let owner = ChannelOwner::new("127.0.0.1", 0);
        let id = owner.add_message_handler(Arc::new(|_: &serde_json::Value| {}));

        assert!(owner.remove_message_handler(id));
        assert!(!owner.remove_message_handler(id));
        assert!(!owner.remove_message_handler(HandlerId(9999)));
    }

    #[tokio::test]
    async fn test_running_flips_when_server_dies() {
        let owner = ChannelOwner::new("127.0.0.1", 0);
        owner.start().await.unwrap();
        assert!(owner.is_running());

        owner.dispose();
        tokio::time::timeout(Duration::from_secs(5), owner.stopped())
            .await
            .unwrap();

        assert!(!owner.is_running());
        // Ownership is still recorded; only liveness changed
        assert!(owner.state().is_owner());
    }
}
