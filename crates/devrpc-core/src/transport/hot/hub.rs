//! TCP hub that dev tools connect to.
//!
//! Accepts connections, gives each one a fresh [`PeerId`], and routes every
//! inbound frame through the hub's [`EventRegistry`] tagged with that id.
//! Outbound frames go through a per-client writer task so that senders never
//! wait on the socket.
//!
//! Connects and disconnects are emitted on the registry too, synchronously:
//! a connect handler runs before the client's first frame is read.
//!
//! # Thread Safety
//!
//! The hub runs on the tokio runtime. Each connection is handled in its own
//! spawned task. The client table is a `std::sync::Mutex` that is never held
//! across an await.

use super::channel::EventChannel;
use super::frame::{encode_parts, HotFrame};
use super::{CONNECT_EVENT, DISCONNECT_EVENT, RESERVED_PREFIX};
use crate::channel::Channel;
use crate::config::HubConfig;
use crate::events::EventRegistry;
use crate::group::{MembershipSource, PeerId};
use crate::protocol::{read_frame, write_frame};
use crate::{Result, RpcError};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

impl HubEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            HubEvent::Connected(peer) | HubEvent::Disconnected(peer) => *peer,
        }
    }
}

struct ClientEntry {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

pub(crate) struct HubShared {
    clients: Mutex<BTreeMap<PeerId, ClientEntry>>,
    events: EventRegistry,
    notifications: broadcast::Sender<HubEvent>,
    next_peer: AtomicU64,
}

impl HubShared {
    fn clients(&self) -> MutexGuard<'_, BTreeMap<PeerId, ClientEntry>> {
        self.clients.lock().expect("hub client table lock poisoned")
    }

    fn peers(&self) -> Vec<PeerId> {
        self.clients().keys().copied().collect()
    }

    fn register(&self, addr: SocketAddr) -> (PeerId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let peer = PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.clients().insert(peer, ClientEntry { addr, outbound });
        self.events.emit(CONNECT_EVENT, peer, &[]);
        let _ = self.notifications.send(HubEvent::Connected(peer));
        (peer, outbound_rx)
    }

    /// Forget `peer` and close every channel bound to it.
    fn disconnect(&self, peer: PeerId) {
        let removed = self.clients().remove(&peer);
        if let Some(entry) = removed {
            info!("{} ({}) disconnected", peer, entry.addr);
            self.events.emit(DISCONNECT_EVENT, peer, &[]);
            let _ = self.notifications.send(HubEvent::Disconnected(peer));
        }
    }

    fn open_channel(&self, peer: PeerId, event: &str) -> Result<EventChannel> {
        // Subscribing under the client lock orders this against `disconnect`:
        // either the peer is gone already, or its disconnect will reach us.
        let clients = self.clients();
        let entry = clients.get(&peer).ok_or_else(|| RpcError::Transport {
            message: format!("{} is not connected", peer),
        })?;
        Ok(EventChannel::open(
            &self.events,
            event,
            peer,
            entry.outbound.clone(),
        ))
    }
}

/// Handle to a running hub. Dropping shuts down the hub.
pub struct HotHubHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shared: Arc<HubShared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl HotHubHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Registry that receives every inbound frame, tagged with its sender.
    pub fn events(&self) -> &EventRegistry {
        &self.shared.events
    }

    /// Receive connect/disconnect notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.shared.notifications.subscribe()
    }

    /// Currently connected clients, in connection order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.peers()
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.shared.clients().get(&peer).map(|entry| entry.addr)
    }

    /// Membership view over this hub for one event name.
    pub fn membership(&self, event: impl Into<String>) -> HubMembership {
        HubMembership {
            shared: self.shared.clone(),
            event: event.into(),
        }
    }

    /// Send one raw event frame to a connected client.
    ///
    /// Reserved `hub:` events are local to each side and can't be sent.
    pub fn send(&self, peer: PeerId, event: &str, payload: &[u8]) -> Result<()> {
        if event.starts_with(RESERVED_PREFIX) {
            return Err(RpcError::InvalidFrame {
                message: format!("event {} is reserved", event),
            });
        }
        let bytes = encode_parts(event, payload)?;
        let clients = self.shared.clients();
        let entry = clients.get(&peer).ok_or_else(|| RpcError::PeerNotFound {
            peer: peer.to_string(),
        })?;
        entry.outbound.send(bytes).map_err(|_| RpcError::Transport {
            message: format!("connection to {} is gone", peer),
        })
    }

    /// Shut down the hub.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for HotHubHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for HotHubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotHubHandle")
            .field("addr", &self.addr)
            .field("peers", &self.peers())
            .finish()
    }
}

/// Hot channel server.
pub struct HotHub;

impl HotHub {
    /// Bind `addr` and start accepting clients in background tasks.
    ///
    /// Bind to port 0 to let the OS pick one; the handle reports it.
    pub async fn start(addr: impl ToSocketAddrs) -> Result<HotHubHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Hot channel hub listening on {}", addr);

        let (notifications, _) = broadcast::channel(HubConfig::EVENT_CAPACITY);
        let shared = Arc::new(HubShared {
            clients: Mutex::new(BTreeMap::new()),
            events: EventRegistry::new(),
            notifications,
            next_peer: AtomicU64::new(1),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            shared.clone(),
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(HotHubHandle {
            addr,
            port,
            shared,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        shared: Arc<HubShared>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Hot channel hub shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = shared.clients().len();
                            if current >= HubConfig::MAX_HUB_CONNECTIONS {
                                warn!(
                                    "Rejecting hub connection from {}: at max capacity ({})",
                                    peer_addr,
                                    HubConfig::MAX_HUB_CONNECTIONS
                                );
                                continue;
                            }

                            let (peer, outbound_rx) = shared.register(peer_addr);
                            info!("{} connected from {}", peer, peer_addr);
                            let shared = shared.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    peer,
                                    &shared,
                                    outbound_rx,
                                    &mut conn_shutdown,
                                )
                                .await
                                {
                                    debug!("Hub connection {} ended: {}", peer, e);
                                }
                                shared.disconnect(peer);
                            });
                        }
                        Err(e) => {
                            error!("Hub accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer: PeerId,
        shared: &HubShared,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    debug!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
        });

        let result = Self::read_loop(&mut reader, peer, shared, shutdown_rx).await;
        writer_task.abort();
        result
    }

    async fn read_loop(
        reader: &mut OwnedReadHalf,
        peer: PeerId,
        shared: &HubShared,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let bytes = tokio::select! {
                result = read_frame(reader) => {
                    match result? {
                        Some(bytes) => bytes,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(()); // Hub shutting down
                }
            };

            let frame = match HotFrame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping malformed frame from {}: {}", peer, e);
                    continue;
                }
            };
            if frame.is_reserved() {
                warn!("Dropping frame from {} on reserved event {}", peer, frame.event);
                continue;
            }

            shared.events.emit(&frame.event, peer, &frame.payload);
        }
    }
}

/// [`MembershipSource`] over a hub's connected clients, for one event name.
#[derive(Clone)]
pub struct HubMembership {
    shared: Arc<HubShared>,
    event: String,
}

impl HubMembership {
    pub fn event(&self) -> &str {
        &self.event
    }
}

impl MembershipSource for HubMembership {
    fn live_peers(&self) -> Vec<PeerId> {
        self.shared.peers()
    }

    fn open_channel(&self, peer: PeerId) -> Result<Arc<dyn Channel>> {
        let channel = self.shared.open_channel(peer, &self.event)?;
        Ok(Arc::new(channel))
    }
}

impl std::fmt::Debug for HubMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubMembership")
            .field("event", &self.event)
            .finish()
    }
}
