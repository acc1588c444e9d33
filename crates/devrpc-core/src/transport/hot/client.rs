//! Hot channel client: one connection to a [`HotHub`](super::HotHub).
//!
//! Inbound frames are routed through the client's own
//! [`EventRegistry`], all tagged with [`HotClient::HUB_PEER`]. Outbound frames
//! are queued to a writer task, so sending never waits on the socket.

use super::channel::EventChannel;
use super::frame::HotFrame;
use super::DISCONNECT_EVENT;
use crate::config::HubConfig;
use crate::events::EventRegistry;
use crate::group::PeerId;
use crate::protocol::{read_frame, write_frame};
use crate::{Result, RpcError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ClientShared {
    events: EventRegistry,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    connected: AtomicBool,
}

impl ClientShared {
    fn mark_disconnected(&self) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.events.emit(DISCONNECT_EVENT, HotClient::HUB_PEER, &[]);
        }
    }
}

/// Client connection to a hot channel hub. Dropping it disconnects.
pub struct HotClient {
    addr: SocketAddr,
    shared: Arc<ClientShared>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl HotClient {
    /// Source id the client uses for everything the hub sends.
    pub const HUB_PEER: PeerId = PeerId(0);

    /// Connect to a hub.
    ///
    /// Uses the configured connection timeout from `HubConfig`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(HubConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Transport {
                message: format!(
                    "connecting to {} timed out after {:?}",
                    addr,
                    HubConfig::CONNECT_TIMEOUT
                ),
            })?
            .map_err(|e| RpcError::Transport {
                message: format!("connecting to {} failed: {}", addr, e),
            })?;

        debug!("Hot channel client connected to {}", addr);

        let (reader, mut writer) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let shared = Arc::new(ClientShared {
            events: EventRegistry::new(),
            outbound,
            connected: AtomicBool::new(true),
        });

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    debug!("Write to hub {} failed: {}", addr, e);
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            if let Err(e) = Self::read_loop(reader, &reader_shared).await {
                debug!("Hub connection {} ended: {}", addr, e);
            }
            reader_shared.mark_disconnected();
        });

        Ok(Self {
            addr,
            shared,
            reader_task,
            writer_task,
        })
    }

    async fn read_loop(mut reader: OwnedReadHalf, shared: &ClientShared) -> Result<()> {
        while let Some(bytes) = read_frame(&mut reader).await? {
            match HotFrame::decode(&bytes) {
                Ok(frame) if frame.is_reserved() => {
                    warn!("Dropping frame from hub on reserved event {}", frame.event);
                }
                Ok(frame) => {
                    shared
                        .events
                        .emit(&frame.event, Self::HUB_PEER, &frame.payload);
                }
                Err(e) => warn!("Dropping malformed frame from hub: {}", e),
            }
        }
        Ok(())
    }

    /// A channel bound to `event` on this connection.
    ///
    /// Already closed if the connection is gone.
    pub fn channel(&self, event: &str) -> EventChannel {
        let channel = EventChannel::open(
            &self.shared.events,
            event,
            Self::HUB_PEER,
            self.shared.outbound.clone(),
        );
        if !self.is_connected() {
            crate::channel::Channel::close(&channel);
        }
        channel
    }

    /// Registry that receives every frame the hub sends.
    pub fn events(&self) -> &EventRegistry {
        &self.shared.events
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Drop the connection. Every channel on it closes.
    pub fn disconnect(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
        self.shared.mark_disconnected();
    }
}

impl Drop for HotClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for HotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotClient")
            .field("addr", &self.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelEvent};
    use crate::transport::hot::{HotHub, HubEvent};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HotClient::connect(addr).await.unwrap_err();
        assert_eq!(err.kind(), crate::RpcErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_disconnect_closes_channels_locally() {
        let hub = HotHub::start("127.0.0.1:0").await.unwrap();
        let client = HotClient::connect(hub.addr()).await.unwrap();
        let channel = client.channel("a");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.on_receive(Box::new(move |event| sink.lock().unwrap().push(event)));

        client.disconnect();

        assert!(!client.is_connected());
        assert!(!channel.is_open());
        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::Closed]);
        assert!(!client.channel("b").is_open());
    }

    #[tokio::test]
    async fn test_hub_sees_client_disconnect() {
        let hub = HotHub::start("127.0.0.1:0").await.unwrap();
        let mut events = hub.subscribe();
        let client = HotClient::connect(hub.addr()).await.unwrap();

        let peer = match events.recv().await.unwrap() {
            HubEvent::Connected(peer) => peer,
            other => panic!("unexpected {:?}", other),
        };
        client.disconnect();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, HubEvent::Disconnected(peer));
    }
}
