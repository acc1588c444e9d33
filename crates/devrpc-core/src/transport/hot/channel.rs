//! [`Channel`] over one event of one hot channel connection.

use super::frame::encode_parts;
use super::DISCONNECT_EVENT;
use crate::channel::{Channel, ChannelEvent, Mailbox, ReceiveHandler};
use crate::events::{EventRegistry, Subscription};
use crate::group::PeerId;
use crate::{Result, RpcError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Inner {
    event: String,
    peer: PeerId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    open: AtomicBool,
    mailbox: Mutex<Mailbox>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Inner {
    fn mailbox(&self) -> std::sync::MutexGuard<'_, Mailbox> {
        self.mailbox.lock().expect("event channel mailbox lock poisoned")
    }

    fn receive(&self, payload: &[u8]) {
        let mut mailbox = self.mailbox();
        if self.open.load(Ordering::SeqCst) {
            mailbox.deliver(ChannelEvent::Frame(payload.to_vec()));
        }
    }

    fn shut(&self) {
        if self
            .open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .expect("event channel subscription lock poisoned"),
        );
        drop(subscriptions);
        self.mailbox().deliver(ChannelEvent::Closed);
    }
}

/// Sends and receives frames of a single event, to and from a single peer.
///
/// Receives only frames whose source is `peer`; frames for other events or
/// from other peers on the same registry are ignored. Closes when the
/// connection ends. Closing it does not close the connection, which other
/// events may still be using.
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl EventChannel {
    pub(crate) fn open(
        events: &EventRegistry,
        event: &str,
        peer: PeerId,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            event: event.to_string(),
            peer,
            outbound,
            open: AtomicBool::new(true),
            mailbox: Mutex::new(Mailbox::default()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let frames = events.subscribe(event, move |source, payload| {
            if source != peer {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.receive(payload);
            }
        });
        let weak = Arc::downgrade(&inner);
        let disconnect = events.subscribe(DISCONNECT_EVENT, move |source, _| {
            if source != peer {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.shut();
            }
        });
        inner
            .subscriptions
            .lock()
            .expect("event channel subscription lock poisoned")
            .extend([frames, disconnect]);

        Self { inner }
    }

    pub fn event(&self) -> &str {
        &self.inner.event
    }

    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }
}

impl Channel for EventChannel {
    fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::channel_closed());
        }
        let bytes = encode_parts(&self.inner.event, &frame)?;
        self.inner.outbound.send(bytes).map_err(|_| RpcError::Transport {
            message: format!("connection to {} is gone", self.inner.peer),
        })
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        self.inner.mailbox().install(handler);
    }

    fn close(&self) {
        self.inner.shut();
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("event", &self.inner.event)
            .field("peer", &self.inner.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
