//! Duplex message pipe to a single remote peer.
//!
//! A [`Channel`] is Open until it is Closed, and never reopens: a new
//! physical connection is a new `Channel`. Nothing sent while closed is
//! buffered or retried.

use crate::{Result, RpcError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// What a channel hands to its receive handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(Vec<u8>),
    /// Delivered exactly once, after which no more frames arrive.
    Closed,
}

/// Receive callback. Called from the transport's context, so it must not
/// block.
pub type ReceiveHandler = Box<dyn Fn(ChannelEvent) + Send + Sync>;

pub trait Channel: Send + Sync {
    /// Send one frame to the peer. Fails with `Transport` once closed.
    fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Install the receive handler. Replaces (and drops) any previous one.
    fn on_receive(&self, handler: ReceiveHandler);

    /// Close the channel. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Receive-side state shared by the channel implementations: the installed
/// handler, plus whatever arrived before there was one.
#[derive(Default)]
pub(crate) struct Mailbox {
    handler: Option<ReceiveHandler>,
    backlog: VecDeque<ChannelEvent>,
}

impl Mailbox {
    pub(crate) fn deliver(&mut self, event: ChannelEvent) {
        match &self.handler {
            Some(handler) => handler(event),
            None => self.backlog.push_back(event),
        }
    }

    /// Install `handler`, replaying the backlog into it first.
    pub(crate) fn install(&mut self, handler: ReceiveHandler) {
        while let Some(event) = self.backlog.pop_front() {
            handler(event);
        }
        self.handler = Some(handler);
    }
}

struct Shared {
    open: AtomicBool,
    sides: [Mutex<Mailbox>; 2],
}

impl Shared {
    fn side(&self, index: usize) -> std::sync::MutexGuard<'_, Mailbox> {
        self.sides[index].lock().expect("channel side lock poisoned")
    }
}

/// In-process channel, one half of a pair created by [`MemoryChannel::pair`].
///
/// Frames that arrive before a handler is installed are held and replayed
/// when one is. Handlers run while the receiving side is locked, which keeps
/// per-sender ordering; a handler must not install a handler on its own side.
pub struct MemoryChannel {
    shared: Arc<Shared>,
    side: usize,
}

impl MemoryChannel {
    /// Create two connected halves. Closing either closes both.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let shared = Arc::new(Shared {
            open: AtomicBool::new(true),
            sides: [Mutex::new(Mailbox::default()), Mutex::new(Mailbox::default())],
        });
        (
            MemoryChannel {
                shared: shared.clone(),
                side: 0,
            },
            MemoryChannel { shared, side: 1 },
        )
    }

    fn peer_side(&self) -> usize {
        1 - self.side
    }
}

impl Channel for MemoryChannel {
    fn send(&self, frame: Vec<u8>) -> Result<()> {
        // Checked under the receiving side's lock, which `close` also takes
        // to deliver `Closed`, so no frame can follow it.
        let mut peer = self.shared.side(self.peer_side());
        if !self.is_open() {
            return Err(RpcError::channel_closed());
        }
        peer.deliver(ChannelEvent::Frame(frame));
        Ok(())
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        self.shared.side(self.side).install(handler);
    }

    fn close(&self) {
        if self
            .shared
            .open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        for index in [self.side, self.peer_side()] {
            self.shared.side(index).deliver(ChannelEvent::Closed);
        }
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("side", &self.side)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<Mutex<Vec<ChannelEvent>>>, ReceiveHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: ReceiveHandler = Box::new(move |event| sink.lock().unwrap().push(event));
        (seen, handler)
    }

    #[test]
    fn test_frames_arrive_in_order() {
        let (a, b) = MemoryChannel::pair();
        let (seen, handler) = collector();
        b.on_receive(handler);

        a.send(b"one".to_vec()).unwrap();
        a.send(b"two".to_vec()).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ChannelEvent::Frame(b"one".to_vec()),
                ChannelEvent::Frame(b"two".to_vec())
            ]
        );
    }

    #[test]
    fn test_backlog_is_replayed_to_late_handler() {
        let (a, b) = MemoryChannel::pair();
        a.send(b"early".to_vec()).unwrap();

        let (seen, handler) = collector();
        b.on_receive(handler);

        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::Frame(b"early".to_vec())]);
    }

    #[test]
    fn test_replacing_handler_drops_previous() {
        let (a, b) = MemoryChannel::pair();
        let (first, handler) = collector();
        b.on_receive(handler);
        let (second, handler) = collector();
        b.on_receive(handler);

        a.send(b"x".to_vec()).unwrap();

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_close_is_seen_once_by_both_sides() {
        let (a, b) = MemoryChannel::pair();
        let (seen_a, handler) = collector();
        a.on_receive(handler);
        let (seen_b, handler) = collector();
        b.on_receive(handler);

        a.close();
        b.close();

        assert_eq!(*seen_a.lock().unwrap(), vec![ChannelEvent::Closed]);
        assert_eq!(*seen_b.lock().unwrap(), vec![ChannelEvent::Closed]);
        assert!(!b.is_open());
    }

    #[test]
    fn test_send_after_close_is_transport_error() {
        let (a, b) = MemoryChannel::pair();
        b.close();

        let err = a.send(b"late".to_vec()).unwrap_err();
        assert_eq!(err.kind(), crate::RpcErrorKind::Transport);
    }

    #[test]
    fn test_no_frame_follows_closed_under_concurrent_close() {
        for _ in 0..200 {
            let (a, b) = MemoryChannel::pair();
            let (seen, handler) = collector();
            b.on_receive(handler);

            let sender = std::thread::spawn(move || {
                while a.send(b"x".to_vec()).is_ok() {}
            });
            std::thread::yield_now();
            b.close();
            sender.join().unwrap();

            let seen = seen.lock().unwrap();
            assert_eq!(seen.last(), Some(&ChannelEvent::Closed));
            assert_eq!(seen.iter().filter(|e| **e == ChannelEvent::Closed).count(), 1);
        }
    }
}
