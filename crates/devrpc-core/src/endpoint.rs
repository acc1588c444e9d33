//! Call/response protocol over one [`Channel`].
//!
//! An [`Endpoint`] turns outgoing calls into correlated requests and incoming
//! requests into local invocations. Inbound frames are handled in arrival
//! order on a dedicated task; each invocation runs on its own task so a slow
//! function never holds up the frames behind it.
//!
//! # Lifecycle
//!
//! An Endpoint lives as long as its channel. When the channel closes, or the
//! Endpoint is closed explicitly, every outstanding call rejects with
//! [`RpcError::PeerDisconnected`] and later frames are ignored.

use crate::channel::{Channel, ChannelEvent};
use crate::config::{RpcOptions, TimeoutPolicy};
use crate::protocol::{self, ErrorObject, Message};
use crate::registry::FunctionRegistry;
use crate::{Result, RpcError};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Code sent back when a registry function fails.
const REMOTE_FAILURE_CODE: i32 = -32603;
/// Code sent back for a request that could not be decoded.
const INVALID_REQUEST_CODE: i32 = -32600;

/// Bookkeeping for one request awaiting its response.
struct PendingCall {
    method: String,
    created_at: Instant,
    reply: oneshot::Sender<Result<Value>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn settle(mut self, result: Result<Value>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The caller may have dropped its ReplyFuture; that is not an error.
        let _ = self.reply.send(result);
    }
}

struct EndpointInner {
    label: String,
    registry: Arc<FunctionRegistry>,
    channel: Arc<dyn Channel>,
    timeout: TimeoutPolicy,
    /// Next id to hand out; ids start at 1.
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    closed: AtomicBool,
}

/// Binds a [`FunctionRegistry`] to one [`Channel`].
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Create an Endpoint and start processing the channel's inbound frames.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<FunctionRegistry>,
        channel: Arc<dyn Channel>,
        options: &RpcOptions,
    ) -> Self {
        Self::with_label(registry, channel, options, "peer")
    }

    /// Like [`Endpoint::new`], with a label used in log lines.
    pub fn with_label(
        registry: Arc<FunctionRegistry>,
        channel: Arc<dyn Channel>,
        options: &RpcOptions,
        label: impl Into<String>,
    ) -> Self {
        let inner = Arc::new(EndpointInner {
            label: label.into(),
            registry,
            channel: channel.clone(),
            timeout: options.timeout,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        channel.on_receive(Box::new(move |event| {
            let _ = events_tx.send(event);
        }));
        tokio::spawn(Self::inbound_loop(inner.clone(), events_rx));

        Self { inner }
    }

    async fn inbound_loop(
        inner: Arc<EndpointInner>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Frame(bytes) => inner.handle_frame(&bytes),
                ChannelEvent::Closed => break,
            }
        }
        let rejected = inner.shutdown();
        debug!(
            "Channel to {} closed, rejected {} pending call(s)",
            inner.label, rejected
        );
    }

    /// Call `method` on the peer.
    ///
    /// The call id and pending entry are allocated before this returns, so
    /// the request is already on the wire even if the future is never
    /// polled.
    pub fn call(&self, method: &str, args: Vec<Value>) -> ReplyFuture {
        let inner = &self.inner;
        if inner.is_closed() {
            return ReplyFuture::failed(None, method, inner.disconnected(method));
        }

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let bytes = match protocol::encode(&Message::request(id, method, args)) {
            Ok(bytes) => bytes,
            Err(e) => return ReplyFuture::failed(Some(id), method, e),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let call = PendingCall {
            method: method.to_string(),
            created_at: Instant::now(),
            reply: reply_tx,
            timer: None,
        };
        if let Err(call) = inner.insert_pending(id, call) {
            call.settle(Err(inner.disconnected(method)));
            return ReplyFuture::waiting(id, method, reply_rx);
        }
        // The entry must exist before its timer can fire.
        if let Some(timeout) = inner.timeout.duration() {
            let timer = EndpointInner::start_timer(Arc::downgrade(inner), id, timeout);
            inner.arm_timer(id, timer);
        }

        debug!("-> {} call #{} {}", inner.label, id, method);
        if let Err(e) = inner.channel.send(bytes) {
            if let Some(call) = inner.take_pending(id) {
                call.settle(Err(e));
            }
        }
        ReplyFuture::waiting(id, method, reply_rx)
    }

    /// Call `method` and decode its result into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fire-and-forget: send a request that expects no response.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<()> {
        if self.inner.is_closed() {
            return Err(RpcError::channel_closed());
        }
        let bytes = protocol::encode(&Message::notification(method, args))?;
        debug!("-> {} notify {}", self.inner.label, method);
        self.inner.channel.send(bytes)
    }

    /// Close the channel and reject every outstanding call.
    ///
    /// Returns how many calls were rejected.
    pub fn close(&self) -> usize {
        let rejected = self.inner.shutdown();
        self.inner.channel.close();
        rejected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of calls still awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Age of the oldest outstanding call, if any.
    pub fn oldest_pending(&self) -> Option<Duration> {
        self.inner
            .lock_pending()
            .values()
            .map(|call| call.created_at.elapsed())
            .max()
    }

    /// The most recently allocated call id, `0` before the first call.
    pub fn last_call_id(&self) -> u64 {
        self.inner.next_id.load(Ordering::SeqCst) - 1
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.inner.registry
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

impl EndpointInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn disconnected(&self, method: &str) -> RpcError {
        RpcError::PeerDisconnected {
            method: method.to_string(),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().expect("pending call lock poisoned")
    }

    /// Refuses (handing the call back) once the Endpoint is closed, so no
    /// entry can slip in after `shutdown` drained the table.
    fn insert_pending(&self, id: u64, call: PendingCall) -> std::result::Result<(), PendingCall> {
        let mut pending = self.lock_pending();
        if self.is_closed() {
            return Err(call);
        }
        pending.insert(id, call);
        Ok(())
    }

    fn take_pending(&self, id: u64) -> Option<PendingCall> {
        self.lock_pending().remove(&id)
    }

    /// Attach `timer` to call `id`, or abort it if the call already settled.
    fn arm_timer(&self, id: u64, timer: JoinHandle<()>) {
        let mut pending = self.lock_pending();
        match pending.get_mut(&id) {
            Some(call) => call.timer = Some(timer),
            None => timer.abort(),
        }
    }

    fn start_timer(inner: Weak<EndpointInner>, id: u64, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Some(mut call) = inner.take_pending(id) {
                debug!("Call #{} {} to {} timed out", id, call.method, inner.label);
                // This task is the timer; don't abort it from inside.
                call.timer = None;
                let method = call.method.clone();
                call.settle(Err(RpcError::Timeout { method, timeout }));
            }
        })
    }

    /// Mark closed and reject everything outstanding. Only the first call
    /// does any work.
    fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let drained: Vec<PendingCall> = self.lock_pending().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let err = self.disconnected(&call.method);
            call.settle(Err(err));
        }
        count
    }

    fn handle_frame(self: &Arc<Self>, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }
        match protocol::decode(bytes) {
            Ok(Message::Request { id, method, args }) => self.handle_request(id, method, args),
            Ok(Message::Response { id, outcome }) => self.handle_response(id, outcome),
            Err(e) => {
                warn!("Dropping undecodable frame from {}: {}", self.label, e);
                if let Some(id) = protocol::rejected_request_id(bytes) {
                    self.reply(Message::error(
                        id,
                        ErrorObject {
                            code: INVALID_REQUEST_CODE,
                            message: format!("Invalid request: {}", e),
                            data: None,
                        },
                    ));
                }
            }
        }
    }

    fn handle_request(self: &Arc<Self>, id: Option<u64>, method: String, args: Vec<Value>) {
        let Some(function) = self.registry.get(&method) else {
            match id {
                Some(id) => {
                    debug!("{} called unknown method {}", self.label, method);
                    let err = RpcError::MethodNotFound { method }.to_wire();
                    self.reply(Message::error(id, err));
                }
                None => debug!("Dropping notification for unknown method {}", method),
            }
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(function.call(args)).catch_unwind().await;
            let outcome = match outcome {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("{} panicked", method)),
            };

            let Some(id) = id else {
                if let Err(e) = outcome {
                    debug!("Notification {} failed: {:#}", method, e);
                }
                return;
            };

            let message = match outcome {
                Ok(value) => Message::success(id, value),
                Err(e) => {
                    debug!("{} #{} failed: {:#}", method, id, e);
                    Message::error(
                        id,
                        ErrorObject {
                            code: REMOTE_FAILURE_CODE,
                            message: format!("{:#}", e),
                            data: None,
                        },
                    )
                }
            };
            inner.reply(message);
        });
    }

    fn handle_response(&self, id: u64, outcome: std::result::Result<Value, ErrorObject>) {
        let Some(call) = self.take_pending(id) else {
            // Already timed out, or never ours.
            debug!("Discarding response #{} from {}: no pending call", id, self.label);
            return;
        };
        debug!(
            "<- {} reply #{} {} after {:?}",
            self.label,
            id,
            call.method,
            call.created_at.elapsed()
        );
        let result = outcome.map_err(|e| RpcError::from_wire(&call.method, &e));
        call.settle(result);
    }

    fn reply(&self, message: Message) {
        let sent = protocol::encode(&message).and_then(|bytes| self.channel.send(bytes));
        if let Err(e) = sent {
            debug!("Could not reply to {}: {}", self.label, e);
        }
    }
}

/// Resolves with the result of one call.
///
/// Dropping it does not cancel the call; the pending entry stays until a
/// response, a timeout, or the channel closing.
pub struct ReplyFuture {
    id: Option<u64>,
    method: String,
    state: ReplyState,
}

enum ReplyState {
    Waiting(oneshot::Receiver<Result<Value>>),
    Failed(Option<RpcError>),
}

impl ReplyFuture {
    fn waiting(id: u64, method: &str, rx: oneshot::Receiver<Result<Value>>) -> Self {
        Self {
            id: Some(id),
            method: method.to_string(),
            state: ReplyState::Waiting(rx),
        }
    }

    fn failed(id: Option<u64>, method: &str, error: RpcError) -> Self {
        Self {
            id,
            method: method.to_string(),
            state: ReplyState::Failed(Some(error)),
        }
    }

    /// The call id, or `None` if the call failed before one was allocated.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for ReplyFuture {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            ReplyState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // Sender dropped without settling: the Endpoint went away.
                Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::PeerDisconnected {
                    method: this.method.clone(),
                })),
                Poll::Pending => Poll::Pending,
            },
            ReplyState::Failed(error) => Poll::Ready(Err(error.take().unwrap_or_else(|| {
                RpcError::PeerDisconnected {
                    method: this.method.clone(),
                }
            }))),
        }
    }
}
