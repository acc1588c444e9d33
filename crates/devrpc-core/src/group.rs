//! A dynamic set of Endpoints, one per connected peer.
//!
//! The Group caches one [`Endpoint`] per [`PeerId`]. [`Group::update_membership`]
//! reconciles that cache against the transport's current peer list: peers that
//! are still there keep their Endpoint (and with it every in-flight call),
//! new peers get a fresh Endpoint, and departed peers have theirs closed.
//!
//! A peer whose Endpoint was dropped is never resurrected. If the same
//! identity shows up again it gets a new Endpoint with a fresh call-id space.

use crate::channel::Channel;
use crate::config::RpcOptions;
use crate::endpoint::Endpoint;
use crate::registry::FunctionRegistry;
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Stable identity of one physical connection, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Where a Group learns who is connected and how to reach them.
pub trait MembershipSource: Send + Sync {
    /// Identities of every peer connected right now.
    fn live_peers(&self) -> Vec<PeerId>;

    /// Open a channel to `peer`. Called once per Endpoint the Group creates.
    fn open_channel(&self, peer: PeerId) -> Result<Arc<dyn Channel>>;
}

/// What one [`Group::update_membership`] call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub kept: Vec<PeerId>,
    pub added: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl MembershipDiff {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One member's result from [`Group::broadcast`].
#[derive(Debug)]
pub struct BroadcastOutcome {
    pub peer: PeerId,
    pub result: Result<Value>,
}

pub struct Group {
    registry: Arc<FunctionRegistry>,
    source: Arc<dyn MembershipSource>,
    options: RpcOptions,
    members: Mutex<BTreeMap<PeerId, Endpoint>>,
}

impl Group {
    /// Create an empty Group. Call [`Group::update_membership`] to populate it.
    pub fn new(
        registry: Arc<FunctionRegistry>,
        source: Arc<dyn MembershipSource>,
        options: RpcOptions,
    ) -> Self {
        Self {
            registry,
            source,
            options,
            members: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock_members(&self) -> std::sync::MutexGuard<'_, BTreeMap<PeerId, Endpoint>> {
        self.members.lock().expect("membership lock poisoned")
    }

    /// Reconcile the cache with the source's live peers.
    ///
    /// Idempotent: with an unchanged peer list nothing is created or closed.
    /// An Endpoint whose channel closed on its own counts as gone; if its
    /// peer is still listed it is replaced by a fresh one.
    pub fn update_membership(&self) -> MembershipDiff {
        // Read the peer list under the lock so overlapping updates apply in order.
        let mut members = self.lock_members();
        let live: BTreeSet<PeerId> = self.source.live_peers().into_iter().collect();
        let mut diff = MembershipDiff::default();

        let stale: Vec<PeerId> = members
            .iter()
            .filter(|(peer, endpoint)| !live.contains(*peer) || endpoint.is_closed())
            .map(|(peer, _)| *peer)
            .collect();
        for peer in stale {
            if let Some(endpoint) = members.remove(&peer) {
                let rejected = endpoint.close();
                debug!("Dropped {} ({} pending call(s) rejected)", peer, rejected);
                diff.removed.push(peer);
            }
        }

        for peer in live {
            if members.contains_key(&peer) {
                diff.kept.push(peer);
                continue;
            }
            match self.source.open_channel(peer) {
                Ok(channel) => {
                    let endpoint = Endpoint::with_label(
                        self.registry.clone(),
                        channel,
                        &self.options,
                        peer.to_string(),
                    );
                    members.insert(peer, endpoint);
                    diff.added.push(peer);
                }
                Err(e) => warn!("Could not open channel to {}: {}", peer, e),
            }
        }

        if !diff.is_unchanged() {
            info!(
                "Membership updated: {} kept, {} added, {} removed",
                diff.kept.len(),
                diff.added.len(),
                diff.removed.len()
            );
        }
        diff
    }

    /// Open members, in peer order.
    fn active_members(&self) -> Vec<(PeerId, Endpoint)> {
        self.lock_members()
            .iter()
            .filter(|(_, endpoint)| !endpoint.is_closed())
            .map(|(peer, endpoint)| (*peer, endpoint.clone()))
            .collect()
    }

    /// Call `method` on every member and collect each outcome.
    ///
    /// All requests are sent before any response is awaited. One member
    /// failing has no effect on the others.
    pub async fn broadcast(&self, method: &str, args: Vec<Value>) -> Vec<BroadcastOutcome> {
        let calls: Vec<_> = self
            .active_members()
            .into_iter()
            .map(|(peer, endpoint)| (peer, endpoint.call(method, args.clone())))
            .collect();
        debug!("Broadcasting {} to {} member(s)", method, calls.len());

        futures::future::join_all(calls.into_iter().map(|(peer, reply)| async move {
            BroadcastOutcome {
                peer,
                result: reply.await,
            }
        }))
        .await
    }

    /// Fire-and-forget `method` to every member. Returns how many sends
    /// succeeded.
    pub fn notify_all(&self, method: &str, args: Vec<Value>) -> usize {
        self.active_members()
            .into_iter()
            .filter(|(peer, endpoint)| match endpoint.notify(method, args.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Notify {} to {} failed: {}", method, peer, e);
                    false
                }
            })
            .count()
    }

    /// Call `method` on one member.
    pub async fn call_one(&self, peer: PeerId, method: &str, args: Vec<Value>) -> Result<Value> {
        let endpoint = self.endpoint(peer).ok_or_else(|| RpcError::PeerNotFound {
            peer: peer.to_string(),
        })?;
        endpoint.call(method, args).await
    }

    /// The open Endpoint cached for `peer`.
    pub fn endpoint(&self, peer: PeerId) -> Option<Endpoint> {
        self.lock_members()
            .get(&peer)
            .filter(|endpoint| !endpoint.is_closed())
            .cloned()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.active_members().into_iter().map(|(peer, _)| peer).collect()
    }

    pub fn len(&self) -> usize {
        self.active_members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The registry every member Endpoint is bound to.
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Close every member. Returns how many pending calls were rejected.
    pub fn close_all(&self) -> usize {
        let members = std::mem::take(&mut *self.lock_members());
        members.values().map(Endpoint::close).sum()
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("peers", &self.peers())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::config::TimeoutPolicy;
    use crate::RpcErrorKind;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// In-memory peers. Each opened channel gets a remote Endpoint serving
    /// that peer's registry.
    #[derive(Default)]
    struct FakePeers {
        live: Mutex<Vec<PeerId>>,
        registries: Mutex<HashMap<PeerId, Arc<FunctionRegistry>>>,
        remotes: Mutex<HashMap<PeerId, Endpoint>>,
        opened: AtomicUsize,
    }

    impl FakePeers {
        fn set_live(&self, peers: &[u64]) {
            *self.live.lock().unwrap() = peers.iter().copied().map(PeerId).collect();
        }

        fn serve(&self, peer: u64, registry: Arc<FunctionRegistry>) {
            self.registries.lock().unwrap().insert(PeerId(peer), registry);
        }

        fn remote(&self, peer: u64) -> Endpoint {
            self.remotes.lock().unwrap()[&PeerId(peer)].clone()
        }
    }

    impl MembershipSource for FakePeers {
        fn live_peers(&self) -> Vec<PeerId> {
            self.live.lock().unwrap().clone()
        }

        fn open_channel(&self, peer: PeerId) -> Result<Arc<dyn Channel>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (local, remote) = MemoryChannel::pair();
            let registry = self
                .registries
                .lock()
                .unwrap()
                .get(&peer)
                .cloned()
                .unwrap_or_else(default_remote);
            let endpoint = Endpoint::new(registry, Arc::new(remote), &RpcOptions::default());
            self.remotes.lock().unwrap().insert(peer, endpoint);
            Ok(Arc::new(local))
        }
    }

    /// Stalls the first `live_peers` call after taking its snapshot, until
    /// released.
    struct StallingPeers {
        inner: FakePeers,
        stall: Mutex<Option<(std::sync::mpsc::Sender<()>, std::sync::mpsc::Receiver<()>)>>,
    }

    impl MembershipSource for StallingPeers {
        fn live_peers(&self) -> Vec<PeerId> {
            let snapshot = self.inner.live_peers();
            let stall = self.stall.lock().unwrap().take();
            if let Some((entered, release)) = stall {
                entered.send(()).unwrap();
                release.recv().unwrap();
            }
            snapshot
        }

        fn open_channel(&self, peer: PeerId) -> Result<Arc<dyn Channel>> {
            self.inner.open_channel(peer)
        }
    }

    fn default_remote() -> Arc<FunctionRegistry> {
        FunctionRegistry::builder()
            .register("whoami", |_| async move { Ok(json!("client")) })
            .build()
    }

    fn group_with(peers: &Arc<FakePeers>, options: RpcOptions) -> Group {
        let registry = FunctionRegistry::builder()
            .register("serverTime", |_| async move { Ok(json!(42)) })
            .build();
        Group::new(registry, peers.clone(), options)
    }

    fn gated_registry(gate: Arc<Notify>) -> Arc<FunctionRegistry> {
        FunctionRegistry::builder()
            .register("waitForGate", move |_| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(json!("opened"))
                }
            })
            .build()
    }

    #[tokio::test]
    async fn test_update_membership_adds_and_removes() {
        let peers = Arc::new(FakePeers::default());
        let group = group_with(&peers, RpcOptions::default());

        peers.set_live(&[1, 2]);
        let diff = group.update_membership();
        assert_eq!(diff.added, vec![PeerId(1), PeerId(2)]);
        assert_eq!(group.peers(), vec![PeerId(1), PeerId(2)]);

        peers.set_live(&[2, 3]);
        let diff = group.update_membership();
        assert_eq!(diff.kept, vec![PeerId(2)]);
        assert_eq!(diff.added, vec![PeerId(3)]);
        assert_eq!(diff.removed, vec![PeerId(1)]);
        assert_eq!(group.len(), 2);
    }

    #[tokio::test]
    async fn test_update_membership_is_idempotent_and_keeps_pending_calls() {
        let gate = Arc::new(Notify::new());
        let peers = Arc::new(FakePeers::default());
        peers.serve(1, gated_registry(gate.clone()));
        peers.set_live(&[1]);
        let group = group_with(&peers, RpcOptions::default());

        group.update_membership();
        let before = group.endpoint(PeerId(1)).unwrap();
        let reply = before.call("waitForGate", vec![]);

        let diff = group.update_membership();
        assert!(diff.is_unchanged());
        assert_eq!(diff.kept, vec![PeerId(1)]);
        assert_eq!(peers.opened.load(Ordering::SeqCst), 1);
        assert_eq!(group.endpoint(PeerId(1)).unwrap().pending_calls(), 1);

        gate.notify_one();
        assert_eq!(reply.await.unwrap(), json!("opened"));
    }

    #[tokio::test]
    async fn test_removed_peer_rejects_pending_calls() {
        let peers = Arc::new(FakePeers::default());
        peers.serve(1, gated_registry(Arc::new(Notify::new())));
        peers.set_live(&[1]);
        let group = group_with(&peers, RpcOptions::default());
        group.update_membership();

        let reply = group.endpoint(PeerId(1)).unwrap().call("waitForGate", vec![]);
        peers.set_live(&[]);
        let diff = group.update_membership();

        assert_eq!(diff.removed, vec![PeerId(1)]);
        assert_eq!(reply.await.unwrap_err().kind(), RpcErrorKind::PeerDisconnected);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_reappearing_peer_gets_fresh_endpoint() {
        let peers = Arc::new(FakePeers::default());
        peers.set_live(&[7]);
        let group = group_with(&peers, RpcOptions::default());
        group.update_membership();

        group.call_one(PeerId(7), "whoami", vec![]).await.unwrap();
        assert_eq!(group.endpoint(PeerId(7)).unwrap().last_call_id(), 1);

        peers.set_live(&[]);
        group.update_membership();
        peers.set_live(&[7]);
        let diff = group.update_membership();

        assert_eq!(diff.added, vec![PeerId(7)]);
        assert_eq!(group.endpoint(PeerId(7)).unwrap().last_call_id(), 0);
        assert_eq!(peers.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_self_closed_endpoint_leaves_and_is_replaced() {
        let peers = Arc::new(FakePeers::default());
        peers.set_live(&[1, 2]);
        let group = group_with(&peers, RpcOptions::default());
        group.update_membership();

        let local = group.endpoint(PeerId(1)).unwrap();
        peers.remote(1).close();
        while !local.is_closed() {
            tokio::task::yield_now().await;
        }
        assert_eq!(group.peers(), vec![PeerId(2)]);

        let diff = group.update_membership();
        assert_eq!(diff.removed, vec![PeerId(1)]);
        assert_eq!(diff.added, vec![PeerId(1)]);
        assert_eq!(
            group.call_one(PeerId(1), "whoami", vec![]).await.unwrap(),
            json!("client")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_collects_independent_outcomes() {
        let peers = Arc::new(FakePeers::default());
        peers.serve(
            1,
            FunctionRegistry::builder()
                .register("refresh", |_| async move { Ok(json!("ok")) })
                .build(),
        );
        peers.serve(
            2,
            FunctionRegistry::builder()
                .register("refresh", |_| async move {
                    Err::<Value, _>(anyhow::anyhow!("component tree unavailable"))
                })
                .build(),
        );
        peers.serve(
            3,
            FunctionRegistry::builder()
                .register("refresh", |_| async move {
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                })
                .build(),
        );
        peers.set_live(&[1, 2, 3]);
        let options = RpcOptions::with_timeout(TimeoutPolicy::After(Duration::from_millis(500)));
        let group = group_with(&peers, options);
        group.update_membership();

        let outcomes = group.broadcast("refresh", vec![]).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].peer, PeerId(1));
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &json!("ok"));
        assert_eq!(
            outcomes[1].result.as_ref().unwrap_err().kind(),
            RpcErrorKind::Remote
        );
        assert_eq!(
            outcomes[2].result.as_ref().unwrap_err().kind(),
            RpcErrorKind::Timeout
        );
    }

    #[tokio::test]
    async fn test_call_one_unknown_peer() {
        let peers = Arc::new(FakePeers::default());
        let group = group_with(&peers, RpcOptions::default());

        let err = group.call_one(PeerId(9), "whoami", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), RpcErrorKind::PeerNotFound);
    }

    #[tokio::test]
    async fn test_members_can_call_the_shared_registry() {
        let peers = Arc::new(FakePeers::default());
        peers.set_live(&[1, 2]);
        let group = group_with(&peers, RpcOptions::default());
        group.update_membership();

        for peer in [1, 2] {
            let remote = peers.remote(peer);
            assert_eq!(remote.call("serverTime", vec![]).await.unwrap(), json!(42));
        }
        for peer in group.peers() {
            let endpoint = group.endpoint(peer).unwrap();
            assert!(Arc::ptr_eq(endpoint.registry(), group.registry()));
        }
    }

    #[tokio::test]
    async fn test_notify_all_counts_deliveries() {
        let peers = Arc::new(FakePeers::default());
        peers.set_live(&[1, 2, 3]);
        let group = group_with(&peers, RpcOptions::default());
        group.update_membership();

        assert_eq!(group.notify_all("whoami", vec![]), 3);
        assert_eq!(group.close_all(), 0);
        assert_eq!(group.notify_all("whoami", vec![]), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_updates_keep_connected_peer() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let peers = Arc::new(StallingPeers {
            inner: FakePeers::default(),
            stall: Mutex::new(Some((entered_tx, release_rx))),
        });
        let group = Arc::new(Group::new(
            default_remote(),
            peers.clone(),
            RpcOptions::default(),
        ));

        // The first update sees no peers and stalls.
        let first = {
            let group = group.clone();
            tokio::task::spawn_blocking(move || group.update_membership())
        };
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Peer 6 connects while the first update is still running.
        peers.inner.set_live(&[6]);
        let second = {
            let group = group.clone();
            tokio::task::spawn_blocking(move || group.update_membership())
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(()).unwrap();

        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(group.peers(), vec![PeerId(6)]);
        assert!(!group.endpoint(PeerId(6)).unwrap().is_closed());
    }
}
