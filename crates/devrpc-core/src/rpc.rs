//! Ready-made wiring of the RPC layer onto the hot channel.
//!
//! A dev server calls [`create_rpc_server`] once per named RPC surface; each
//! tool calls [`create_rpc_client`] with the same name. Both sides use the
//! event `"<name>:rpc"`, so several surfaces can share one hub.

use crate::config::{RpcConfig, RpcOptions};
use crate::endpoint::Endpoint;
use crate::events::Subscription;
use crate::group::Group;
use crate::registry::FunctionRegistry;
use crate::transport::hot::{HotClient, HotHubHandle, CONNECT_EVENT, DISCONNECT_EVENT};
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, info};

/// Event name used for the RPC surface `name`.
pub fn rpc_event_name(name: &str) -> String {
    format!("{}:{}", name, RpcConfig::DEFAULT_EVENT_SUFFIX)
}

/// Server side of a named RPC surface: a [`Group`] over every client of the
/// hub that keeps itself in sync with connects and disconnects.
///
/// The Group is refreshed from inside the hub's connect handling, before the
/// new client's first frame is read, so a request sent right after
/// connecting always finds its Endpoint.
///
/// Derefs to the [`Group`]. Dropping it unsubscribes from the hub and closes
/// every member Endpoint.
pub struct RpcServer {
    name: String,
    group: Arc<Group>,
    subscriptions: Vec<Subscription>,
}

impl RpcServer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }
}

impl Deref for RpcServer {
    type Target = Group;

    fn deref(&self) -> &Group {
        &self.group
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.subscriptions.clear();
        self.group.close_all();
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("name", &self.name)
            .field("group", &self.group)
            .finish()
    }
}

/// Expose `registry` to every client of `hub` under `name`.
///
/// Clients already connected are picked up immediately. Must be called from
/// within a tokio runtime.
pub fn create_rpc_server(
    name: &str,
    hub: &HotHubHandle,
    registry: Arc<FunctionRegistry>,
    options: RpcOptions,
) -> RpcServer {
    let event = rpc_event_name(name);
    let group = Arc::new(Group::new(
        registry,
        Arc::new(hub.membership(event.clone())),
        options,
    ));

    // Subscribe before the first sync so no connect slips between the two.
    let subscriptions = [CONNECT_EVENT, DISCONNECT_EVENT]
        .into_iter()
        .map(|lifecycle| {
            let weak = Arc::downgrade(&group);
            let event = event.clone();
            hub.events().subscribe(lifecycle, move |peer, _| {
                if let Some(group) = weak.upgrade() {
                    debug!("Membership change on {} ({})", event, peer);
                    group.update_membership();
                }
            })
        })
        .collect();
    group.update_membership();

    info!(
        "RPC server '{}' ready ({} functions)",
        name,
        group.registry().len()
    );

    RpcServer {
        name: name.to_string(),
        group,
        subscriptions,
    }
}

/// Connect `registry` to the server's surface `name` over `client`.
pub fn create_rpc_client(
    name: &str,
    client: &HotClient,
    registry: Arc<FunctionRegistry>,
    options: RpcOptions,
) -> Endpoint {
    let channel = client.channel(&rpc_event_name(name));
    Endpoint::with_label(registry, Arc::new(channel), &options, "server")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        assert_eq!(rpc_event_name("devrpc"), "devrpc:rpc");
        assert_eq!(rpc_event_name("inspect"), "inspect:rpc");
    }
}
