//! Hot channel: one TCP connection per client, many named events on it.
//!
//! A dev server runs a [`HotHub`]; each tool connects with a [`HotClient`].
//! Every stream frame carries an event name and an opaque payload, so several
//! independent protocols can share one connection. The RPC layer claims one
//! event name (`"<name>:rpc"`) and sees only its own frames.
//!
//! # Architecture
//!
//! - **Frame**: event-tagged payloads inside the length-prefixed stream framing
//! - **Hub**: accepts clients, assigns each a [`PeerId`](crate::group::PeerId),
//!   routes inbound frames through an [`EventRegistry`](crate::events::EventRegistry)
//! - **Client**: a single connection to a hub
//! - **Channel**: an [`EventChannel`] binds one event on one connection to the
//!   [`Channel`](crate::channel::Channel) trait

pub mod channel;
pub mod client;
pub mod frame;
pub mod hub;

pub use channel::EventChannel;
pub use client::HotClient;
pub use frame::HotFrame;
pub use hub::{HotHub, HotHubHandle, HubEvent, HubMembership};

/// Emitted locally (never sent on the wire) when a client connects, before
/// any of its frames are read. The source is the new peer.
pub(crate) const CONNECT_EVENT: &str = "hub:connect";

/// Emitted locally (never sent on the wire) when a connection ends. The
/// source is the peer that went away.
pub(crate) const DISCONNECT_EVENT: &str = "hub:disconnect";

/// Event names with this prefix belong to the transport; clients may not
/// send them.
pub(crate) const RESERVED_PREFIX: &str = "hub:";
