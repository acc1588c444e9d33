//! Concrete transports that feed Endpoints and Groups.
//!
//! The RPC layer only needs a [`Channel`](crate::channel::Channel) per peer
//! and, for Groups, a [`MembershipSource`](crate::group::MembershipSource).
//! Everything here exists to provide those two things over a real socket.

pub mod hot;

pub use hot::{EventChannel, HotClient, HotHub, HotHubHandle, HubEvent, HubMembership};
