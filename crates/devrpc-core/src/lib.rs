//! devrpc core - bidirectional RPC between a dev server and its tools.
//!
//! Each side exposes a [`FunctionRegistry`] and calls the other side's
//! functions as if they were local async functions. Requests and responses
//! travel as JSON-RPC 2.0 over any [`Channel`]; the [`transport::hot`] module
//! provides one over TCP.
//!
//! - An [`Endpoint`] binds a registry to one channel: outgoing calls,
//!   notifications, inbound dispatch, timeouts.
//! - A [`Group`] keeps one Endpoint per connected peer and broadcasts to all
//!   of them.
//!
//! # Example
//!
//! ```rust,ignore
//! use devrpc_core::{create_rpc_client, create_rpc_server, FunctionRegistry, HotClient, HotHub};
//!
//! #[tokio::main]
//! async fn main() -> devrpc_core::Result<()> {
//!     let hub = HotHub::start("127.0.0.1:0").await?;
//!     let server_fns = FunctionRegistry::builder()
//!         .register_typed("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
//!         .build();
//!     let server = create_rpc_server("devrpc", &hub, server_fns, Default::default());
//!
//!     let client = HotClient::connect(hub.addr()).await?;
//!     let endpoint =
//!         create_rpc_client("devrpc", &client, FunctionRegistry::empty(), Default::default());
//!     let sum: i64 = endpoint.call_as("add", vec![2.into(), 3.into()]).await?;
//!     assert_eq!(sum, 5);
//!
//!     // And back: every connected client, concurrently.
//!     let outcomes = server.broadcast("reload", vec![]).await;
//!     println!("{} peers answered", outcomes.len());
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod group;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod transport;

// Re-export commonly used types
pub use channel::{Channel, ChannelEvent, MemoryChannel, ReceiveHandler};
pub use config::{HubConfig, RpcConfig, RpcOptions, TimeoutPolicy};
pub use endpoint::{Endpoint, ReplyFuture};
pub use error::{Result, RpcError, RpcErrorKind};
pub use events::{EventRegistry, Subscription};
pub use group::{BroadcastOutcome, Group, MembershipDiff, MembershipSource, PeerId};
pub use protocol::{ErrorObject, Message};
pub use registry::{FunctionRegistry, RegistryBuilder, RpcFunction};
pub use rpc::{create_rpc_client, create_rpc_server, rpc_event_name, RpcServer};
pub use transport::hot::{EventChannel, HotClient, HotHub, HotHubHandle, HubEvent, HubMembership};
