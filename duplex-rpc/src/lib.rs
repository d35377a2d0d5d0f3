//! Bidirectional, line-delimited JSON-RPC over stream sockets.
//!
//! Either peer of a connection may invoke methods on the other at any time;
//! a call may hand back a reference to an instance living on the callee,
//! which the caller then invokes methods on through the same socket. One
//! thread drives the inbound side ([`Connection::serve`]) while any number
//! of threads issue outbound calls through [`Proxy`] in three modalities:
//! blocking, in-flight handle, and fire-and-forget notification.

pub mod core;
pub mod error;
pub mod server;

pub use crate::core::codec::{BoundMethod, RpcValue};
pub use crate::core::connection::{
  Connection, HandlerFactory, StatsSnapshot, Timeouts, WeakConnection,
};
pub use crate::core::handler::{Handler, Method, MethodTable, Params, TableHandler};
pub use crate::core::proxy::Proxy;
pub use crate::core::remote::RemoteObject;
pub use crate::core::request::PendingCall;
pub use crate::error::{ReadError, RpcError};
pub use crate::server::Server;
