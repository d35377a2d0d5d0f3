use crate::core::codec::RpcValue;
use crate::core::connection::Connection;
use crate::core::handler::Params;
use crate::core::request::PendingCall;
use crate::error::RpcError;

/// User-facing call surface, bound either to the peer's root handler or to
/// one named instance on the peer.
///
/// The three methods are the three call modalities over the same wire
/// envelope: [`call`](Proxy::call) blocks for the reply,
/// [`request`](Proxy::request) returns a [`PendingCall`] immediately, and
/// [`notify`](Proxy::notify) asks the peer not to reply at all.
#[derive(Clone)]
pub struct Proxy {
  conn: Connection,
  object: Option<String>,
}

impl Proxy {
  pub(crate) fn root(conn: Connection) -> Self {
    Proxy { conn, object: None }
  }

  pub(crate) fn bound(conn: Connection, name: &str) -> Self {
    Proxy {
      conn,
      object: Some(name.to_string()),
    }
  }

  fn qualify(&self, method: &str) -> String {
    match &self.object {
      Some(object) => format!("{}.{}", object, method),
      None => method.to_string(),
    }
  }

  /// Invoke `method`, block until the peer replies, and return the result.
  /// A non-null `error` in the reply surfaces as [`RpcError::Server`].
  pub fn call(&self, method: &str, params: Params) -> Result<RpcValue, RpcError> {
    self.conn.send_rpc_request(&self.qualify(method), params)
  }

  /// Invoke `method` and return a handle to the in-flight call.
  pub fn request(&self, method: &str, params: Params) -> Result<PendingCall, RpcError> {
    self.conn.async_send_rpc_request(&self.qualify(method), params)
  }

  /// Invoke `method` without an id; the peer will not reply, even on error.
  pub fn notify(&self, method: &str, params: Params) -> Result<(), RpcError> {
    self.conn.send_rpc_notification(&self.qualify(method), params)
  }

  /// The instance name this proxy is bound to, if any.
  pub fn object(&self) -> Option<&str> {
    self.object.as_deref()
  }
}
