use crate::core::connection::Connection;
use crate::core::handler::Params;
use crate::core::proxy::Proxy;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A handle to an instance living on the peer, materialized while decoding a
/// remote-object hint.
///
/// Methods invoked through [`proxy`](RemoteObject::proxy) execute on the
/// originating peer. Dropping the last clone of a handle sends a best-effort
/// delete notification so the peer can release the instance; [`close`]
/// (RemoteObject::close) does the same eagerly.
#[derive(Clone)]
pub struct RemoteObject {
  inner: Arc<RemoteInner>,
}

struct RemoteInner {
  name: String,
  conn: Connection,
  released: AtomicBool,
}

impl RemoteInner {
  fn release(&self) {
    if self.released.swap(true, Ordering::AcqRel) {
      return;
    }
    if self.conn.is_closed() {
      return;
    }
    let method = format!("{}.__delete__", self.name);
    if let Err(err) = self.conn.send_rpc_notification(&method, Params::new()) {
      // The peer may already be gone; releasing a handle must never fail.
      debug!("[RPC] could not release {}: {}", self.name, err);
    }
  }
}

impl Drop for RemoteInner {
  fn drop(&mut self) {
    self.release();
  }
}

impl RemoteObject {
  pub(crate) fn attach(conn: Connection, name: &str) -> Self {
    RemoteObject {
      inner: Arc::new(RemoteInner {
        name: name.to_string(),
        conn,
        released: AtomicBool::new(false),
      }),
    }
  }

  /// The peer-assigned instance name.
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Call surface bound to this instance.
  pub fn proxy(&self) -> Proxy {
    Proxy::bound(self.inner.conn.clone(), &self.inner.name)
  }

  /// Tell the peer to release the instance now instead of on drop.
  pub fn close(&self) {
    self.inner.release();
  }

  pub fn connection(&self) -> &Connection {
    &self.inner.conn
  }

  pub(crate) fn same_connection(&self, conn: &Connection) -> bool {
    self.inner.conn.same_as(conn)
  }
}

impl fmt::Debug for RemoteObject {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "RemoteObject({})", self.inner.name)
  }
}
