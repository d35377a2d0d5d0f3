use crate::core::codec::RpcValue;
use crate::error::RpcError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use tracing::warn;

pub(crate) type ResponseSender = Sender<Result<RpcValue, RpcError>>;

/// Outstanding requests awaiting a response, keyed by id.
#[derive(Default)]
pub(crate) struct RequestTable {
  pending: Mutex<BTreeMap<u64, ResponseSender>>,
}

impl RequestTable {
  pub(crate) fn insert(&self, id: u64, tx: ResponseSender) {
    let previous = self.pending.lock().insert(id, tx);
    debug_assert!(previous.is_none(), "request id {} reused", id);
  }

  /// Deliver a response to its waiter. Returns false when the id is unknown.
  pub(crate) fn complete(&self, id: u64, result: Result<RpcValue, RpcError>) -> bool {
    let tx = self.pending.lock().remove(&id);
    match tx {
      Some(tx) => {
        // A waiter that gave up is not an error.
        let _ = tx.send(result);
        true
      },
      None => false,
    }
  }

  /// Drop an entry without completing it (the request never hit the wire).
  pub(crate) fn discard(&self, id: u64) {
    self.pending.lock().remove(&id);
  }

  /// Fail every outstanding entry with a transport error.
  pub(crate) fn fail_all(&self) {
    let drained = std::mem::take(&mut *self.pending.lock());
    if !drained.is_empty() {
      warn!("[RPC] failing {} outstanding requests", drained.len());
    }
    for (_, tx) in drained {
      let _ = tx.send(Err(RpcError::PeerDisconnect));
    }
  }

  pub(crate) fn outstanding(&self) -> usize {
    self.pending.lock().len()
  }
}

/// Handle to an in-flight call issued without waiting.
///
/// The result arrives on whichever thread is driving the connection's read
/// loop; [`wait`](PendingCall::wait) blocks until it does.
pub struct PendingCall {
  id: u64,
  rx: Receiver<Result<RpcValue, RpcError>>,
}

impl PendingCall {
  pub(crate) fn new(id: u64, rx: Receiver<Result<RpcValue, RpcError>>) -> Self {
    PendingCall { id, rx }
  }

  pub(crate) fn channel(id: u64) -> (ResponseSender, PendingCall) {
    let (tx, rx) = mpsc::channel();
    (tx, PendingCall::new(id, rx))
  }

  /// The request id this call was issued under.
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Block until the response (or a transport failure) arrives.
  pub fn wait(self) -> Result<RpcValue, RpcError> {
    self.rx.recv().unwrap_or(Err(RpcError::PeerDisconnect))
  }

  /// Non-blocking completion check; consumes the result when it is ready.
  pub fn poll(&self) -> Option<Result<RpcValue, RpcError>> {
    match self.rx.try_recv() {
      Ok(result) => Some(result),
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Disconnected) => Some(Err(RpcError::PeerDisconnect)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn complete_reaches_the_waiter() {
    let table = RequestTable::default();
    let (tx, call) = PendingCall::channel(1);
    table.insert(1, tx);
    assert!(table.complete(1, Ok(RpcValue::from(json!("pong")))));
    assert_eq!(call.wait().unwrap().as_str(), Some("pong"));
    assert_eq!(table.outstanding(), 0);
  }

  #[test]
  fn unknown_ids_are_reported() {
    let table = RequestTable::default();
    assert!(!table.complete(99, Ok(RpcValue::null())));
  }

  #[test]
  fn fail_all_unblocks_every_waiter() {
    let table = RequestTable::default();
    let (tx1, call1) = PendingCall::channel(1);
    let (tx2, call2) = PendingCall::channel(2);
    table.insert(1, tx1);
    table.insert(2, tx2);
    table.fail_all();
    assert!(matches!(call1.wait(), Err(RpcError::PeerDisconnect)));
    assert!(matches!(call2.wait(), Err(RpcError::PeerDisconnect)));
  }

  #[test]
  fn poll_is_nonblocking() {
    let table = RequestTable::default();
    let (tx, call) = PendingCall::channel(1);
    table.insert(1, tx);
    assert!(call.poll().is_none());
    table.complete(1, Ok(RpcValue::null()));
    assert!(call.poll().unwrap().unwrap().is_null());
  }
}
