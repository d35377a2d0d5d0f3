use crate::core::codec::{self, BoundMethod, RpcValue};
use crate::core::frame::{self, ReadBuf, WriteBuf};
use crate::core::handler::{Handler, Params};
use crate::core::proxy::Proxy;
use crate::core::registry::ObjectRegistry;
use crate::core::request::{PendingCall, RequestTable};
use crate::error::RpcError;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, trace};

/// Per-operation timeout maxima, fixed at connection construction.
///
/// A per-call timeout of `None` or anything above the maximum is clamped to
/// the maximum; a zero timeout means non-blocking.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
  pub read: Option<Duration>,
  pub write: Option<Duration>,
}

impl Default for Timeouts {
  fn default() -> Self {
    Timeouts {
      read: Some(Duration::from_secs(5)),
      write: Some(Duration::from_secs(5)),
    }
  }
}

impl Timeouts {
  /// No upper bound on either operation.
  pub fn unbounded() -> Self {
    Timeouts {
      read: None,
      write: None,
    }
  }

  pub(crate) fn clamp_read(&self, requested: Option<Duration>) -> Option<Duration> {
    clamp(self.read, requested)
  }

  pub(crate) fn clamp_write(&self, requested: Option<Duration>) -> Option<Duration> {
    clamp(self.write, requested)
  }
}

fn clamp(max: Option<Duration>, requested: Option<Duration>) -> Option<Duration> {
  match (max, requested) {
    (None, requested) => requested,
    (Some(max), None) => Some(max),
    (Some(max), Some(requested)) => Some(requested.min(max)),
  }
}

/// Builds the root handler of a connection. Invoked once, with the
/// connection as sole argument, right after the transport is set up.
pub trait HandlerFactory: Send + Sync {
  fn build(&self, conn: &Connection) -> Arc<dyn Handler>;
}

impl<F> HandlerFactory for F
where
  F: Fn(&Connection) -> Arc<dyn Handler> + Send + Sync,
{
  fn build(&self, conn: &Connection) -> Arc<dyn Handler> {
    (self)(conn)
  }
}

#[derive(Default)]
pub(crate) struct ConnStats {
  pub(crate) dispatched_frames: AtomicU64,
  pub(crate) dropped_notification_errors: AtomicU64,
}

/// Point-in-time counters of one connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatsSnapshot {
  /// Frames successfully parsed and routed.
  pub dispatched_frames: u64,
  /// Failed notifications that were dropped without a reply.
  pub dropped_notification_errors: u64,
}

const PHASE_OPEN: u8 = 0;
const PHASE_CLOSING: u8 = 1;
const PHASE_CLOSED: u8 = 2;

pub(crate) struct ReadState {
  pub(crate) buf: ReadBuf,
}

pub(crate) struct WriteState {
  pub(crate) buf: WriteBuf,
}

pub(crate) struct ConnState {
  pub(crate) stream: TcpStream,
  pub(crate) peer_addr: Option<SocketAddr>,
  pub(crate) timeouts: Timeouts,
  /// Inbound buffer; only the thread inside the dispatch loop takes this.
  pub(crate) read: Mutex<ReadState>,
  /// The write lock. Guards the socket's send side and the id/insert step
  /// of outbound requests.
  pub(crate) write: Mutex<WriteState>,
  pub(crate) id_counter: AtomicU64,
  pub(crate) requests: RequestTable,
  pub(crate) registry: ObjectRegistry,
  pub(crate) handler: OnceCell<Arc<dyn Handler>>,
  pub(crate) phase: AtomicU8,
  pub(crate) stats: ConnStats,
}

/// One bidirectional line-delimited JSON-RPC session over a stream socket.
///
/// Cheap to clone; all clones share the same session. One thread drives the
/// inbound side through [`serve`](Connection::serve) (or manual
/// [`read_and_dispatch`](Connection::read_and_dispatch) calls) while any
/// number of threads issue outbound calls through [`proxy`](Connection::proxy).
#[derive(Clone)]
pub struct Connection {
  pub(crate) state: Arc<ConnState>,
}

impl Connection {
  /// Wrap an already-connected socket. The factory, when given, builds the
  /// root handler exposed to the peer.
  pub fn new(
    stream: TcpStream,
    timeouts: Timeouts,
    factory: Option<&dyn HandlerFactory>,
  ) -> Self {
    let _ = stream.set_nodelay(true);
    let peer_addr = stream.peer_addr().ok();
    let conn = Connection {
      state: Arc::new(ConnState {
        stream,
        peer_addr,
        timeouts,
        read: Mutex::new(ReadState {
          buf: ReadBuf::default(),
        }),
        write: Mutex::new(WriteState {
          buf: WriteBuf::default(),
        }),
        id_counter: AtomicU64::new(0),
        requests: RequestTable::default(),
        registry: ObjectRegistry::default(),
        handler: OnceCell::new(),
        phase: AtomicU8::new(PHASE_OPEN),
        stats: ConnStats::default(),
      }),
    };
    if let Some(factory) = factory {
      let handler = factory.build(&conn);
      let _ = conn.state.handler.set(handler);
    }
    trace!("[RPC] connection to {:?} established", conn.state.peer_addr);
    conn
  }

  /// Dial `addr` and wrap the resulting socket.
  pub fn connect(
    addr: impl ToSocketAddrs,
    timeouts: Timeouts,
    factory: Option<&dyn HandlerFactory>,
  ) -> Result<Self, RpcError> {
    let stream = TcpStream::connect(addr)?;
    Ok(Self::new(stream, timeouts, factory))
  }

  /// Call surface bound to the peer's root handler.
  pub fn proxy(&self) -> Proxy {
    Proxy::root(self.clone())
  }

  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.state.peer_addr
  }

  pub fn stats(&self) -> StatsSnapshot {
    StatsSnapshot {
      dispatched_frames: self.state.stats.dispatched_frames.load(Ordering::Relaxed),
      dropped_notification_errors: self
        .state
        .stats
        .dropped_notification_errors
        .load(Ordering::Relaxed),
    }
  }

  /// Requests still waiting for a response.
  pub fn outstanding_requests(&self) -> usize {
    self.state.requests.outstanding()
  }

  /// Bytes of a frame that never made it out after a short write.
  pub fn unsent_bytes(&self) -> usize {
    self.state.write.lock().buf.unsent()
  }

  /// Non-owning handle, for handlers that call back into their own
  /// connection without keeping it alive.
  pub fn downgrade(&self) -> WeakConnection {
    WeakConnection {
      state: Arc::downgrade(&self.state),
    }
  }

  pub(crate) fn same_as(&self, other: &Connection) -> bool {
    Arc::ptr_eq(&self.state, &other.state)
  }

  /// Next value of the per-connection counter shared by request ids and
  /// exported-instance names. First issued value is 1.
  pub(crate) fn next_id(&self) -> u64 {
    self.state.id_counter.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub(crate) fn root_handler(&self) -> Option<Arc<dyn Handler>> {
    self.state.handler.get().cloned()
  }

  pub(crate) fn registered_instance(&self, name: &str) -> Option<Arc<dyn Handler>> {
    self.state.registry.get(name)
  }

  pub(crate) fn export_instance(&self, instance: &Arc<dyn Handler>) -> String {
    self.state.registry.export(instance, || self.next_id())
  }

  /// Resolve a symbolic function name against the root handler, or against
  /// a registered instance when the name is dotted.
  pub(crate) fn resolve_function(&self, name: &str) -> Result<BoundMethod, RpcError> {
    let func = if let Some((object, short)) = name.split_once('.') {
      let instance = self
        .registered_instance(object)
        .ok_or_else(|| RpcError::BadReference(object.to_string()))?;
      instance
        .get_method(short)
        .ok_or_else(|| RpcError::NoSuchMethod(name.to_string()))?
    } else {
      let handler = self
        .root_handler()
        .ok_or_else(|| RpcError::NoSuchMethod(name.to_string()))?;
      handler
        .get_method(name)
        .ok_or_else(|| RpcError::NoSuchMethod(name.to_string()))?
    };
    Ok(BoundMethod::new(name.to_string(), self.clone(), func))
  }

  // ---- outbound path -----------------------------------------------------

  /// Issue a call and block until the reply is dispatched.
  pub(crate) fn send_rpc_request(
    &self,
    method: &str,
    params: Params,
  ) -> Result<RpcValue, RpcError> {
    self.async_send_rpc_request(method, params)?.wait()
  }

  /// Issue a call and return the in-flight handle.
  pub(crate) fn async_send_rpc_request(
    &self,
    method: &str,
    params: Params,
  ) -> Result<PendingCall, RpcError> {
    let id = self.next_id();
    let pending = self.send_call(method, params, Some(id))?;
    // send_call always produces a handle when an id is passed.
    pending.ok_or(RpcError::PeerDisconnect)
  }

  /// Issue a call without an id; the peer must not reply.
  pub(crate) fn send_rpc_notification(
    &self,
    method: &str,
    params: Params,
  ) -> Result<(), RpcError> {
    self.send_call(method, params, None).map(|_| ())
  }

  fn send_call(
    &self,
    method: &str,
    params: Params,
    id: Option<u64>,
  ) -> Result<Option<PendingCall>, RpcError> {
    if self.phase() != PHASE_OPEN {
      return Err(RpcError::PeerDisconnect);
    }
    trace!("[RPC] call {} (id: {:?})", method, id);

    // The lock spans encoding and the pending insert: instance names are
    // allocated while we hold exclusive send access, and the pending entry
    // is visible before the frame can possibly be answered.
    let mut write = self.state.write.lock();

    let mut envelope = Map::new();
    envelope.insert("method".to_string(), json!(method));
    if let Some(id) = id {
      envelope.insert("id".to_string(), json!(id));
    }
    let (pos, kw) = self.pack_params(params)?;
    if let Some(pos) = pos {
      envelope.insert("params".to_string(), pos);
    }
    if let Some(kw) = kw {
      envelope.insert("kwparams".to_string(), kw);
    }
    let payload = serde_json::to_vec(&Value::Object(envelope))?;

    let pending = id.map(|id| {
      let (tx, call) = PendingCall::channel(id);
      self.state.requests.insert(id, tx);
      call
    });

    if let Err(err) = frame::write_line(
      &self.state.stream,
      &mut write.buf,
      &payload,
      self.state.timeouts.clamp_write(None),
    ) {
      if let Some(call) = &pending {
        self.state.requests.discard(call.id());
      }
      drop(write);
      self.handle_write_failure(&err);
      return Err(err);
    }
    Ok(pending)
  }

  /// Pack positional and keyword arguments into the wire envelope: keywords
  /// alone travel under `params`, otherwise positionals take `params` and
  /// keywords take `kwparams`.
  fn pack_params(&self, params: Params) -> Result<(Option<Value>, Option<Value>), RpcError> {
    let (args, kwargs) = params.into_parts();
    let kw = if kwargs.is_empty() {
      None
    } else {
      let mut map = Map::with_capacity(kwargs.len());
      for (key, value) in &kwargs {
        map.insert(key.clone(), codec::encode_value(self, value)?);
      }
      Some(Value::Object(map))
    };
    if args.is_empty() {
      Ok((kw, None))
    } else {
      let pos: Result<Vec<Value>, RpcError> = args
        .iter()
        .map(|value| codec::encode_value(self, value))
        .collect();
      Ok((Some(Value::Array(pos?)), kw))
    }
  }

  /// Write one reply frame. Reply failures are logged, not propagated; a
  /// transport failure additionally fails all pending requests.
  pub(crate) fn respond(&self, result: Value, error: Option<String>, id: &Value) {
    let reply = json!({ "result": result, "error": error, "id": id });
    let payload = match serde_json::to_vec(&reply) {
      Ok(payload) => payload,
      Err(err) => {
        error!("[RPC] could not serialize reply for id {}: {}", id, err);
        return;
      },
    };
    let mut write = self.state.write.lock();
    if let Err(err) = frame::write_line(
      &self.state.stream,
      &mut write.buf,
      &payload,
      self.state.timeouts.clamp_write(None),
    ) {
      drop(write);
      error!("[RPC] error sending reply for id {}: {}", id, err);
      self.handle_write_failure(&err);
    }
  }

  // ---- lifecycle ---------------------------------------------------------

  fn phase(&self) -> u8 {
    self.state.phase.load(Ordering::Acquire)
  }

  pub fn is_closed(&self) -> bool {
    self.phase() == PHASE_CLOSED
  }

  fn handle_write_failure(&self, err: &RpcError) {
    trace!("[RPC] write failed, failing pending requests: {}", err);
    let _ = self.state.phase.compare_exchange(
      PHASE_OPEN,
      PHASE_CLOSING,
      Ordering::AcqRel,
      Ordering::Acquire,
    );
    self.state.requests.fail_all();
  }

  /// Half-shut and close the socket, fail every outstanding request, and
  /// release all exported instances. Idempotent.
  pub fn close(&self) {
    let previous = self.state.phase.swap(PHASE_CLOSED, Ordering::AcqRel);
    if previous == PHASE_CLOSED {
      return;
    }
    let _ = self.state.stream.shutdown(Shutdown::Both);
    self.state.requests.fail_all();
    self.state.registry.clear();
    trace!("[RPC] connection to {:?} closed", self.state.peer_addr);
  }
}

/// Weak counterpart of [`Connection`]. A root handler holds one of these
/// instead of a strong clone, because the connection owns the handler.
#[derive(Clone)]
pub struct WeakConnection {
  state: Weak<ConnState>,
}

impl WeakConnection {
  pub fn upgrade(&self) -> Option<Connection> {
    self.state.upgrade().map(|state| Connection { state })
  }
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection")
      .field("peer", &self.state.peer_addr)
      .field("phase", &self.phase())
      .finish()
  }
}
