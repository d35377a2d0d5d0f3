use duplex_rpc::{
  Connection, Handler, HandlerFactory, MethodTable, Params, RpcError, RpcValue, Server,
  TableHandler, Timeouts,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

pub fn setup_log() {
  static START: Once = Once::new();
  START.call_once(|| {
    let level = "trace";
    std::env::set_var("RUST_LOG", format!("duplex_rpc={}", level));

    use tracing_subscriber::fmt::Subscriber;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    let subscriber = Subscriber::builder()
      .with_env_filter(EnvFilter::from_default_env())
      .with_line_number(true)
      .with_ansi(true)
      .with_test_writer()
      .finish();
    let _ = subscriber.try_init();
  });
}

/// The instance type handed out by `newList`/`sharedList`.
fn list_handler() -> Arc<dyn Handler> {
  let items = Arc::new(Mutex::new(Vec::<Value>::new()));
  let mut methods = MethodTable::new();

  let push_items = items.clone();
  methods.insert("add", move |p: Params| {
    let value = p
      .args()
      .first()
      .and_then(RpcValue::as_json)
      .cloned()
      .ok_or_else(|| RpcError::Server("add needs a value".to_string()))?;
    push_items.lock().push(value);
    Ok(RpcValue::null())
  });

  let read_items = items;
  methods.insert("getitems", move |_| {
    Ok(RpcValue::from(Value::Array(read_items.lock().clone())))
  });

  Arc::new(TableHandler::new("list", methods))
}

/// Root handler of the test server: the usual arithmetic suspects plus
/// instance-returning and deliberately failing methods.
pub fn test_service(conn: &Connection) -> Arc<dyn Handler> {
  let mut methods = MethodTable::new();

  methods.insert("ping", |_| Ok(RpcValue::from("pong")));

  methods.insert("add2", |p: Params| {
    let x = p
      .get(0, "x")
      .and_then(RpcValue::as_i64)
      .ok_or_else(|| RpcError::Server("add2 takes two integers".to_string()))?;
    let y = p
      .get(1, "y")
      .and_then(RpcValue::as_i64)
      .ok_or_else(|| RpcError::Server("add2 takes two integers".to_string()))?;
    Ok(RpcValue::from(x + y))
  });

  methods.insert("addN", |p: Params| {
    let mut total = 0.0;
    for value in p.args() {
      total += value
        .as_f64()
        .ok_or_else(|| RpcError::Server("addN takes numbers".to_string()))?;
    }
    Ok(RpcValue::from(total))
  });

  methods.insert("getabc", |p: Params| {
    let pick = |index: usize, name: &str| {
      p.get(index, name)
        .and_then(RpcValue::as_json)
        .cloned()
        .unwrap_or(Value::Null)
    };
    Ok(RpcValue::from(json!([
      pick(0, "a"),
      pick(1, "b"),
      pick(2, "c")
    ])))
  });

  methods.insert("echo", |p: Params| {
    Ok(
      p.args()
        .first()
        .cloned()
        .unwrap_or_else(RpcValue::null),
    )
  });

  methods.insert("fail", |p: Params| {
    let message = p
      .get(0, "message")
      .and_then(RpcValue::as_str)
      .unwrap_or("expected failure")
      .to_string();
    Err(RpcError::Server(message))
  });

  methods.insert("boom", |_| Err(anyhow::anyhow!("handler blew up").into()));

  methods.insert("invoke_ref", |p: Params| {
    let func = p
      .get(0, "function")
      .and_then(RpcValue::as_callable)
      .cloned()
      .ok_or_else(|| RpcError::Server("invoke_ref takes a function reference".to_string()))?;
    func.call(Params::new())
  });

  methods.insert("newList", |_| Ok(RpcValue::exposed(list_handler())));

  let shared = list_handler();
  methods.insert("sharedList", move |_| Ok(RpcValue::exposed(shared.clone())));

  // Weak: the connection owns this handler.
  let peer = conn.downgrade();
  methods.insert("pokeback", move |_| {
    let peer = peer
      .upgrade()
      .ok_or_else(|| RpcError::Server("connection is gone".to_string()))?;
    peer.proxy().notify("touched", Params::new())?;
    Ok(RpcValue::from("ok"))
  });

  Arc::new(TableHandler::new("service", methods))
}

/// Client-side root handler counting reverse-direction notifications.
pub fn touch_counter_factory() -> (Arc<AtomicU64>, Arc<dyn HandlerFactory>) {
  let touched = Arc::new(AtomicU64::new(0));
  let counter = touched.clone();
  let factory: Arc<dyn HandlerFactory> =
    Arc::new(move |_conn: &Connection| -> Arc<dyn Handler> {
      let mut methods = MethodTable::new();
      let touched = counter.clone();
      methods.insert("touched", move |_| {
        touched.fetch_add(1, Ordering::SeqCst);
        Ok(RpcValue::null())
      });
      Arc::new(TableHandler::new("counter", methods))
    });
  (touched, factory)
}

/// Bind a test server on an ephemeral port and run its accept loop on a
/// background thread.
pub fn start_server() -> (SocketAddr, Arc<Server>) {
  setup_log();
  let factory: Arc<dyn HandlerFactory> =
    Arc::new(|conn: &Connection| -> Arc<dyn Handler> { test_service(conn) });
  let server = Arc::new(
    Server::bind("127.0.0.1:0", Timeouts::default(), factory).expect("bind test server"),
  );
  let addr = server.local_addr().expect("server addr");
  let accept = server.clone();
  thread::spawn(move || {
    let _ = accept.serve_forever();
  });
  (addr, server)
}

/// Connect a client and drive its inbound side on a background thread.
pub fn connect(addr: SocketAddr, factory: Option<&dyn HandlerFactory>) -> Connection {
  let conn = Connection::connect(addr, Timeouts::default(), factory).expect("connect");
  let reader = conn.clone();
  thread::spawn(move || {
    let _ = reader.serve();
  });
  conn
}

/// A peer speaking raw newline-delimited JSON, for wire-level assertions.
pub struct RawClient {
  stream: TcpStream,
  reader: BufReader<TcpStream>,
}

impl RawClient {
  pub fn connect(addr: SocketAddr) -> Self {
    let stream = TcpStream::connect(addr).expect("raw connect");
    stream
      .set_read_timeout(Some(Duration::from_secs(5)))
      .expect("read timeout");
    let reader = BufReader::new(stream.try_clone().expect("clone stream"));
    RawClient { stream, reader }
  }

  pub fn send(&mut self, value: &Value) {
    let mut line = serde_json::to_vec(value).expect("encode frame");
    line.push(b'\n');
    self.stream.write_all(&line).expect("send frame");
  }

  /// Push pre-rendered bytes, e.g. two concatenated frames in one write.
  pub fn send_raw(&mut self, bytes: &[u8]) {
    self.stream.write_all(bytes).expect("send bytes");
  }

  pub fn recv(&mut self) -> Value {
    let mut line = String::new();
    self.reader.read_line(&mut line).expect("recv frame");
    assert!(!line.is_empty(), "peer closed while a reply was expected");
    serde_json::from_str(line.trim_end()).expect("parse frame")
  }
}
