mod util;

use duplex_rpc::{params, Connection, Params, RpcError, Timeouts};
use serde_json::json;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use util::*;

#[test]
fn call_without_parameters() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  for _ in 0..30 {
    let pong = conn.proxy().call("ping", Params::new()).unwrap();
    assert_eq!(pong.as_str(), Some("pong"));
  }
}

#[test]
fn call_with_two_parameters() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let pairs = [
    (941, -499),
    (1582, 1704),
    (-733, 119),
    (-967, 1755),
    (95, 286),
    (1866, -954),
  ];
  for (x, y) in pairs {
    let added = conn.proxy().call("add2", params![x, y]).unwrap();
    assert_eq!(added.as_i64(), Some(x + y));
  }
}

#[test]
fn call_with_n_parameters() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let added = conn.proxy().call("addN", params![1, 2, 3, 4, 5]).unwrap();
  assert_eq!(added.as_f64(), Some(15.0));
}

#[test]
fn keyword_parameters() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let proxy = conn.proxy();

  let abc = proxy
    .call("getabc", Params::new().kw("a", 1).kw("b", 2).kw("c", 3))
    .unwrap();
  assert_eq!(abc.as_json(), Some(&json!([1, 2, 3])));

  // Missing leading parameters come back as null.
  let abc = proxy
    .call("getabc", Params::new().kw("b", "b").kw("c", "c"))
    .unwrap();
  assert_eq!(abc.as_json(), Some(&json!([null, "b", "c"])));
}

#[test]
fn common_errors_surface_as_server_errors() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let proxy = conn.proxy();

  // Inexistent method.
  match proxy.call("myfun", Params::new()) {
    Err(RpcError::Server(message)) => assert!(message.contains("myfun"), "got: {}", message),
    other => panic!("expected a server error, got {:?}", other.map(|v| format!("{:?}", v))),
  }

  // Handler-signaled failure carries its message verbatim.
  match proxy.call("fail", params!["out of cheese"]) {
    Err(RpcError::Server(message)) => assert_eq!(message, "out of cheese"),
    other => panic!("expected a server error, got {:?}", other.map(|v| format!("{:?}", v))),
  }

  // Anything else is reported as "<Kind>: <message>" and keeps the
  // connection usable.
  match proxy.call("boom", Params::new()) {
    Err(RpcError::Server(message)) => {
      assert!(message.starts_with("InternalError:"), "got: {}", message)
    },
    other => panic!("expected a server error, got {:?}", other.map(|v| format!("{:?}", v))),
  }
  assert_eq!(proxy.call("ping", Params::new()).unwrap().as_str(), Some("pong"));
}

#[test]
fn request_ids_increase_from_one() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let proxy = conn.proxy();

  let first = proxy.request("ping", Params::new()).unwrap();
  let second = proxy.request("ping", Params::new()).unwrap();
  let third = proxy.request("add2", params![2, 2]).unwrap();
  assert_eq!((first.id(), second.id(), third.id()), (1, 2, 3));

  assert_eq!(third.wait().unwrap().as_i64(), Some(4));
  assert_eq!(first.wait().unwrap().as_str(), Some("pong"));
  assert_eq!(second.wait().unwrap().as_str(), Some("pong"));
}

#[test]
fn notifications_are_silent_even_on_error() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let proxy = conn.proxy();

  proxy.notify("fail", params!["nobody hears this"]).unwrap();
  proxy.notify("myfun", Params::new()).unwrap();
  // The next reply on the wire must belong to this call, not to either
  // notification above.
  assert_eq!(proxy.call("ping", Params::new()).unwrap().as_str(), Some("pong"));
}

#[test]
fn echo_round_trips_json_values() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let proxy = conn.proxy();

  let values = [
    json!(null),
    json!(true),
    json!(-42),
    json!(13.25),
    json!("newline-free text"),
    json!([1, [2, [3, []]], {"k": "v"}]),
    json!({"nested": {"deep": [null, false, 0.5]}}),
  ];
  for value in values {
    let echoed = proxy.call("echo", params![value.clone()]).unwrap();
    assert_eq!(echoed.as_json(), Some(&value));
  }
}

#[test]
fn remote_objects_execute_on_the_peer() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let proxy = conn.proxy();

  let handle = proxy
    .call("newList", Params::new())
    .unwrap()
    .into_remote()
    .expect("newList returns a handle");
  let list = handle.proxy();
  for i in 0..10 {
    list.notify("add", params![i]).unwrap();
  }
  let items = list.call("getitems", Params::new()).unwrap();
  assert_eq!(
    items.as_json(),
    Some(&json!([0, 1, 2, 3, 4, 5, 6, 7, 8, 9]))
  );

  // After an explicit release the instance is gone on the peer.
  handle.close();
  match list.call("getitems", Params::new()) {
    Err(RpcError::Server(message)) => assert_eq!(message, "Unknown format"),
    other => panic!("expected an error, got {:?}", other.map(|v| format!("{:?}", v))),
  }
}

#[test]
fn re_serialized_instances_keep_their_identity() {
  let (addr, _server) = start_server();
  let conn = connect(addr, None);
  let proxy = conn.proxy();

  let first = proxy
    .call("sharedList", Params::new())
    .unwrap()
    .into_remote()
    .unwrap();
  let second = proxy
    .call("sharedList", Params::new())
    .unwrap()
    .into_remote()
    .unwrap();
  assert_eq!(first.name(), second.name());

  // Both handles dereference the same instance on the peer.
  first.proxy().notify("add", params!["x"]).unwrap();
  let items = second.proxy().call("getitems", Params::new()).unwrap();
  assert_eq!(items.as_json(), Some(&json!(["x"])));
}

#[test]
fn handlers_may_notify_their_own_peer() {
  let (addr, _server) = start_server();
  let (touched, factory) = touch_counter_factory();
  let conn = connect(addr, Some(factory.as_ref()));

  let out = conn.proxy().call("pokeback", Params::new()).unwrap();
  assert_eq!(out.as_str(), Some("ok"));

  let deadline = Instant::now() + Duration::from_secs(2);
  while touched.load(Ordering::SeqCst) == 0 {
    assert!(Instant::now() < deadline, "reverse notification never arrived");
    thread::sleep(Duration::from_millis(10));
  }
  assert_eq!(touched.load(Ordering::SeqCst), 1);
}

#[test]
fn peer_eof_leaves_the_server_accepting() {
  let (addr, _server) = start_server();

  // A peer that connects and immediately goes away only ends its own session.
  drop(TcpStream::connect(addr).unwrap());

  let conn = connect(addr, None);
  assert_eq!(
    conn.proxy().call("ping", Params::new()).unwrap().as_str(),
    Some("pong")
  );
}

#[test]
fn close_fails_outstanding_requests() {
  setup_log();
  // A listener that accepts and never replies.
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  let mute = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

  let conn = Connection::connect(addr, Timeouts::default(), None).unwrap();
  let pending = conn.proxy().request("ping", Params::new()).unwrap();
  assert_eq!(conn.outstanding_requests(), 1);

  conn.close();
  assert!(matches!(pending.wait(), Err(RpcError::PeerDisconnect)));
  assert_eq!(conn.outstanding_requests(), 0);
  assert!(conn.is_closed());

  // Calls after close are refused without touching the wire.
  assert!(matches!(
    conn.proxy().call("ping", Params::new()),
    Err(RpcError::PeerDisconnect)
  ));
  drop(mute.join());
}

#[test]
fn dropped_notification_errors_are_counted() {
  setup_log();
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  let client = TcpStream::connect(addr).unwrap();
  let (server_stream, _) = listener.accept().unwrap();

  let factory = |conn: &Connection| -> std::sync::Arc<dyn duplex_rpc::Handler> {
    test_service(conn)
  };
  let server = Connection::new(server_stream, Timeouts::default(), Some(&factory));

  let mut raw = RawClientOver(client);
  raw.send_line(br#"{"method":"fail","params":["nope"]}"#);

  assert!(server.read_and_dispatch(Some(Duration::from_secs(1))).unwrap());
  let stats = server.stats();
  assert_eq!(stats.dispatched_frames, 1);
  assert_eq!(stats.dropped_notification_errors, 1);
}

#[test]
fn buffered_frames_dispatch_without_blocking() {
  setup_log();
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  let client = TcpStream::connect(addr).unwrap();
  let (server_stream, _) = listener.accept().unwrap();

  let factory = |conn: &Connection| -> std::sync::Arc<dyn duplex_rpc::Handler> {
    test_service(conn)
  };
  let server = Connection::new(server_stream, Timeouts::default(), Some(&factory));

  // Three notifications in a single TCP write.
  let mut raw = RawClientOver(client);
  raw.send_line(
    b"{\"method\":\"ping\"}\n{\"method\":\"ping\"}\n{\"method\":\"ping\"}",
  );

  assert!(server.read_and_dispatch(Some(Duration::from_secs(1))).unwrap());
  // The rest is already buffered; draining must not touch the socket again.
  assert_eq!(server.dispatch_until_empty().unwrap(), 2);
  assert_eq!(server.stats().dispatched_frames, 3);
}

/// Bare writer for the two manually-driven tests above.
struct RawClientOver(TcpStream);

impl RawClientOver {
  fn send_line(&mut self, bytes: &[u8]) {
    use std::io::Write;
    let mut buf = Vec::with_capacity(bytes.len() + 1);
    buf.extend_from_slice(bytes);
    buf.push(b'\n');
    self.0.write_all(&buf).unwrap();
  }
}
