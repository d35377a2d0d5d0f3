//! Example server: a running tally any peer can add to, with a
//! reverse-direction notification whenever the total is read.
//!
//! Run with `demo-server [port]` (default 10123) and speak newline-delimited
//! JSON to it, e.g.:
//!
//! ```text
//! {"method":"addvalue","id":1,"params":[4.5]}
//! {"method":"gettotal","id":2}
//! ```

use anyhow::Result;
use duplex_rpc::{
  Connection, Handler, HandlerFactory, MethodTable, Params, RpcError, RpcValue, Server,
  TableHandler, Timeouts,
};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
struct Tally {
  count: u64,
  total: f64,
}

fn tally_service(conn: &Connection) -> Arc<dyn Handler> {
  let tally = Arc::new(Mutex::new(Tally::default()));
  let mut methods = MethodTable::new();

  let add_tally = tally.clone();
  methods.insert("addvalue", move |p: Params| {
    let number = p
      .get(0, "number")
      .and_then(RpcValue::as_f64)
      .ok_or_else(|| RpcError::Server("addvalue takes a number".to_string()))?;
    let mut tally = add_tally.lock();
    tally.count += 1;
    tally.total += number;
    Ok(RpcValue::null())
  });

  let total_tally = tally.clone();
  let peer = conn.downgrade();
  methods.insert("gettotal", move |_| {
    // Tell the peer its total is being read before handing it over.
    if let Some(peer) = peer.upgrade() {
      peer.proxy().notify("notify", duplex_rpc::params!["total"])?;
    }
    Ok(RpcValue::from(total_tally.lock().total))
  });

  let count_tally = tally;
  methods.insert("getcount", move |_| {
    Ok(RpcValue::from(count_tally.lock().count))
  });

  methods.insert("getrandom", |_| {
    Ok(RpcValue::from(rand::thread_rng().gen_range(0..=100i64)))
  });

  methods.insert("echo", |p: Params| {
    let text = p
      .get(0, "string")
      .and_then(RpcValue::as_str)
      .ok_or_else(|| RpcError::Server("echo takes a string".to_string()))?;
    info!("echo: {}", text);
    Ok(RpcValue::from(text))
  });

  Arc::new(TableHandler::new("tally", methods))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,duplex_rpc=debug".into()),
    )
    .init();

  let port = std::env::args()
    .nth(1)
    .map(|arg| arg.parse::<u16>())
    .transpose()?
    .unwrap_or(10123);

  let factory: Arc<dyn HandlerFactory> =
    Arc::new(|conn: &Connection| -> Arc<dyn Handler> { tally_service(conn) });
  let server = Server::bind(("0.0.0.0", port), Timeouts::default(), factory)?;
  info!("tally server ready on port {}", port);
  server.serve_forever()?;
  Ok(())
}
