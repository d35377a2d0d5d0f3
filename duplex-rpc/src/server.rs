use crate::core::connection::{Connection, HandlerFactory, Timeouts};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, trace};

/// Minimal TCP harness: accepts connections and serves each on its own
/// thread, sharing one handler factory.
pub struct Server {
  listener: TcpListener,
  timeouts: Timeouts,
  factory: Arc<dyn HandlerFactory>,
  stopping: AtomicBool,
}

impl Server {
  pub fn bind(
    addr: impl ToSocketAddrs,
    timeouts: Timeouts,
    factory: Arc<dyn HandlerFactory>,
  ) -> io::Result<Self> {
    let listener = TcpListener::bind(addr)?;
    info!("[RPC] listening on {}", listener.local_addr()?);
    Ok(Server {
      listener,
      timeouts,
      factory,
      stopping: AtomicBool::new(false),
    })
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Accept until [`stop`](Server::stop) is called. Each accepted socket
  /// gets a connection with its own root handler and serve thread.
  pub fn serve_forever(&self) -> io::Result<()> {
    for stream in self.listener.incoming() {
      if self.stopping.load(Ordering::Acquire) {
        break;
      }
      match stream {
        Ok(stream) => self.spawn_connection(stream)?,
        Err(err) => error!("[RPC] accept failed: {}", err),
      }
    }
    info!("[RPC] accept loop stopped");
    Ok(())
  }

  fn spawn_connection(&self, stream: TcpStream) -> io::Result<()> {
    trace!("[RPC] accepted connection from {:?}", stream.peer_addr().ok());
    let factory = self.factory.clone();
    let timeouts = self.timeouts;
    thread::Builder::new()
      .name("duplex-rpc-conn".to_string())
      .spawn(move || {
        let conn = Connection::new(stream, timeouts, Some(factory.as_ref()));
        if let Err(err) = conn.serve() {
          error!("[RPC] connection ended with error: {}", err);
        }
      })?;
    Ok(())
  }

  /// Ask the accept loop to exit. Best-effort: pokes the listener with a
  /// throwaway connection so a blocking accept wakes up.
  pub fn stop(&self) {
    self.stopping.store(true, Ordering::Release);
    if let Ok(addr) = self.listener.local_addr() {
      let _ = TcpStream::connect(addr);
    }
  }
}
