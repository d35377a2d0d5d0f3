use std::io;
use thiserror::Error;

/// Errors surfaced to callers of the connection and proxy API.
#[derive(Debug, Error)]
pub enum RpcError {
  /// The peer's handler reported an expected failure. The message is carried
  /// verbatim from the `error` field of the reply.
  #[error("{0}")]
  Server(String),

  /// The connection went away while a call was outstanding, or a call was
  /// issued on a connection that is no longer writable.
  #[error("peer disconnected")]
  PeerDisconnect,

  #[error("io error: {0}")]
  Io(#[from] io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  /// A value with no JSON representation reached the encoder.
  #[error("value is not serializable: {0}")]
  NotSerializable(&'static str),

  /// A callable or object handle bound to some other connection reached the
  /// encoder of this one.
  #[error("value belongs to another connection")]
  WrongConnection,

  /// An object reference named an instance this side never exported.
  #[error("unknown object: {0}")]
  BadReference(String),

  /// The handler does not expose a method under the requested name.
  #[error("unknown method: {0}")]
  NoSuchMethod(String),

  /// A message carried a shape the dispatcher cannot route.
  #[error("malformed message: {0}")]
  Malformed(String),

  /// Any other failure inside a handler, reported to the peer as
  /// `"<Kind>: <message>"`.
  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

impl RpcError {
  /// Short tag used when a failure is reported back over the wire as
  /// `"<Kind>: <message>"`.
  pub(crate) fn kind(&self) -> &'static str {
    match self {
      RpcError::Server(_) => "ServerError",
      RpcError::PeerDisconnect => "PeerDisconnect",
      RpcError::Io(_) => "IoError",
      RpcError::Json(_) => "JsonError",
      RpcError::NotSerializable(_) => "NotSerializable",
      RpcError::WrongConnection => "WrongConnection",
      RpcError::BadReference(_) => "BadReference",
      RpcError::NoSuchMethod(_) => "NoSuchMethod",
      RpcError::Malformed(_) => "Malformed",
      RpcError::Internal(_) => "InternalError",
    }
  }

  /// Protocol-level defects never reach the handler; they are logged and
  /// answered with a generic reply instead of a per-kind message.
  pub(crate) fn is_protocol(&self) -> bool {
    matches!(self, RpcError::BadReference(_) | RpcError::Malformed(_))
  }
}

/// Errors produced by the inbound half of a connection.
#[derive(Debug, Error)]
pub enum ReadError {
  /// The peer shut down its sending side with no complete frame pending.
  #[error("peer closed the connection ({buffered} bytes buffered)")]
  Eof { buffered: usize },

  #[error("io error: {0}")]
  Io(#[from] io::Error),

  #[error("connection is closed")]
  Closed,
}

impl ReadError {
  /// An orderly end of the session (peer EOF or local close), as opposed to
  /// a transport defect.
  pub fn is_disconnect(&self) -> bool {
    matches!(self, ReadError::Eof { .. } | ReadError::Closed)
  }
}
