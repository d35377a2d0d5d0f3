use crate::error::{ReadError, RpcError};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{trace, warn};

/// Socket read granularity while hunting for a newline.
const READ_CHUNK: usize = 2048;

/// A non-blocking read that finds nothing gets one short blocking retry
/// before reporting "no data".
const PROMOTED_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound byte buffer. Owned by the read path only; complete frames are
/// peeled off the front, the partial remainder stays put.
#[derive(Debug, Default)]
pub(crate) struct ReadBuf {
  buf: Vec<u8>,
}

impl ReadBuf {
  /// Whether a complete newline-terminated frame is already buffered.
  pub(crate) fn has_frame(&self) -> bool {
    self.buf.contains(&b'\n')
  }

  pub(crate) fn len(&self) -> usize {
    self.buf.len()
  }

  fn take_line(&mut self) -> Option<Vec<u8>> {
    let pos = self.buf.iter().position(|&b| b == b'\n')?;
    let tail = self.buf.split_off(pos + 1);
    let mut line = std::mem::replace(&mut self.buf, tail);
    line.truncate(pos);
    Some(line)
  }
}

/// Outbound remainder after a short write. Kept around so callers can observe
/// how much of a frame never made it out.
#[derive(Debug, Default)]
pub(crate) struct WriteBuf {
  left: Vec<u8>,
}

impl WriteBuf {
  pub(crate) fn unsent(&self) -> usize {
    self.left.len()
  }
}

/// A zero timeout means "do not wait". The socket API rejects a literal
/// zero, and toggling non-blocking mode would race the opposite direction
/// of the socket, so it is modeled as the shortest accepted timeout.
const MIN_WAIT: Duration = Duration::from_millis(1);

fn effective(timeout: Option<Duration>) -> Option<Duration> {
  match timeout {
    Some(t) if t.is_zero() => Some(MIN_WAIT),
    other => other,
  }
}

fn apply_read_timeout(stream: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
  stream.set_read_timeout(effective(timeout))
}

fn apply_write_timeout(stream: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
  stream.set_write_timeout(effective(timeout))
}

fn is_transient(kind: io::ErrorKind) -> bool {
  matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Read one newline-terminated frame, appending to `rbuf` until it holds a
/// `\n`. Returns `Ok(None)` when the read timed out or hit a recoverable
/// socket error, `Err(Eof)` when the peer shut down with no frame pending.
pub(crate) fn read_line(
  stream: &TcpStream,
  rbuf: &mut ReadBuf,
  timeout: Option<Duration>,
) -> Result<Option<Vec<u8>>, ReadError> {
  if let Some(line) = rbuf.take_line() {
    return Ok(Some(line));
  }

  apply_read_timeout(stream, timeout)?;
  let mut promoted = false;
  let mut chunk = [0u8; READ_CHUNK];
  let mut sock = stream;
  loop {
    let n = match sock.read(&mut chunk) {
      Ok(0) => return Err(ReadError::Eof { buffered: rbuf.len() }),
      Ok(n) => n,
      Err(err) if is_transient(err.kind()) => {
        if timeout == Some(Duration::ZERO) && !promoted {
          promoted = true;
          apply_read_timeout(stream, Some(PROMOTED_READ_TIMEOUT))?;
          continue;
        }
        trace!("[RPC] read timed out (timeout: {:?})", timeout);
        return Ok(None);
      },
      Err(err) => {
        trace!("[RPC] read socket error: {:?}", err);
        return Ok(None);
      },
    };
    rbuf.buf.extend_from_slice(&chunk[..n]);
    if let Some(line) = rbuf.take_line() {
      return Ok(Some(line));
    }
  }
}

/// Append `\n` to `payload` and push the whole frame out, looping over
/// partial sends. A zero-byte send leaves the remainder in `wbuf`.
pub(crate) fn write_line(
  stream: &TcpStream,
  wbuf: &mut WriteBuf,
  payload: &[u8],
  timeout: Option<Duration>,
) -> Result<(), RpcError> {
  debug_assert!(
    !payload.contains(&b'\n'),
    "frame payload must not contain a newline"
  );

  apply_write_timeout(stream, timeout).map_err(RpcError::Io)?;
  wbuf.left.reserve(payload.len() + 1);
  wbuf.left.extend_from_slice(payload);
  wbuf.left.push(b'\n');

  let mut sock = stream;
  while !wbuf.left.is_empty() {
    match sock.write(&wbuf.left) {
      Ok(0) => break,
      Ok(n) => {
        wbuf.left.drain(..n);
      },
      Err(err) => return Err(RpcError::Io(err)),
    }
  }
  if !wbuf.left.is_empty() {
    warn!("[RPC] {} bytes left in write buffer", wbuf.left.len());
  }
  Ok(())
}
