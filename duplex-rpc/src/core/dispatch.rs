use crate::core::codec::{self, RpcObject, RpcValue};
use crate::core::connection::Connection;
use crate::core::frame;
use crate::core::handler::{Method, Params};
use crate::error::{ReadError, RpcError};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

impl Connection {
  /// Drive the inbound side until EOF or an unrecoverable transport error,
  /// then close the connection. An orderly disconnect returns `Ok(())`.
  ///
  /// Meant to run on a dedicated thread; outbound calls from other threads
  /// are safe while it runs.
  pub fn serve(&self) -> Result<(), ReadError> {
    let exit = loop {
      match self.read_and_dispatch(None) {
        Ok(_) => continue,
        Err(err) => break err,
      }
    };
    self.close();
    if exit.is_disconnect() {
      trace!("[RPC] serve loop ended: peer disconnected");
      Ok(())
    } else {
      Err(exit)
    }
  }

  /// Read one frame (within `timeout`) and dispatch its content. Returns
  /// whether a frame was dispatched; timeouts and malformed frames count as
  /// no progress, only transport-level failures are errors.
  pub fn read_and_dispatch(&self, timeout: Option<Duration>) -> Result<bool, ReadError> {
    if self.is_closed() {
      return Err(ReadError::Closed);
    }
    let line = {
      let mut read = self.state.read.lock();
      frame::read_line(
        &self.state.stream,
        &mut read.buf,
        self.state.timeouts.clamp_read(timeout),
      )?
    };
    let line = match line {
      Some(line) if !line.is_empty() => line,
      _ => return Ok(false),
    };

    let parsed: Value = match serde_json::from_slice(&line) {
      Ok(parsed) => parsed,
      Err(err) => {
        error!("[RPC] failed to parse frame: {}", err);
        return Ok(false);
      },
    };
    match parsed {
      Value::Array(items) => {
        // Batch: dispatch in order, replies keep that order.
        for item in items {
          self.dispatch_item(item);
        }
      },
      item @ Value::Object(_) => self.dispatch_item(item),
      other => {
        error!("[RPC] frame with unknown top-level type: {}", other);
        return Ok(false);
      },
    }
    self
      .state
      .stats
      .dispatched_frames
      .fetch_add(1, Ordering::Relaxed);
    Ok(true)
  }

  /// Dispatch frames without blocking until the inbound buffer holds no
  /// complete frame. Returns the number of frames dispatched.
  pub fn dispatch_until_empty(&self) -> Result<usize, ReadError> {
    let mut count = 0;
    loop {
      if !self.read_and_dispatch(Some(Duration::ZERO))? {
        break;
      }
      count += 1;
      if !self.state.read.lock().buf.has_frame() {
        break;
      }
    }
    Ok(count)
  }

  /// Route one parsed item: an invocation when `method` is present, a
  /// response when `result` is, a protocol error otherwise.
  fn dispatch_item(&self, item: Value) {
    if !item.is_object() {
      error!("[RPC] batch entry with unknown format: {}", item);
      return;
    }
    let msg = RpcObject(item);
    let id = msg.id_value();

    if msg.has_method() {
      self.dispatch_invocation(&msg, &id);
    } else if msg.is_response() {
      self.dispatch_response(&msg, &id);
    } else {
      debug!("[RPC] item with neither method nor result (id: {})", id);
      self.respond(Value::Null, Some("Unknown format".to_string()), &id);
    }
  }

  // ---- response path -----------------------------------------------------

  fn dispatch_response(&self, msg: &RpcObject, id: &Value) {
    let Some(id_num) = id.as_u64() else {
      // A response-shaped item we can never correlate; only this case gets
      // an error reply, a known-shaped id is simply dropped below.
      warn!("[RPC] response without a usable id: {}", msg.0);
      self.respond(Value::Null, Some("Unknown format".to_string()), id);
      return;
    };

    let outcome = match msg.error() {
      Some(error) if !error.is_null() => {
        let message = error
          .as_str()
          .map(str::to_string)
          .unwrap_or_else(|| error.to_string());
        Err(RpcError::Server(message))
      },
      _ => {
        let result = msg.result().cloned().unwrap_or(Value::Null);
        codec::decode_value(self, &result)
      },
    };

    if !self.state.requests.complete(id_num, outcome) {
      warn!("[RPC] response for unknown id {} dropped", id_num);
    }
  }

  // ---- invocation path ---------------------------------------------------

  fn dispatch_invocation(&self, msg: &RpcObject, id: &Value) {
    let is_notification = id.is_null();
    let Some(method) = msg.method() else {
      debug!("[RPC] invocation with non-string method: {}", msg.0);
      if !is_notification {
        self.respond(Value::Null, Some("Unknown format".to_string()), id);
      }
      return;
    };
    trace!("[RPC] dispatching {} (id: {})", method, id);

    match self.invoke_method(method, msg) {
      Ok(value) => {
        if is_notification {
          return;
        }
        match codec::encode_value(self, &value) {
          Ok(result) => self.respond(result, None, id),
          Err(err) => {
            error!("[RPC] could not encode result of {}: {}", method, err);
            self.respond(
              Value::Null,
              Some(format!("{}: {}", err.kind(), err)),
              id,
            );
          },
        }
      },
      Err(err) if err.is_protocol() => {
        error!("[RPC] protocol error dispatching {}: {}", method, err);
        if !is_notification {
          self.respond(Value::Null, Some("Unknown format".to_string()), id);
        }
      },
      Err(RpcError::Server(message)) => {
        if is_notification {
          trace!("[RPC] dropping error of notification {}: {}", method, message);
          self.count_dropped_error();
        } else {
          self.respond(Value::Null, Some(message), id);
        }
      },
      Err(RpcError::NoSuchMethod(name)) => {
        // Resolution failures surface like handler-signaled errors.
        let err = RpcError::NoSuchMethod(name);
        if is_notification {
          trace!("[RPC] dropping error of notification {}: {}", method, err);
          self.count_dropped_error();
        } else {
          self.respond(Value::Null, Some(err.to_string()), id);
        }
      },
      Err(err) => {
        error!("[RPC] handler for {} failed: {:?}", method, err);
        if is_notification {
          self.count_dropped_error();
        } else {
          self.respond(
            Value::Null,
            Some(format!("{}: {}", err.kind(), err)),
            id,
          );
        }
      },
    }
  }

  /// Resolve the target callable and run it.
  fn invoke_method(&self, method: &str, msg: &RpcObject) -> Result<RpcValue, RpcError> {
    let func: Method = if let Some((object, short)) = method.split_once('.') {
      if short == "__delete__" {
        // Release is idempotent; a repeated delete is a no-op.
        self.state.registry.remove(object);
        return Ok(RpcValue::null());
      }
      let instance = self
        .registered_instance(object)
        .ok_or_else(|| RpcError::BadReference(object.to_string()))?;
      instance
        .get_method(short)
        .ok_or_else(|| RpcError::NoSuchMethod(method.to_string()))?
    } else {
      let handler = self
        .root_handler()
        .ok_or_else(|| RpcError::NoSuchMethod(method.to_string()))?;
      handler
        .get_method(method)
        .ok_or_else(|| RpcError::NoSuchMethod(method.to_string()))?
    };
    let params = self.decode_params(msg)?;
    func(params)
  }

  /// Rebuild call arguments: `params` as an object means keyword arguments
  /// (and any `kwparams` alongside is discarded); as an array (or absent) it
  /// is positional, with `kwparams` carrying keywords.
  fn decode_params(&self, msg: &RpcObject) -> Result<Params, RpcError> {
    let mut params = Params::new();
    match msg.params() {
      Some(Value::Object(map)) => {
        for (key, value) in map {
          params.set(key.as_str(), codec::decode_value(self, value)?);
        }
        return Ok(params);
      },
      Some(Value::Array(items)) => {
        for value in items {
          params.push(codec::decode_value(self, value)?);
        }
      },
      Some(Value::Null) | None => {},
      Some(other) => {
        return Err(RpcError::Malformed(format!(
          "params must be an array or object, got {}",
          other
        )));
      },
    }
    if let Some(Value::Object(map)) = msg.kwparams() {
      for (key, value) in map {
        params.set(key.as_str(), codec::decode_value(self, value)?);
      }
    }
    Ok(params)
  }

  fn count_dropped_error(&self) {
    self
      .state
      .stats
      .dropped_notification_errors
      .fetch_add(1, Ordering::Relaxed);
  }
}
