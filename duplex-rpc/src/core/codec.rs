use crate::core::connection::Connection;
use crate::core::handler::{Handler, Method, Params};
use crate::core::remote::RemoteObject;
use crate::error::RpcError;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub(crate) const REMOTE_OBJECT_KEY: &str = "__remoteobject__";
pub(crate) const OBJECT_REFERENCE_KEY: &str = "__objectreference__";
pub(crate) const FUNCTION_REFERENCE_KEY: &str = "__functionreference__";

/// A value crossing the wire, classified at the boundary instead of by
/// runtime inspection.
///
/// Plain JSON trees stay collapsed in a single [`RpcValue::Plain`] node; the
/// `Array`/`Map` variants only appear when a reference is nested somewhere
/// inside a container.
#[derive(Clone)]
pub enum RpcValue {
  /// A plain JSON tree with no embedded references.
  Plain(Value),
  Array(Vec<RpcValue>),
  Map(BTreeMap<String, RpcValue>),
  /// A local instance exported (or to be exported) to the peer.
  Exposed(Arc<dyn Handler>),
  /// A handle to an instance living on the peer.
  Remote(RemoteObject),
  /// A callable bound to the root handler or to an exported instance.
  Callable(BoundMethod),
}

impl RpcValue {
  pub fn null() -> Self {
    RpcValue::Plain(Value::Null)
  }

  /// Wrap a float, rejecting values JSON cannot carry.
  pub fn number(value: f64) -> Result<Self, RpcError> {
    serde_json::Number::from_f64(value)
      .map(|n| RpcValue::Plain(Value::Number(n)))
      .ok_or(RpcError::NotSerializable("non-finite number"))
  }

  /// Export a local instance so the peer receives a handle to it.
  pub fn exposed(instance: Arc<dyn Handler>) -> Self {
    RpcValue::Exposed(instance)
  }

  pub fn is_null(&self) -> bool {
    matches!(self, RpcValue::Plain(Value::Null))
  }

  pub fn as_json(&self) -> Option<&Value> {
    match self {
      RpcValue::Plain(v) => Some(v),
      _ => None,
    }
  }

  pub fn into_json(self) -> Option<Value> {
    match self {
      RpcValue::Plain(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    self.as_json().and_then(Value::as_i64)
  }

  pub fn as_f64(&self) -> Option<f64> {
    self.as_json().and_then(Value::as_f64)
  }

  pub fn as_str(&self) -> Option<&str> {
    self.as_json().and_then(Value::as_str)
  }

  pub fn as_remote(&self) -> Option<&RemoteObject> {
    match self {
      RpcValue::Remote(handle) => Some(handle),
      _ => None,
    }
  }

  pub fn into_remote(self) -> Option<RemoteObject> {
    match self {
      RpcValue::Remote(handle) => Some(handle),
      _ => None,
    }
  }

  pub fn as_callable(&self) -> Option<&BoundMethod> {
    match self {
      RpcValue::Callable(method) => Some(method),
      _ => None,
    }
  }
}

impl fmt::Debug for RpcValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RpcValue::Plain(v) => write!(f, "Plain({})", v),
      RpcValue::Array(items) => f.debug_list().entries(items).finish(),
      RpcValue::Map(map) => f.debug_map().entries(map).finish(),
      RpcValue::Exposed(instance) => write!(f, "Exposed({})", instance.type_label()),
      RpcValue::Remote(handle) => write!(f, "Remote({})", handle.name()),
      RpcValue::Callable(method) => write!(f, "Callable({})", method.name()),
    }
  }
}

impl From<Value> for RpcValue {
  fn from(value: Value) -> Self {
    RpcValue::Plain(value)
  }
}

impl From<RemoteObject> for RpcValue {
  fn from(handle: RemoteObject) -> Self {
    RpcValue::Remote(handle)
  }
}

impl From<BoundMethod> for RpcValue {
  fn from(method: BoundMethod) -> Self {
    RpcValue::Callable(method)
  }
}

impl From<Vec<RpcValue>> for RpcValue {
  fn from(items: Vec<RpcValue>) -> Self {
    RpcValue::Array(items)
  }
}

macro_rules! plain_from {
  ($($ty:ty),+) => {
    $(
      impl From<$ty> for RpcValue {
        fn from(value: $ty) -> Self {
          RpcValue::Plain(Value::from(value))
        }
      }
    )+
  };
}

plain_from!(bool, i32, i64, u32, u64, f64, &str, String);

/// A callable decoded from (or destined to become) a function-reference
/// hint. Remembers its connection so it cannot leak across connections.
#[derive(Clone)]
pub struct BoundMethod {
  name: String,
  conn: Connection,
  func: Method,
}

impl BoundMethod {
  pub(crate) fn new(name: String, conn: Connection, func: Method) -> Self {
    BoundMethod { name, conn, func }
  }

  /// The symbolic wire name, dotted when bound to an exported instance.
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn call(&self, params: Params) -> Result<RpcValue, RpcError> {
    (self.func)(params)
  }

  pub(crate) fn connection(&self) -> &Connection {
    &self.conn
  }
}

impl fmt::Debug for BoundMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "BoundMethod({})", self.name)
  }
}

/// Turn an outbound value into its wire form, emitting hinted-class objects
/// for everything JSON cannot carry natively.
pub(crate) fn encode_value(conn: &Connection, value: &RpcValue) -> Result<Value, RpcError> {
  match value {
    RpcValue::Plain(v) => Ok(v.clone()),
    RpcValue::Array(items) => {
      let out: Result<Vec<Value>, RpcError> =
        items.iter().map(|item| encode_value(conn, item)).collect();
      Ok(Value::Array(out?))
    },
    RpcValue::Map(map) => {
      let mut out = Map::with_capacity(map.len());
      for (key, item) in map {
        out.insert(key.clone(), encode_value(conn, item)?);
      }
      Ok(Value::Object(out))
    },
    RpcValue::Exposed(instance) => {
      let name = conn.export_instance(instance);
      Ok(json!({ REMOTE_OBJECT_KEY: name }))
    },
    RpcValue::Remote(handle) => {
      if !handle.same_connection(conn) {
        return Err(RpcError::WrongConnection);
      }
      Ok(json!({ OBJECT_REFERENCE_KEY: handle.name() }))
    },
    RpcValue::Callable(method) => {
      if !method.connection().same_as(conn) {
        return Err(RpcError::WrongConnection);
      }
      Ok(json!({ FUNCTION_REFERENCE_KEY: method.name() }))
    },
  }
}

/// Rebuild an inbound wire value, materializing handles and resolving
/// references against this connection.
pub(crate) fn decode_value(conn: &Connection, value: &Value) -> Result<RpcValue, RpcError> {
  match value {
    Value::Array(items) => {
      let decoded: Result<Vec<RpcValue>, RpcError> =
        items.iter().map(|item| decode_value(conn, item)).collect();
      let decoded = decoded?;
      if decoded.iter().all(|item| matches!(item, RpcValue::Plain(_))) {
        Ok(RpcValue::Plain(value.clone()))
      } else {
        Ok(RpcValue::Array(decoded))
      }
    },
    Value::Object(map) => {
      if let Some(name) = map.get(REMOTE_OBJECT_KEY).and_then(Value::as_str) {
        return Ok(RpcValue::Remote(RemoteObject::attach(conn.clone(), name)));
      }
      if let Some(name) = map.get(OBJECT_REFERENCE_KEY).and_then(Value::as_str) {
        let instance = conn
          .registered_instance(name)
          .ok_or_else(|| RpcError::BadReference(name.to_string()))?;
        return Ok(RpcValue::Exposed(instance));
      }
      if let Some(name) = map.get(FUNCTION_REFERENCE_KEY).and_then(Value::as_str) {
        return Ok(RpcValue::Callable(conn.resolve_function(name)?));
      }
      let mut decoded = BTreeMap::new();
      let mut all_plain = true;
      for (key, item) in map {
        let item = decode_value(conn, item)?;
        all_plain &= matches!(item, RpcValue::Plain(_));
        decoded.insert(key.clone(), item);
      }
      if all_plain {
        Ok(RpcValue::Plain(value.clone()))
      } else {
        Ok(RpcValue::Map(decoded))
      }
    },
    _ => Ok(RpcValue::Plain(value.clone())),
  }
}

/// One parsed wire item, addressed by key presence the way the dispatcher
/// routes it.
#[derive(Debug, Clone)]
pub(crate) struct RpcObject(pub(crate) Value);

impl RpcObject {
  /// The `id` field with absence normalized to `null`.
  pub(crate) fn id_value(&self) -> Value {
    self.0.get("id").cloned().unwrap_or(Value::Null)
  }

  pub(crate) fn has_method(&self) -> bool {
    self.0.get("method").is_some()
  }

  pub(crate) fn method(&self) -> Option<&str> {
    self.0.get("method").and_then(Value::as_str)
  }

  pub(crate) fn is_response(&self) -> bool {
    self.0.get("result").is_some()
  }

  pub(crate) fn params(&self) -> Option<&Value> {
    self.0.get("params")
  }

  pub(crate) fn kwparams(&self) -> Option<&Value> {
    self.0.get("kwparams")
  }

  pub(crate) fn result(&self) -> Option<&Value> {
    self.0.get("result")
  }

  pub(crate) fn error(&self) -> Option<&Value> {
    self.0.get("error")
  }
}
