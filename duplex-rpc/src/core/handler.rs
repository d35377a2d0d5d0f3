use crate::core::codec::RpcValue;
use crate::error::RpcError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An invocable entry point resolved from a method name.
pub type Method = Arc<dyn Fn(Params) -> Result<RpcValue, RpcError> + Send + Sync>;

/// The capability a user-supplied handler must satisfy to be callable from
/// the peer, either as the root handler of a connection or as an instance
/// exported through it.
///
/// A root handler is built by a [`HandlerFactory`](crate::HandlerFactory)
/// with the connection as its sole argument, so its methods can issue calls
/// back to the peer.
pub trait Handler: Send + Sync {
  /// Resolve a method name to an invocable entry point. `None` is reported
  /// to the peer as a server error.
  fn get_method(&self, name: &str) -> Option<Method>;

  /// Label used when this instance is exported to the peer; the wire name
  /// becomes `<label>_<hex id>`.
  fn type_label(&self) -> &str {
    "object"
  }
}

/// Name → method mapping populated when a handler is constructed.
///
/// Handlers typically embed one of these and delegate
/// [`Handler::get_method`] to it:
///
/// ```ignore
/// let mut methods = MethodTable::new();
/// methods.insert("ping", |_| Ok(RpcValue::from("pong")));
/// ```
#[derive(Default)]
pub struct MethodTable {
  methods: HashMap<String, Method>,
}

impl MethodTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert<F>(&mut self, name: &str, f: F)
  where
    F: Fn(Params) -> Result<RpcValue, RpcError> + Send + Sync + 'static,
  {
    self.methods.insert(name.to_string(), Arc::new(f));
  }

  pub fn get(&self, name: &str) -> Option<Method> {
    self.methods.get(name).cloned()
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.methods.keys().map(String::as_str)
  }
}

/// Ready-made [`Handler`] backed by a [`MethodTable`], for handlers whose
/// state lives in the method closures.
pub struct TableHandler {
  label: String,
  methods: MethodTable,
}

impl TableHandler {
  pub fn new(label: impl Into<String>, methods: MethodTable) -> Self {
    TableHandler {
      label: label.into(),
      methods,
    }
  }
}

impl Handler for TableHandler {
  fn get_method(&self, name: &str) -> Option<Method> {
    self.methods.get(name)
  }

  fn type_label(&self) -> &str {
    &self.label
  }
}

/// Positional and keyword arguments of one call, on either side of the wire.
#[derive(Debug, Default)]
pub struct Params {
  args: Vec<RpcValue>,
  kwargs: BTreeMap<String, RpcValue>,
}

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, value: impl Into<RpcValue>) {
    self.args.push(value.into());
  }

  pub fn set(&mut self, name: impl Into<String>, value: impl Into<RpcValue>) {
    self.kwargs.insert(name.into(), value.into());
  }

  /// Chainable positional argument.
  pub fn arg(mut self, value: impl Into<RpcValue>) -> Self {
    self.push(value);
    self
  }

  /// Chainable keyword argument.
  pub fn kw(mut self, name: impl Into<String>, value: impl Into<RpcValue>) -> Self {
    self.set(name, value);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.args.is_empty() && self.kwargs.is_empty()
  }

  pub fn args(&self) -> &[RpcValue] {
    &self.args
  }

  pub fn kwargs(&self) -> &BTreeMap<String, RpcValue> {
    &self.kwargs
  }

  /// Look an argument up by position, falling back to its keyword name.
  pub fn get(&self, index: usize, name: &str) -> Option<&RpcValue> {
    self.args.get(index).or_else(|| self.kwargs.get(name))
  }

  pub(crate) fn into_parts(self) -> (Vec<RpcValue>, BTreeMap<String, RpcValue>) {
    (self.args, self.kwargs)
  }
}

/// Build positional [`Params`] from a list of values.
///
/// ```ignore
/// let sum = proxy.call("add2", params![941, -499])?;
/// ```
#[macro_export]
macro_rules! params {
  () => { $crate::Params::new() };
  ($($value:expr),+ $(,)?) => {{
    let mut p = $crate::Params::new();
    $( p.push($value); )+
    p
  }};
}
