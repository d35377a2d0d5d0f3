use crate::core::handler::Handler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

struct Entry {
  instance: Arc<dyn Handler>,
  identity: usize,
}

#[derive(Default)]
struct RegistryInner {
  by_name: HashMap<String, Entry>,
  name_by_identity: HashMap<usize, String>,
}

/// Local instances exported to the peer, addressable by their wire name.
///
/// Identity-keyed: exporting the same instance twice through the same
/// connection yields the same name, so the peer observes reference identity.
#[derive(Default)]
pub(crate) struct ObjectRegistry {
  inner: Mutex<RegistryInner>,
}

fn identity_of(instance: &Arc<dyn Handler>) -> usize {
  Arc::as_ptr(instance) as *const () as usize
}

impl ObjectRegistry {
  /// Register `instance` under a fresh `<label>_<4 hex digits>` name, or
  /// return the name it already carries on this connection.
  pub(crate) fn export<F>(&self, instance: &Arc<dyn Handler>, next_id: F) -> String
  where
    F: FnOnce() -> u64,
  {
    let identity = identity_of(instance);
    let mut inner = self.inner.lock();
    if let Some(name) = inner.name_by_identity.get(&identity) {
      return name.clone();
    }
    let name = format!("{}_{:04x}", instance.type_label().to_lowercase(), next_id());
    trace!("[RPC] exporting instance {}", name);
    inner.name_by_identity.insert(identity, name.clone());
    inner.by_name.insert(
      name.clone(),
      Entry {
        instance: instance.clone(),
        identity,
      },
    );
    name
  }

  pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
    self.inner.lock().by_name.get(name).map(|e| e.instance.clone())
  }

  /// Idempotent: a second removal of the same name is a no-op.
  pub(crate) fn remove(&self, name: &str) -> bool {
    let mut inner = self.inner.lock();
    match inner.by_name.remove(name) {
      Some(entry) => {
        inner.name_by_identity.remove(&entry.identity);
        trace!("[RPC] released instance {}", name);
        true
      },
      None => false,
    }
  }

  pub(crate) fn clear(&self) {
    let mut inner = self.inner.lock();
    inner.by_name.clear();
    inner.name_by_identity.clear();
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.inner.lock().by_name.len()
  }
}
