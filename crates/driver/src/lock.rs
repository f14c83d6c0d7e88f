//! Reference-counted per-key async mutexes.
//!
//! ControllerPublishVolume must not attach two volumes to the same node
//! concurrently, so attach requests serialize per node ID. Entries are
//! removed when the last guard for a key drops, keeping the registry
//! bounded by the number of in-flight requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

type Registry = Arc<Mutex<HashMap<String, Entry>>>;

struct Entry {
  refs: usize,
  lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Clone, Default)]
pub struct KeyedMutex {
  registry: Registry,
}

impl KeyedMutex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Waits for the lock on `key`. Guards for different keys never
  /// contend.
  pub async fn lock(&self, key: &str) -> KeyedGuard {
    let lock = {
      let mut registry = lock_registry(&self.registry);
      let entry = registry.entry(key.to_string()).or_insert_with(|| Entry {
        refs: 0,
        lock: Arc::new(tokio::sync::Mutex::new(())),
      });
      entry.refs += 1;
      Arc::clone(&entry.lock)
    };
    let guard = lock.lock_owned().await;
    KeyedGuard {
      key: key.to_string(),
      registry: Arc::clone(&self.registry),
      _guard: guard,
    }
  }

  #[cfg(test)]
  fn keys(&self) -> usize {
    lock_registry(&self.registry).len()
  }
}

pub struct KeyedGuard {
  key: String,
  registry: Registry,
  _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyedGuard {
  fn drop(&mut self) {
    let mut registry = lock_registry(&self.registry);
    if let Some(entry) = registry.get_mut(&self.key) {
      entry.refs -= 1;
      if entry.refs == 0 {
        registry.remove(&self.key);
      }
    }
  }
}

fn lock_registry(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
  registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn entry_is_removed_after_last_guard() {
    let locks = KeyedMutex::new();
    let guard = locks.lock("node-1").await;
    assert_eq!(locks.keys(), 1);
    drop(guard);
    assert_eq!(locks.keys(), 0);
  }

  #[tokio::test]
  async fn same_key_serializes() {
    let locks = KeyedMutex::new();
    let guard = locks.lock("node-1").await;
    let pending = {
      let locks = locks.clone();
      tokio::spawn(async move {
        let _g = locks.lock("node-1").await;
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());
    drop(guard);
    pending.await.unwrap();
    assert_eq!(locks.keys(), 0);
  }

  #[tokio::test]
  async fn different_keys_are_independent() {
    let locks = KeyedMutex::new();
    let _a = locks.lock("node-a").await;
    // would deadlock if keys shared a lock
    let _b = locks.lock("node-b").await;
    assert_eq!(locks.keys(), 2);
  }
}
