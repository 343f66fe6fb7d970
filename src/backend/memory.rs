//! In-process backend connector
//!
//! Keeps every namespace in a map guarded by one lock so conditional puts
//! are trivially atomic. Carries fault-injection hooks used by restart and
//! fencing tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{BackendConnector, BackendError, BackendResult, PutCondition};
use crate::types::Namespace;

/// In-memory object store
pub struct MemoryConnector {
    namespaces: Mutex<BTreeMap<Namespace, BTreeMap<String, Vec<u8>>>>,
    fail_next_puts: AtomicU32,
    put_delay_ms: AtomicU64,
}

impl MemoryConnector {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self {
            namespaces: Mutex::new(BTreeMap::new()),
            fail_next_puts: AtomicU32::new(0),
            put_delay_ms: AtomicU64::new(0),
        }
    }

    /// Make the next `n` puts fail with a retryable error
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_next_puts.store(n, Ordering::SeqCst);
    }

    /// Delay every put by the given duration
    pub fn set_put_delay(&self, delay: Duration) {
        self.put_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total number of objects across all namespaces
    pub fn object_count(&self) -> usize {
        self.namespaces.lock().values().map(|ns| ns.len()).sum()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn put(
        &self,
        ns: &Namespace,
        name: &str,
        bytes: Vec<u8>,
        overwrite: bool,
        condition: Option<&PutCondition>,
    ) -> BackendResult<()> {
        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self
            .fail_next_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::Retryable(format!(
                "injected put failure for {name}"
            )));
        }

        let mut namespaces = self.namespaces.lock();
        let objects = namespaces
            .get_mut(ns)
            .ok_or_else(|| BackendError::NamespaceNotFound(ns.0.clone()))?;

        let existing = objects.get(name);
        if existing.is_some() && !overwrite {
            return Err(BackendError::ObjectExists(name.to_string()));
        }
        if let Some(cond) = condition {
            if !cond.eval(existing.map(|b| b.as_slice())) {
                return Err(BackendError::ConditionFailed(format!(
                    "{name} [{}]",
                    cond.label()
                )));
            }
        }
        objects.insert(name.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, ns: &Namespace, name: &str) -> BackendResult<Vec<u8>> {
        let namespaces = self.namespaces.lock();
        let objects = namespaces
            .get(ns)
            .ok_or_else(|| BackendError::NamespaceNotFound(ns.0.clone()))?;
        objects
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::ObjectNotFound(name.to_string()))
    }

    async fn list(&self, ns: &Namespace, prefix: &str) -> BackendResult<Vec<String>> {
        let namespaces = self.namespaces.lock();
        let objects = namespaces
            .get(ns)
            .ok_or_else(|| BackendError::NamespaceNotFound(ns.0.clone()))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exists(&self, ns: &Namespace, name: &str) -> BackendResult<bool> {
        let namespaces = self.namespaces.lock();
        let objects = namespaces
            .get(ns)
            .ok_or_else(|| BackendError::NamespaceNotFound(ns.0.clone()))?;
        Ok(objects.contains_key(name))
    }

    async fn remove(&self, ns: &Namespace, name: &str, may_not_exist: bool) -> BackendResult<()> {
        let mut namespaces = self.namespaces.lock();
        let objects = namespaces
            .get_mut(ns)
            .ok_or_else(|| BackendError::NamespaceNotFound(ns.0.clone()))?;
        match objects.remove(name) {
            Some(_) => Ok(()),
            None if may_not_exist => Ok(()),
            None => Err(BackendError::ObjectNotFound(name.to_string())),
        }
    }

    async fn create_namespace(&self, ns: &Namespace) -> BackendResult<()> {
        let mut namespaces = self.namespaces.lock();
        namespaces.entry(ns.clone()).or_default();
        Ok(())
    }

    async fn delete_namespace(&self, ns: &Namespace) -> BackendResult<()> {
        let mut namespaces = self.namespaces.lock();
        namespaces
            .remove(ns)
            .map(|_| ())
            .ok_or_else(|| BackendError::NamespaceNotFound(ns.0.clone()))
    }

    async fn namespace_exists(&self, ns: &Namespace) -> BackendResult<bool> {
        Ok(self.namespaces.lock().contains_key(ns))
    }

    async fn list_namespaces(&self) -> BackendResult<Vec<Namespace>> {
        Ok(self.namespaces.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("vol-test")
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryConnector::new();
        store.create_namespace(&ns()).await.unwrap();
        store
            .put(&ns(), "obj", b"hello".to_vec(), false, None)
            .await
            .unwrap();
        assert_eq!(store.get(&ns(), "obj").await.unwrap(), b"hello");
        assert!(store.exists(&ns(), "obj").await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_denied_without_flag() {
        let store = MemoryConnector::new();
        store.create_namespace(&ns()).await.unwrap();
        store
            .put(&ns(), "obj", b"a".to_vec(), false, None)
            .await
            .unwrap();
        let err = store
            .put(&ns(), "obj", b"b".to_vec(), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ObjectExists(_)));
        store
            .put(&ns(), "obj", b"b".to_vec(), true, None)
            .await
            .unwrap();
        assert_eq!(store.get(&ns(), "obj").await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn conditional_put_rejects() {
        let store = MemoryConnector::new();
        store.create_namespace(&ns()).await.unwrap();
        store
            .put(&ns(), "obj", b"v1".to_vec(), false, None)
            .await
            .unwrap();

        let cond = PutCondition::new("must-be-v2", |existing| existing == Some(b"v2".as_ref()));
        let err = store
            .put(&ns(), "obj", b"v3".to_vec(), true, Some(&cond))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ConditionFailed(_)));
        assert_eq!(store.get(&ns(), "obj").await.unwrap(), b"v1");
    }

    #[tokio::test]
    async fn remove_may_not_exist() {
        let store = MemoryConnector::new();
        store.create_namespace(&ns()).await.unwrap();
        store.remove(&ns(), "ghost", true).await.unwrap();
        let err = store.remove(&ns(), "ghost", false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_by_prefix_is_sorted() {
        let store = MemoryConnector::new();
        store.create_namespace(&ns()).await.unwrap();
        for name in ["tlog_b", "tlog_a", "00_00000001_00"] {
            store
                .put(&ns(), name, vec![], false, None)
                .await
                .unwrap();
        }
        let tlogs = store.list(&ns(), "tlog_").await.unwrap();
        assert_eq!(tlogs, vec!["tlog_a".to_string(), "tlog_b".to_string()]);
    }

    #[tokio::test]
    async fn injected_failures_are_retryable() {
        let store = MemoryConnector::new();
        store.create_namespace(&ns()).await.unwrap();
        store.fail_next_puts(1);
        let err = store
            .put(&ns(), "obj", vec![], false, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        store.put(&ns(), "obj", vec![], false, None).await.unwrap();
    }
}
