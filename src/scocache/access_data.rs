//! Read-activity tracking per SCO
//!
//! Each volume keeps a decaying score per SCO number, bumped on every read
//! hit and halved on every decay tick. The scores are published to the
//! backend as the `sco_access_data` object and consumed in two places:
//! prefetch ordering after a backend restart, and (inversely) eviction
//! priority in the SCO cache sweeper.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::backend::{BackendHandle, BackendResult, PutCondition, ACCESS_DATA_OBJECT};
use crate::types::{Namespace, SCONumber};

/// Weight retained by a score across one decay tick
const DECAY_FACTOR: f32 = 0.5;

/// Serialised form of the heatmap
#[derive(Debug, Serialize, Deserialize)]
struct AccessDataDocument {
    version: u32,
    namespace: String,
    entries: Vec<(u32, f32)>,
}

const ACCESS_DATA_VERSION: u32 = 1;

/// In-memory read-activity scores of one volume
#[derive(Debug)]
pub struct ScoAccessData {
    namespace: Namespace,
    inner: RwLock<AccessInner>,
}

#[derive(Debug, Default)]
struct AccessInner {
    scores: HashMap<SCONumber, f32>,
    pending: HashMap<SCONumber, u64>,
}

impl ScoAccessData {
    /// Create an empty heatmap for a namespace
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            inner: RwLock::new(AccessInner::default()),
        }
    }

    /// The namespace these scores belong to
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Record a read hit on an SCO
    pub fn register_read(&self, sco: SCONumber) {
        let mut inner = self.inner.write();
        *inner.pending.entry(sco).or_insert(0) += 1;
    }

    /// Fold pending hits into the scores, decaying history
    pub fn decay(&self) {
        let mut inner = self.inner.write();
        let pending = std::mem::take(&mut inner.pending);
        for score in inner.scores.values_mut() {
            *score *= DECAY_FACTOR;
        }
        for (sco, hits) in pending {
            *inner.scores.entry(sco).or_insert(0.0) += hits as f32;
        }
        inner.scores.retain(|_, s| *s > f32::EPSILON);
    }

    /// Current score of an SCO; unknown SCOs score zero
    pub fn score(&self, sco: SCONumber) -> f32 {
        self.inner.read().scores.get(&sco).copied().unwrap_or(0.0)
    }

    /// Forget an SCO, e.g. after it was deleted by a restore
    pub fn forget(&self, sco: SCONumber) {
        let mut inner = self.inner.write();
        inner.scores.remove(&sco);
        inner.pending.remove(&sco);
    }

    /// SCO numbers ordered hottest-first, for restart prefetch
    pub fn prefetch_order(&self) -> Vec<SCONumber> {
        let inner = self.inner.read();
        let mut scos: Vec<(SCONumber, f32)> =
            inner.scores.iter().map(|(s, v)| (*s, *v)).collect();
        scos.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scos.into_iter().map(|(s, _)| s).collect()
    }

    /// Number of tracked SCOs
    pub fn len(&self) -> usize {
        self.inner.read().scores.len()
    }

    /// Whether no SCO has a score yet
    pub fn is_empty(&self) -> bool {
        self.inner.read().scores.is_empty()
    }

    /// Replace the scores wholesale, used when pulling from the backend
    pub fn reset(&self, scores: HashMap<SCONumber, f32>) {
        let mut inner = self.inner.write();
        inner.scores = scores;
        inner.pending.clear();
    }

    fn snapshot(&self) -> Vec<(u32, f32)> {
        let inner = self.inner.read();
        let mut entries: Vec<(u32, f32)> =
            inner.scores.iter().map(|(s, v)| (s.0, *v)).collect();
        entries.sort_by_key(|(n, _)| *n);
        entries
    }
}

/// Publishes and pulls heatmaps through the backend
pub struct AccessDataPersistor {
    backend: BackendHandle,
}

impl AccessDataPersistor {
    /// Create a persistor over a volume's backend handle
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    /// Publish the heatmap as `sco_access_data`
    pub async fn push(
        &self,
        data: &ScoAccessData,
        condition: Option<&PutCondition>,
    ) -> BackendResult<()> {
        let doc = AccessDataDocument {
            version: ACCESS_DATA_VERSION,
            namespace: data.namespace().0.clone(),
            entries: data.snapshot(),
        };
        let bytes = bincode::serialize(&doc)
            .map_err(|e| crate::backend::BackendError::Permanent(e.to_string()))?;
        self.backend
            .put(ACCESS_DATA_OBJECT, bytes, true, condition)
            .await
    }

    /// Pull the heatmap; a missing object yields an empty map
    pub async fn pull(&self, must_exist: bool) -> BackendResult<ScoAccessData> {
        let namespace = self.backend.namespace().clone();
        match self.backend.get(ACCESS_DATA_OBJECT).await {
            Ok(bytes) => {
                let doc: AccessDataDocument = bincode::deserialize(&bytes)
                    .map_err(|e| crate::backend::BackendError::Permanent(e.to_string()))?;
                let data = ScoAccessData::new(namespace);
                data.reset(
                    doc.entries
                        .into_iter()
                        .map(|(n, s)| (SCONumber(n), s))
                        .collect(),
                );
                Ok(data)
            }
            Err(e) if e.is_not_found() && !must_exist => Ok(ScoAccessData::new(namespace)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConnector, MemoryConnector};
    use std::sync::Arc;

    #[test]
    fn reads_accumulate_and_decay() {
        let data = ScoAccessData::new(Namespace::new("ns"));
        for _ in 0..4 {
            data.register_read(SCONumber(1));
        }
        data.register_read(SCONumber(2));
        data.decay();
        assert_eq!(data.score(SCONumber(1)), 4.0);
        assert_eq!(data.score(SCONumber(2)), 1.0);

        data.register_read(SCONumber(2));
        data.decay();
        assert_eq!(data.score(SCONumber(1)), 2.0);
        assert_eq!(data.score(SCONumber(2)), 1.5);
    }

    #[test]
    fn prefetch_order_is_hottest_first() {
        let data = ScoAccessData::new(Namespace::new("ns"));
        data.register_read(SCONumber(7));
        for _ in 0..3 {
            data.register_read(SCONumber(9));
        }
        data.decay();
        assert_eq!(data.prefetch_order(), vec![SCONumber(9), SCONumber(7)]);
    }

    #[tokio::test]
    async fn push_pull_roundtrip() {
        let connector = Arc::new(MemoryConnector::new());
        let ns = Namespace::new("vol");
        connector.create_namespace(&ns).await.unwrap();
        let handle = BackendHandle::new(connector, ns.clone());

        let data = ScoAccessData::new(ns);
        data.register_read(SCONumber(3));
        data.decay();

        let persistor = AccessDataPersistor::new(handle);
        persistor.push(&data, None).await.unwrap();
        let pulled = persistor.pull(true).await.unwrap();
        assert_eq!(pulled.score(SCONumber(3)), 1.0);
    }

    #[tokio::test]
    async fn pull_missing_is_empty_unless_required() {
        let connector = Arc::new(MemoryConnector::new());
        let ns = Namespace::new("vol");
        connector.create_namespace(&ns).await.unwrap();
        let persistor = AccessDataPersistor::new(BackendHandle::new(connector, ns));

        assert!(persistor.pull(false).await.unwrap().is_empty());
        assert!(persistor.pull(true).await.is_err());
    }
}
