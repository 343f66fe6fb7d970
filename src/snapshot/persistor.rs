//! The serialised history-of-snapshots document

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{Snapshot, SnapshotError, SnapshotResult};
use crate::types::{SnapshotName, TLogId};

const DOCUMENT_VERSION: u32 = 1;

/// XML document model, kept string-typed so the wire format is stable
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "snapshots")]
struct Document {
    version: u32,
    #[serde(default)]
    snapshot: Vec<SnapshotElement>,
    current: TlogList,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotElement {
    uuid: String,
    name: String,
    created: String,
    metadata: String,
    tlogs: TlogList,
    backend_size: u64,
    in_backend: bool,
    tombstoned: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TlogList {
    #[serde(default)]
    tlog: Vec<String>,
}

/// Result of cutting the chain back to a snapshot
#[derive(Debug, Clone)]
pub struct ChainCut {
    /// TLog ids dropped by the cut, both snapshotted and current
    pub dropped_tlogs: Vec<TLogId>,
    /// Names of snapshots dropped because they sat after the cut
    pub dropped_snapshots: Vec<SnapshotName>,
}

/// The chain of snapshots and current TLogs of one volume
///
/// Owns the ordering invariants: snapshots are ordered by creation, every
/// TLog id appears exactly once, and the last current TLog is the volume's
/// open write target.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPersistor {
    snapshots: Vec<Snapshot>,
    current_tlogs: Vec<TLogId>,
}

impl SnapshotPersistor {
    /// Start a fresh chain with the volume's first TLog
    pub fn new(initial_tlog: TLogId) -> Self {
        Self {
            snapshots: Vec::new(),
            current_tlogs: vec![initial_tlog],
        }
    }

    /// The open TLog the volume is writing to
    pub fn current_tlog(&self) -> TLogId {
        *self
            .current_tlogs
            .last()
            .expect("chain always has an open tlog")
    }

    /// All unsnapshotted TLogs, oldest first; the last one is open
    pub fn current_tlogs(&self) -> &[TLogId] {
        &self.current_tlogs
    }

    /// Append a fresh open TLog on rollover
    pub fn add_current_tlog(&mut self, id: TLogId) {
        self.current_tlogs.push(id);
    }

    /// Replace the current chain after a restart
    ///
    /// `kept` is the surviving prefix of the previous current chain (tail
    /// logs lost in a crash are simply dropped); `fresh` becomes the open
    /// write target.
    pub fn reset_current(&mut self, kept: Vec<TLogId>, fresh: TLogId) {
        self.current_tlogs = kept;
        self.current_tlogs.push(fresh);
    }

    /// Snapshots in creation order, tombstoned ones included
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Non-tombstoned snapshot names in creation order
    pub fn list_names(&self) -> Vec<SnapshotName> {
        self.snapshots
            .iter()
            .filter(|s| !s.tombstoned)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Find a snapshot by name
    pub fn find(&self, name: &SnapshotName) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .find(|s| &s.name == name && !s.tombstoned)
    }

    /// The most recent snapshot, tombstoned or not
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Cut the current TLogs into a new snapshot
    ///
    /// Fails while the previous snapshot is not yet on the backend or when
    /// the name is taken. The caller seals the open TLog first and passes
    /// the id of the fresh one that succeeds it.
    pub fn create_snapshot(
        &mut self,
        name: SnapshotName,
        metadata: String,
        backend_size: u64,
        next_tlog: TLogId,
    ) -> SnapshotResult<&Snapshot> {
        if self.find(&name).is_some() {
            return Err(SnapshotError::NameAlreadyExists(name));
        }
        if let Some(last) = self.snapshots.last() {
            if !last.in_backend {
                return Err(SnapshotError::PreviousNotOnBackend(last.name.clone()));
            }
        }
        let tlogs = std::mem::replace(&mut self.current_tlogs, vec![next_tlog]);
        self.snapshots
            .push(Snapshot::new(name, metadata, tlogs, backend_size));
        Ok(self.snapshots.last().unwrap())
    }

    /// Flip a snapshot to `in_backend` once its TLogs are durable
    pub fn mark_in_backend(&mut self, name: &SnapshotName) -> SnapshotResult<()> {
        let snapshot = self
            .snapshots
            .iter_mut()
            .find(|s| &s.name == name)
            .ok_or_else(|| SnapshotError::NotFound(name.clone()))?;
        snapshot.in_backend = true;
        Ok(())
    }

    /// Tombstone a snapshot, making its exclusive data scrub-eligible
    pub fn delete_snapshot(&mut self, name: &SnapshotName) -> SnapshotResult<()> {
        let snapshot = self
            .snapshots
            .iter_mut()
            .find(|s| &s.name == name && !s.tombstoned)
            .ok_or_else(|| SnapshotError::NotFound(name.clone()))?;
        snapshot.tombstoned = true;
        Ok(())
    }

    /// Every TLog id in chain order: snapshotted first, then current
    pub fn all_tlogs(&self) -> Vec<TLogId> {
        let mut tlogs: Vec<TLogId> = self
            .snapshots
            .iter()
            .flat_map(|s| s.tlogs.iter().copied())
            .collect();
        tlogs.extend(self.current_tlogs.iter().copied());
        tlogs
    }

    /// TLogs from the start of history through the named snapshot
    pub fn tlogs_through(&self, name: &SnapshotName) -> SnapshotResult<Vec<TLogId>> {
        let mut tlogs = Vec::new();
        for snapshot in &self.snapshots {
            tlogs.extend(snapshot.tlogs.iter().copied());
            if &snapshot.name == name {
                return Ok(tlogs);
            }
        }
        Err(SnapshotError::NotFound(name.clone()))
    }

    /// TLogs covered by snapshots whose `in_backend` flag is set
    pub fn tlogs_on_backend(&self) -> Vec<TLogId> {
        self.snapshots
            .iter()
            .take_while(|s| s.in_backend)
            .flat_map(|s| s.tlogs.iter().copied())
            .collect()
    }

    /// Cut the chain back to the named snapshot
    ///
    /// Drops every later snapshot and all current TLogs; the fresh TLog id
    /// becomes the new open write target. Returns what was dropped so the
    /// caller can delete the corresponding objects.
    pub fn cut_after(
        &mut self,
        name: &SnapshotName,
        fresh_tlog: TLogId,
    ) -> SnapshotResult<ChainCut> {
        let index = self
            .snapshots
            .iter()
            .position(|s| &s.name == name && !s.tombstoned)
            .ok_or_else(|| SnapshotError::NotFound(name.clone()))?;

        let dropped: Vec<Snapshot> = self.snapshots.split_off(index + 1);
        let mut cut = ChainCut {
            dropped_tlogs: dropped
                .iter()
                .flat_map(|s| s.tlogs.iter().copied())
                .collect(),
            dropped_snapshots: dropped.into_iter().map(|s| s.name).collect(),
        };
        cut.dropped_tlogs
            .extend(std::mem::replace(&mut self.current_tlogs, vec![fresh_tlog]));
        Ok(cut)
    }

    /// Serialise to the canonical XML form
    pub fn to_xml(&self) -> SnapshotResult<String> {
        let doc = Document {
            version: DOCUMENT_VERSION,
            snapshot: self
                .snapshots
                .iter()
                .map(|s| SnapshotElement {
                    uuid: s.uuid.to_string(),
                    name: s.name.0.clone(),
                    created: s.created.to_rfc3339(),
                    metadata: s.metadata.clone(),
                    tlogs: TlogList {
                        tlog: s.tlogs.iter().map(|t| t.object_name()).collect(),
                    },
                    backend_size: s.backend_size,
                    in_backend: s.in_backend,
                    tombstoned: s.tombstoned,
                })
                .collect(),
            current: TlogList {
                tlog: self.current_tlogs.iter().map(|t| t.object_name()).collect(),
            },
        };
        quick_xml::se::to_string(&doc).map_err(|e| SnapshotError::Document(e.to_string()))
    }

    /// Parse the canonical XML form
    pub fn from_xml(xml: &str) -> SnapshotResult<Self> {
        let doc: Document =
            quick_xml::de::from_str(xml).map_err(|e| SnapshotError::Document(e.to_string()))?;
        if doc.version != DOCUMENT_VERSION {
            return Err(SnapshotError::Document(format!(
                "unsupported document version {}",
                doc.version
            )));
        }
        let parse_tlog = |raw: &str| {
            TLogId::parse_object_name(raw)
                .ok_or_else(|| SnapshotError::Document(format!("bad tlog id {raw}")))
        };
        let mut snapshots = Vec::with_capacity(doc.snapshot.len());
        for element in doc.snapshot {
            let tlogs = element
                .tlogs
                .tlog
                .iter()
                .map(|raw| parse_tlog(raw))
                .collect::<SnapshotResult<Vec<_>>>()?;
            snapshots.push(Snapshot {
                uuid: element
                    .uuid
                    .parse()
                    .map_err(|e| SnapshotError::Document(format!("bad uuid: {e}")))?,
                name: SnapshotName(element.name),
                created: element
                    .created
                    .parse()
                    .map_err(|e| SnapshotError::Document(format!("bad timestamp: {e}")))?,
                metadata: element.metadata,
                tlogs,
                backend_size: element.backend_size,
                in_backend: element.in_backend,
                tombstoned: element.tombstoned,
            });
        }
        let current_tlogs = doc
            .current
            .tlog
            .iter()
            .map(|raw| parse_tlog(raw))
            .collect::<SnapshotResult<Vec<_>>>()?;
        if current_tlogs.is_empty() {
            return Err(SnapshotError::Document(
                "document has no current tlog".to_string(),
            ));
        }
        Ok(Self {
            snapshots,
            current_tlogs,
        })
    }

    /// Write the document to a local file, atomically
    pub fn save_local(&self, path: impl AsRef<Path>) -> SnapshotResult<()> {
        let xml = self.to_xml()?;
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, xml.as_bytes())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read the document from a local file
    pub fn load_local(path: impl AsRef<Path>) -> SnapshotResult<Self> {
        let xml = std::fs::read_to_string(path)?;
        Self::from_xml(&xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn name(n: &str) -> SnapshotName {
        SnapshotName::new(n)
    }

    #[test]
    fn chain_starts_with_one_open_tlog() {
        let t0 = TLogId::new();
        let persistor = SnapshotPersistor::new(t0);
        assert_eq!(persistor.current_tlog(), t0);
        assert_eq!(persistor.all_tlogs(), vec![t0]);
    }

    #[test]
    fn snapshot_cuts_current_chain() {
        let t0 = TLogId::new();
        let t1 = TLogId::new();
        let mut persistor = SnapshotPersistor::new(t0);

        let snap = persistor
            .create_snapshot(name("s1"), String::new(), 4096, t1)
            .unwrap();
        assert_eq!(snap.tlogs, vec![t0]);
        assert!(!snap.in_backend);
        assert_eq!(persistor.current_tlog(), t1);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut persistor = SnapshotPersistor::new(TLogId::new());
        persistor
            .create_snapshot(name("s1"), String::new(), 0, TLogId::new())
            .unwrap();
        persistor.mark_in_backend(&name("s1")).unwrap();
        let err = persistor
            .create_snapshot(name("s1"), String::new(), 0, TLogId::new())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::NameAlreadyExists(_)));
    }

    #[test]
    fn snapshot_blocked_until_previous_on_backend() {
        let mut persistor = SnapshotPersistor::new(TLogId::new());
        persistor
            .create_snapshot(name("s1"), String::new(), 0, TLogId::new())
            .unwrap();

        let err = persistor
            .create_snapshot(name("s2"), String::new(), 0, TLogId::new())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::PreviousNotOnBackend(_)));

        persistor.mark_in_backend(&name("s1")).unwrap();
        persistor
            .create_snapshot(name("s2"), String::new(), 0, TLogId::new())
            .unwrap();
    }

    #[test]
    fn cut_after_drops_later_history() {
        let t0 = TLogId::new();
        let mut persistor = SnapshotPersistor::new(t0);
        let t1 = TLogId::new();
        persistor
            .create_snapshot(name("s1"), String::new(), 0, t1)
            .unwrap();
        persistor.mark_in_backend(&name("s1")).unwrap();
        let t2 = TLogId::new();
        persistor
            .create_snapshot(name("s2"), String::new(), 0, t2)
            .unwrap();
        persistor.mark_in_backend(&name("s2")).unwrap();
        let t3 = TLogId::new();
        persistor.add_current_tlog(t3);

        let fresh = TLogId::new();
        let cut = persistor.cut_after(&name("s1"), fresh).unwrap();
        assert_eq!(cut.dropped_snapshots, vec![name("s2")]);
        assert_eq!(cut.dropped_tlogs, vec![t1, t2, t3]);
        assert_eq!(persistor.current_tlog(), fresh);
        assert_eq!(persistor.list_names(), vec![name("s1")]);
    }

    #[test]
    fn xml_roundtrip_preserves_chain() {
        let mut persistor = SnapshotPersistor::new(TLogId::new());
        persistor
            .create_snapshot(name("s1"), "meta-blob".to_string(), 8192, TLogId::new())
            .unwrap();
        persistor.mark_in_backend(&name("s1")).unwrap();
        persistor.add_current_tlog(TLogId::new());

        let xml = persistor.to_xml().unwrap();
        let parsed = SnapshotPersistor::from_xml(&xml).unwrap();
        assert_eq!(parsed, persistor);
    }

    #[test]
    fn tlogs_on_backend_stops_at_first_pending() {
        let t0 = TLogId::new();
        let mut persistor = SnapshotPersistor::new(t0);
        persistor
            .create_snapshot(name("s1"), String::new(), 0, TLogId::new())
            .unwrap();
        persistor.mark_in_backend(&name("s1")).unwrap();
        persistor
            .create_snapshot(name("s2"), String::new(), 0, TLogId::new())
            .unwrap();

        // s2 is still pending, so only s1's tlogs count.
        assert_eq!(persistor.tlogs_on_backend(), vec![t0]);
    }

    #[test]
    fn local_save_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("berth-persistor-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let persistor = SnapshotPersistor::new(TLogId::new());
        let path = dir.join("snapshots.xml");
        persistor.save_local(&path).unwrap();
        let loaded = SnapshotPersistor::load_local(&path).unwrap();
        assert_eq!(loaded, persistor);
        std::fs::remove_dir_all(dir).ok();
    }
}
