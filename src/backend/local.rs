//! Filesystem-backed connector
//!
//! One directory per namespace under a base path, one file per object.
//! Puts write to a temp file and rename into place; conditional puts hold a
//! connector-wide lock for the check-then-rename window, which is atomic
//! within a single process (cross-process exclusion belongs to the real
//! object store behind this interface).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BackendConnector, BackendError, BackendResult, PutCondition};
use crate::types::Namespace;

/// Object store rooted at a local directory
pub struct LocalConnector {
    base: PathBuf,
    put_lock: Mutex<()>,
}

impl LocalConnector {
    /// Open a connector rooted at `base`, creating the directory if needed
    pub fn new(base: impl AsRef<Path>) -> BackendResult<Self> {
        let base = base.as_ref().to_path_buf();
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            put_lock: Mutex::new(()),
        })
    }

    fn ns_dir(&self, ns: &Namespace) -> PathBuf {
        self.base.join(&ns.0)
    }

    fn object_path(&self, ns: &Namespace, name: &str) -> PathBuf {
        self.ns_dir(ns).join(name)
    }

    fn require_ns(&self, ns: &Namespace) -> BackendResult<PathBuf> {
        let dir = self.ns_dir(ns);
        if !dir.is_dir() {
            return Err(BackendError::NamespaceNotFound(ns.0.clone()));
        }
        Ok(dir)
    }
}

#[async_trait]
impl BackendConnector for LocalConnector {
    async fn put(
        &self,
        ns: &Namespace,
        name: &str,
        bytes: Vec<u8>,
        overwrite: bool,
        condition: Option<&PutCondition>,
    ) -> BackendResult<()> {
        let dir = self.require_ns(ns)?;
        let path = self.object_path(ns, name);

        let _guard = self.put_lock.lock().await;

        let existing = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if existing.is_some() && !overwrite {
            return Err(BackendError::ObjectExists(name.to_string()));
        }
        if let Some(cond) = condition {
            if !cond.eval(existing.as_deref()) {
                return Err(BackendError::ConditionFailed(format!(
                    "{name} [{}]",
                    cond.label()
                )));
            }
        }

        let tmp = dir.join(format!(".put-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, ns: &Namespace, name: &str) -> BackendResult<Vec<u8>> {
        self.require_ns(ns)?;
        match tokio::fs::read(self.object_path(ns, name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::ObjectNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, ns: &Namespace, prefix: &str) -> BackendResult<Vec<String>> {
        let dir = self.require_ns(ns)?;
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) && !name.starts_with(".put-") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, ns: &Namespace, name: &str) -> BackendResult<bool> {
        self.require_ns(ns)?;
        Ok(self.object_path(ns, name).is_file())
    }

    async fn remove(&self, ns: &Namespace, name: &str, may_not_exist: bool) -> BackendResult<()> {
        self.require_ns(ns)?;
        match tokio::fs::remove_file(self.object_path(ns, name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && may_not_exist => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::ObjectNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_namespace(&self, ns: &Namespace) -> BackendResult<()> {
        tokio::fs::create_dir_all(self.ns_dir(ns)).await?;
        Ok(())
    }

    async fn delete_namespace(&self, ns: &Namespace) -> BackendResult<()> {
        let dir = self.require_ns(ns)?;
        tokio::fs::remove_dir_all(dir).await?;
        Ok(())
    }

    async fn namespace_exists(&self, ns: &Namespace) -> BackendResult<bool> {
        Ok(self.ns_dir(ns).is_dir())
    }

    async fn list_namespaces(&self) -> BackendResult<Vec<Namespace>> {
        let mut namespaces = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                namespaces.push(Namespace::new(
                    entry.file_name().to_string_lossy().into_owned(),
                ));
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }
}
