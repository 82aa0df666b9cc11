//! Archive tier.
//!
//! Write-only from the control plane: rows go in as immutable objects,
//! one per partition per call. Restores happen out of band.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::models::StoredLog;

pub trait ArchiveStore: Send + Sync {
    /// Store `rows`; returns the ids of the objects written.
    fn put(&self, rows: &[StoredLog]) -> Result<Vec<String>>;
}

fn group_by_partition(rows: &[StoredLog]) -> BTreeMap<&str, Vec<&StoredLog>> {
    let mut groups: BTreeMap<&str, Vec<&StoredLog>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.partition.as_str()).or_default().push(row);
    }
    groups
}

fn object_id(partition: &str) -> String {
    format!("{}/{}", partition, Uuid::new_v4())
}

#[derive(Default)]
pub struct InMemoryArchive {
    objects: Mutex<HashMap<String, Vec<StoredLog>>>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn row_count(&self) -> usize {
        self.objects.lock().values().map(Vec::len).sum()
    }

    pub fn object(&self, id: &str) -> Option<Vec<StoredLog>> {
        self.objects.lock().get(id).cloned()
    }
}

impl ArchiveStore for InMemoryArchive {
    fn put(&self, rows: &[StoredLog]) -> Result<Vec<String>> {
        let mut objects = self.objects.lock();
        let mut ids = Vec::new();
        for (partition, group) in group_by_partition(rows) {
            let id = object_id(partition);
            if objects.contains_key(&id) {
                return Err(Error::Conflict(format!("archive object {} exists", id)));
            }
            objects.insert(id.clone(), group.into_iter().cloned().collect());
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Archive objects as JSON files under `root/<partition>/<uuid>.json`.
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|err| Error::Storage(format!("archive dir {}: {}", root.display(), err)))?;
        Ok(Self { root })
    }

    pub fn path_of(&self, object_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", object_id))
    }
}

impl ArchiveStore for FsArchive {
    fn put(&self, rows: &[StoredLog]) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for (partition, group) in group_by_partition(rows) {
            let id = object_id(partition);
            let path = self.path_of(&id);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| Error::Storage(format!("{}: {}", parent.display(), err)))?;
            }
            let body = serde_json::to_vec(&group)?;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|err| Error::Storage(format!("{}: {}", path.display(), err)))?;
            file.write_all(&body)
                .and_then(|_| file.sync_all())
                .map_err(|err| Error::Storage(format!("{}: {}", path.display(), err)))?;
            ids.push(id);
        }
        Ok(ids)
    }
}
