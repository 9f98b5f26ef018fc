//! Keyed-object registry.
//!
//! Every replicated object (camera, visualization, rendering, rendering
//! set, datasets, partition, renderer) is identified by an integer key
//! unique across the peer group. The creating rank holds the primary
//! copy; every other rank holds a read-only replica installed by a
//! collective commit. Deletion notifications and update notifications go
//! through a narrow event channel: observers register a callback and
//! receive `(subject_key, EventKind)`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::camera::Camera;
use crate::datasets::Datasets;
use crate::errors::{NebulaError, Result};
use crate::partition::PartitionMeta;
use crate::renderer::{Renderer, RendererConfig};
use crate::rendering::{Rendering, RenderingMeta, RenderingSet, RenderingSetMeta};
use crate::vis::Visualization;

/// Group-unique object identifier.
pub type Key = u64;

/// Class tag carried by every keyed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassTag {
    Camera,
    Visualization,
    Datasets,
    Partition,
    Rendering,
    RenderingSet,
    Renderer,
}

impl ClassTag {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ClassTag::Camera => "Camera",
            ClassTag::Visualization => "Visualization",
            ClassTag::Datasets => "Datasets",
            ClassTag::Partition => "Partition",
            ClassTag::Rendering => "Rendering",
            ClassTag::RenderingSet => "RenderingSet",
            ClassTag::Renderer => "Renderer",
        }
    }
}

/// Registry event kinds. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Updated,
    Deleted,
}

/// A replicated object held by the registry. Closed sum over the
/// concrete kinds; runtime state (frame buffers, counters) lives behind
/// interior mutability inside the pointed-to values.
#[derive(Clone)]
pub enum SharedObject {
    Camera(Arc<Camera>),
    Visualization(Arc<Visualization>),
    Datasets(Arc<Datasets>),
    Partition(PartitionMeta),
    Rendering(Arc<Rendering>),
    RenderingSet(Arc<RenderingSet>),
    Renderer(Arc<Renderer>),
}

impl SharedObject {
    #[must_use]
    pub fn tag(&self) -> ClassTag {
        match self {
            SharedObject::Camera(_) => ClassTag::Camera,
            SharedObject::Visualization(_) => ClassTag::Visualization,
            SharedObject::Datasets(_) => ClassTag::Datasets,
            SharedObject::Partition(_) => ClassTag::Partition,
            SharedObject::Rendering(_) => ClassTag::Rendering,
            SharedObject::RenderingSet(_) => ClassTag::RenderingSet,
            SharedObject::Renderer(_) => ClassTag::Renderer,
        }
    }
}

/// Serializable commit payload: what travels in a `CommitMsg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitEnvelope {
    pub key: Key,
    pub body: CommitBody,
}

/// Wire form of each keyed object class. Runtime-only state (buffers,
/// counters, kernels) is rebuilt on the receiving rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommitBody {
    Camera(Camera),
    Visualization(Visualization),
    Datasets(Datasets),
    Partition(PartitionMeta),
    Rendering(RenderingMeta),
    RenderingSet(RenderingSetMeta),
    Renderer(RendererConfig),
}

struct Entry {
    version: u32,
    primary: bool,
    object: SharedObject,
}

type Observer = Box<dyn Fn(Key, EventKind) + Send + Sync>;

/// Per-rank object table.
pub struct Registry {
    rank: usize,
    next_key: AtomicU64,
    map: RwLock<FxHashMap<Key, Entry>>,
    observers: Mutex<Vec<Observer>>,
}

impl Registry {
    #[must_use]
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            next_key: AtomicU64::new(1),
            map: RwLock::new(FxHashMap::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a fresh key. Only the driver rank creates objects, so
    /// sequential allocation here is group-unique.
    pub fn allocate_key(&self) -> Key {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Mark `key` as taken without installing an object; placeholder
    /// creation ahead of the commit that carries the content.
    pub fn reserve_key(&self, key: Key) {
        self.next_key.fetch_max(key + 1, Ordering::Relaxed);
    }

    /// Install or replace an object. Bumps the version on replace and
    /// notifies observers of the update.
    pub fn insert(&self, key: Key, object: SharedObject, primary: bool) {
        // Replicas must never hand out a key the primary already used
        self.next_key.fetch_max(key + 1, Ordering::Relaxed);
        {
            let mut map = self.map.write();
            let version = map.get(&key).map_or(0, |e| e.version + 1);
            map.insert(
                key,
                Entry {
                    version,
                    primary,
                    object,
                },
            );
        }
        self.notify(key, EventKind::Updated);
    }

    /// Drop the object. Notifies observers of the deletion.
    pub fn remove(&self, key: Key) -> Result<()> {
        let existed = self.map.write().remove(&key).is_some();
        if !existed {
            return Err(NebulaError::UnknownKey(key));
        }
        self.notify(key, EventKind::Deleted);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: Key) -> Option<SharedObject> {
        self.map.read().get(&key).map(|e| e.object.clone())
    }

    #[must_use]
    pub fn version(&self, key: Key) -> Option<u32> {
        self.map.read().get(&key).map(|e| e.version)
    }

    #[must_use]
    pub fn is_primary(&self, key: Key) -> bool {
        self.map.read().get(&key).is_some_and(|e| e.primary)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Register an observer for registry events.
    pub fn observe<F>(&self, callback: F)
    where
        F: Fn(Key, EventKind) + Send + Sync + 'static,
    {
        self.observers.lock().push(Box::new(callback));
    }

    fn notify(&self, key: Key, kind: EventKind) {
        let observers = self.observers.lock();
        for cb in observers.iter() {
            cb(key, kind);
        }
    }

    /// Every rendering set currently known to this rank.
    #[must_use]
    pub fn rendering_sets(&self) -> Vec<Arc<RenderingSet>> {
        self.map
            .read()
            .values()
            .filter_map(|e| match &e.object {
                SharedObject::RenderingSet(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Typed lookups
    // ------------------------------------------------------------------

    fn wrong_class(key: Key, actual: ClassTag, expected: &'static str) -> NebulaError {
        NebulaError::WrongClass {
            key,
            actual: actual.name(),
            expected,
        }
    }

    pub fn camera(&self, key: Key) -> Result<Arc<Camera>> {
        match self.get(key).ok_or(NebulaError::UnknownKey(key))? {
            SharedObject::Camera(c) => Ok(c),
            other => Err(Self::wrong_class(key, other.tag(), "Camera")),
        }
    }

    pub fn visualization(&self, key: Key) -> Result<Arc<Visualization>> {
        match self.get(key).ok_or(NebulaError::UnknownKey(key))? {
            SharedObject::Visualization(v) => Ok(v),
            other => Err(Self::wrong_class(key, other.tag(), "Visualization")),
        }
    }

    pub fn datasets(&self, key: Key) -> Result<Arc<Datasets>> {
        match self.get(key).ok_or(NebulaError::UnknownKey(key))? {
            SharedObject::Datasets(d) => Ok(d),
            other => Err(Self::wrong_class(key, other.tag(), "Datasets")),
        }
    }

    pub fn partition_meta(&self, key: Key) -> Result<PartitionMeta> {
        match self.get(key).ok_or(NebulaError::UnknownKey(key))? {
            SharedObject::Partition(p) => Ok(p),
            other => Err(Self::wrong_class(key, other.tag(), "Partition")),
        }
    }

    pub fn rendering(&self, key: Key) -> Result<Arc<Rendering>> {
        match self.get(key).ok_or(NebulaError::UnknownKey(key))? {
            SharedObject::Rendering(r) => Ok(r),
            other => Err(Self::wrong_class(key, other.tag(), "Rendering")),
        }
    }

    pub fn rendering_set(&self, key: Key) -> Result<Arc<RenderingSet>> {
        match self.get(key).ok_or(NebulaError::UnknownKey(key))? {
            SharedObject::RenderingSet(s) => Ok(s),
            other => Err(Self::wrong_class(key, other.tag(), "RenderingSet")),
        }
    }

    pub fn renderer(&self, key: Key) -> Result<Arc<Renderer>> {
        match self.get(key).ok_or(NebulaError::UnknownKey(key))? {
            SharedObject::Renderer(r) => Ok(r),
            other => Err(Self::wrong_class(key, other.tag(), "Renderer")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn insert_lookup_versioning() {
        let reg = Registry::new(0);
        let key = reg.allocate_key();
        let cam = Camera::default();
        reg.insert(key, SharedObject::Camera(Arc::new(cam.clone())), true);
        assert_eq!(reg.version(key), Some(0));
        assert!(reg.is_primary(key));
        assert_eq!(reg.camera(key).unwrap().eye, cam.eye);

        reg.insert(key, SharedObject::Camera(Arc::new(cam)), true);
        assert_eq!(reg.version(key), Some(1));
    }

    #[test]
    fn typed_lookup_rejects_wrong_class() {
        let reg = Registry::new(0);
        let key = reg.allocate_key();
        reg.insert(key, SharedObject::Camera(Arc::new(Camera::default())), true);
        assert!(matches!(
            reg.visualization(key),
            Err(NebulaError::WrongClass { .. })
        ));
        assert!(matches!(reg.camera(999), Err(NebulaError::UnknownKey(999))));
    }

    #[test]
    fn observers_see_update_and_delete() {
        let reg = Registry::new(0);
        let updates = Arc::new(AtomicUsize::new(0));
        let deletes = Arc::new(AtomicUsize::new(0));
        let (u, d) = (updates.clone(), deletes.clone());
        reg.observe(move |_k, kind| match kind {
            EventKind::Updated => {
                u.fetch_add(1, Ordering::SeqCst);
            }
            EventKind::Deleted => {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });

        let key = reg.allocate_key();
        reg.insert(key, SharedObject::Camera(Arc::new(Camera::default())), true);
        reg.remove(key).unwrap();
        assert!(reg.remove(key).is_err());

        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replica_keys_advance_allocator() {
        let reg = Registry::new(1);
        reg.insert(41, SharedObject::Camera(Arc::new(Camera::default())), false);
        assert!(reg.allocate_key() > 41);
    }
}
