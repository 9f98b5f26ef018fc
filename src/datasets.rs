//! The dataset catalog.
//!
//! Data objects themselves live outside the core (the trace kernels own
//! them); the catalog is the replicated name-to-key table a
//! visualization resolves against. Every rank holds the same catalog, so
//! a vis element committed anywhere names the same data everywhere.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::registry::Key;

/// The spatial data kinds the engine partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Volume,
    Particles,
    PathLines,
    Triangles,
}

/// One catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub key: Key,
    pub kind: DataKind,
}

/// Replicated catalog of the datasets visible to a render call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Datasets {
    entries: FxHashMap<String, DatasetRef>,
}

impl Datasets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, key: Key, kind: DataKind) {
        self.entries.insert(name.into(), DatasetRef { key, kind });
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<DatasetRef> {
        self.entries.get(name).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DatasetRef)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), *r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_round_trip() {
        let mut ds = Datasets::new();
        ds.insert("density", 10, DataKind::Volume);
        ds.insert("tracers", 11, DataKind::Particles);

        let json = serde_json::to_string(&ds).unwrap();
        let back: Datasets = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ds);
        assert_eq!(back.find("density").unwrap().key, 10);
        assert_eq!(back.find("missing"), None);
    }
}
