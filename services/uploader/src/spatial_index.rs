//! R-tree index of photo positions.
//!
//! The tree lives in memory and is persisted wholesale as a JSON blob through
//! the bound [`ObjectStore`]. Nothing is flushed automatically: call
//! [`SpatialIndex::save`] after a batch of inserts when durability matters.

use crate::metadata::valid_position;
use crate::storage::{ObjectStore, StorageError};
use parking_lot::Mutex;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors raised while loading or saving the index
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupt index blob: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Leaf of the tree. `seq` records insertion order for tie-breaking.
#[derive(Debug, Clone, PartialEq)]
struct Leaf {
    identity: String,
    /// `[longitude, latitude]`
    point: [f64; 2],
    seq: u64,
}

impl RTreeObject for Leaf {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for Leaf {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Persisted form of one leaf
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    identity: String,
    latitude: f64,
    longitude: f64,
}

/// In-memory R-tree keyed by photo identity
#[derive(Debug, Default)]
pub struct PhotoIndex {
    tree: RTree<Leaf>,
    leaves: HashMap<String, Leaf>,
    next_seq: u64,
}

impl PhotoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `identity` at the given position, replacing any previous leaf.
    ///
    /// Non-finite or out-of-range positions are refused and return `false`.
    pub fn insert(&mut self, identity: &str, latitude: f64, longitude: f64) -> bool {
        if !valid_position(latitude, longitude) {
            return false;
        }
        if let Some(previous) = self.leaves.remove(identity) {
            self.tree.remove(&previous);
        }

        let leaf = Leaf {
            identity: identity.to_string(),
            point: [longitude, latitude],
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.leaves.insert(leaf.identity.clone(), leaf.clone());
        self.tree.insert(leaf);
        true
    }

    /// Remove `identity`, returning whether it was present
    pub fn remove(&mut self, identity: &str) -> bool {
        match self.leaves.remove(identity) {
            Some(leaf) => self.tree.remove(&leaf).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Up to `max_results` identities nearest to the point, closest first.
    /// Equidistant leaves come back in insertion order.
    pub fn query(&self, latitude: f64, longitude: f64, max_results: usize) -> Vec<String> {
        if max_results == 0 {
            return Vec::new();
        }

        let target = [longitude, latitude];
        let mut hits: Vec<(f64, &Leaf)> = Vec::with_capacity(max_results);

        for (leaf, distance) in self.tree.nearest_neighbor_iter_with_distance_2(&target) {
            // Keep pulling past the limit while distances tie with the last hit
            if hits.len() >= max_results && hits.last().is_some_and(|(last, _)| distance > *last) {
                break;
            }
            hits.push((distance, leaf));
        }

        sorted_identities(hits, max_results)
    }

    /// Identities within `radius` degrees of the point, closest first
    pub fn query_within(&self, latitude: f64, longitude: f64, radius: f64) -> Vec<String> {
        let target = [longitude, latitude];
        let hits: Vec<(f64, &Leaf)> = self
            .tree
            .locate_within_distance(target, radius * radius)
            .map(|leaf| (leaf.distance_2(&target), leaf))
            .collect();

        let len = hits.len();
        sorted_identities(hits, len)
    }

    fn to_entries(&self) -> Vec<IndexEntry> {
        let mut leaves: Vec<&Leaf> = self.leaves.values().collect();
        leaves.sort_by_key(|leaf| leaf.seq);
        leaves
            .into_iter()
            .map(|leaf| IndexEntry {
                identity: leaf.identity.clone(),
                latitude: leaf.point[1],
                longitude: leaf.point[0],
            })
            .collect()
    }

    fn from_entries(entries: Vec<IndexEntry>) -> Self {
        let mut leaves = HashMap::with_capacity(entries.len());
        let mut next_seq = 0;

        for entry in entries {
            if !valid_position(entry.latitude, entry.longitude) {
                warn!(identity = %entry.identity, "Skipping index entry with invalid position");
                continue;
            }
            let leaf = Leaf {
                identity: entry.identity,
                point: [entry.longitude, entry.latitude],
                seq: next_seq,
            };
            next_seq += 1;
            leaves.insert(leaf.identity.clone(), leaf);
        }

        let tree = RTree::bulk_load(leaves.values().cloned().collect());
        Self {
            tree,
            leaves,
            next_seq,
        }
    }
}

fn sorted_identities(mut hits: Vec<(f64, &Leaf)>, limit: usize) -> Vec<String> {
    hits.sort_by(|(da, a), (db, b)| da.total_cmp(db).then(a.seq.cmp(&b.seq)));
    hits.into_iter()
        .take(limit)
        .map(|(_, leaf)| leaf.identity.clone())
        .collect()
}

/// Shared photo index bound to the backend that persists it
pub struct SpatialIndex {
    store: Arc<dyn ObjectStore>,
    index: Mutex<PhotoIndex>,
}

impl SpatialIndex {
    /// Empty index persisted through `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            index: Mutex::new(PhotoIndex::new()),
        }
    }

    /// Replace the in-memory tree with the persisted one.
    ///
    /// A missing blob yields an empty index. Returns the number of leaves.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<usize, IndexError> {
        let loaded = match self.store.load_index_blob().await? {
            Some(blob) => PhotoIndex::from_entries(serde_json::from_slice(&blob)?),
            None => PhotoIndex::new(),
        };

        let len = loaded.len();
        *self.index.lock() = loaded;

        info!(entries = len, "Spatial index loaded");
        Ok(len)
    }

    /// Persist the whole tree, overwriting the previous blob
    #[instrument(skip(self))]
    pub async fn save(&self) -> Result<(), IndexError> {
        let entries = self.index.lock().to_entries();
        let blob = serde_json::to_vec(&entries)?;
        self.store.save_index_blob(&blob).await?;

        info!(entries = entries.len(), bytes = blob.len(), "Spatial index saved");
        Ok(())
    }

    /// Index a photo position; returns `false` if the position was refused
    pub fn insert(&self, identity: &str, latitude: f64, longitude: f64) -> bool {
        let inserted = self.index.lock().insert(identity, latitude, longitude);
        if inserted {
            debug!(identity = %identity, latitude, longitude, "Indexed photo position");
        } else {
            warn!(identity = %identity, latitude, longitude, "Refused invalid photo position");
        }
        inserted
    }

    pub fn remove(&self, identity: &str) -> bool {
        self.index.lock().remove(identity)
    }

    /// Drop every entry from memory; the persisted blob is untouched until [`save`](Self::save)
    pub fn clear(&self) {
        *self.index.lock() = PhotoIndex::new();
    }

    pub fn query(&self, latitude: f64, longitude: f64, max_results: usize) -> Vec<String> {
        self.index.lock().query(latitude, longitude, max_results)
    }

    pub fn query_within(&self, latitude: f64, longitude: f64, radius: f64) -> Vec<String> {
        self.index.lock().query_within(latitude, longitude, radius)
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }
}
