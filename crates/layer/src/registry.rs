//! Layer registry.
//!
//! Maps layer ids to weak layer references so that joins configured by id
//! can be resolved without the registry keeping layers alive.

use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::layer::VectorLayer;

#[derive(Default)]
pub struct LayerRegistry {
    layers: RwLock<HashMap<String, Weak<VectorLayer>>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a layer under its id, replacing any previous entry.
    pub fn add(&self, layer: &Arc<VectorLayer>) {
        self.layers
            .write()
            .insert(layer.id().to_string(), Arc::downgrade(layer));
    }

    /// Removes a layer. Returns true if it was registered.
    pub fn remove(&self, id: &str) -> bool {
        self.layers.write().remove(id).is_some()
    }

    /// Looks up a live layer by id.
    pub fn get(&self, id: &str) -> Option<Arc<VectorLayer>> {
        self.layers.read().get(id).and_then(Weak::upgrade)
    }

    pub(crate) fn get_weak(&self, id: &str) -> Option<Weak<VectorLayer>> {
        self.layers
            .read()
            .get(id)
            .filter(|w| w.strong_count() > 0)
            .cloned()
    }

    /// Ids of live layers, sorted.
    pub fn layer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .layers
            .read()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drops entries whose layer has been dropped.
    pub fn cleanup(&self) {
        self.layers.write().retain(|_, w| w.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }
}
