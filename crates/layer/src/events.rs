//! Layer change notifications.
//!
//! Listeners are invoked synchronously, after the layer has released its
//! internal locks, so a listener may read from (or edit) the layer that
//! notified it.

use std::sync::Arc;

use vlayer_core::{FeatureId, Geometry, Value};

/// Unique identifier for a listener subscription.
pub type SubscriptionId = u64;

/// Callback invoked for every layer event.
pub type LayerListener = Arc<dyn Fn(&LayerEvent) + Send + Sync>;

/// A change to a layer's features or schema.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerEvent {
    FeatureAdded { id: FeatureId },
    FeatureDeleted { id: FeatureId },
    GeometryChanged {
        id: FeatureId,
        geometry: Option<Geometry>,
    },
    /// `index` is a layer field index.
    AttributeValueChanged {
        id: FeatureId,
        index: usize,
        value: Value,
    },
    AttributeAdded { index: usize },
    AttributeDeleted { index: usize },
    /// The layer schema was recomputed.
    UpdatedFields,
    /// Bulk change: any feature may differ.
    DataChanged,
}

/// Registered listeners of one layer.
#[derive(Default)]
pub(crate) struct Listeners {
    listeners: Vec<(SubscriptionId, LayerListener)>,
    next_id: SubscriptionId,
}

impl Listeners {
    pub(crate) fn subscribe(&mut self, listener: LayerListener) -> SubscriptionId {
        self.next_id += 1;
        self.listeners.push((self.next_id, listener));
        self.next_id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    /// Clones the listener list so callers can notify without holding a lock.
    pub(crate) fn snapshot(&self) -> Vec<LayerListener> {
        self.listeners.iter().map(|(_, l)| l.clone()).collect()
    }
}

/// Calls every listener with every event, in order.
pub(crate) fn dispatch(listeners: &[LayerListener], events: &[LayerEvent]) {
    for event in events {
        tracing::trace!(?event, listeners = listeners.len(), "layer event");
        for listener in listeners {
            listener(event);
        }
    }
}
