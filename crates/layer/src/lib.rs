//! vlayer Layer - Vector layers merging provider data with uncommitted edits.
//!
//! This crate provides:
//!
//! - `edit_buffer`: Copy-on-write record of uncommitted feature and attribute edits
//! - `join`: Left-outer joins to other layers, with optional memory caches
//! - `expression_fields`: Computed attributes
//! - `source`: Point-in-time feature source snapshots
//! - `feature_iterator`: The merge iterator combining provider rows, edits and virtual fields
//! - `layer`: The vector layer owning all of the above
//! - `events`: Layer change notifications
//! - `registry`: Id-based layer lookup for join resolution
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vlayer_core::{DataType, Feature, Value};
//! use vlayer_layer::VectorLayer;
//! use vlayer_query::{FeatureRequest, MemoryProvider};
//!
//! let provider = MemoryProvider::with_columns(&[("name", DataType::String)]).unwrap();
//! provider.add_feature(vec![Value::from("stored")], None);
//!
//! let layer = VectorLayer::new("roads", "Roads", Arc::new(provider));
//! layer.start_editing();
//! let id = layer
//!     .add_feature(Feature::new(0, vec![Value::from("pending")]))
//!     .unwrap();
//! assert!(id < 0);
//!
//! let features = layer.get_features(&FeatureRequest::new()).unwrap();
//! assert_eq!(features.collect_features().unwrap().len(), 2);
//! ```

pub mod edit_buffer;
pub mod events;
pub mod expression_fields;
pub mod feature_iterator;
pub mod join;
pub mod layer;
pub mod registry;
pub mod source;

pub use edit_buffer::{AttributeLayout, EditBuffer, EditState};
pub use events::{LayerEvent, LayerListener, SubscriptionId};
pub use expression_fields::ExpressionField;
pub use feature_iterator::LayerFeatureIterator;
pub use join::{JoinBuffer, JoinInfo};
pub use layer::VectorLayer;
pub use registry::LayerRegistry;
pub use source::LayerFeatureSource;
