//! vlayer Core - Core types for the vector layer engine.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - `DataType` / `Value`: attribute types and runtime values
//! - `Feature` / `FeatureId`: a record of a vector layer
//! - `Field` / `Fields` / `FieldOrigin`: the layer schema and where each column comes from
//! - `Geometry` / `Rect`: planar geometry used by spatial filters
//! - `Error`: error type for engine operations
//!
//! # Example
//!
//! ```rust
//! use vlayer_core::{DataType, Feature, Field, Fields, Geometry, Value};
//!
//! let fields = Fields::from_fields(vec![
//!     Field::provider("id", DataType::Int64, 0),
//!     Field::provider("name", DataType::String, 1),
//! ])
//! .unwrap();
//!
//! let feature = Feature::with_geometry(
//!     1,
//!     vec![Value::Int64(1), Value::String("Alice".into())],
//!     Geometry::point(3.0, 4.0),
//! );
//!
//! assert_eq!(fields.lookup("NAME"), Some(1));
//! assert_eq!(feature.attribute(1), Some(&Value::String("Alice".into())));
//! ```

#![no_std]

extern crate alloc;

mod error;
mod feature;
mod fields;
pub mod geometry;
mod types;
mod value;

pub use error::{Error, Result};
pub use feature::{is_added_id, Feature, FeatureId, INVALID_FEATURE_ID};
pub use fields::{Field, FieldOrigin, Fields};
pub use geometry::{Coord, Geometry, Rect};
pub use types::DataType;
pub use value::Value;
