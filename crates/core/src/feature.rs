//! Feature structure.
//!
//! A `Feature` is one record of a vector layer: an id, an attribute vector
//! indexed by field position, and an optional geometry.

use crate::geometry::Geometry;
use crate::value::Value;
use alloc::vec::Vec;

/// Identifier of a feature.
///
/// Non-negative ids are assigned by the data provider. Negative ids, starting
/// at -1 and decreasing, belong to features added during an editing session.
pub type FeatureId = i64;

/// Id carried by a feature that was never fetched.
pub const INVALID_FEATURE_ID: FeatureId = i64::MIN;

/// Returns true if the id was assigned to an uncommitted, added feature.
#[inline]
pub fn is_added_id(id: FeatureId) -> bool {
    id < 0 && id != INVALID_FEATURE_ID
}

/// A feature of a vector layer.
#[derive(Clone, Debug)]
pub struct Feature {
    id: FeatureId,
    attributes: Vec<Value>,
    geometry: Option<Geometry>,
    valid: bool,
}

impl Feature {
    /// Creates a valid feature with the given id and attributes and no geometry.
    pub fn new(id: FeatureId, attributes: Vec<Value>) -> Self {
        Self {
            id,
            attributes,
            geometry: None,
            valid: true,
        }
    }

    /// Creates a valid feature with a geometry.
    pub fn with_geometry(id: FeatureId, attributes: Vec<Value>, geometry: Geometry) -> Self {
        Self {
            id,
            attributes,
            geometry: Some(geometry),
            valid: true,
        }
    }

    /// Creates an empty, invalid feature.
    pub fn invalid() -> Self {
        Self {
            id: INVALID_FEATURE_ID,
            attributes: Vec::new(),
            geometry: None,
            valid: false,
        }
    }

    #[inline]
    pub fn id(&self) -> FeatureId {
        self.id
    }

    pub fn set_id(&mut self, id: FeatureId) {
        self.id = id;
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    #[inline]
    pub fn attributes(&self) -> &[Value] {
        &self.attributes
    }

    #[inline]
    pub fn attributes_mut(&mut self) -> &mut Vec<Value> {
        &mut self.attributes
    }

    pub fn set_attributes(&mut self, attributes: Vec<Value>) {
        self.attributes = attributes;
    }

    /// Gets the attribute at the given field index.
    pub fn attribute(&self, index: usize) -> Option<&Value> {
        self.attributes.get(index)
    }

    /// Sets the attribute at the given field index.
    ///
    /// Returns false when the index is past the end of the attribute vector.
    pub fn set_attribute(&mut self, index: usize, value: Value) -> bool {
        match self.attributes.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Resizes the attribute vector, padding with nulls.
    pub fn resize_attributes(&mut self, len: usize) {
        self.attributes.resize(len, Value::Null);
    }

    #[inline]
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    #[inline]
    pub fn geometry(&self) -> Option<&Geometry> {
        self.geometry.as_ref()
    }

    #[inline]
    pub fn has_geometry(&self) -> bool {
        self.geometry.is_some()
    }

    pub fn set_geometry(&mut self, geometry: Option<Geometry>) {
        self.geometry = geometry;
    }

    pub fn clear_geometry(&mut self) {
        self.geometry = None;
    }
}

impl PartialEq for Feature {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.attributes == other.attributes && self.geometry == other.geometry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_feature_new() {
        let f = Feature::new(1, vec![Value::Int64(42), Value::String("Alice".into())]);
        assert_eq!(f.id(), 1);
        assert!(f.is_valid());
        assert_eq!(f.attribute_count(), 2);
        assert!(!f.has_geometry());
    }

    #[test]
    fn test_feature_attributes() {
        let mut f = Feature::new(1, vec![Value::Int64(1), Value::String("Alice".into())]);
        assert_eq!(f.attribute(1), Some(&Value::String("Alice".into())));
        assert_eq!(f.attribute(2), None);
        assert!(f.set_attribute(0, Value::Int64(100)));
        assert_eq!(f.attribute(0), Some(&Value::Int64(100)));
        assert!(!f.set_attribute(10, Value::Int64(999)));
    }

    #[test]
    fn test_resize_attributes() {
        let mut f = Feature::new(3, vec![Value::Int32(1)]);
        f.resize_attributes(3);
        assert_eq!(f.attributes(), &[Value::Int32(1), Value::Null, Value::Null]);
        f.resize_attributes(1);
        assert_eq!(f.attribute_count(), 1);
    }

    #[test]
    fn test_invalid_feature() {
        let f = Feature::invalid();
        assert!(!f.is_valid());
        assert_eq!(f.id(), INVALID_FEATURE_ID);
        assert!(!is_added_id(f.id()));
        assert!(is_added_id(-1));
        assert!(!is_added_id(0));
    }

    #[test]
    fn test_feature_equality() {
        let a = Feature::with_geometry(1, vec![Value::Int32(42)], Geometry::point(1.0, 2.0));
        let b = Feature::with_geometry(1, vec![Value::Int32(42)], Geometry::point(1.0, 2.0));
        let c = Feature::new(1, vec![Value::Int32(42)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
