//! Field and schema definitions.
//!
//! A layer schema is an ordered list of [`Field`]s. Each field records where
//! its value comes from via a [`FieldOrigin`]. Provider and edit fields always
//! form a prefix of the schema (the "stored" block); joined and expression
//! fields follow it.

use crate::error::{Error, Result};
use crate::types::DataType;
use crate::value::Value;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use hashbrown::HashMap;

/// Where a field's values come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldOrigin {
    /// Column `index` of the data provider.
    Provider { index: usize },
    /// Attribute added in the edit buffer, `index` into the added attributes.
    Edit { index: usize },
    /// Column `source_index` of the layer joined by join number `join_index`.
    Join { join_index: usize, source_index: usize },
    /// Expression field number `index`.
    Expression { index: usize },
}

impl FieldOrigin {
    /// Returns true for origins whose values are stored per feature.
    #[inline]
    pub fn is_stored(&self) -> bool {
        matches!(self, FieldOrigin::Provider { .. } | FieldOrigin::Edit { .. })
    }

    /// Returns true for origins computed while fetching.
    #[inline]
    pub fn is_virtual(&self) -> bool {
        !self.is_stored()
    }
}

/// A single schema field.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    name: String,
    data_type: DataType,
    origin: FieldOrigin,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, origin: FieldOrigin) -> Self {
        Self {
            name: name.into(),
            data_type,
            origin,
        }
    }

    /// Creates a provider field for column `index`.
    pub fn provider(name: impl Into<String>, data_type: DataType, index: usize) -> Self {
        Self::new(name, data_type, FieldOrigin::Provider { index })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    #[inline]
    pub fn origin(&self) -> FieldOrigin {
        self.origin
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_origin(mut self, origin: FieldOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Coerces a value to this field's data type.
    ///
    /// Null stays null. A value that cannot be represented in the field type
    /// becomes null.
    pub fn convert_compatible(&self, value: Value) -> Value {
        if value.is_null() || value.data_type() == Some(self.data_type) {
            return value;
        }
        let converted = match self.data_type {
            DataType::Boolean => match &value {
                Value::Int32(_) | Value::Int64(_) | Value::Float64(_) => {
                    value.to_f64().map(|v| Value::Boolean(v != 0.0))
                }
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" => Some(Value::Boolean(true)),
                    "false" | "f" | "0" => Some(Value::Boolean(false)),
                    _ => None,
                },
                _ => None,
            },
            DataType::Int32 => to_integer(&value)
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int32),
            DataType::Int64 => to_integer(&value).map(Value::Int64),
            DataType::DateTime => to_integer(&value).map(Value::DateTime),
            DataType::Float64 => match &value {
                Value::String(s) => s.trim().parse::<f64>().ok().map(Value::Float64),
                Value::Boolean(b) => Some(Value::Float64(if *b { 1.0 } else { 0.0 })),
                other => other.to_f64().map(Value::Float64),
            },
            DataType::String => Some(Value::String(value.to_key_string())),
            DataType::Bytes => match value {
                Value::String(s) => Some(Value::Bytes(s.into_bytes())),
                _ => None,
            },
        };
        converted.unwrap_or(Value::Null)
    }
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Boolean(b) => Some(*b as i64),
        Value::Float64(f) => {
            if f.is_finite() {
                Some(libm::round(*f) as i64)
            } else {
                None
            }
        }
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| libm::round(f) as i64))
        }
        other => other.to_i64(),
    }
}

/// Ordered field list with name lookup.
#[derive(Clone, Debug, Default)]
pub struct Fields {
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
    by_lower_name: HashMap<String, usize>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a schema from fields, failing on duplicate names.
    pub fn from_fields(fields: impl IntoIterator<Item = Field>) -> Result<Self> {
        let mut out = Fields::new();
        for field in fields {
            out.append(field)?;
        }
        Ok(out)
    }

    /// Appends a field. Names must be unique.
    pub fn append(&mut self, field: Field) -> Result<usize> {
        if self.by_name.contains_key(field.name()) {
            return Err(Error::duplicate_field(field.name()));
        }
        let index = self.fields.len();
        self.by_name.insert(field.name.clone(), index);
        self.by_lower_name
            .entry(field.name.to_lowercase())
            .or_insert(index);
        self.fields.push(field);
        Ok(index)
    }

    /// Removes the field at `index`, shifting later fields down.
    pub fn remove(&mut self, index: usize) -> Result<Field> {
        if index >= self.fields.len() {
            return Err(Error::field_index_out_of_range(index, self.fields.len()));
        }
        let field = self.fields.remove(index);
        self.rebuild_index();
        Ok(field)
    }

    fn rebuild_index(&mut self) {
        self.by_name.clear();
        self.by_lower_name.clear();
        for (i, f) in self.fields.iter().enumerate() {
            self.by_name.insert(f.name.clone(), i);
            self.by_lower_name.entry(f.name.to_lowercase()).or_insert(i);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Field> {
        self.fields.iter()
    }

    /// Exact name lookup.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Name lookup: exact match first, then case-insensitive.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index_of(name)
            .or_else(|| self.by_lower_name.get(&name.to_lowercase()).copied())
    }

    /// Like [`lookup`](Self::lookup) but reports a missing field as an error.
    pub fn require(&self, name: &str) -> Result<usize> {
        self.lookup(name).ok_or_else(|| Error::field_not_found(name))
    }

    pub fn origin(&self, index: usize) -> Option<FieldOrigin> {
        self.fields.get(index).map(|f| f.origin)
    }

    /// Number of provider and edit fields at the front of the schema.
    pub fn stored_count(&self) -> usize {
        self.fields
            .iter()
            .take_while(|f| f.origin.is_stored())
            .count()
    }

    /// Provider column read by the field at layer `index`.
    pub fn provider_index(&self, index: usize) -> Option<usize> {
        match self.origin(index)? {
            FieldOrigin::Provider { index } => Some(index),
            _ => None,
        }
    }

    /// Returns true if any field in `indices` is not a provider field.
    pub fn any_non_provider(&self, indices: impl IntoIterator<Item = usize>) -> bool {
        indices
            .into_iter()
            .any(|i| !matches!(self.origin(i), Some(FieldOrigin::Provider { .. })))
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.to_string()).collect()
    }
}

impl PartialEq for Fields {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl<'a> IntoIterator for &'a Fields {
    type Item = &'a Field;
    type IntoIter = core::slice::Iter<'a, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}
