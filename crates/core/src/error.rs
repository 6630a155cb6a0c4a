//! Error types for the vector layer engine.

use alloc::string::String;
use core::fmt;

/// Result type alias for engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types for engine operations.
///
/// "Not found" lookups are reported as `Ok(None)` or `false` by the calling
/// API rather than through this enum.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Failure reported by a backing data provider.
    Provider { message: String },
    /// Field name could not be resolved.
    FieldNotFound { name: String },
    /// Field index past the end of the schema.
    FieldIndexOutOfRange { index: usize, count: usize },
    /// Attempt to edit a joined or computed field.
    ReadOnlyField { name: String },
    /// Edit call without an active editing session.
    NotEditable { layer: String },
    /// Join whose target field depends on itself.
    JoinCycle { layer: String },
    /// A field with this name already exists.
    DuplicateField { name: String },
    /// Layer id not present in the registry.
    LayerNotFound { id: String },
    /// Invalid operation.
    InvalidOperation { message: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Provider { message } => write!(f, "Provider error: {}", message),
            Error::FieldNotFound { name } => write!(f, "Field not found: {}", name),
            Error::FieldIndexOutOfRange { index, count } => {
                write!(f, "Field index {} out of range (field count {})", index, count)
            }
            Error::ReadOnlyField { name } => write!(f, "Field {} is read-only", name),
            Error::NotEditable { layer } => write!(f, "Layer {} is not in editing mode", layer),
            Error::JoinCycle { layer } => {
                write!(f, "Join on layer {} would create a dependency cycle", layer)
            }
            Error::DuplicateField { name } => write!(f, "Duplicate field name: {}", name),
            Error::LayerNotFound { id } => write!(f, "Layer not found: {}", id),
            Error::InvalidOperation { message } => write!(f, "Invalid operation: {}", message),
        }
    }
}

impl Error {
    pub fn provider(message: impl Into<String>) -> Self {
        Error::Provider {
            message: message.into(),
        }
    }

    pub fn field_not_found(name: impl Into<String>) -> Self {
        Error::FieldNotFound { name: name.into() }
    }

    pub fn field_index_out_of_range(index: usize, count: usize) -> Self {
        Error::FieldIndexOutOfRange { index, count }
    }

    pub fn read_only_field(name: impl Into<String>) -> Self {
        Error::ReadOnlyField { name: name.into() }
    }

    pub fn not_editable(layer: impl Into<String>) -> Self {
        Error::NotEditable {
            layer: layer.into(),
        }
    }

    pub fn join_cycle(layer: impl Into<String>) -> Self {
        Error::JoinCycle {
            layer: layer.into(),
        }
    }

    pub fn duplicate_field(name: impl Into<String>) -> Self {
        Error::DuplicateField { name: name.into() }
    }

    pub fn layer_not_found(id: impl Into<String>) -> Self {
        Error::LayerNotFound { id: id.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_display() {
        let err = Error::provider("disk gone");
        assert!(err.to_string().contains("disk gone"));

        let err = Error::field_not_found("name");
        assert!(err.to_string().contains("name"));

        let err = Error::field_index_out_of_range(7, 3);
        assert_eq!(err.to_string(), "Field index 7 out of range (field count 3)");
    }

    #[test]
    fn test_error_constructors() {
        match Error::join_cycle("roads") {
            Error::JoinCycle { layer } => assert_eq!(layer, "roads"),
            _ => panic!("Wrong error type"),
        }
        assert_eq!(
            Error::not_editable("a"),
            Error::NotEditable { layer: "a".into() }
        );
    }
}
