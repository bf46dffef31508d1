//! Layout Error Definitions
//!
//! Error types for layout construction, path resolution, and the
//! checked offset arithmetic backing both.

use std::fmt;

/// Errors raised while building a layout or resolving a path against one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// An invariant was violated while constructing a layout.
    Construction { message: String },

    /// A static path does not fit the layout it was applied to.
    PathResolution { message: String },

    /// A runtime index handed to an unbound path element is outside the
    /// sequence it selects.
    IndexOutOfBounds { index: i64, count: u64 },

    /// Offset or size arithmetic left the representable range.
    ArithmeticOverflow { message: String },
}

impl LayoutError {
    pub(crate) fn construction(message: impl Into<String>) -> Self {
        LayoutError::Construction {
            message: message.into(),
        }
    }

    pub(crate) fn path(message: impl Into<String>) -> Self {
        LayoutError::PathResolution {
            message: message.into(),
        }
    }

    pub(crate) fn overflow(message: impl Into<String>) -> Self {
        LayoutError::ArithmeticOverflow {
            message: message.into(),
        }
    }
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::Construction { message } => write!(f, "{}", message),
            LayoutError::PathResolution { message } => {
                write!(f, "Bad layout path: {}", message)
            }
            LayoutError::IndexOutOfBounds { index, count } => {
                write!(
                    f,
                    "Index {} out of bounds for sequence of {} elements",
                    index, count
                )
            }
            LayoutError::ArithmeticOverflow { message } => {
                write!(f, "integer overflow: {}", message)
            }
        }
    }
}

impl std::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_greppable() {
        let e = LayoutError::path("attempting to select a sequence element from a non-sequence layout: i4");
        assert!(e.to_string().starts_with("Bad layout path:"));

        let e = LayoutError::IndexOutOfBounds { index: 7, count: 4 };
        assert_eq!(
            e.to_string(),
            "Index 7 out of bounds for sequence of 4 elements"
        );

        let e = LayoutError::overflow("sequence size");
        assert!(e.to_string().contains("integer overflow"));
    }
}
