//! Memory Error Definitions
//!
//! Error kinds for segment access and scope lifecycle. Each kind is a
//! distinct, caller-visible condition; none are retried or downgraded.

use std::fmt;

/// Errors raised by segment access or scope operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// A dynamic offset or length lies outside the segment.
    OutOfBounds {
        offset: u64,
        length: u64,
        segment_size: u64,
    },

    /// Offset arithmetic left the representable range.
    ArithmeticOverflow { message: String },

    /// The segment's scope has been closed.
    NotAlive,

    /// A confined resource was touched from the wrong thread.
    WrongThread { operation: &'static str },

    /// Write attempted through a read-only view.
    ReadOnly,

    /// The operation does not apply to this scope kind.
    UnsupportedOperation { message: String },

    /// One or more cleanup actions failed at scope close. The first
    /// failure is primary; the rest are preserved as suppressed causes.
    CleanupFailed {
        primary: String,
        suppressed: Vec<String>,
    },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfBounds {
                offset,
                length,
                segment_size,
            } => write!(
                f,
                "Out of bound access on segment: offset {}, length {}, segment size {}",
                offset, length, segment_size
            ),
            MemoryError::ArithmeticOverflow { message } => {
                write!(f, "integer overflow: {}", message)
            }
            MemoryError::NotAlive => write!(f, "Already closed"),
            MemoryError::WrongThread { operation } => {
                write!(f, "Attempted {} outside owning thread", operation)
            }
            MemoryError::ReadOnly => write!(f, "Attempt to write a read-only segment"),
            MemoryError::UnsupportedOperation { message } => write!(f, "{}", message),
            MemoryError::CleanupFailed {
                primary,
                suppressed,
            } => {
                write!(f, "cleanup action failed: {}", primary)?;
                for cause in suppressed {
                    write!(f, "; suppressed: {}", cause)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MemoryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditions_are_distinguishable() {
        assert_eq!(MemoryError::NotAlive.to_string(), "Already closed");
        assert_eq!(
            MemoryError::WrongThread { operation: "access" }.to_string(),
            "Attempted access outside owning thread"
        );
        assert_eq!(
            MemoryError::ReadOnly.to_string(),
            "Attempt to write a read-only segment"
        );
        let oob = MemoryError::OutOfBounds {
            offset: 8,
            length: 4,
            segment_size: 10,
        };
        assert!(oob.to_string().starts_with("Out of bound access on segment"));
    }

    #[test]
    fn test_cleanup_failure_preserves_all_messages() {
        let e = MemoryError::CleanupFailed {
            primary: "first".into(),
            suppressed: vec!["second".into(), "third".into()],
        };
        let text = e.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("suppressed: second"));
        assert!(text.contains("suppressed: third"));
    }
}
