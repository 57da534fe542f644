use std::fmt;

/// Unified error type for pool operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Handle recycled twice without an intervening get
    DoubleRecycle,

    /// Handle state inconsistent with any legal container transition
    StateInvariant,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DoubleRecycle => write!(f, "handle recycled multiple times"),
            Error::StateInvariant => write!(f, "handle state invariant violated"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::DoubleRecycle.to_string(),
            "handle recycled multiple times"
        );
        assert_eq!(
            Error::StateInvariant.to_string(),
            "handle state invariant violated"
        );
    }
}
