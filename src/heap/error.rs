use std::fmt;

use crate::formatted_size;

/// Failure to bring the collector up.
///
/// Once a [`CollectorContext`](super::collector::CollectorContext) exists no further
/// recoverable errors are produced: broken invariants during a cycle abort the process.
#[derive(Debug)]
pub enum CollectorError {
    /// The OS refused to map storage for one of the side tables.
    MetadataReservation {
        what: &'static str,
        bytes: usize,
        errno: errno::Errno,
    },
    InvalidConfiguration(String),
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetadataReservation { what, bytes, errno } => write!(
                f,
                "collector unavailable: failed to reserve {} for {}: {}",
                formatted_size(*bytes),
                what,
                errno
            ),
            Self::InvalidConfiguration(msg) => write!(f, "invalid collector configuration: {}", msg),
        }
    }
}

impl std::error::Error for CollectorError {}

impl CollectorError {
    pub(crate) fn reservation(what: &'static str, bytes: usize) -> Self {
        Self::MetadataReservation {
            what,
            bytes,
            errno: errno::errno(),
        }
    }
}
