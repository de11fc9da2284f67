//! Error type for collection operations.
//!
//! Operations on the persistent collections either succeed with a new
//! collection value or fail with one of the variants of [`Error`]. Failures
//! only arise from programming errors (an out-of-range slice bound, a missing
//! capability at construction); there are no runtime faults and nothing is
//! retried.

use std::error;
use std::fmt;

/// An error produced by a collection operation.
///
/// # Examples
///
/// ```rust
/// use persimm::error::Error;
/// use persimm::persistent::PersistentVector;
///
/// let vector: PersistentVector<i32> = (0..10).collect();
/// let result = vector.slice(4, 20);
///
/// assert_eq!(result.unwrap_err(), Error::IndexOutOfRange { index: 20, length: 10 });
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An index or bound was outside the permitted range of the collection.
    IndexOutOfRange {
        /// The offending index.
        index: usize,
        /// The length of the collection at the time of the call.
        length: usize,
    },
    /// A keyed collection was constructed without a capability and the key
    /// domain has no built-in default.
    NoCapability,
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange { index, length } => {
                write!(
                    formatter,
                    "index {index} out of range for collection of length {length}"
                )
            }
            Self::NoCapability => {
                write!(
                    formatter,
                    "no capability provided and the key domain has no built-in default"
                )
            }
        }
    }
}

impl error::Error for Error {}
