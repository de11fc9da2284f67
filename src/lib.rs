//! # persimm
//!
//! Persistent immutable collections for Rust: an indexed sequence, an
//! unordered map and an ordered map, all with structural sharing.
//!
//! ## Overview
//!
//! Every mutating operation returns a new collection value that observes the
//! mutation while the input remains unchanged; the two versions share every
//! node the operation did not touch. Independent holders of a collection may
//! therefore read it concurrently without synchronization.
//!
//! The three collections and their backing trees:
//!
//! - [`PersistentVector`](persistent::PersistentVector) - a radix balanced
//!   tree with branching factor 32 and an origin offset, giving O(log32 N)
//!   indexed access and amortized O(1) append *and* prepend.
//! - [`PersistentHashMap`](persistent::PersistentHashMap) - a hash array
//!   mapped trie with bitmap-indexed sparse nodes, dense array nodes above
//!   an occupancy threshold, and collision nodes for equal hashes.
//! - [`PersistentSortedMap`](persistent::PersistentSortedMap) - a
//!   copy-on-write B+tree with branching factor 32 and in-order, seekable
//!   iteration.
//!
//! Hashing and ordering are capabilities: the maps consume a
//! [`Hasher`](capability::Hasher) or [`Comparer`](capability::Comparer)
//! carried in the handle, with built-ins for integers, strings and byte
//! sequences.
//!
//! ## Feature Flags
//!
//! - `arc`: share nodes through `Arc` instead of `Rc`, so collection handles
//!   can be published across threads.
//!
//! ## Example
//!
//! ```rust
//! use persimm::prelude::*;
//!
//! let vector = PersistentVector::new().push_back(1).push_back(2);
//! let longer = vector.push_front(0);
//!
//! assert_eq!(vector.len(), 2);  // original unchanged
//! assert_eq!(longer.len(), 3);
//! assert_eq!(longer.get(0), Some(&0));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Prelude module for convenient imports.
///
/// Re-exports the collection types, the capability traits and the error
/// type.
///
/// # Usage
///
/// ```rust
/// use persimm::prelude::*;
/// ```
pub mod prelude {
    pub use crate::capability::*;
    pub use crate::error::Error;
    pub use crate::persistent::*;
}

pub mod capability;
pub mod error;
pub mod persistent;
