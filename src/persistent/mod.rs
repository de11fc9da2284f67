//! Persistent (immutable) collections.
//!
//! This module provides the three collection types of the crate, all built
//! on structural sharing: a mutating operation returns a new collection that
//! shares every untouched node with its input.
//!
//! - [`PersistentVector`]: indexed sequence (radix balanced tree with an
//!   origin offset for cheap prepend)
//! - [`PersistentHashMap`]: unordered map (hash array mapped trie)
//! - [`PersistentSortedMap`]: ordered map (copy-on-write B+tree)
//!
//! # Structural Sharing
//!
//! Because no node is ever modified after it is linked into a published
//! root, any number of readers may traverse the same collection value
//! concurrently without synchronization, and writers never invalidate
//! readers: they produce new handles while the old ones stay valid.
//!
//! # Examples
//!
//! ## `PersistentVector`
//!
//! ```rust
//! use persimm::persistent::PersistentVector;
//!
//! let vector: PersistentVector<i32> = (0..100).collect();
//! assert_eq!(vector.get(50), Some(&50));
//!
//! // Structural sharing: the original vector is preserved
//! let updated = vector.update(50, 999).unwrap();
//! assert_eq!(vector.get(50), Some(&50));     // Original unchanged
//! assert_eq!(updated.get(50), Some(&999));   // New version
//! ```
//!
//! ## `PersistentHashMap`
//!
//! ```rust
//! use persimm::persistent::PersistentHashMap;
//!
//! let map = PersistentHashMap::new()
//!     .insert("one".to_string(), 1)
//!     .insert("two".to_string(), 2);
//! assert_eq!(map.get("one"), Some(&1));
//!
//! // Structural sharing: the original map is preserved
//! let updated = map.insert("one".to_string(), 100);
//! assert_eq!(map.get("one"), Some(&1));       // Original unchanged
//! assert_eq!(updated.get("one"), Some(&100)); // New version
//! ```
//!
//! ## `PersistentSortedMap`
//!
//! ```rust
//! use persimm::persistent::PersistentSortedMap;
//!
//! let map = PersistentSortedMap::new()
//!     .insert(3, "three")
//!     .insert(1, "one")
//!     .insert(2, "two");
//!
//! // Entries are always in sorted order
//! let keys: Vec<&i32> = map.keys().collect();
//! assert_eq!(keys, vec![&1, &2, &3]);
//! ```

// =============================================================================
// Reference Counter Type Alias
// =============================================================================

/// Reference-counted smart pointer type.
///
/// When the `arc` feature is enabled, this is `std::sync::Arc`, which allows
/// collection handles to be published across threads.
///
/// When the `arc` feature is disabled (default), this is `std::rc::Rc`,
/// which is faster but keeps handles on a single thread.
#[cfg(feature = "arc")]
pub(crate) type ReferenceCounter<T> = std::sync::Arc<T>;

#[cfg(not(feature = "arc"))]
pub(crate) type ReferenceCounter<T> = std::rc::Rc<T>;

mod hashmap;
mod sortedmap;
mod vector;

pub use hashmap::PersistentHashMap;
pub use hashmap::PersistentHashMapIntoIterator;
pub use hashmap::PersistentHashMapIterator;
pub use sortedmap::PersistentSortedMap;
pub use sortedmap::PersistentSortedMapIntoIterator;
pub use sortedmap::PersistentSortedMapIterator;
pub use sortedmap::PersistentSortedMapRangeIterator;
pub use vector::PersistentVector;
pub use vector::PersistentVectorIntoIterator;
pub use vector::PersistentVectorIterator;

// =============================================================================
// Tests
// =============================================================================
