//! Persistent (immutable) ordered map based on a copy-on-write B+tree.
//!
//! This module provides [`PersistentSortedMap`], an immutable ordered map
//! that uses structural sharing for efficient operations.
//!
//! # Overview
//!
//! `PersistentSortedMap` is a B+tree with branching factor 32: every entry
//! lives in a leaf, interior nodes hold (separator, child) pairs where the
//! separator is the smallest key of the child's subtree, and every non-root
//! node stays between half-full and full. Ordering comes from a [`Comparer`]
//! capability carried inside the handle.
//!
//! - O(log N) `get`, `insert`, `remove`
//! - O(log N) `min` / `max`
//! - O(log N + k) range queries over k results
//! - O(1) `len` and `is_empty`
//!
//! All operations return new maps without modifying the original. A write
//! clones only the path from the root to the touched leaf; splits on the way
//! up grow the tree and merges shrink it, so the height always matches the
//! entry count.
//!
//! # Examples
//!
//! ```rust
//! use persimm::persistent::PersistentSortedMap;
//!
//! let map = PersistentSortedMap::new()
//!     .insert("c", 3)
//!     .insert("a", 1)
//!     .insert("b", 2);
//!
//! // Entries are always in sorted key order
//! let keys: Vec<&&str> = map.keys().collect();
//! assert_eq!(keys, vec![&"a", &"b", &"c"]);
//!
//! // Structural sharing: the original map is preserved
//! let updated = map.insert("a", 100);
//! assert_eq!(map.get(&"a"), Some(&1));      // Original unchanged
//! assert_eq!(updated.get(&"a"), Some(&100)); // New version
//! ```

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::iter::{FromIterator, FusedIterator};
use std::ops::{Bound, RangeBounds};

use smallvec::{SmallVec, smallvec};

use super::ReferenceCounter;
use crate::capability::{Comparer, DefaultComparer, SortKey};
use crate::error::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of entries per node
const NODE_CAPACITY: usize = 32;

/// Minimum number of entries per non-root node
const MIN_OCCUPANCY: usize = NODE_CAPACITY / 2;

// =============================================================================
// Node Definition
// =============================================================================

/// A leaf node: the sorted run of key-value entries it covers.
#[derive(Clone)]
struct LeafNode<K, V> {
    entries: SmallVec<[(K, V); NODE_CAPACITY]>,
}

/// An interior node: sorted (separator, child) pairs where each separator is
/// the smallest key of its child's subtree.
#[derive(Clone)]
struct InternalNode<K, V> {
    entries: SmallVec<[(K, Node<K, V>); NODE_CAPACITY]>,
}

/// Internal node structure for the B+tree.
#[derive(Clone)]
enum Node<K, V> {
    /// Interior node holding separators and children
    Internal(ReferenceCounter<InternalNode<K, V>>),
    /// Leaf node holding the entries
    Leaf(ReferenceCounter<LeafNode<K, V>>),
}

// =============================================================================
// PersistentSortedMap Definition
// =============================================================================

/// A persistent (immutable) ordered map based on a copy-on-write B+tree.
///
/// `PersistentSortedMap` is an immutable data structure that uses structural
/// sharing to efficiently support functional programming patterns. Key order
/// comes from a [`Comparer`] capability carried inside the handle;
/// [`new`](Self::new) selects the built-in capability for the key domain,
/// and [`with_comparer`](Self::with_comparer) accepts any other.
///
/// # Time Complexity
///
/// | Operation      | Complexity        |
/// |----------------|-------------------|
/// | `new`          | O(1)              |
/// | `get`          | O(log N)          |
/// | `insert`       | O(log N)          |
/// | `remove`       | O(log N)          |
/// | `contains_key` | O(log N)          |
/// | `min`/`max`    | O(log N)          |
/// | `range`        | O(log N + k)      |
/// | `len`          | O(1)              |
/// | `is_empty`     | O(1)              |
///
/// # Examples
///
/// ```rust
/// use persimm::persistent::PersistentSortedMap;
///
/// let map = PersistentSortedMap::singleton(42, "answer");
/// assert_eq!(map.get(&42), Some(&"answer"));
/// ```
#[derive(Clone)]
pub struct PersistentSortedMap<K, V, C = DefaultComparer> {
    /// Root node of the tree
    root: Option<Node<K, V>>,
    /// Number of entries
    length: usize,
    /// Ordering capability
    comparer: C,
}

impl<K: SortKey, V> PersistentSortedMap<K, V> {
    /// Creates a new empty map using the key domain's built-in capability.
    ///
    /// Available when the key domain is one of the built-ins (integers,
    /// strings, byte sequences); other domains construct through
    /// [`with_comparer`](Self::with_comparer) or
    /// [`from_comparer`](Self::from_comparer).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map: PersistentSortedMap<i32, String> = PersistentSortedMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparer(DefaultComparer)
    }
}

impl<K: SortKey + Clone, V: Clone> PersistentSortedMap<K, V> {
    /// Creates a map containing a single key-value pair.
    ///
    /// # Arguments
    ///
    /// * `key` - The key
    /// * `value` - The value
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::singleton(42, "answer");
    /// assert_eq!(map.len(), 1);
    /// assert_eq!(map.get(&42), Some(&"answer"));
    /// ```
    #[inline]
    #[must_use]
    pub fn singleton(key: K, value: V) -> Self {
        Self::new().insert(key, value)
    }
}

impl<K, V, C> PersistentSortedMap<K, V, C> {
    /// Creates a new empty map with an explicit ordering capability.
    ///
    /// # Arguments
    ///
    /// * `comparer` - The capability used to order keys
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::capability::IntegerComparer;
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map: PersistentSortedMap<i32, &str, IntegerComparer> =
    ///     PersistentSortedMap::with_comparer(IntegerComparer);
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn with_comparer(comparer: C) -> Self {
        Self {
            root: None,
            length: 0,
            comparer,
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// # Complexity
    ///
    /// O(1)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert(1, "one")
    ///     .insert(2, "two");
    /// assert_eq!(map.len(), 2);
    /// ```
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if the map contains no entries.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let empty: PersistentSortedMap<i32, String> = PersistentSortedMap::new();
    /// assert!(empty.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the entry with the minimum key.
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert(3, "three")
    ///     .insert(1, "one")
    ///     .insert(2, "two");
    ///
    /// assert_eq!(map.min(), Some((&1, &"one")));
    /// ```
    #[must_use]
    pub fn min(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_ref()?;
        loop {
            match node {
                Node::Internal(internal) => node = &internal.entries.first()?.1,
                Node::Leaf(leaf) => {
                    return leaf.entries.first().map(|(key, value)| (key, value));
                }
            }
        }
    }

    /// Returns the entry with the maximum key.
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert(3, "three")
    ///     .insert(1, "one")
    ///     .insert(2, "two");
    ///
    /// assert_eq!(map.max(), Some((&3, &"three")));
    /// ```
    #[must_use]
    pub fn max(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_ref()?;
        loop {
            match node {
                Node::Internal(internal) => node = &internal.entries.last()?.1,
                Node::Leaf(leaf) => {
                    return leaf.entries.last().map(|(key, value)| (key, value));
                }
            }
        }
    }

    /// Returns an iterator over entries in sorted key order.
    ///
    /// The iterator walks the frozen tree through a stack of cursor frames,
    /// supports reverse iteration through [`DoubleEndedIterator`], and never
    /// touches the map itself.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert(3, "three")
    ///     .insert(1, "one")
    ///     .insert(2, "two");
    ///
    /// let keys: Vec<&i32> = map.iter().map(|(key, _)| key).collect();
    /// assert_eq!(keys, vec![&1, &2, &3]);
    /// ```
    #[must_use]
    pub fn iter(&self) -> PersistentSortedMapIterator<'_, K, V> {
        let (front, back) = self.root.as_ref().map_or_else(
            || (Cursor::empty(), Cursor::empty()),
            |root| {
                let mut front = Cursor::empty();
                front.push_leftmost(root);
                let mut back = Cursor::empty();
                back.push_rightmost(root);
                (front, back)
            },
        );

        PersistentSortedMapIterator {
            front,
            back,
            remaining: self.length,
        }
    }

    /// Returns an iterator over keys in sorted order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert(3, "three")
    ///     .insert(1, "one");
    ///
    /// let keys: Vec<&i32> = map.keys().collect();
    /// assert_eq!(keys, vec![&1, &3]);
    /// ```
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over values in key order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert(1, 10)
    ///     .insert(2, 20);
    ///
    /// let sum: i32 = map.values().sum();
    /// assert_eq!(sum, 30);
    /// ```
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    /// Returns the number of entries held by a node.
    fn node_size(node: &Node<K, V>) -> usize {
        match node {
            Node::Internal(internal) => internal.entries.len(),
            Node::Leaf(leaf) => leaf.entries.len(),
        }
    }

    /// Returns the smallest key of a node's subtree.
    ///
    /// Linked nodes are never empty, so the first entry always exists.
    fn node_key(node: &Node<K, V>) -> &K {
        match node {
            Node::Internal(internal) => &internal.entries[0].0,
            Node::Leaf(leaf) => &leaf.entries[0].0,
        }
    }
}

impl<K, V, C: Comparer<K>> PersistentSortedMap<K, V, C> {
    /// Creates a new empty map, resolving a missing capability to the
    /// domain's built-in default.
    ///
    /// Passing `Some(comparer)` behaves like
    /// [`with_comparer`](Self::with_comparer). Passing `None` asks the
    /// capability type for its built-in default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCapability`] when `comparer` is `None` and the
    /// capability type has no built-in default.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::capability::IntegerComparer;
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map: PersistentSortedMap<i32, &str, IntegerComparer> =
    ///     PersistentSortedMap::from_comparer(None).unwrap();
    /// assert!(map.is_empty());
    /// ```
    pub fn from_comparer(comparer: Option<C>) -> Result<Self, Error> {
        comparer
            .or_else(|| C::default_capability())
            .map(Self::with_comparer)
            .ok_or(Error::NoCapability)
    }
}

impl<K: Clone, V: Clone, C: Comparer<K> + Clone> PersistentSortedMap<K, V, C> {
    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but the
    /// capability must order the borrowed form consistently with the owned
    /// form.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to look up
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert("hello".to_string(), 42);
    ///
    /// // Can use &str to look up String keys
    /// assert_eq!(map.get("hello"), Some(&42));
    /// assert_eq!(map.get("world"), None);
    /// ```
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
    {
        let mut node = self.root.as_ref()?;
        loop {
            match node {
                Node::Internal(internal) => {
                    let index = Self::child_index(&self.comparer, &internal.entries, key);
                    node = &internal.entries[index].1;
                }
                Node::Leaf(leaf) => {
                    return Self::search_entries(&self.comparer, &leaf.entries, key)
                        .ok()
                        .map(|index| &leaf.entries[index].1);
                }
            }
        }
    }

    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to check
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert("key".to_string(), 42);
    ///
    /// assert!(map.contains_key("key"));
    /// assert!(!map.contains_key("other"));
    /// ```
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
    {
        self.get(key).is_some()
    }

    /// Binary-searches a run of entries for a key.
    fn search_entries<Q, E>(comparer: &C, entries: &[(K, E)], key: &Q) -> Result<usize, usize>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
    {
        entries.binary_search_by(|(entry_key, _)| {
            Comparer::<Q>::compare(comparer, entry_key.borrow(), key)
        })
    }

    /// Returns the index of the child whose subtree covers the key: the last
    /// separator at most the key, clamped to the first child for keys below
    /// every separator.
    fn child_index<Q>(comparer: &C, entries: &[(K, Node<K, V>)], key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
    {
        match Self::search_entries(comparer, entries, key) {
            Ok(index) => index,
            Err(0) => 0,
            Err(index) => index - 1,
        }
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the map already contains the key, the value is replaced and the
    /// length is unchanged.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to insert
    /// * `value` - The value to insert
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map1 = PersistentSortedMap::new().insert(1, "one");
    /// let map2 = map1.insert(1, "ONE");
    ///
    /// assert_eq!(map1.get(&1), Some(&"one")); // Original unchanged
    /// assert_eq!(map2.get(&1), Some(&"ONE")); // New version
    /// ```
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        let Some(root) = self.root.as_ref() else {
            return Self {
                root: Some(Node::Leaf(ReferenceCounter::new(LeafNode {
                    entries: smallvec![(key, value)],
                }))),
                length: 1,
                comparer: self.comparer.clone(),
            };
        };

        let (node, split, added) = Self::insert_into_node(&self.comparer, root, key, value);
        let new_root = match split {
            None => node,
            Some((separator, right)) => {
                // The root split: a new root one level up holds both halves
                let left_key = Self::node_key(&node).clone();
                let entries: SmallVec<[(K, Node<K, V>); NODE_CAPACITY]> =
                    smallvec![(left_key, node), (separator, right)];
                Node::Internal(ReferenceCounter::new(InternalNode { entries }))
            }
        };

        Self {
            root: Some(new_root),
            length: if added { self.length + 1 } else { self.length },
            comparer: self.comparer.clone(),
        }
    }

    /// Recursive helper for insert.
    /// Returns the rebuilt node, the (separator, sibling) pair produced by a
    /// split, and whether a new entry was added.
    #[allow(clippy::type_complexity)]
    fn insert_into_node(
        comparer: &C,
        node: &Node<K, V>,
        key: K,
        value: V,
    ) -> (Node<K, V>, Option<(K, Node<K, V>)>, bool) {
        match node {
            Node::Leaf(leaf) => {
                let mut entries = leaf.entries.clone();
                match Self::search_entries(comparer, &entries, &key) {
                    Ok(index) => {
                        entries[index] = (key, value);
                        (
                            Node::Leaf(ReferenceCounter::new(LeafNode { entries })),
                            None,
                            false,
                        )
                    }
                    Err(index) => {
                        entries.insert(index, (key, value));
                        if entries.len() > NODE_CAPACITY {
                            let (separator, right) = Self::split_entries(&mut entries);
                            (
                                Node::Leaf(ReferenceCounter::new(LeafNode { entries })),
                                Some((
                                    separator,
                                    Node::Leaf(ReferenceCounter::new(LeafNode { entries: right })),
                                )),
                                true,
                            )
                        } else {
                            (
                                Node::Leaf(ReferenceCounter::new(LeafNode { entries })),
                                None,
                                true,
                            )
                        }
                    }
                }
            }
            Node::Internal(internal) => {
                let index = Self::child_index(comparer, &internal.entries, &key);
                let (new_child, split, added) =
                    Self::insert_into_node(comparer, &internal.entries[index].1, key, value);

                let mut entries = internal.entries.clone();
                entries[index] = (Self::node_key(&new_child).clone(), new_child);
                if let Some((separator, right)) = split {
                    entries.insert(index + 1, (separator, right));
                }

                if entries.len() > NODE_CAPACITY {
                    let (separator, right) = Self::split_entries(&mut entries);
                    (
                        Node::Internal(ReferenceCounter::new(InternalNode { entries })),
                        Some((
                            separator,
                            Node::Internal(ReferenceCounter::new(InternalNode { entries: right })),
                        )),
                        added,
                    )
                } else {
                    (
                        Node::Internal(ReferenceCounter::new(InternalNode { entries })),
                        None,
                        added,
                    )
                }
            }
        }
    }

    /// Splits an overflowing entry run at the median, leaving the left half
    /// in place and returning the right half with its separator.
    #[allow(clippy::type_complexity)]
    fn split_entries<E: Clone>(
        entries: &mut SmallVec<[(K, E); NODE_CAPACITY]>,
    ) -> (K, SmallVec<[(K, E); NODE_CAPACITY]>) {
        let median = entries.len() / 2;
        let right: SmallVec<[(K, E); NODE_CAPACITY]> = entries.drain(median..).collect();
        let separator = right[0].0.clone();
        (separator, right)
    }

    /// Removes a key from the map.
    ///
    /// Returns a new map without the key. If the key is absent the returned
    /// map shares its root with the input, so no nodes are copied.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to remove
    ///
    /// # Complexity
    ///
    /// O(log N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map = PersistentSortedMap::new()
    ///     .insert(1, "one")
    ///     .insert(2, "two");
    /// let removed = map.remove(&1);
    ///
    /// assert_eq!(map.len(), 2);     // Original unchanged
    /// assert_eq!(removed.len(), 1); // New version
    /// assert_eq!(removed.get(&1), None);
    /// ```
    #[must_use]
    pub fn remove<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
    {
        let Some(root) = self.root.as_ref() else {
            return self.clone();
        };
        let Some(new_root) = Self::remove_from_node(&self.comparer, root, key) else {
            return self.clone();
        };

        // Collapse trivial roots: an empty leaf empties the map, and an
        // interior root left with a single child hands the root to it
        let root = match new_root {
            Node::Leaf(leaf) if leaf.entries.is_empty() => None,
            Node::Internal(internal) if internal.entries.len() == 1 => {
                Some(internal.entries[0].1.clone())
            }
            other => Some(other),
        };

        Self {
            root,
            length: self.length.saturating_sub(1),
            comparer: self.comparer.clone(),
        }
    }

    /// Recursive helper for remove.
    /// Returns `Some(new_node)` if the key was present, `None` otherwise.
    /// The returned node may be underfull; the caller rebalances it.
    fn remove_from_node<Q>(comparer: &C, node: &Node<K, V>, key: &Q) -> Option<Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
    {
        match node {
            Node::Leaf(leaf) => {
                let index = Self::search_entries(comparer, &leaf.entries, key).ok()?;
                let mut entries = leaf.entries.clone();
                entries.remove(index);
                Some(Node::Leaf(ReferenceCounter::new(LeafNode { entries })))
            }
            Node::Internal(internal) => {
                let index = Self::child_index(comparer, &internal.entries, key);
                let new_child = Self::remove_from_node(comparer, &internal.entries[index].1, key)?;

                let mut entries = internal.entries.clone();
                if Self::node_size(&new_child) < MIN_OCCUPANCY {
                    Self::rebalance(&mut entries, index, new_child);
                } else {
                    entries[index] = (Self::node_key(&new_child).clone(), new_child);
                }

                Some(Node::Internal(ReferenceCounter::new(InternalNode {
                    entries,
                })))
            }
        }
    }

    /// Restores the occupancy invariant for an underfull child: borrow one
    /// entry from a sibling that can spare it, otherwise merge with a
    /// sibling and drop the orphaned separator.
    fn rebalance(
        entries: &mut SmallVec<[(K, Node<K, V>); NODE_CAPACITY]>,
        index: usize,
        child: Node<K, V>,
    ) {
        if index > 0 && Self::node_size(&entries[index - 1].1) > MIN_OCCUPANCY {
            let (left, child) = Self::borrow_from_left(&entries[index - 1].1, &child);
            entries[index - 1].1 = left;
            entries[index] = (Self::node_key(&child).clone(), child);
        } else if index + 1 < entries.len()
            && Self::node_size(&entries[index + 1].1) > MIN_OCCUPANCY
        {
            let (child, right) = Self::borrow_from_right(&child, &entries[index + 1].1);
            entries[index] = (Self::node_key(&child).clone(), child);
            entries[index + 1] = (Self::node_key(&right).clone(), right);
        } else if index > 0 {
            let merged = Self::merge_siblings(&entries[index - 1].1, &child);
            entries[index - 1] = (Self::node_key(&merged).clone(), merged);
            entries.remove(index);
        } else if index + 1 < entries.len() {
            let merged = Self::merge_siblings(&child, &entries[index + 1].1);
            entries[index] = (Self::node_key(&merged).clone(), merged);
            entries.remove(index + 1);
        } else {
            // A lone child only occurs at the root, which the caller
            // collapses
            entries[index] = (Self::node_key(&child).clone(), child);
        }
    }

    /// Moves the last entry of `left` to the front of `child`.
    fn borrow_from_left(left: &Node<K, V>, child: &Node<K, V>) -> (Node<K, V>, Node<K, V>) {
        match (left, child) {
            (Node::Leaf(left_leaf), Node::Leaf(child_leaf)) => {
                let mut left_entries = left_leaf.entries.clone();
                match left_entries.pop() {
                    Some(moved) => {
                        let mut child_entries = child_leaf.entries.clone();
                        child_entries.insert(0, moved);
                        (
                            Node::Leaf(ReferenceCounter::new(LeafNode {
                                entries: left_entries,
                            })),
                            Node::Leaf(ReferenceCounter::new(LeafNode {
                                entries: child_entries,
                            })),
                        )
                    }
                    None => (left.clone(), child.clone()),
                }
            }
            (Node::Internal(left_internal), Node::Internal(child_internal)) => {
                let mut left_entries = left_internal.entries.clone();
                match left_entries.pop() {
                    Some(moved) => {
                        let mut child_entries = child_internal.entries.clone();
                        child_entries.insert(0, moved);
                        (
                            Node::Internal(ReferenceCounter::new(InternalNode {
                                entries: left_entries,
                            })),
                            Node::Internal(ReferenceCounter::new(InternalNode {
                                entries: child_entries,
                            })),
                        )
                    }
                    None => (left.clone(), child.clone()),
                }
            }
            // Siblings always share a height
            _ => (left.clone(), child.clone()),
        }
    }

    /// Moves the first entry of `right` to the back of `child`.
    fn borrow_from_right(child: &Node<K, V>, right: &Node<K, V>) -> (Node<K, V>, Node<K, V>) {
        match (child, right) {
            (Node::Leaf(child_leaf), Node::Leaf(right_leaf)) => {
                let mut right_entries = right_leaf.entries.clone();
                let moved = right_entries.remove(0);
                let mut child_entries = child_leaf.entries.clone();
                child_entries.push(moved);
                (
                    Node::Leaf(ReferenceCounter::new(LeafNode {
                        entries: child_entries,
                    })),
                    Node::Leaf(ReferenceCounter::new(LeafNode {
                        entries: right_entries,
                    })),
                )
            }
            (Node::Internal(child_internal), Node::Internal(right_internal)) => {
                let mut right_entries = right_internal.entries.clone();
                let moved = right_entries.remove(0);
                let mut child_entries = child_internal.entries.clone();
                child_entries.push(moved);
                (
                    Node::Internal(ReferenceCounter::new(InternalNode {
                        entries: child_entries,
                    })),
                    Node::Internal(ReferenceCounter::new(InternalNode {
                        entries: right_entries,
                    })),
                )
            }
            // Siblings always share a height
            _ => (child.clone(), right.clone()),
        }
    }

    /// Concatenates two siblings into one node.
    fn merge_siblings(left: &Node<K, V>, right: &Node<K, V>) -> Node<K, V> {
        match (left, right) {
            (Node::Leaf(left_leaf), Node::Leaf(right_leaf)) => {
                let mut entries = left_leaf.entries.clone();
                entries.extend(right_leaf.entries.iter().cloned());
                Node::Leaf(ReferenceCounter::new(LeafNode { entries }))
            }
            (Node::Internal(left_internal), Node::Internal(right_internal)) => {
                let mut entries = left_internal.entries.clone();
                entries.extend(right_internal.entries.iter().cloned());
                Node::Internal(ReferenceCounter::new(InternalNode { entries }))
            }
            // Siblings always share a height
            _ => left.clone(),
        }
    }

    /// Returns an iterator over the entries whose keys fall within the
    /// range.
    ///
    /// This is the seek surface of the map: `range(k..)` positions a forward
    /// iterator at the least key greater than or equal to `k`, and
    /// `range(..=k).next_back()` yields the greatest key less than or equal
    /// to `k`. Inverted ranges yield nothing.
    ///
    /// # Arguments
    ///
    /// * `range` - Any standard range over a borrowed form of the key
    ///
    /// # Complexity
    ///
    /// O(log N) to position, O(1) amortized per step
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentSortedMap;
    ///
    /// let map: PersistentSortedMap<i32, i32> = (0..10).map(|key| (key, key * 10)).collect();
    ///
    /// let window: Vec<i32> = map.range(3..6).map(|(key, _)| *key).collect();
    /// assert_eq!(window, vec![3, 4, 5]);
    ///
    /// assert_eq!(map.range(4..).next(), Some((&4, &40)));
    /// assert_eq!(map.range(..=7).next_back(), Some((&7, &70)));
    /// ```
    #[must_use]
    pub fn range<Q, R>(&self, range: R) -> PersistentSortedMapRangeIterator<'_, K, V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
        R: RangeBounds<Q>,
    {
        let front = match range.start_bound() {
            Bound::Unbounded => self.cursor_first(),
            Bound::Included(key) => self.cursor_at_least(key),
            Bound::Excluded(key) => {
                let mut cursor = self.cursor_at_least(key);
                let at_bound = cursor.entry().is_some_and(|(entry_key, _)| {
                    Comparer::<Q>::compare(&self.comparer, entry_key.borrow(), key)
                        == Ordering::Equal
                });
                if at_bound {
                    cursor.advance();
                }
                cursor
            }
        };

        let back = match range.end_bound() {
            Bound::Unbounded => self.cursor_last(),
            Bound::Included(key) => self.cursor_at_most(key),
            Bound::Excluded(key) => {
                let mut cursor = self.cursor_at_most(key);
                let at_bound = cursor.entry().is_some_and(|(entry_key, _)| {
                    Comparer::<Q>::compare(&self.comparer, entry_key.borrow(), key)
                        == Ordering::Equal
                });
                if at_bound {
                    cursor.retreat();
                }
                cursor
            }
        };

        let exhausted = match (front.entry(), back.entry()) {
            (Some((front_key, _)), Some((back_key, _))) => {
                Comparer::<K>::compare(&self.comparer, front_key, back_key) == Ordering::Greater
            }
            _ => true,
        };

        PersistentSortedMapRangeIterator {
            front,
            back,
            exhausted,
        }
    }

    /// Builds a cursor at the first entry.
    fn cursor_first(&self) -> Cursor<'_, K, V> {
        let mut cursor = Cursor::empty();
        if let Some(root) = self.root.as_ref() {
            cursor.push_leftmost(root);
        }
        cursor
    }

    /// Builds a cursor at the last entry.
    fn cursor_last(&self) -> Cursor<'_, K, V> {
        let mut cursor = Cursor::empty();
        if let Some(root) = self.root.as_ref() {
            cursor.push_rightmost(root);
        }
        cursor
    }

    /// Builds a cursor at the least entry with key at least `key`.
    fn cursor_at_least<Q>(&self, key: &Q) -> Cursor<'_, K, V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
    {
        let Some(root) = self.root.as_ref() else {
            return Cursor::empty();
        };

        let mut cursor = Cursor::empty();
        let mut node = root;
        loop {
            match node {
                Node::Internal(internal) => {
                    let index = Self::child_index(&self.comparer, &internal.entries, key);
                    cursor.stack.push((internal, index));
                    node = &internal.entries[index].1;
                }
                Node::Leaf(leaf) => {
                    match Self::search_entries(&self.comparer, &leaf.entries, key) {
                        Ok(index) => cursor.leaf = Some((leaf, index)),
                        Err(index) if index < leaf.entries.len() => {
                            cursor.leaf = Some((leaf, index));
                        }
                        Err(_) if leaf.entries.is_empty() => cursor.leaf = None,
                        Err(_) => {
                            // Past this leaf: step onto its successor
                            cursor.leaf = Some((leaf, leaf.entries.len() - 1));
                            cursor.advance();
                        }
                    }
                    return cursor;
                }
            }
        }
    }

    /// Builds a cursor at the greatest entry with key at most `key`.
    fn cursor_at_most<Q>(&self, key: &Q) -> Cursor<'_, K, V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparer<Q>,
    {
        let Some(root) = self.root.as_ref() else {
            return Cursor::empty();
        };

        let mut cursor = Cursor::empty();
        let mut node = root;
        loop {
            match node {
                Node::Internal(internal) => {
                    let index = Self::child_index(&self.comparer, &internal.entries, key);
                    cursor.stack.push((internal, index));
                    node = &internal.entries[index].1;
                }
                Node::Leaf(leaf) => {
                    match Self::search_entries(&self.comparer, &leaf.entries, key) {
                        Ok(index) => cursor.leaf = Some((leaf, index)),
                        Err(index) if index > 0 => cursor.leaf = Some((leaf, index - 1)),
                        Err(_) if leaf.entries.is_empty() => cursor.leaf = None,
                        Err(_) => {
                            // Before this leaf: step onto its predecessor
                            cursor.leaf = Some((leaf, 0));
                            cursor.retreat();
                        }
                    }
                    return cursor;
                }
            }
        }
    }
}

// =============================================================================
// Iterator Implementation
// =============================================================================

/// A cursor into the frozen tree: a stack of interior frames terminating in
/// a leaf position.
struct Cursor<'a, K, V> {
    stack: SmallVec<[(&'a InternalNode<K, V>, usize); 8]>,
    leaf: Option<(&'a LeafNode<K, V>, usize)>,
}

impl<'a, K, V> Cursor<'a, K, V> {
    /// An exhausted cursor pointing at nothing.
    fn empty() -> Self {
        Cursor {
            stack: SmallVec::new(),
            leaf: None,
        }
    }

    /// Descends along first children to the smallest entry under `node`.
    fn push_leftmost(&mut self, mut node: &'a Node<K, V>) {
        loop {
            match node {
                Node::Internal(internal) => {
                    self.stack.push((internal, 0));
                    node = &internal.entries[0].1;
                }
                Node::Leaf(leaf) => {
                    self.leaf = if leaf.entries.is_empty() {
                        None
                    } else {
                        Some((leaf, 0))
                    };
                    return;
                }
            }
        }
    }

    /// Descends along last children to the greatest entry under `node`.
    fn push_rightmost(&mut self, mut node: &'a Node<K, V>) {
        loop {
            match node {
                Node::Internal(internal) => {
                    let last = internal.entries.len() - 1;
                    self.stack.push((internal, last));
                    node = &internal.entries[last].1;
                }
                Node::Leaf(leaf) => {
                    self.leaf = if leaf.entries.is_empty() {
                        None
                    } else {
                        Some((leaf, leaf.entries.len() - 1))
                    };
                    return;
                }
            }
        }
    }

    /// Returns the entry under the cursor.
    fn entry(&self) -> Option<(&'a K, &'a V)> {
        self.leaf.map(|(leaf, index)| {
            let (key, value) = &leaf.entries[index];
            (key, value)
        })
    }

    /// Moves the cursor one entry forward, unwinding across leaf boundaries.
    fn advance(&mut self) {
        let Some((leaf, index)) = self.leaf else {
            return;
        };

        if index + 1 < leaf.entries.len() {
            self.leaf = Some((leaf, index + 1));
            return;
        }

        while let Some((internal, child_index)) = self.stack.pop() {
            if child_index + 1 < internal.entries.len() {
                self.stack.push((internal, child_index + 1));
                let child = &internal.entries[child_index + 1].1;
                self.push_leftmost(child);
                return;
            }
        }

        self.leaf = None;
    }

    /// Moves the cursor one entry backward, unwinding across leaf
    /// boundaries.
    fn retreat(&mut self) {
        let Some((leaf, index)) = self.leaf else {
            return;
        };

        if index > 0 {
            self.leaf = Some((leaf, index - 1));
            return;
        }

        while let Some((internal, child_index)) = self.stack.pop() {
            if child_index > 0 {
                self.stack.push((internal, child_index - 1));
                let child = &internal.entries[child_index - 1].1;
                self.push_rightmost(child);
                return;
            }
        }

        self.leaf = None;
    }

    /// Returns `true` if two cursors sit on the same entry.
    fn same_position(front: &Self, back: &Self) -> bool {
        match (front.leaf, back.leaf) {
            (Some((front_leaf, front_index)), Some((back_leaf, back_index))) => {
                std::ptr::eq(front_leaf, back_leaf) && front_index == back_index
            }
            _ => false,
        }
    }
}

/// An iterator over entries of a [`PersistentSortedMap`] in key order.
pub struct PersistentSortedMapIterator<'a, K, V> {
    front: Cursor<'a, K, V>,
    back: Cursor<'a, K, V>,
    remaining: usize,
}

impl<'a, K, V> Iterator for PersistentSortedMapIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let entry = self.front.entry()?;
        self.remaining -= 1;
        self.front.advance();
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> DoubleEndedIterator for PersistentSortedMapIterator<'_, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let entry = self.back.entry()?;
        self.remaining -= 1;
        self.back.retreat();
        Some(entry)
    }
}

impl<K, V> ExactSizeIterator for PersistentSortedMapIterator<'_, K, V> {
    fn len(&self) -> usize {
        self.remaining
    }
}

impl<K, V> FusedIterator for PersistentSortedMapIterator<'_, K, V> {}

/// An iterator over a key range of a [`PersistentSortedMap`].
///
/// Created by [`PersistentSortedMap::range`]; iterates forward from the
/// lower bound and backward from the upper bound.
pub struct PersistentSortedMapRangeIterator<'a, K, V> {
    front: Cursor<'a, K, V>,
    back: Cursor<'a, K, V>,
    exhausted: bool,
}

impl<'a, K, V> Iterator for PersistentSortedMapRangeIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let entry = self.front.entry();
        if entry.is_none() {
            self.exhausted = true;
            return None;
        }

        if Cursor::same_position(&self.front, &self.back) {
            self.exhausted = true;
        } else {
            self.front.advance();
        }
        entry
    }
}

impl<K, V> DoubleEndedIterator for PersistentSortedMapRangeIterator<'_, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let entry = self.back.entry();
        if entry.is_none() {
            self.exhausted = true;
            return None;
        }

        if Cursor::same_position(&self.front, &self.back) {
            self.exhausted = true;
        } else {
            self.back.retreat();
        }
        entry
    }
}

impl<K, V> FusedIterator for PersistentSortedMapRangeIterator<'_, K, V> {}

/// An owning iterator over entries of a [`PersistentSortedMap`] in key
/// order.
pub struct PersistentSortedMapIntoIterator<K, V> {
    entries: std::vec::IntoIter<(K, V)>,
}

impl<K, V> Iterator for PersistentSortedMapIntoIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl<K, V> ExactSizeIterator for PersistentSortedMapIntoIterator<K, V> {}

impl<K, V> FusedIterator for PersistentSortedMapIntoIterator<K, V> {}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K: SortKey, V> Default for PersistentSortedMap<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SortKey + Clone, V: Clone> FromIterator<(K, V)> for PersistentSortedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map = map.insert(key, value);
        }
        map
    }
}

impl<K: Clone, V: Clone, C: Comparer<K> + Clone> IntoIterator for PersistentSortedMap<K, V, C> {
    type Item = (K, V);
    type IntoIter = PersistentSortedMapIntoIterator<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let entries: Vec<(K, V)> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        PersistentSortedMapIntoIterator {
            entries: entries.into_iter(),
        }
    }
}

impl<'a, K, V, C> IntoIterator for &'a PersistentSortedMap<K, V, C> {
    type Item = (&'a K, &'a V);
    type IntoIter = PersistentSortedMapIterator<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Clone, V: Clone + PartialEq, C: Comparer<K> + Clone> PartialEq
    for PersistentSortedMap<K, V, C>
{
    fn eq(&self, other: &Self) -> bool {
        if self.length != other.length {
            return false;
        }

        self.iter()
            .zip(other.iter())
            .all(|((left_key, left_value), (right_key, right_value))| {
                self.comparer.compare(left_key, right_key) == Ordering::Equal
                    && left_value == right_value
            })
    }
}

impl<K: Clone, V: Clone + Eq, C: Comparer<K> + Clone> Eq for PersistentSortedMap<K, V, C> {}

impl<K: Clone + fmt::Debug, V: Clone + fmt::Debug, C: Comparer<K> + Clone> fmt::Debug
    for PersistentSortedMap<K, V, C>
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
impl<K: Clone, V: Clone, C: Comparer<K> + Clone> PersistentSortedMap<K, V, C> {
    /// Asserts every structural invariant of the tree.
    fn check_invariants(&self) {
        match self.root.as_ref() {
            None => assert_eq!(self.length, 0),
            Some(root) => {
                let (count, _) = Self::check_node(&self.comparer, root, true);
                assert_eq!(count, self.length);
            }
        }
    }

    /// Checks one node, returning its entry count and depth.
    fn check_node(comparer: &C, node: &Node<K, V>, is_root: bool) -> (usize, usize) {
        match node {
            Node::Leaf(leaf) => {
                if !is_root {
                    assert!(leaf.entries.len() >= MIN_OCCUPANCY);
                }
                assert!(leaf.entries.len() <= NODE_CAPACITY);
                for window in leaf.entries.windows(2) {
                    assert_eq!(comparer.compare(&window[0].0, &window[1].0), Ordering::Less);
                }
                (leaf.entries.len(), 0)
            }
            Node::Internal(internal) => {
                if is_root {
                    assert!(internal.entries.len() >= 2);
                } else {
                    assert!(internal.entries.len() >= MIN_OCCUPANCY);
                }
                assert!(internal.entries.len() <= NODE_CAPACITY);
                for window in internal.entries.windows(2) {
                    assert_eq!(comparer.compare(&window[0].0, &window[1].0), Ordering::Less);
                }

                let mut total = 0;
                let mut depth = None;
                for (separator, child) in &internal.entries {
                    assert_eq!(
                        comparer.compare(separator, Self::node_key(child)),
                        Ordering::Equal
                    );
                    let (count, child_depth) = Self::check_node(comparer, child, false);
                    total += count;
                    match depth {
                        None => depth = Some(child_depth),
                        Some(existing) => assert_eq!(existing, child_depth),
                    }
                }
                (total, depth.unwrap_or(0) + 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roots_shared<K, V, C>(
        left: &PersistentSortedMap<K, V, C>,
        right: &PersistentSortedMap<K, V, C>,
    ) -> bool {
        match (left.root.as_ref(), right.root.as_ref()) {
            (Some(Node::Leaf(a)), Some(Node::Leaf(b))) => ReferenceCounter::ptr_eq(a, b),
            (Some(Node::Internal(a)), Some(Node::Internal(b))) => ReferenceCounter::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    #[rstest]
    fn test_new_creates_empty() {
        let map: PersistentSortedMap<i32, String> = PersistentSortedMap::new();
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
        assert_eq!(map.get(&1), None);
    }

    #[rstest]
    fn test_insert_and_get() {
        let map = PersistentSortedMap::new()
            .insert(2, "two")
            .insert(1, "one")
            .insert(3, "three");

        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.get(&2), Some(&"two"));
        assert_eq!(map.get(&3), Some(&"three"));
        map.check_invariants();
    }

    #[rstest]
    fn test_insert_overwrite_keeps_length() {
        let map1 = PersistentSortedMap::new().insert(1, "one");
        let map2 = map1.insert(1, "ONE");

        assert_eq!(map1.get(&1), Some(&"one"));
        assert_eq!(map2.get(&1), Some(&"ONE"));
        assert_eq!(map1.len(), 1);
        assert_eq!(map2.len(), 1);
    }

    #[rstest]
    #[case(32)]
    #[case(33)]
    #[case(100)]
    #[case(1100)]
    fn test_growth_preserves_invariants(#[case] size: i64) {
        let mut map = PersistentSortedMap::new();
        for key in 0..size {
            map = map.insert(key, key * 2);
        }
        assert_eq!(map.len(), usize::try_from(size).unwrap());
        map.check_invariants();
        for key in 0..size {
            assert_eq!(map.get(&key), Some(&(key * 2)));
        }
    }

    #[rstest]
    fn test_reverse_insertion_order() {
        let mut map = PersistentSortedMap::new();
        for key in (0..200_i64).rev() {
            map = map.insert(key, ());
        }
        map.check_invariants();
        let keys: Vec<i64> = map.keys().copied().collect();
        let expected: Vec<i64> = (0..200).collect();
        assert_eq!(keys, expected);
    }

    #[rstest]
    fn test_remove_with_rebalancing() {
        let mut map = PersistentSortedMap::new();
        for key in 0..500_i64 {
            map = map.insert(key, key);
        }
        for key in (0..500_i64).filter(|key| key % 2 == 0) {
            map = map.remove(&key);
            map.check_invariants();
        }
        assert_eq!(map.len(), 250);
        for key in 0..500_i64 {
            if key % 2 == 0 {
                assert_eq!(map.get(&key), None);
            } else {
                assert_eq!(map.get(&key), Some(&key));
            }
        }
    }

    #[rstest]
    fn test_remove_shrinks_height_to_empty() {
        let mut map = PersistentSortedMap::new();
        for key in 0..100_i64 {
            map = map.insert(key, key);
        }
        for key in 0..100_i64 {
            map = map.remove(&key);
            map.check_invariants();
        }
        assert!(map.is_empty());
        assert!(map.root.is_none());
    }

    #[rstest]
    fn test_remove_absent_shares_root() {
        let map = PersistentSortedMap::new().insert(1, "one").insert(2, "two");
        let removed = map.remove(&99);

        assert_eq!(removed.len(), 2);
        assert!(roots_shared(&map, &removed));
    }

    #[rstest]
    fn test_min_max() {
        let map = PersistentSortedMap::new()
            .insert(5, "five")
            .insert(1, "one")
            .insert(9, "nine");

        assert_eq!(map.min(), Some((&1, &"one")));
        assert_eq!(map.max(), Some((&9, &"nine")));

        let empty: PersistentSortedMap<i32, &str> = PersistentSortedMap::new();
        assert_eq!(empty.min(), None);
        assert_eq!(empty.max(), None);
    }

    #[rstest]
    fn test_iter_sorted() {
        let map = PersistentSortedMap::new()
            .insert("c", 3)
            .insert("a", 1)
            .insert("b", 2);

        let entries: Vec<(&&str, &i32)> = map.iter().collect();
        assert_eq!(entries, vec![(&"a", &1), (&"b", &2), (&"c", &3)]);
    }

    #[rstest]
    fn test_iter_rev() {
        let map: PersistentSortedMap<i64, i64> = (0..100).map(|key| (key, key)).collect();
        let keys: Vec<i64> = map.iter().rev().map(|(key, _)| *key).collect();
        let expected: Vec<i64> = (0..100).rev().collect();
        assert_eq!(keys, expected);
    }

    #[rstest]
    fn test_iter_meets_in_the_middle() {
        let map: PersistentSortedMap<i64, i64> = (0..10).map(|key| (key, key)).collect();
        let mut iterator = map.iter();
        assert_eq!(iterator.next().map(|(key, _)| *key), Some(0));
        assert_eq!(iterator.next_back().map(|(key, _)| *key), Some(9));
        let middle: Vec<i64> = iterator.map(|(key, _)| *key).collect();
        assert_eq!(middle, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[rstest]
    fn test_range_window() {
        let map: PersistentSortedMap<i64, i64> = (0..100).map(|key| (key, key)).collect();
        let window: Vec<i64> = map.range(10..20).map(|(key, _)| *key).collect();
        let expected: Vec<i64> = (10..20).collect();
        assert_eq!(window, expected);
    }

    #[rstest]
    fn test_range_seeks_to_least_at_least() {
        let map: PersistentSortedMap<i64, i64> = (0..100).map(|key| (key, key * 3)).collect();
        // 50 is present; 1000 is past the end.
        assert_eq!(map.range(50..).next(), Some((&50, &150)));
        assert_eq!(map.range(1000..).next(), None);

        let sparse: PersistentSortedMap<i64, ()> =
            [10, 20, 30].into_iter().map(|key| (key, ())).collect();
        assert_eq!(sparse.range(15..).next().map(|(key, _)| *key), Some(20));
    }

    #[rstest]
    fn test_range_reverse_seeks_to_greatest_at_most() {
        let sparse: PersistentSortedMap<i64, ()> =
            [10, 20, 30].into_iter().map(|key| (key, ())).collect();
        assert_eq!(
            sparse.range(..=25).next_back().map(|(key, _)| *key),
            Some(20)
        );
        assert_eq!(sparse.range(..=5).next_back(), None);
    }

    #[rstest]
    fn test_range_exclusive_bounds() {
        let map: PersistentSortedMap<i64, i64> = (0..10).map(|key| (key, key)).collect();
        let window: Vec<i64> = map
            .range((Bound::Excluded(2), Bound::Excluded(7)))
            .map(|(key, _)| *key)
            .collect();
        assert_eq!(window, vec![3, 4, 5, 6]);
    }

    #[rstest]
    fn test_range_empty_and_inverted() {
        let map: PersistentSortedMap<i64, i64> = (0..10).map(|key| (key, key)).collect();
        assert_eq!(map.range(5..5).count(), 0);
        assert_eq!(map.range(7..3).count(), 0);
    }

    #[rstest]
    fn test_eq() {
        let map1 = PersistentSortedMap::new().insert(1, "one").insert(2, "two");
        let map2 = PersistentSortedMap::new().insert(2, "two").insert(1, "one");
        assert_eq!(map1, map2);
    }

    #[rstest]
    fn test_from_comparer_none_resolves_default() {
        use crate::capability::IntegerComparer;

        let map: PersistentSortedMap<i64, (), IntegerComparer> =
            PersistentSortedMap::from_comparer(None).unwrap();
        assert!(map.is_empty());
    }

    #[rstest]
    fn test_from_comparer_none_without_default_fails() {
        #[derive(Clone, Copy)]
        struct ReverseComparer;

        impl Comparer<i64> for ReverseComparer {
            fn compare(&self, left: &i64, right: &i64) -> Ordering {
                right.cmp(left)
            }
        }

        let result: Result<PersistentSortedMap<i64, (), ReverseComparer>, Error> =
            PersistentSortedMap::from_comparer(None);
        assert_eq!(result.unwrap_err(), Error::NoCapability);
    }

    #[rstest]
    fn test_custom_comparer_orders_iteration() {
        #[derive(Clone, Copy, Default)]
        struct ReverseComparer;

        impl Comparer<i64> for ReverseComparer {
            fn compare(&self, left: &i64, right: &i64) -> Ordering {
                right.cmp(left)
            }
        }

        let mut map = PersistentSortedMap::with_comparer(ReverseComparer);
        for key in 0..50_i64 {
            map = map.insert(key, ());
        }
        let keys: Vec<i64> = map.keys().copied().collect();
        let expected: Vec<i64> = (0..50).rev().collect();
        assert_eq!(keys, expected);
    }
}
