//! Persistent (immutable) hash map based on HAMT.
//!
//! This module provides [`PersistentHashMap`], an immutable hash map
//! that uses structural sharing for efficient operations.
//!
//! # Overview
//!
//! `PersistentHashMap` is based on a Hash Array Mapped Trie (HAMT): a 32-way
//! branching trie over the bits of each key's hash. The hash is produced by
//! a [`Hasher`] capability and consumed five bits at a time, least
//! significant first, for at most six levels; keys whose thirty consumed
//! bits agree share a collision node and are told apart by the capability's
//! equality alone.
//!
//! - O(log32 N) `get` (effectively O(1) for practical sizes)
//! - O(log32 N) `insert`
//! - O(log32 N) `remove`
//! - O(1) `len` and `is_empty`
//!
//! All operations return new maps without modifying the original,
//! and structural sharing ensures memory efficiency.
//!
//! # Examples
//!
//! ```rust
//! use persimm::persistent::PersistentHashMap;
//!
//! let map = PersistentHashMap::new()
//!     .insert("one".to_string(), 1)
//!     .insert("two".to_string(), 2)
//!     .insert("three".to_string(), 3);
//!
//! assert_eq!(map.get("one"), Some(&1));
//! assert_eq!(map.get("two"), Some(&2));
//! assert_eq!(map.get("three"), Some(&3));
//!
//! // Structural sharing: the original map is preserved
//! let updated = map.insert("one".to_string(), 100);
//! assert_eq!(map.get("one"), Some(&1));       // Original unchanged
//! assert_eq!(updated.get("one"), Some(&100)); // New version
//! ```
//!
//! # Internal Structure
//!
//! Sparse interior nodes hold a 32-bit occupancy bitmap and a compact child
//! array ordered by set-bit index. A sparse node that fills past sixteen
//! children is promoted to a dense 32-slot array node; deletion demotes it
//! back below the same threshold. Hash collisions on the thirty consumed
//! bits live in dedicated collision nodes that keep insertion order.

use std::borrow::Borrow;
use std::fmt;
use std::iter::{FromIterator, FusedIterator};

use super::ReferenceCounter;
use crate::capability::{DefaultHasher, HashKey, Hasher};
use crate::error::Error;

// =============================================================================
// Constants
// =============================================================================

/// Branching factor (2^5 = 32)
const BRANCHING_FACTOR: usize = 32;

/// Bits per level in the trie
const BITS_PER_LEVEL: usize = 5;

/// Bit mask for extracting index within a node
const MASK: u32 = (BRANCHING_FACTOR - 1) as u32;

/// Number of levels before hashes are considered exhausted (6 * 5 = 30 bits)
const MAX_LEVEL: usize = 6;

/// The thirty hash bits the trie actually consumes
const HASH_PREFIX_MASK: u32 = (1 << (MAX_LEVEL * BITS_PER_LEVEL)) - 1;

/// Occupancy at which a bitmap node is promoted to an array node, and below
/// which an array node is demoted back
const ARRAY_THRESHOLD: usize = BRANCHING_FACTOR / 2;

/// Extracts the child index at a given level from a hash.
#[inline]
const fn hash_index(hash: u32, level: usize) -> usize {
    ((hash >> (level * BITS_PER_LEVEL)) & MASK) as usize
}

/// Masks a hash down to the thirty bits the trie consumes.
#[inline]
const fn hash_prefix(hash: u32) -> u32 {
    hash & HASH_PREFIX_MASK
}

// =============================================================================
// Node Definition
// =============================================================================

/// Internal node structure for the HAMT.
#[derive(Clone)]
enum Node<K, V> {
    /// Empty node (the root of an empty map)
    Empty,
    /// Single key-value leaf
    Entry { hash: u32, key: K, value: V },
    /// Bitmap-indexed sparse branch node
    Bitmap {
        /// Bitmap indicating which slots are occupied
        bitmap: u32,
        /// Children (entries or subnodes), compact, ordered by slot
        children: ReferenceCounter<[Child<K, V>]>,
    },
    /// Dense branch node used above the occupancy threshold
    Array {
        /// Number of occupied slots
        size: usize,
        /// One slot per possible child index
        children: ReferenceCounter<[Option<Child<K, V>>; BRANCHING_FACTOR]>,
    },
    /// Collision node for keys sharing all consumed hash bits
    Collision {
        hash: u32,
        entries: ReferenceCounter<[(K, V)]>,
    },
}

/// A child in a branch node.
#[derive(Clone)]
enum Child<K, V> {
    /// An inline key-value entry
    Entry { key: K, value: V },
    /// A sub-node
    Node(ReferenceCounter<Node<K, V>>),
}

impl<K, V> Node<K, V> {
    /// Creates an empty node.
    const fn empty() -> Self {
        Self::Empty
    }
}

// =============================================================================
// PersistentHashMap Definition
// =============================================================================

/// A persistent (immutable) hash map based on HAMT.
///
/// `PersistentHashMap` is an immutable data structure that uses structural
/// sharing to efficiently support functional programming patterns. Hashing
/// and key equality come from a [`Hasher`] capability carried inside the
/// handle; [`new`](Self::new) selects the built-in capability for the key
/// domain, and [`with_hasher`](Self::with_hasher) accepts any other.
///
/// # Time Complexity
///
/// | Operation      | Complexity        |
/// |----------------|-------------------|
/// | `new`          | O(1)              |
/// | `get`          | O(log32 N)        |
/// | `insert`       | O(log32 N)        |
/// | `remove`       | O(log32 N)        |
/// | `contains_key` | O(log32 N)        |
/// | `len`          | O(1)              |
/// | `is_empty`     | O(1)              |
///
/// # Examples
///
/// ```rust
/// use persimm::persistent::PersistentHashMap;
///
/// let map = PersistentHashMap::singleton("key".to_string(), 42);
/// assert_eq!(map.get("key"), Some(&42));
/// ```
#[derive(Clone)]
pub struct PersistentHashMap<K, V, H = DefaultHasher> {
    /// Root node of the trie
    root: ReferenceCounter<Node<K, V>>,
    /// Number of entries
    length: usize,
    /// Hashing capability
    hasher: H,
}

impl<K: HashKey, V> PersistentHashMap<K, V> {
    /// Creates a new empty map using the key domain's built-in capability.
    ///
    /// Available when the key domain is one of the built-ins (integers,
    /// strings, byte sequences); other domains construct through
    /// [`with_hasher`](Self::with_hasher) or [`from_hasher`](Self::from_hasher).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map: PersistentHashMap<String, i32> = PersistentHashMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(DefaultHasher)
    }
}

impl<K: HashKey + Clone, V: Clone> PersistentHashMap<K, V> {
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
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::singleton("key".to_string(), 42);
    /// assert_eq!(map.len(), 1);
    /// assert_eq!(map.get("key"), Some(&42));
    /// ```
    #[inline]
    #[must_use]
    pub fn singleton(key: K, value: V) -> Self {
        Self::new().insert(key, value)
    }
}

impl<K, V, H> PersistentHashMap<K, V, H> {
    /// Creates a new empty map with an explicit hashing capability.
    ///
    /// # Arguments
    ///
    /// * `hasher` - The capability used to hash and compare keys
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::capability::StringHasher;
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map: PersistentHashMap<String, i32, StringHasher> =
    ///     PersistentHashMap::with_hasher(StringHasher);
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn with_hasher(hasher: H) -> Self {
        Self {
            root: ReferenceCounter::new(Node::empty()),
            length: 0,
            hasher,
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
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
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
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let empty: PersistentHashMap<String, i32> = PersistentHashMap::new();
    /// assert!(empty.is_empty());
    ///
    /// let non_empty = empty.insert("key".to_string(), 42);
    /// assert!(!non_empty.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<K, V, H: Hasher<K>> PersistentHashMap<K, V, H> {
    /// Creates a new empty map, resolving a missing capability to the
    /// domain's built-in default.
    ///
    /// Passing `Some(hasher)` behaves like [`with_hasher`](Self::with_hasher).
    /// Passing `None` asks the capability type for its built-in default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCapability`] when `hasher` is `None` and the
    /// capability type has no built-in default.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::capability::StringHasher;
    /// use persimm::error::Error;
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map: PersistentHashMap<String, i32, StringHasher> =
    ///     PersistentHashMap::from_hasher(None).unwrap();
    /// assert!(map.is_empty());
    /// ```
    pub fn from_hasher(hasher: Option<H>) -> Result<Self, Error> {
        hasher
            .or_else(|| H::default_capability())
            .map(Self::with_hasher)
            .ok_or(Error::NoCapability)
    }
}

impl<K: Clone, V: Clone, H: Hasher<K> + Clone> PersistentHashMap<K, V, H> {
    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but the
    /// capability must hash and compare the borrowed form consistently with
    /// the owned form.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to look up
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
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
        H: Hasher<Q>,
    {
        let hash = Hasher::<Q>::hash(&self.hasher, key);
        Self::get_from_node(&self.hasher, &self.root, key, hash, 0)
    }

    /// Recursive helper for get.
    fn get_from_node<'a, Q>(
        hasher: &H,
        node: &'a Node<K, V>,
        key: &Q,
        hash: u32,
        level: usize,
    ) -> Option<&'a V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: Hasher<Q>,
    {
        match node {
            Node::Empty => None,
            Node::Entry {
                hash: entry_hash,
                key: entry_key,
                value,
            } => {
                if *entry_hash == hash && Hasher::<Q>::equal(hasher, entry_key.borrow(), key) {
                    Some(value)
                } else {
                    None
                }
            }
            Node::Bitmap { bitmap, children } => {
                let index = hash_index(hash, level);
                let bit = 1u32 << index;

                if bitmap & bit == 0 {
                    return None;
                }

                let position = (bitmap & (bit - 1)).count_ones() as usize;
                Self::get_from_child(hasher, &children[position], key, hash, level)
            }
            Node::Array { children, .. } => children[hash_index(hash, level)]
                .as_ref()
                .and_then(|child| Self::get_from_child(hasher, child, key, hash, level)),
            Node::Collision {
                hash: collision_hash,
                entries,
            } => {
                if *collision_hash != hash_prefix(hash) {
                    return None;
                }
                entries
                    .iter()
                    .find(|(entry_key, _)| Hasher::<Q>::equal(hasher, entry_key.borrow(), key))
                    .map(|(_, value)| value)
            }
        }
    }

    /// Looks up a key in a single branch child.
    fn get_from_child<'a, Q>(
        hasher: &H,
        child: &'a Child<K, V>,
        key: &Q,
        hash: u32,
        level: usize,
    ) -> Option<&'a V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: Hasher<Q>,
    {
        match child {
            Child::Entry {
                key: child_key,
                value,
            } => {
                if Hasher::<Q>::equal(hasher, child_key.borrow(), key) {
                    Some(value)
                } else {
                    None
                }
            }
            Child::Node(subnode) => Self::get_from_node(hasher, subnode, key, hash, level + 1),
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
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
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
        H: Hasher<Q>,
    {
        self.get(key).is_some()
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
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map1 = PersistentHashMap::new().insert("key".to_string(), 1);
    /// let map2 = map1.insert("key".to_string(), 2);
    ///
    /// assert_eq!(map1.get("key"), Some(&1)); // Original unchanged
    /// assert_eq!(map2.get("key"), Some(&2)); // New version
    /// ```
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        let hash = self.hasher.hash(&key);
        let (new_root, added) = Self::insert_into_node(&self.hasher, &self.root, key, value, hash, 0);

        Self {
            root: ReferenceCounter::new(new_root),
            length: if added { self.length + 1 } else { self.length },
            hasher: self.hasher.clone(),
        }
    }

    /// Recursive helper for insert.
    /// Returns (`new_node`, `was_added`) where `was_added` is true if a new
    /// entry was added.
    fn insert_into_node(
        hasher: &H,
        node: &Node<K, V>,
        key: K,
        value: V,
        hash: u32,
        level: usize,
    ) -> (Node<K, V>, bool) {
        match node {
            Node::Empty => (Node::Entry { hash, key, value }, true),
            Node::Entry {
                hash: existing_hash,
                key: existing_key,
                value: existing_value,
            } => Self::insert_into_entry_node(
                hasher,
                *existing_hash,
                existing_key,
                existing_value,
                key,
                value,
                hash,
                level,
            ),
            Node::Bitmap { bitmap, children } => {
                Self::insert_into_bitmap_node(hasher, *bitmap, children, key, value, hash, level)
            }
            Node::Array { size, children } => {
                Self::insert_into_array_node(hasher, *size, children, key, value, hash, level)
            }
            Node::Collision {
                hash: collision_hash,
                entries,
            } => Self::insert_into_collision_node(
                hasher,
                node,
                *collision_hash,
                entries,
                key,
                value,
                hash,
                level,
            ),
        }
    }

    /// Helper for inserting into an Entry node.
    #[allow(clippy::too_many_arguments)]
    fn insert_into_entry_node(
        hasher: &H,
        existing_hash: u32,
        existing_key: &K,
        existing_value: &V,
        key: K,
        value: V,
        hash: u32,
        level: usize,
    ) -> (Node<K, V>, bool) {
        if hasher.equal(existing_key, &key) {
            // Same key, replace value
            (Node::Entry { hash, key, value }, false)
        } else if hash_prefix(existing_hash) == hash_prefix(hash) {
            // The consumed hash bits are exhausted, so the two keys share a
            // collision node
            let entries = ReferenceCounter::from(vec![
                (existing_key.clone(), existing_value.clone()),
                (key, value),
            ]);
            (
                Node::Collision {
                    hash: hash_prefix(hash),
                    entries,
                },
                true,
            )
        } else {
            // Different hash - branch on the first differing digit
            Self::branch_two_entries(
                hasher,
                existing_hash,
                existing_key,
                existing_value,
                key,
                value,
                hash,
                level,
            )
        }
    }

    /// Creates a bitmap node from two entries whose hashes differ.
    #[allow(clippy::too_many_arguments)]
    fn branch_two_entries(
        hasher: &H,
        existing_hash: u32,
        existing_key: &K,
        existing_value: &V,
        key: K,
        value: V,
        hash: u32,
        level: usize,
    ) -> (Node<K, V>, bool) {
        let existing_index = hash_index(existing_hash, level);
        let new_index = hash_index(hash, level);

        if existing_index == new_index {
            // Same digit at this level - recurse
            let sub_entry = Node::Entry {
                hash: existing_hash,
                key: existing_key.clone(),
                value: existing_value.clone(),
            };
            let (subnode, added) =
                Self::insert_into_node(hasher, &sub_entry, key, value, hash, level + 1);
            let bitmap = 1u32 << existing_index;
            let children = ReferenceCounter::from(vec![Child::Node(ReferenceCounter::new(subnode))]);
            (Node::Bitmap { bitmap, children }, added)
        } else {
            // Different digits - create a bitmap with two inline children
            let bitmap = (1u32 << existing_index) | (1u32 << new_index);
            let children: Vec<Child<K, V>> = if existing_index < new_index {
                vec![
                    Child::Entry {
                        key: existing_key.clone(),
                        value: existing_value.clone(),
                    },
                    Child::Entry { key, value },
                ]
            } else {
                vec![
                    Child::Entry { key, value },
                    Child::Entry {
                        key: existing_key.clone(),
                        value: existing_value.clone(),
                    },
                ]
            };
            (
                Node::Bitmap {
                    bitmap,
                    children: ReferenceCounter::from(children),
                },
                true,
            )
        }
    }

    /// Helper for inserting into a Bitmap node.
    fn insert_into_bitmap_node(
        hasher: &H,
        bitmap: u32,
        children: &ReferenceCounter<[Child<K, V>]>,
        key: K,
        value: V,
        hash: u32,
        level: usize,
    ) -> (Node<K, V>, bool) {
        let index = hash_index(hash, level);
        let bit = 1u32 << index;
        let position = (bitmap & (bit - 1)).count_ones() as usize;

        if bitmap & bit == 0 {
            if children.len() >= ARRAY_THRESHOLD {
                // The node is at the occupancy threshold: promote to a dense
                // array node while adding the new entry
                return (
                    Self::promote_to_array(bitmap, children, index, Child::Entry { key, value }),
                    true,
                );
            }

            // Slot is empty - add new entry at its compact position
            let mut new_children = children.to_vec();
            new_children.insert(position, Child::Entry { key, value });
            (
                Node::Bitmap {
                    bitmap: bitmap | bit,
                    children: ReferenceCounter::from(new_children),
                },
                true,
            )
        } else {
            // Slot is occupied
            let (new_child, added) =
                Self::insert_into_child(hasher, &children[position], key, value, hash, level);
            let mut new_children = children.to_vec();
            new_children[position] = new_child;
            (
                Node::Bitmap {
                    bitmap,
                    children: ReferenceCounter::from(new_children),
                },
                added,
            )
        }
    }

    /// Helper for inserting into an Array node.
    fn insert_into_array_node(
        hasher: &H,
        size: usize,
        children: &ReferenceCounter<[Option<Child<K, V>>; BRANCHING_FACTOR]>,
        key: K,
        value: V,
        hash: u32,
        level: usize,
    ) -> (Node<K, V>, bool) {
        let index = hash_index(hash, level);
        let mut new_children = children.as_ref().clone();

        match &children[index] {
            None => {
                new_children[index] = Some(Child::Entry { key, value });
                (
                    Node::Array {
                        size: size + 1,
                        children: ReferenceCounter::new(new_children),
                    },
                    true,
                )
            }
            Some(child) => {
                let (new_child, added) =
                    Self::insert_into_child(hasher, child, key, value, hash, level);
                new_children[index] = Some(new_child);
                (
                    Node::Array {
                        size,
                        children: ReferenceCounter::new(new_children),
                    },
                    added,
                )
            }
        }
    }

    /// Inserts into an occupied branch child.
    fn insert_into_child(
        hasher: &H,
        child: &Child<K, V>,
        key: K,
        value: V,
        hash: u32,
        level: usize,
    ) -> (Child<K, V>, bool) {
        match child {
            Child::Entry {
                key: child_key,
                value: child_value,
            } => {
                if hasher.equal(child_key, &key) {
                    (Child::Entry { key, value }, false)
                } else {
                    let child_hash = hasher.hash(child_key);
                    if hash_prefix(child_hash) == hash_prefix(hash) {
                        let collision = Node::Collision {
                            hash: hash_prefix(hash),
                            entries: ReferenceCounter::from(vec![
                                (child_key.clone(), child_value.clone()),
                                (key, value),
                            ]),
                        };
                        (Child::Node(ReferenceCounter::new(collision)), true)
                    } else {
                        let child_entry = Node::Entry {
                            hash: child_hash,
                            key: child_key.clone(),
                            value: child_value.clone(),
                        };
                        let (subnode, added) =
                            Self::insert_into_node(hasher, &child_entry, key, value, hash, level + 1);
                        (Child::Node(ReferenceCounter::new(subnode)), added)
                    }
                }
            }
            Child::Node(subnode) => {
                let (new_subnode, added) =
                    Self::insert_into_node(hasher, subnode, key, value, hash, level + 1);
                (Child::Node(ReferenceCounter::new(new_subnode)), added)
            }
        }
    }

    /// Helper for inserting into a Collision node.
    #[allow(clippy::too_many_arguments)]
    fn insert_into_collision_node(
        hasher: &H,
        node: &Node<K, V>,
        collision_hash: u32,
        entries: &ReferenceCounter<[(K, V)]>,
        key: K,
        value: V,
        hash: u32,
        level: usize,
    ) -> (Node<K, V>, bool) {
        if hash_prefix(hash) == collision_hash {
            // Same consumed bits - update in place or extend in insertion
            // order
            let mut new_entries = entries.to_vec();
            let found = new_entries
                .iter()
                .position(|(entry_key, _)| hasher.equal(entry_key, &key));

            match found {
                Some(position) => {
                    new_entries[position] = (key, value);
                    (
                        Node::Collision {
                            hash: collision_hash,
                            entries: ReferenceCounter::from(new_entries),
                        },
                        false,
                    )
                }
                None => {
                    new_entries.push((key, value));
                    (
                        Node::Collision {
                            hash: collision_hash,
                            entries: ReferenceCounter::from(new_entries),
                        },
                        true,
                    )
                }
            }
        } else {
            // Different consumed bits - branch away from the collision node
            let collision_index = hash_index(collision_hash, level);
            let new_index = hash_index(hash, level);

            if collision_index == new_index {
                let (subnode, added) =
                    Self::insert_into_node(hasher, node, key, value, hash, level + 1);
                let bitmap = 1u32 << collision_index;
                let children =
                    ReferenceCounter::from(vec![Child::Node(ReferenceCounter::new(subnode))]);
                (Node::Bitmap { bitmap, children }, added)
            } else {
                let bitmap = (1u32 << collision_index) | (1u32 << new_index);
                let children: Vec<Child<K, V>> = if collision_index < new_index {
                    vec![
                        Child::Node(ReferenceCounter::new(node.clone())),
                        Child::Entry { key, value },
                    ]
                } else {
                    vec![
                        Child::Entry { key, value },
                        Child::Node(ReferenceCounter::new(node.clone())),
                    ]
                };
                (
                    Node::Bitmap {
                        bitmap,
                        children: ReferenceCounter::from(children),
                    },
                    true,
                )
            }
        }
    }

    /// Builds a dense array node from a bitmap node's children plus one new
    /// child at `index`.
    fn promote_to_array(
        bitmap: u32,
        children: &ReferenceCounter<[Child<K, V>]>,
        index: usize,
        child: Child<K, V>,
    ) -> Node<K, V> {
        let mut slots: [Option<Child<K, V>>; BRANCHING_FACTOR] = std::array::from_fn(|_| None);
        let mut position = 0;
        for slot in 0..BRANCHING_FACTOR {
            if bitmap & (1u32 << slot) != 0 {
                slots[slot] = Some(children[position].clone());
                position += 1;
            }
        }
        slots[index] = Some(child);

        Node::Array {
            size: children.len() + 1,
            children: ReferenceCounter::new(slots),
        }
    }

    /// Builds a bitmap node from a dense array node's slots, skipping the
    /// slot at `skip`.
    fn demote_to_bitmap(
        children: &[Option<Child<K, V>>; BRANCHING_FACTOR],
        skip: usize,
    ) -> Node<K, V> {
        let mut bitmap = 0u32;
        let mut compact: Vec<Child<K, V>> = Vec::new();
        for (slot, child) in children.iter().enumerate() {
            if slot == skip {
                continue;
            }
            if let Some(child) = child {
                bitmap |= 1u32 << slot;
                compact.push(child.clone());
            }
        }

        Node::Bitmap {
            bitmap,
            children: ReferenceCounter::from(compact),
        }
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
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    /// let removed = map.remove("a");
    ///
    /// assert_eq!(map.len(), 2);     // Original unchanged
    /// assert_eq!(removed.len(), 1); // New version
    /// assert_eq!(removed.get("a"), None);
    /// ```
    #[must_use]
    pub fn remove<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: Hasher<Q>,
    {
        let hash = Hasher::<Q>::hash(&self.hasher, key);
        match Self::remove_from_node(&self.hasher, &self.root, key, hash, 0) {
            Some(new_root) => Self {
                root: ReferenceCounter::new(new_root),
                length: self.length.saturating_sub(1),
                hasher: self.hasher.clone(),
            },
            None => self.clone(),
        }
    }

    /// Recursive helper for remove.
    /// Returns `Some(new_node)` if the key was present, `None` otherwise.
    fn remove_from_node<Q>(
        hasher: &H,
        node: &Node<K, V>,
        key: &Q,
        hash: u32,
        level: usize,
    ) -> Option<Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: Hasher<Q>,
    {
        match node {
            Node::Empty => None,
            Node::Entry {
                hash: entry_hash,
                key: entry_key,
                ..
            } => {
                if *entry_hash == hash && Hasher::<Q>::equal(hasher, entry_key.borrow(), key) {
                    Some(Node::Empty)
                } else {
                    None
                }
            }
            Node::Bitmap { bitmap, children } => {
                Self::remove_from_bitmap_node(hasher, *bitmap, children, key, hash, level)
            }
            Node::Array { size, children } => {
                Self::remove_from_array_node(hasher, *size, children, key, hash, level)
            }
            Node::Collision {
                hash: collision_hash,
                entries,
            } => Self::remove_from_collision_node(hasher, *collision_hash, entries, key, hash),
        }
    }

    /// Helper for removing from a Bitmap node.
    fn remove_from_bitmap_node<Q>(
        hasher: &H,
        bitmap: u32,
        children: &ReferenceCounter<[Child<K, V>]>,
        key: &Q,
        hash: u32,
        level: usize,
    ) -> Option<Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: Hasher<Q>,
    {
        let index = hash_index(hash, level);
        let bit = 1u32 << index;

        if bitmap & bit == 0 {
            return None;
        }

        let position = (bitmap & (bit - 1)).count_ones() as usize;

        match &children[position] {
            Child::Entry { key: child_key, .. } => {
                if !Hasher::<Q>::equal(hasher, child_key.borrow(), key) {
                    return None;
                }

                let new_bitmap = bitmap & !bit;
                if new_bitmap == 0 {
                    return Some(Node::Empty);
                }

                let mut new_children = children.to_vec();
                new_children.remove(position);
                Some(Self::collapse_bitmap(hasher, new_bitmap, new_children))
            }
            Child::Node(subnode) => {
                let new_subnode = Self::remove_from_node(hasher, subnode, key, hash, level + 1)?;
                let mut new_children = children.to_vec();

                match new_subnode {
                    Node::Empty => {
                        let new_bitmap = bitmap & !bit;
                        if new_bitmap == 0 {
                            return Some(Node::Empty);
                        }
                        new_children.remove(position);
                        Some(Self::collapse_bitmap(hasher, new_bitmap, new_children))
                    }
                    Node::Entry { key, value, .. } => {
                        // A lone entry below is lifted into this node's slot
                        new_children[position] = Child::Entry { key, value };
                        Some(Self::collapse_bitmap(hasher, bitmap, new_children))
                    }
                    other => {
                        new_children[position] = Child::Node(ReferenceCounter::new(other));
                        Some(Node::Bitmap {
                            bitmap,
                            children: ReferenceCounter::from(new_children),
                        })
                    }
                }
            }
        }
    }

    /// Helper for removing from an Array node.
    fn remove_from_array_node<Q>(
        hasher: &H,
        size: usize,
        children: &ReferenceCounter<[Option<Child<K, V>>; BRANCHING_FACTOR]>,
        key: &Q,
        hash: u32,
        level: usize,
    ) -> Option<Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: Hasher<Q>,
    {
        let index = hash_index(hash, level);

        match &children[index] {
            None => None,
            Some(Child::Entry { key: child_key, .. }) => {
                if !Hasher::<Q>::equal(hasher, child_key.borrow(), key) {
                    return None;
                }

                if size - 1 < ARRAY_THRESHOLD {
                    // Occupancy drops below the threshold: demote back to a
                    // bitmap node
                    return Some(Self::demote_to_bitmap(children, index));
                }

                let mut new_children = children.as_ref().clone();
                new_children[index] = None;
                Some(Node::Array {
                    size: size - 1,
                    children: ReferenceCounter::new(new_children),
                })
            }
            Some(Child::Node(subnode)) => {
                let new_subnode = Self::remove_from_node(hasher, subnode, key, hash, level + 1)?;
                let mut new_children = children.as_ref().clone();

                match new_subnode {
                    Node::Empty => {
                        if size - 1 < ARRAY_THRESHOLD {
                            return Some(Self::demote_to_bitmap(children, index));
                        }
                        new_children[index] = None;
                        Some(Node::Array {
                            size: size - 1,
                            children: ReferenceCounter::new(new_children),
                        })
                    }
                    Node::Entry { key, value, .. } => {
                        new_children[index] = Some(Child::Entry { key, value });
                        Some(Node::Array {
                            size,
                            children: ReferenceCounter::new(new_children),
                        })
                    }
                    other => {
                        new_children[index] = Some(Child::Node(ReferenceCounter::new(other)));
                        Some(Node::Array {
                            size,
                            children: ReferenceCounter::new(new_children),
                        })
                    }
                }
            }
        }
    }

    /// Rebuilds a bitmap node, lifting it into a single entry when exactly
    /// one inline child remains.
    fn collapse_bitmap(hasher: &H, bitmap: u32, children: Vec<Child<K, V>>) -> Node<K, V> {
        if children.len() == 1 {
            if let Child::Entry { key, value } = &children[0] {
                let entry_hash = hasher.hash(key);
                return Node::Entry {
                    hash: entry_hash,
                    key: key.clone(),
                    value: value.clone(),
                };
            }
        }

        Node::Bitmap {
            bitmap,
            children: ReferenceCounter::from(children),
        }
    }

    /// Helper for removing from a Collision node.
    fn remove_from_collision_node<Q>(
        hasher: &H,
        collision_hash: u32,
        entries: &ReferenceCounter<[(K, V)]>,
        key: &Q,
        hash: u32,
    ) -> Option<Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: Hasher<Q>,
    {
        if collision_hash != hash_prefix(hash) {
            return None;
        }

        let found_index = entries
            .iter()
            .position(|(entry_key, _)| Hasher::<Q>::equal(hasher, entry_key.borrow(), key))?;

        let mut new_entries = entries.to_vec();
        new_entries.remove(found_index);

        if new_entries.len() == 1 {
            let (remaining_key, remaining_value) = new_entries.remove(0);
            let entry_hash = Hasher::<K>::hash(hasher, &remaining_key);
            Some(Node::Entry {
                hash: entry_hash,
                key: remaining_key,
                value: remaining_value,
            })
        } else {
            Some(Node::Collision {
                hash: collision_hash,
                entries: ReferenceCounter::from(new_entries),
            })
        }
    }

    /// Updates, inserts or removes a value for a key through one closure.
    ///
    /// The updater receives `Some(&V)` if the key exists, or `None` if it
    /// doesn't. Returning `Some(V)` inserts or replaces the value; returning
    /// `None` removes the key if it exists.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to update
    /// * `updater` - A function from the current value (or `None`) to the
    ///   new value (or `None` to remove)
    ///
    /// # Complexity
    ///
    /// O(log32 N)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new().insert("count".to_string(), 10);
    ///
    /// let incremented = map.update_with("count", |value| value.map(|count| count + 1));
    /// assert_eq!(incremented.get("count"), Some(&11));
    ///
    /// let removed = map.update_with("count", |_| None);
    /// assert_eq!(removed.get("count"), None);
    /// ```
    #[must_use]
    pub fn update_with<Q, F>(&self, key: &Q, updater: F) -> Self
    where
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + ?Sized,
        H: Hasher<Q>,
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let current_value = self.get(key);
        match (current_value.is_some(), updater(current_value)) {
            (_, Some(value)) => self.insert(key.to_owned(), value),
            (true, None) => self.remove(key),
            (false, None) => self.clone(),
        }
    }

    /// Merges two maps, with values from `other` taking precedence on key
    /// conflicts.
    ///
    /// # Arguments
    ///
    /// * `other` - The map to merge with
    ///
    /// # Complexity
    ///
    /// O(m log32(n + m)) where m is the size of `other`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map1 = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    /// let map2 = PersistentHashMap::new()
    ///     .insert("b".to_string(), 20)
    ///     .insert("c".to_string(), 3);
    ///
    /// let merged = map1.merge(&map2);
    ///
    /// assert_eq!(merged.get("a"), Some(&1));
    /// assert_eq!(merged.get("b"), Some(&20)); // From map2
    /// assert_eq!(merged.get("c"), Some(&3));
    /// ```
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for (key, value) in other.iter() {
            result = result.insert(key.clone(), value.clone());
        }
        result
    }

    /// Returns an iterator over key-value pairs.
    ///
    /// The traversal is deterministic for a given trie structure, but the
    /// order is derived from key hashes rather than insertion order; two
    /// maps holding the same keys may iterate differently if they were built
    /// through different insertion sequences that produced different
    /// collision-node orders.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    ///
    /// assert_eq!(map.iter().count(), 2);
    /// ```
    #[must_use]
    pub fn iter(&self) -> PersistentHashMapIterator<'_, K, V> {
        let mut iterator = PersistentHashMapIterator {
            stack: Vec::new(),
            remaining: self.length,
        };
        iterator.push_node(&self.root);
        iterator
    }

    /// Returns an iterator over keys.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    ///
    /// assert_eq!(map.keys().count(), 2);
    /// ```
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over values.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use persimm::persistent::PersistentHashMap;
    ///
    /// let map = PersistentHashMap::new()
    ///     .insert("a".to_string(), 1)
    ///     .insert("b".to_string(), 2);
    ///
    /// let sum: i32 = map.values().sum();
    /// assert_eq!(sum, 3);
    /// ```
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }
}

// =============================================================================
// Iterator Implementation
// =============================================================================

/// A traversal frame over one node of the trie.
enum Frame<'a, K, V> {
    /// A pending value leaf
    Single(&'a K, &'a V),
    /// A bitmap node and the next compact position to visit
    Bitmap {
        children: &'a [Child<K, V>],
        position: usize,
    },
    /// An array node and the next slot to visit
    Array {
        children: &'a [Option<Child<K, V>>; BRANCHING_FACTOR],
        slot: usize,
    },
    /// A collision node and the next entry to visit
    Collision {
        entries: &'a [(K, V)],
        position: usize,
    },
}

/// An iterator over key-value pairs of a [`PersistentHashMap`].
///
/// Holds a stack of traversal frames into the frozen trie; the source map is
/// never modified.
pub struct PersistentHashMapIterator<'a, K, V> {
    stack: Vec<Frame<'a, K, V>>,
    remaining: usize,
}

impl<'a, K, V> PersistentHashMapIterator<'a, K, V> {
    /// Pushes the frame for a node onto the traversal stack.
    fn push_node(&mut self, node: &'a Node<K, V>) {
        match node {
            Node::Empty => {}
            Node::Entry { key, value, .. } => self.stack.push(Frame::Single(key, value)),
            Node::Bitmap { children, .. } => self.stack.push(Frame::Bitmap {
                children,
                position: 0,
            }),
            Node::Array { children, .. } => self.stack.push(Frame::Array { children, slot: 0 }),
            Node::Collision { entries, .. } => self.stack.push(Frame::Collision {
                entries,
                position: 0,
            }),
        }
    }
}

impl<'a, K, V> Iterator for PersistentHashMapIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            let subnode: &'a Node<K, V> = match frame {
                Frame::Single(key, value) => {
                    let entry = (*key, *value);
                    self.stack.pop();
                    self.remaining -= 1;
                    return Some(entry);
                }
                Frame::Bitmap { children, position } => {
                    let slice: &'a [Child<K, V>] = *children;
                    if *position == slice.len() {
                        self.stack.pop();
                        continue;
                    }
                    let child = &slice[*position];
                    *position += 1;
                    match child {
                        Child::Entry { key, value } => {
                            self.remaining -= 1;
                            return Some((key, value));
                        }
                        Child::Node(subnode) => subnode.as_ref(),
                    }
                }
                Frame::Array { children, slot } => {
                    let slots: &'a [Option<Child<K, V>>; BRANCHING_FACTOR] = *children;
                    if *slot == BRANCHING_FACTOR {
                        self.stack.pop();
                        continue;
                    }
                    let child = &slots[*slot];
                    *slot += 1;
                    match child {
                        None => continue,
                        Some(Child::Entry { key, value }) => {
                            self.remaining -= 1;
                            return Some((key, value));
                        }
                        Some(Child::Node(subnode)) => subnode.as_ref(),
                    }
                }
                Frame::Collision { entries, position } => {
                    let slice: &'a [(K, V)] = *entries;
                    if *position == slice.len() {
                        self.stack.pop();
                        continue;
                    }
                    let (key, value) = &slice[*position];
                    *position += 1;
                    self.remaining -= 1;
                    return Some((key, value));
                }
            };
            self.push_node(subnode);
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for PersistentHashMapIterator<'_, K, V> {
    fn len(&self) -> usize {
        self.remaining
    }
}

impl<K, V> FusedIterator for PersistentHashMapIterator<'_, K, V> {}

/// An owning iterator over key-value pairs of a [`PersistentHashMap`].
pub struct PersistentHashMapIntoIterator<K, V> {
    entries: std::vec::IntoIter<(K, V)>,
}

impl<K, V> Iterator for PersistentHashMapIntoIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl<K, V> ExactSizeIterator for PersistentHashMapIntoIterator<K, V> {}

impl<K, V> FusedIterator for PersistentHashMapIntoIterator<K, V> {}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K: HashKey, V> Default for PersistentHashMap<K, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HashKey + Clone, V: Clone> FromIterator<(K, V)> for PersistentHashMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map = map.insert(key, value);
        }
        map
    }
}

impl<K: Clone, V: Clone, H: Hasher<K> + Clone> IntoIterator for PersistentHashMap<K, V, H> {
    type Item = (K, V);
    type IntoIter = PersistentHashMapIntoIterator<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let entries: Vec<(K, V)> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        PersistentHashMapIntoIterator {
            entries: entries.into_iter(),
        }
    }
}

impl<'a, K: Clone, V: Clone, H: Hasher<K> + Clone> IntoIterator
    for &'a PersistentHashMap<K, V, H>
{
    type Item = (&'a K, &'a V);
    type IntoIter = PersistentHashMapIterator<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Clone, V: Clone + PartialEq, H: Hasher<K> + Clone> PartialEq
    for PersistentHashMap<K, V, H>
{
    fn eq(&self, other: &Self) -> bool {
        if self.length != other.length {
            return false;
        }

        self.iter().all(|(key, value)| {
            other
                .get(key)
                .is_some_and(|other_value| other_value == value)
        })
    }
}

impl<K: Clone, V: Clone + Eq, H: Hasher<K> + Clone> Eq for PersistentHashMap<K, V, H> {}

impl<K: Clone + fmt::Debug, V: Clone + fmt::Debug, H: Hasher<K> + Clone> fmt::Debug
    for PersistentHashMap<K, V, H>
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// A capability with fully controllable hashes: the key's low 32 bits.
    #[derive(Clone, Copy, Default)]
    struct IdentityHasher;

    impl Hasher<u64> for IdentityHasher {
        #[allow(clippy::cast_possible_truncation)]
        fn hash(&self, key: &u64) -> u32 {
            *key as u32
        }

        fn equal(&self, left: &u64, right: &u64) -> bool {
            left == right
        }
    }

    #[rstest]
    fn test_new_creates_empty() {
        let map: PersistentHashMap<String, i32> = PersistentHashMap::new();
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
    }

    #[rstest]
    fn test_insert_and_get() {
        let map = PersistentHashMap::new()
            .insert("one".to_string(), 1)
            .insert("two".to_string(), 2);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("one"), Some(&1));
        assert_eq!(map.get("two"), Some(&2));
        assert_eq!(map.get("three"), None);
    }

    #[rstest]
    fn test_insert_overwrite_keeps_length() {
        let map1 = PersistentHashMap::new().insert("key".to_string(), 1);
        let map2 = map1.insert("key".to_string(), 2);

        assert_eq!(map1.get("key"), Some(&1));
        assert_eq!(map2.get("key"), Some(&2));
        assert_eq!(map1.len(), 1);
        assert_eq!(map2.len(), 1);
    }

    #[rstest]
    fn test_remove() {
        let map = PersistentHashMap::new()
            .insert("a".to_string(), 1)
            .insert("b".to_string(), 2);
        let removed = map.remove("a");

        assert_eq!(removed.len(), 1);
        assert_eq!(removed.get("a"), None);
        assert_eq!(removed.get("b"), Some(&2));
    }

    #[rstest]
    fn test_remove_absent_shares_root() {
        let map = PersistentHashMap::new()
            .insert("a".to_string(), 1)
            .insert("b".to_string(), 2);
        let removed = map.remove("missing");

        assert_eq!(removed.len(), 2);
        assert!(ReferenceCounter::ptr_eq(&map.root, &removed.root));
    }

    #[rstest]
    fn test_many_keys_round_trip() {
        let mut map = PersistentHashMap::new();
        for key in 0..1000_i64 {
            map = map.insert(key, key * 2);
        }
        assert_eq!(map.len(), 1000);
        for key in 0..1000_i64 {
            assert_eq!(map.get(&key), Some(&(key * 2)));
        }
    }

    #[rstest]
    fn test_promotion_to_array_node() {
        // Identity hashes 0..=19 occupy distinct root slots, pushing the
        // root bitmap past the occupancy threshold.
        let mut map = PersistentHashMap::with_hasher(IdentityHasher);
        for key in 0..20_u64 {
            map = map.insert(key, key);
        }
        assert_eq!(map.len(), 20);
        assert!(matches!(map.root.as_ref(), Node::Array { .. }));
        for key in 0..20_u64 {
            assert_eq!(map.get(&key), Some(&key));
        }
    }

    #[rstest]
    fn test_demotion_back_to_bitmap_node() {
        let mut map = PersistentHashMap::with_hasher(IdentityHasher);
        for key in 0..20_u64 {
            map = map.insert(key, key);
        }
        for key in 10..20_u64 {
            map = map.remove(&key);
        }
        assert_eq!(map.len(), 10);
        assert!(matches!(map.root.as_ref(), Node::Bitmap { .. }));
        for key in 0..10_u64 {
            assert_eq!(map.get(&key), Some(&key));
        }
    }

    #[rstest]
    fn test_full_hash_collision() {
        // Keys agreeing on the low 32 bits collide exactly.
        let left = 5_u64;
        let right = 5_u64 + (1 << 32);

        let map = PersistentHashMap::with_hasher(IdentityHasher)
            .insert(left, "left")
            .insert(right, "right");

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&left), Some(&"left"));
        assert_eq!(map.get(&right), Some(&"right"));

        let removed = map.remove(&left);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed.get(&left), None);
        assert_eq!(removed.get(&right), Some(&"right"));
    }

    #[rstest]
    fn test_collision_on_consumed_bits_only() {
        // Bits 30 and 31 are never consumed, so these keys share a
        // collision node despite distinct full hashes.
        let left = 7_u64;
        let right = 7_u64 | (1 << 30);

        let map = PersistentHashMap::with_hasher(IdentityHasher)
            .insert(left, 1)
            .insert(right, 2);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&left), Some(&1));
        assert_eq!(map.get(&right), Some(&2));
    }

    #[rstest]
    fn test_collision_node_keeps_insertion_order() {
        let first = 9_u64;
        let second = 9_u64 + (1 << 32);
        let third = 9_u64 + (2 << 32);

        let map = PersistentHashMap::with_hasher(IdentityHasher)
            .insert(first, 1)
            .insert(second, 2)
            .insert(third, 3);

        let keys: Vec<u64> = map.iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, vec![first, second, third]);
    }

    #[rstest]
    fn test_iteration_is_deterministic() {
        let mut map = PersistentHashMap::new();
        for key in 0..100_i64 {
            map = map.insert(key, ());
        }
        let first_pass: Vec<i64> = map.keys().copied().collect();
        let second_pass: Vec<i64> = map.keys().copied().collect();
        assert_eq!(first_pass, second_pass);
        assert_eq!(first_pass.len(), 100);
    }

    #[rstest]
    fn test_iterator_len_tracks_remaining() {
        let map: PersistentHashMap<i64, i64> = (0..50).map(|key| (key, key)).collect();
        let mut iterator = map.iter();
        assert_eq!(iterator.len(), 50);
        iterator.next();
        assert_eq!(iterator.len(), 49);
    }

    #[rstest]
    fn test_update_with() {
        let map = PersistentHashMap::new().insert("count".to_string(), 10);

        let incremented = map.update_with("count", |value| value.map(|count| count + 1));
        assert_eq!(incremented.get("count"), Some(&11));

        let inserted = map.update_with("missing", |value| match value {
            Some(existing) => Some(*existing),
            None => Some(100),
        });
        assert_eq!(inserted.get("missing"), Some(&100));

        let removed = map.update_with("count", |_| None);
        assert_eq!(removed.get("count"), None);
        assert_eq!(removed.len(), 0);
    }

    #[rstest]
    fn test_eq_ignores_insertion_order() {
        let map1 = PersistentHashMap::new()
            .insert("a".to_string(), 1)
            .insert("b".to_string(), 2);
        let map2 = PersistentHashMap::new()
            .insert("b".to_string(), 2)
            .insert("a".to_string(), 1);

        assert_eq!(map1, map2);
    }

    #[rstest]
    fn test_from_iter() {
        let entries = vec![("a".to_string(), 1), ("b".to_string(), 2)];
        let map: PersistentHashMap<String, i32> = entries.into_iter().collect();

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(map.get("b"), Some(&2));
    }

    #[rstest]
    fn test_from_hasher_none_resolves_default() {
        let map: PersistentHashMap<String, i32, crate::capability::StringHasher> =
            PersistentHashMap::from_hasher(None).unwrap();
        assert!(map.is_empty());
    }

    #[rstest]
    fn test_from_hasher_none_without_default_fails() {
        let result: Result<PersistentHashMap<u64, i32, IdentityHasher>, Error> =
            PersistentHashMap::from_hasher(None);
        assert_eq!(result.unwrap_err(), Error::NoCapability);
    }
}
