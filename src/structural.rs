//! Structural sharing.
//!
//! [`Reconcile::reconcile`] merges a freshly fetched value into the previous
//! one: every part of `next` that is equal to the matching part of `prev` is
//! replaced by the previous value. Identity lives at `Arc` boundaries, so a
//! subtree wrapped in an `Arc` keeps its pointer when it did not change and
//! downstream consumers can compare with [`Arc::ptr_eq`].
//!
//! Sequences reconcile index by index, maps key by key, and `Option`s
//! reconcile their contents. Everything else is a leaf: when it differs the
//! new value wins as-is.
//!
//! ```rust
//! use std::sync::Arc;
//! use muninn::Reconcile;
//!
//! let prev = Arc::new(vec![Arc::new(1), Arc::new(2)]);
//! let next = Arc::new(vec![Arc::new(1), Arc::new(3)]);
//! let merged = Reconcile::reconcile(&prev, next);
//!
//! assert!(Arc::ptr_eq(&merged[0], &prev[0]));
//! assert_eq!(*merged[1], 3);
//! ```
//!
//! Custom data types opt in with an empty impl, which treats the type as a
//! leaf:
//!
//! ```rust
//! #[derive(Clone, PartialEq)]
//! struct Todo { id: u32, title: String }
//!
//! impl muninn::Reconcile for Todo {}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

/// Values that can take part in structural sharing.
pub trait Reconcile: Clone + PartialEq {
    /// Merge `next` into `prev`, reusing every unchanged part of `prev`.
    fn reconcile(prev: &Self, next: Self) -> Self {
        if *prev == next { prev.clone() } else { next }
    }
}

macro_rules! leaf {
    ($($ty:ty),* $(,)?) => {
        $(impl Reconcile for $ty {})*
    };
}

leaf!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
    serde_json::Value,
);

impl<T: Reconcile> Reconcile for Arc<T> {
    fn reconcile(prev: &Self, next: Self) -> Self {
        if Arc::ptr_eq(prev, &next) || **prev == *next {
            return Arc::clone(prev);
        }
        let next = Arc::try_unwrap(next).unwrap_or_else(|shared| (*shared).clone());
        Arc::new(T::reconcile(prev, next))
    }
}

impl<T: Reconcile> Reconcile for Option<T> {
    fn reconcile(prev: &Self, next: Self) -> Self {
        match (prev, next) {
            (Some(p), Some(n)) => Some(T::reconcile(p, n)),
            (_, next) => next,
        }
    }
}

impl<T: Reconcile> Reconcile for Vec<T> {
    fn reconcile(prev: &Self, next: Self) -> Self {
        if *prev == next {
            return prev.clone();
        }
        next.into_iter()
            .enumerate()
            .map(|(i, item)| match prev.get(i) {
                Some(p) => T::reconcile(p, item),
                None => item,
            })
            .collect()
    }
}

impl<K, V> Reconcile for BTreeMap<K, V>
where
    K: Ord + Clone,
    V: Reconcile,
{
    fn reconcile(prev: &Self, next: Self) -> Self {
        if *prev == next {
            return prev.clone();
        }
        next.into_iter()
            .map(|(k, v)| {
                let v = match prev.get(&k) {
                    Some(p) => V::reconcile(p, v),
                    None => v,
                };
                (k, v)
            })
            .collect()
    }
}

impl<K, V> Reconcile for HashMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Reconcile,
{
    fn reconcile(prev: &Self, next: Self) -> Self {
        if *prev == next {
            return prev.clone();
        }
        next.into_iter()
            .map(|(k, v)| {
                let v = match prev.get(&k) {
                    Some(p) => V::reconcile(p, v),
                    None => v,
                };
                (k, v)
            })
            .collect()
    }
}

impl<A: Reconcile, B: Reconcile> Reconcile for (A, B) {
    fn reconcile(prev: &Self, next: Self) -> Self {
        (A::reconcile(&prev.0, next.0), B::reconcile(&prev.1, next.1))
    }
}
