//! Record identifier collections.
//!
//! [`Ids`] is the set a Watch is interested in. [`IdRefs`] counts how many
//! registrations reference each id, which is what the shared subscription's
//! lifetime is derived from.

use std::fmt;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde::Deserialize;
use serde::Serialize;

/// Ordered, duplicate-free set of record identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ids(IndexSet<String>);

impl Ids {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an id, returning `false` if it was already present.
    pub fn insert(
        &mut self,
        id: impl Into<String>,
    ) -> bool {
        self.0.insert(id.into())
    }

    pub fn remove(
        &mut self,
        id: &str,
    ) -> bool {
        self.0.shift_remove(id)
    }

    pub fn contains(
        &self,
        id: &str,
    ) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Ids in `self` or `other`, keeping `self`'s order first.
    pub fn union(
        &self,
        other: &Ids,
    ) -> Ids {
        Ids(self.0.union(&other.0).cloned().collect())
    }

    /// Ids in `self` that are not in `other`.
    pub fn difference(
        &self,
        other: &Ids,
    ) -> Ids {
        Ids(self.0.difference(&other.0).cloned().collect())
    }

    pub fn intersects(
        &self,
        other: &Ids,
    ) -> bool {
        let (small, large) = if self.len() <= other.len() { (self, other) } else { (other, self) };
        small.iter().any(|id| large.contains(id))
    }
}

impl<S: Into<String>> FromIterator<S> for Ids {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Ids(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> From<Vec<S>> for Ids {
    fn from(ids: Vec<S>) -> Self {
        ids.into_iter().collect()
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for Ids {
    fn from(ids: [S; N]) -> Self {
        ids.into_iter().collect()
    }
}

impl IntoIterator for Ids {
    type Item = String;
    type IntoIter = indexmap::set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Ids {
    type Item = &'a String;
    type IntoIter = indexmap::set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Ids {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{{{}}}", joined.join(","))
    }
}

/// Ordered multiset of ids: how many registrations reference each id.
///
/// Zero counts are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdRefs(IndexMap<String, usize>);

impl IdRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` references to `id`, returning the new count.
    pub fn add(
        &mut self,
        id: impl Into<String>,
        n: usize,
    ) -> usize {
        if n == 0 {
            return self.count(&id.into());
        }
        let count = self.0.entry(id.into()).or_insert(0);
        *count += n;
        *count
    }

    /// Drops up to `n` references to `id`, returning the remaining count.
    /// Unknown ids are ignored.
    ///
    /// An id whose count reaches zero is swapped out, so order is not kept
    /// across releases.
    pub fn release(
        &mut self,
        id: &str,
        n: usize,
    ) -> usize {
        let Some(count) = self.0.get_mut(id) else {
            return 0;
        };
        *count = count.saturating_sub(n);
        let remaining = *count;
        if remaining == 0 {
            self.0.swap_remove(id);
        }
        remaining
    }

    pub fn count(
        &self,
        id: &str,
    ) -> usize {
        self.0.get(id).copied().unwrap_or(0)
    }

    pub fn contains(
        &self,
        id: &str,
    ) -> bool {
        self.0.contains_key(id)
    }

    /// Number of distinct ids.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(id, n)| (id.as_str(), *n))
    }

    /// Distinct ids, dropping counts.
    pub fn ids(&self) -> Ids {
        self.0.keys().cloned().collect()
    }

    /// Adds every reference held by `other`.
    pub fn extend(
        &mut self,
        other: &IdRefs,
    ) {
        for (id, n) in other.iter() {
            self.add(id, n);
        }
    }

    /// Cancels references present in both multisets, leaving in each only
    /// what the other does not offset. Returns the references that were
    /// cancelled out.
    pub fn cancel(
        &mut self,
        other: &mut IdRefs,
    ) -> IdRefs {
        let shared: IdRefs = IdRefs(
            self.0
                .iter()
                .filter_map(|(id, n)| {
                    let m = other.count(id);
                    (m > 0).then(|| (id.clone(), (*n).min(m)))
                })
                .collect(),
        );

        for (id, n) in shared.iter() {
            self.release(id, n);
            other.release(id, n);
        }
        shared
    }
}

impl From<&Ids> for IdRefs {
    fn from(ids: &Ids) -> Self {
        IdRefs(ids.iter().map(|id| (id.to_string(), 1)).collect())
    }
}

impl From<Ids> for IdRefs {
    fn from(ids: Ids) -> Self {
        IdRefs(ids.into_iter().map(|id| (id, 1)).collect())
    }
}
