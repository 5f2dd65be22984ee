//! Attributes and attribute sets
//!
//! An attribute is identified by its (name, value) pair. The weight is
//! carried along (and hashed into the envelope id) but never compared.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A weighted (name, value) attribute
#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    value: String,
    weight: u32,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_weight(name, value, 1)
    }

    /// Create a weighted attribute. Weights below 1 are raised to 1.
    pub fn with_weight(name: impl Into<String>, value: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            weight: weight.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Attribute {}

impl Hash for Attribute {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.value.hash(state);
    }
}

impl PartialOrd for Attribute {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Attribute {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.name, &self.value).cmp(&(&other.name, &other.value))
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.name, self.value, self.weight)
    }
}

/// Value that matches every attribute of a name in removals
pub const ANY_VALUE: &str = "*";

/// Set of attributes in canonical (name, value) order
///
/// Duplicate (name, value) pairs are rejected; one name may carry several
/// values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    attrs: BTreeSet<Attribute>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an attribute. Returns false if (name, value) is already present.
    pub fn add(&mut self, attr: Attribute) -> bool {
        self.attrs.insert(attr)
    }

    /// Remove by (name, value); `ANY_VALUE` removes every value of `name`.
    /// Returns the number of attributes removed.
    pub fn remove(&mut self, name: &str, value: &str) -> usize {
        let before = self.attrs.len();
        if value == ANY_VALUE {
            self.attrs.retain(|a| a.name != name);
        } else {
            self.attrs.remove(&Attribute::new(name, value));
        }
        before - self.attrs.len()
    }

    pub fn get(&self, name: &str, value: &str) -> Option<&Attribute> {
        self.attrs.get(&Attribute::new(name, value))
    }

    pub fn contains(&self, name: &str, value: &str) -> bool {
        self.get(name, value).is_some()
    }

    /// All values carried under one name
    pub fn values_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Attribute> + 'a {
        self.attrs.iter().filter(move |a| a.name == name)
    }

    /// Iterate in canonical order
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

impl FromIterator<Attribute> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        Self {
            attrs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_is_not_identity() {
        let mut set = AttributeSet::new();
        assert!(set.add(Attribute::with_weight("tag", "news", 3)));
        assert!(!set.add(Attribute::with_weight("tag", "news", 7)));
        assert_eq!(set.get("tag", "news").unwrap().weight(), 3);
    }

    #[test]
    fn test_multiple_values_per_name() {
        let mut set = AttributeSet::new();
        set.add(Attribute::new("tag", "b"));
        set.add(Attribute::new("tag", "a"));
        set.add(Attribute::new("kind", "photo"));

        let order: Vec<_> = set.iter().map(|a| a.value().to_string()).collect();
        assert_eq!(order, vec!["photo", "a", "b"]);
        assert_eq!(set.values_of("tag").count(), 2);
    }

    #[test]
    fn test_remove_wildcard() {
        let mut set: AttributeSet = vec![
            Attribute::new("tag", "a"),
            Attribute::new("tag", "b"),
            Attribute::new("kind", "photo"),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.remove("tag", ANY_VALUE), 2);
        assert_eq!(set.remove("kind", "video"), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_zero_weight_raised() {
        assert_eq!(Attribute::with_weight("a", "b", 0).weight(), 1);
    }
}
