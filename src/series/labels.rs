//! Label sets and their stable hash

use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// Label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Reserved label names used to carry metadata through the queue.
pub const META_TYPE_LABEL: &str = "__metadata_type__";
pub const META_HELP_LABEL: &str = "__metadata_help__";
pub const META_UNIT_LABEL: &str = "__metadata_unit__";

const SEPARATOR: u8 = 0xff;

/// Label key-value pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered label set. Labels are kept sorted by name so the hash does not
/// depend on the order callers supplied them in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Self(labels)
    }

    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, value)| Label::new(name, value))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|l| l.name == name)
    }

    /// Metric name, or the empty string if `__name__` is missing.
    pub fn metric_name(&self) -> &str {
        self.get(METRIC_NAME_LABEL).unwrap_or_default()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Empties the set but keeps its allocation for reuse.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Replaces the contents with `other`, reusing the existing allocation.
    pub fn copy_from(&mut self, other: &Labels) {
        self.0.clear();
        self.0.extend(other.0.iter().cloned());
    }

    /// Inserts a label, overwriting the value if the name is already present.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.binary_search_by(|l| l.name.as_str().cmp(&name)) {
            Ok(idx) => self.0[idx].value = value,
            Err(idx) => self.0.insert(idx, Label { name, value }),
        }
    }

    /// Stable 64-bit hash of the label set (xxh3 over `name 0xff value 0xff`).
    pub fn hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for label in &self.0 {
            hasher.update(label.name.as_bytes());
            hasher.update(&[SEPARATOR]);
            hasher.update(label.value.as_bytes());
            hasher.update(&[SEPARATOR]);
        }
        hasher.digest()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_input_order() {
        let a = Labels::from_pairs([("__name__", "cpu"), ("host", "a")]);
        let b = Labels::from_pairs([("host", "a"), ("__name__", "cpu")]);
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_is_repeatable() {
        let labels = Labels::from_pairs([("__name__", "mem"), ("region", "eu")]);
        let first = labels.hash();
        for _ in 0..10 {
            assert_eq!(labels.hash(), first);
        }
    }

    #[test]
    fn test_separator_prevents_concatenation_collisions() {
        let a = Labels::from_pairs([("ab", "c")]);
        let b = Labels::from_pairs([("a", "bc")]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_set_overwrites_and_keeps_order() {
        let mut labels = Labels::from_pairs([("b", "1"), ("d", "2")]);
        labels.set("c", "3");
        labels.set("b", "9");
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "d"]);
        assert_eq!(labels.get("b"), Some("9"));
    }

    #[test]
    fn test_metric_name() {
        let labels = Labels::from_pairs([("__name__", "up")]);
        assert_eq!(labels.metric_name(), "up");
        assert_eq!(Labels::default().metric_name(), "");
    }
}
