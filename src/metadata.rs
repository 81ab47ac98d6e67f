use crate::engine::NativeMetadata;

/// Engine agnostic call metadata: string keys to string values, in insertion
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Inserts or replaces the value under `key`, keeping its position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Returns `true` if a value was stored under `key`.
    pub fn delete(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies the entries into a fresh engine metadata value.
    pub fn to_native(&self) -> NativeMetadata {
        let mut native = NativeMetadata::new();
        for (key, value) in &self.entries {
            native.set(key.as_str(), value.as_str());
        }
        native
    }

    /// Copies engine metadata, keeping the first value of every key.
    pub fn from_native(native: &NativeMetadata) -> Self {
        native
            .get_map()
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value.to_text()))
            .collect()
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.entries
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        metadata.extend(iter);
        metadata
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Metadata {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.set(key, value);
        }
    }
}

impl From<&Metadata> for NativeMetadata {
    fn from(metadata: &Metadata) -> Self {
        metadata.to_native()
    }
}

impl From<&NativeMetadata> for Metadata {
    fn from(native: &NativeMetadata) -> Self {
        Metadata::from_native(native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NativeValue;
    use proptest::prelude::*;

    #[test]
    fn set_replaces_in_place() {
        let mut metadata: Metadata = [("a", "1"), ("b", "2")].into_iter().collect();
        metadata.set("a", "3");
        assert_eq!(metadata.iter().collect::<Vec<_>>(), vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn delete_reports_presence() {
        let mut metadata: Metadata = [("token", "abc")].into_iter().collect();
        assert!(metadata.delete("token"));
        assert!(!metadata.delete("token"));
        assert!(metadata.is_empty());
    }

    #[test]
    fn binary_values_become_text() {
        let mut native = NativeMetadata::new();
        native.add("trace-bin", NativeValue::Binary(b"abc".to_vec()));
        native.add("trace-bin", "ignored");

        let metadata = Metadata::from_native(&native);
        assert_eq!(metadata.get("trace-bin"), Some("abc"));
        assert_eq!(metadata.len(), 1);
    }

    fn arb_metadata() -> impl Strategy<Value = Vec<(String, String)>> {
        proptest::collection::btree_map("[a-z][a-z0-9-]{0,12}", "[ -~]{0,24}", 0..8)
            .prop_map(|map| map.into_iter().collect())
    }

    proptest! {
        #[test]
        fn native_round_trip(pairs in arb_metadata()) {
            let metadata: Metadata = pairs.clone().into_iter().collect();
            let back = Metadata::from_native(&metadata.to_native());
            prop_assert_eq!(back.into_pairs(), pairs);
        }
    }
}
