use std::collections::HashMap;

/// Stateful value → placeholder mapping with per-prefix counters.
///
/// Within one instance, the same (value, prefix) pair always yields the
/// same placeholder; distinct values under a prefix are numbered in
/// first-seen order, starting at 1.
#[derive(Debug, Default)]
pub struct Tokenizer {
    maps: HashMap<String, HashMap<String, String>>,
    counters: HashMap<String, usize>,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the placeholder for a value under a prefix.
    pub fn tokenize(&mut self, value: &str, prefix: &str) -> String {
        let map = self.maps.entry(prefix.to_string()).or_default();
        if let Some(token) = map.get(value) {
            return token.clone();
        }

        let counter = self.counters.entry(prefix.to_string()).or_insert(0);
        *counter += 1;
        let token = format!("[{prefix}_{counter}]");
        map.insert(value.to_string(), token.clone());
        token
    }

    /// Number of unique values tokenized across all prefixes.
    pub fn total_tokens(&self) -> usize {
        self.maps.values().map(HashMap::len).sum()
    }
}
