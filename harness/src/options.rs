//! Command-line options for service programs

use std::collections::HashSet;
use std::fmt;

use tracing::debug;

/// Ordered `--flag value` pairs
///
/// Built with the consuming `with` builder and owned by exactly one instance
/// afterwards. Duplicates are kept until [`CliOptions::to_args`], where the
/// first occurrence of a flag wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    entries: Vec<(String, String)>,
}

impl CliOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an option (fluent API)
    pub fn with<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.entries.push((key.into(), value.to_string()));
        self
    }

    /// Append every option of `other` after this one's
    pub fn chain(mut self, other: &CliOptions) -> Self {
        self.entries.extend(other.entries.iter().cloned());
        self
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value given for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Flatten to an argument vector, dropping repeated flags
    pub fn to_args(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut args = Vec::with_capacity(self.entries.len() * 2);
        for (key, value) in &self.entries {
            if !seen.insert(key.as_str()) {
                debug!("squashed duplicated option: {} = {}", key, value);
                continue;
            }
            args.push(key.clone());
            args.push(value.clone());
        }
        args
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for CliOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), |options, (k, v)| options.with(k, v))
    }
}

impl fmt::Display for CliOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}
