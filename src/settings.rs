//! Hierarchical settings tree.
//!
//! All run-time configuration lives in one TOML document with the top level
//! tables `Input`, `Converter`, `SharedMemory` and `PostProcessor`. Every
//! processor owns the sub-table named after it. Accessors take a default that
//! is returned when the key is missing, so a sparse settings file is valid.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use toml::Value;

/// Errors raised while loading the settings document.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid TOML.
    #[error("cannot parse settings file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// One node of the settings tree.
///
/// A `Settings` value is cheap to clone; all clones share the parsed
/// document. [`Settings::group`] descends into a sub-table and returns an
/// empty group when the table does not exist, so lookups on it fall back to
/// their defaults.
#[derive(Clone, Debug)]
pub struct Settings {
    root: Arc<Value>,
    path: Vec<String>,
}

impl Settings {
    /// Parses the settings document from `file`.
    pub fn load<P: AsRef<Path>>(file: P) -> Result<Settings, SettingsError> {
        let text = fs::read_to_string(file)?;
        Settings::from_str(&text)
    }

    /// Parses the settings document from a TOML string.
    pub fn from_str(text: &str) -> Result<Settings, SettingsError> {
        let root: Value = text.parse()?;
        Ok(Settings {
            root: Arc::new(root),
            path: Vec::new(),
        })
    }

    /// An empty settings tree; every lookup yields its default.
    #[must_use]
    pub fn empty() -> Settings {
        Settings {
            root: Arc::new(Value::Table(Default::default())),
            path: Vec::new(),
        }
    }

    /// Descends into the sub-table `name`.
    #[must_use]
    pub fn group(&self, name: &str) -> Settings {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Settings {
            root: Arc::clone(&self.root),
            path,
        }
    }

    fn node(&self) -> Option<&Value> {
        let mut current: &Value = &self.root;
        for part in &self.path {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.node()?.get(key)
    }

    /// True when `key` exists in this group.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The names of all sub-tables of this group.
    #[must_use]
    pub fn child_groups(&self) -> Vec<String> {
        match self.node() {
            Some(Value::Table(table)) => table
                .iter()
                .filter(|(_, v)| v.is_table())
                .map(|(k, _)| k.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// String value of `key`, or `default` when absent.
    #[must_use]
    pub fn value_str(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    /// Float value of `key`, or `default` when absent. Integers coerce.
    #[must_use]
    pub fn value_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Float(f)) => *f,
            Some(Value::Integer(i)) => *i as f64,
            _ => default,
        }
    }

    /// Integer value of `key`, or `default` when absent.
    #[must_use]
    pub fn value_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Integer(i)) => *i,
            Some(Value::Float(f)) => *f as i64,
            _ => default,
        }
    }

    /// Unsigned value of `key`, clamped at zero, or `default` when absent.
    #[must_use]
    pub fn value_usize(&self, key: &str, default: usize) -> usize {
        self.value_i64(key, default as i64).max(0) as usize
    }

    /// Boolean value of `key`, or `default` when absent.
    #[must_use]
    pub fn value_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Boolean(b)) => *b,
            _ => default,
        }
    }

    /// String list value of `key`, or empty when absent.
    #[must_use]
    pub fn value_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[Input]
File = "run042.xtc"

[PostProcessor.hitrate]
Kind = "threshold"
Threshold = 300.0
Hide = true

[PostProcessor.hitrate.Nested]
Depth = 2
"#;

    #[test]
    fn lookup_with_defaults() {
        let s = Settings::from_str(SAMPLE).unwrap();
        let input = s.group("Input");
        assert_eq!(input.value_str("File", ""), "run042.xtc");
        assert_eq!(input.value_str("Missing", "fallback"), "fallback");

        let pp = s.group("PostProcessor").group("hitrate");
        assert_eq!(pp.value_str("Kind", ""), "threshold");
        assert!((pp.value_f64("Threshold", 0.0) - 300.0).abs() < f64::EPSILON);
        assert!(pp.value_bool("Hide", false));
        assert_eq!(pp.group("Nested").value_i64("Depth", 0), 2);
    }

    #[test]
    fn missing_groups_yield_defaults() {
        let s = Settings::from_str(SAMPLE).unwrap();
        let missing = s.group("SharedMemory");
        assert_eq!(missing.value_usize("NbrOfBuffers", 4), 4);
        assert!(missing.child_groups().is_empty());
    }

    #[test]
    fn processor_names_enumerate() {
        let s = Settings::from_str(SAMPLE).unwrap();
        let names = s.group("PostProcessor").child_groups();
        assert_eq!(names, vec!["hitrate".to_string()]);
    }
}
