//! Workload option blocks with consumption tracking.
//!
//! A spec file hands each workload an ordered bag of `key = value` string
//! pairs. Typed accessors mark keys consumed as the workload constructor
//! reads them; after construction the factory asks for the leftovers and
//! fails the test if any remain, naming every unrecognized key.

use std::fmt;

use crate::error::{HarnessError, HarnessResult};

/// One `(key, value)` option with its consumption flag.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OptionEntry {
    key: String,
    value: String,
    consumed: bool,
}

/// An ordered sequence of workload options, one block per `testName`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionBlock {
    entries: Vec<OptionEntry>,
}

impl OptionBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an option, preserving spec-file order.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push(OptionEntry {
            key: key.into(),
            value: value.into(),
            consumed: false,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate `(key, value)` pairs in file order, consumed or not.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.key.as_str(), e.value.as_str()))
    }

    /// Raw string lookup; marks the key consumed.
    pub fn take_str(&mut self, key: &str, default: &str) -> String {
        match self.take_raw(key) {
            Some(v) => v,
            None => default.to_string(),
        }
    }

    pub fn take_i64(&mut self, key: &str, default: i64) -> HarnessResult<i64> {
        self.take_parsed(key, default)
    }

    pub fn take_u64(&mut self, key: &str, default: u64) -> HarnessResult<u64> {
        self.take_parsed(key, default)
    }

    pub fn take_usize(&mut self, key: &str, default: usize) -> HarnessResult<usize> {
        self.take_parsed(key, default)
    }

    pub fn take_f64(&mut self, key: &str, default: f64) -> HarnessResult<f64> {
        self.take_parsed(key, default)
    }

    pub fn take_bool(&mut self, key: &str, default: bool) -> HarnessResult<bool> {
        match self.take_raw(key) {
            None => Ok(default),
            Some(v) if v == "true" => Ok(true),
            Some(v) if v == "false" => Ok(false),
            Some(v) => Err(invalid_option(key, &v)),
        }
    }

    /// Comma-separated list; marks the key consumed.
    pub fn take_str_list(&mut self, key: &str, default: &[&str]) -> Vec<String> {
        match self.take_raw(key) {
            Some(v) => v.split(',').map(|s| s.to_string()).collect(),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn take_parsed<T: std::str::FromStr>(&mut self, key: &str, default: T) -> HarnessResult<T> {
        match self.take_raw(key) {
            None => Ok(default),
            Some(v) => v.parse::<T>().map_err(|_| invalid_option(key, &v)),
        }
    }

    fn take_raw(&mut self, key: &str) -> Option<String> {
        let entry = self.entries.iter_mut().find(|e| e.key == key)?;
        entry.consumed = true;
        Some(entry.value.clone())
    }

    /// Keys that no accessor read, in file order.
    pub fn unconsumed(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|e| !e.consumed)
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    /// The post-construction leftover check. Errors name every leftover
    /// key so a typo in a spec file is diagnosed in one pass.
    pub fn check_all_consumed(&self) -> HarnessResult<()> {
        let leftover = self.unconsumed();
        if leftover.is_empty() {
            return Ok(());
        }
        let names = leftover
            .iter()
            .map(|(k, v)| format!("'{k}' = '{v}'"))
            .collect::<Vec<_>>()
            .join(", ");
        Err(HarnessError::SpecInvalid(format!(
            "unconsumed workload options: {names}"
        )))
    }
}

impl fmt::Display for OptionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={}", entry.key, entry.value)?;
        }
        Ok(())
    }
}

fn invalid_option(key: &str, value: &str) -> HarnessError {
    HarnessError::SpecInvalid(format!("invalid value '{value}' for option '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(pairs: &[(&str, &str)]) -> OptionBlock {
        let mut b = OptionBlock::new();
        for (k, v) in pairs {
            b.push(*k, *v);
        }
        b
    }

    #[test]
    fn typed_accessors_consume() {
        let mut b = block(&[("count", "12"), ("rate", "0.5"), ("on", "true")]);
        assert_eq!(b.take_i64("count", 0).unwrap(), 12);
        assert_eq!(b.take_f64("rate", 0.0).unwrap(), 0.5);
        assert!(b.take_bool("on", false).unwrap());
        assert!(b.check_all_consumed().is_ok());
    }

    #[test]
    fn missing_key_returns_default_without_consuming_anything() {
        let mut b = block(&[("present", "1")]);
        assert_eq!(b.take_i64("absent", 7).unwrap(), 7);
        let leftover = b.unconsumed();
        assert_eq!(leftover, vec![("present".to_string(), "1".to_string())]);
    }

    #[test]
    fn unconsumed_keys_are_all_named() {
        let mut b = block(&[("used", "1"), ("bogus", "2"), ("extra", "3")]);
        b.take_i64("used", 0).unwrap();
        let err = b.check_all_consumed().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bogus"));
        assert!(msg.contains("extra"));
    }

    #[test]
    fn malformed_int_is_spec_invalid() {
        let mut b = block(&[("count", "twelve")]);
        assert!(matches!(
            b.take_i64("count", 0),
            Err(HarnessError::SpecInvalid(_))
        ));
    }

    #[test]
    fn bool_is_strict() {
        let mut b = block(&[("on", "yes")]);
        assert!(b.take_bool("on", false).is_err());
    }

    #[test]
    fn str_list_splits_on_commas() {
        let mut b = block(&[("names", "a,b,c")]);
        assert_eq!(b.take_str_list("names", &[]), vec!["a", "b", "c"]);
    }
}
