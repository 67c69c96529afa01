//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for prefixed environment variables with
//! validation, error collection, and source tracking. Every getter takes
//! the value from the layer below (file or default) and returns either the
//! environment override or that value unchanged.

use std::env;
use std::time::Duration;

use thiserror::Error;

use super::Sourced;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Parser over the process environment.
    pub fn new(prefix: &'static str) -> Self {
        Self::with_lookup(prefix, |name| env::var(name).ok())
    }

    /// Parser over an arbitrary variable source.
    pub fn with_lookup<F>(prefix: &'static str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            prefix,
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Get the full variable name with prefix.
    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn read(&self, name: &str) -> (String, Option<String>) {
        let var_name = self.var_name(name);
        let value = (self.lookup)(&var_name);
        (var_name, value)
    }

    /// Get a string value; empty values are ignored.
    pub fn get_string(&mut self, name: &str, current: &str) -> Sourced<String> {
        match self.read(name) {
            (var, Some(value)) if !value.is_empty() => Sourced::from_env(value, var),
            _ => Sourced::inherited(current.to_string()),
        }
    }

    /// Get a boolean value.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off (for false)
    pub fn get_bool(&mut self, name: &str, current: bool) -> Sourced<bool> {
        match self.read(name) {
            (var, Some(value)) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Sourced::from_env(true, var),
                "0" | "false" | "no" | "off" => Sourced::from_env(false, var),
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var,
                        expected: "boolean (true/false/1/0/yes/no)".to_string(),
                        value,
                    });
                    Sourced::inherited(current)
                }
            },
            (_, None) => Sourced::inherited(current),
        }
    }

    /// Get a u64 value with range validation.
    pub fn get_u64_range(&mut self, name: &str, current: u64, min: u64, max: u64) -> Sourced<u64> {
        match self.read(name) {
            (var, Some(value)) => match value.parse::<u64>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var,
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::inherited(current)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var,
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    Sourced::inherited(current)
                }
            },
            (_, None) => Sourced::inherited(current),
        }
    }

    /// Get a duration in humantime format (`250ms`, `30s`, `2m`).
    pub fn get_duration(&mut self, name: &str, current: Duration) -> Sourced<Duration> {
        match self.read(name) {
            (var, Some(value)) => match humantime::parse_duration(value.trim()) {
                Ok(d) => Sourced::from_env(d, var),
                Err(_) => {
                    self.errors.push(EnvError::InvalidDuration { var, value });
                    Sourced::inherited(current)
                }
            },
            (_, None) => Sourced::inherited(current),
        }
    }

    /// Get a value through its `FromStr` implementation.
    pub fn get_parsed<T>(&mut self, name: &str, current: T, expected: &str) -> Sourced<T>
    where
        T: std::str::FromStr,
    {
        match self.read(name) {
            (var, Some(value)) => match value.parse::<T>() {
                Ok(parsed) => Sourced::from_env(parsed, var),
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var,
                        expected: expected.to_string(),
                        value,
                    });
                    Sourced::inherited(current)
                }
            },
            (_, None) => Sourced::inherited(current),
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, current: &str) -> Sourced<String> {
        match self.read(name) {
            (var, Some(value)) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::from_env(lower, var)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel { var, value });
                        Sourced::inherited(current.to_string())
                    }
                }
            }
            (_, None) => Sourced::inherited(current.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use std::collections::HashMap;

    fn parser(vars: &[(&str, &str)]) -> EnvParser {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        EnvParser::with_lookup("SGTEST_", move |name| map.get(name).cloned())
    }

    #[test]
    fn test_get_bool_true_values() {
        for val in ["1", "true", "yes", "on", "TRUE", "Yes"] {
            let mut p = parser(&[("SGTEST_FORCE", val)]);
            let result = p.get_bool("FORCE", false);
            assert!(result.value, "Expected true for '{val}'");
            assert_eq!(result.source, ConfigSource::Environment);
            assert!(!p.has_errors());
        }
    }

    #[test]
    fn test_get_bool_invalid_keeps_current() {
        let mut p = parser(&[("SGTEST_FORCE", "maybe")]);
        let result = p.get_bool("FORCE", true);
        assert!(result.value);
        assert_eq!(result.source, ConfigSource::Inherited);
        assert!(p.has_errors());
    }

    #[test]
    fn test_unset_variable_keeps_current() {
        let mut p = parser(&[]);
        let result = p.get_string("ENDPOINT", "127.0.0.1:27017");
        assert_eq!(result.value, "127.0.0.1:27017");
        assert_eq!(result.env_var, None);
    }

    #[test]
    fn test_get_u64_range_out_of_range() {
        let mut p = parser(&[("SGTEST_STEP_DOWN_SECS", "200000")]);
        let result = p.get_u64_range("STEP_DOWN_SECS", 100, 0, 86_400);
        assert_eq!(result.value, 100);
        assert!(matches!(p.errors()[0], EnvError::OutOfRange { .. }));
    }

    #[test]
    fn test_get_duration_humantime() {
        let mut p = parser(&[("SGTEST_POLL_INTERVAL", "250ms")]);
        let result = p.get_duration("POLL_INTERVAL", Duration::from_millis(100));
        assert_eq!(result.value, Duration::from_millis(250));
        assert_eq!(result.env_var.as_deref(), Some("SGTEST_POLL_INTERVAL"));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut p = parser(&[
            ("SGTEST_POLL_TIMEOUT", "soon"),
            ("SGTEST_LOG_LEVEL", "loud"),
        ]);
        p.get_duration("POLL_TIMEOUT", Duration::from_secs(30));
        p.get_log_level("LOG_LEVEL", "info");
        let errors = p.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(!p.has_errors());
    }
}
