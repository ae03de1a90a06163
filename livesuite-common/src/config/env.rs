//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for prefixed environment variables with
//! validation, error collection, and source tracking.

use super::source::{ConfigSource, Sourced};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Prefix used for the harness's own variables.
pub const DEFAULT_PREFIX: &str = "LIVESUITE_";

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

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

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: String,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the `LIVESUITE_` prefix.
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            errors: Vec::new(),
        }
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Get the full variable name with prefix.
    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(value, var_name),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get an optional string (None if not set or blank).
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.trim().is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }

    /// Read a variable that does not carry the parser's prefix, trimmed.
    ///
    /// Used for names owned by the subject service, such as its admin key.
    pub fn get_foreign_string(&mut self, var_name: &str) -> Sourced<Option<String>> {
        match env::var(var_name) {
            Ok(value) if value.trim().is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value.trim().to_string()), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    fn get_range<T>(&mut self, name: &str, default: T, min: T, max: T, expected: &str) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.trim().parse::<T>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: expected.to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a u32 value with default and range validation.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        self.get_range(name, default, min, max, "unsigned 32-bit integer")
    }

    /// Get an i64 value with default and range validation.
    pub fn get_i64_range(&mut self, name: &str, default: i64, min: i64, max: i64) -> Sourced<i64> {
        self.get_range(name, default, min, max, "signed 64-bit integer")
    }

    /// Get a path value with ~ expansion.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        let (value, source) = match env::var(&var_name) {
            Ok(v) => (v, ConfigSource::Environment),
            Err(_) => (default.to_string(), ConfigSource::Default),
        };

        let expanded = expand_home(&value);
        if source == ConfigSource::Environment {
            Sourced::from_env(expanded, var_name)
        } else {
            Sourced::default_value(expanded)
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::from_env(lower, var_name)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        Sourced::from_env(default.to_string(), var_name)
                    }
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(value)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use std::env;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: Tests are serialized via env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_true_values() {
        let _guard = env_test_lock();
        let vars = ["LIVESUITE_TEST_BOOL_TRUE"];
        cleanup_env(&vars);

        for val in &["1", "true", "yes", "on", "TRUE", "Yes"] {
            set_env("LIVESUITE_TEST_BOOL_TRUE", val);
            let mut parser = EnvParser::new();
            let result = parser.get_bool("TEST_BOOL_TRUE", false);
            assert!(result.value, "Expected true for '{}'", val);
            assert!(parser.take_errors().is_empty());
        }

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_bool_invalid_uses_default() {
        let _guard = env_test_lock();
        let vars = ["LIVESUITE_BAD_BOOL"];
        cleanup_env(&vars);

        set_env("LIVESUITE_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        let result = parser.get_bool("BAD_BOOL", false);
        assert!(!result.value);
        assert_eq!(parser.take_errors().len(), 1);

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_i64_range_accepts_negative() {
        let _guard = env_test_lock();
        let vars = ["LIVESUITE_TEST_I64"];
        cleanup_env(&vars);

        set_env("LIVESUITE_TEST_I64", "-3");
        let mut parser = EnvParser::new();
        let result = parser.get_i64_range("TEST_I64", 5, -100, 100);
        assert_eq!(result.value, -3);
        assert_eq!(result.source, ConfigSource::Environment);
        assert!(parser.take_errors().is_empty());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u32_range_out_of_range_keeps_default() {
        let _guard = env_test_lock();
        let vars = ["LIVESUITE_TEST_U32_OOR"];
        cleanup_env(&vars);

        set_env("LIVESUITE_TEST_U32_OOR", "200");
        let mut parser = EnvParser::new();
        let result = parser.get_u32_range("TEST_U32_OOR", 10, 0, 100);
        assert_eq!(result.value, 10);
        assert!(matches!(parser.take_errors()[0], EnvError::OutOfRange { .. }));

        cleanup_env(&vars);
    }

    #[test]
    fn test_errors_are_collected_not_short_circuited() {
        let _guard = env_test_lock();
        let vars = ["LIVESUITE_E1", "LIVESUITE_E2"];
        cleanup_env(&vars);

        set_env("LIVESUITE_E1", "abc");
        set_env("LIVESUITE_E2", "nope");
        let mut parser = EnvParser::new();
        let _ = parser.get_u32_range("E1", 1, 0, 10);
        let _ = parser.get_log_level("E2", "info");
        assert_eq!(parser.take_errors().len(), 2);
        assert!(parser.take_errors().is_empty());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_optional_string_blank_is_none() {
        let _guard = env_test_lock();
        let vars = ["LIVESUITE_OPT"];
        cleanup_env(&vars);

        set_env("LIVESUITE_OPT", "   ");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_string("OPT").value, None);

        cleanup_env(&vars);
        assert_eq!(parser.get_optional_string("OPT").source, ConfigSource::Default);
    }

    #[test]
    fn test_foreign_string_is_trimmed_and_unprefixed() {
        let _guard = env_test_lock();
        let vars = ["LIVESUITE_FOREIGN_ADMIN_KEY"];
        cleanup_env(&vars);

        set_env("LIVESUITE_FOREIGN_ADMIN_KEY", "  secret \n");
        let mut parser = EnvParser::new();
        let result = parser.get_foreign_string("LIVESUITE_FOREIGN_ADMIN_KEY");
        assert!(parser.get_foreign_string("FOREIGN_ADMIN_KEY").value.is_none());
        assert_eq!(result.value.as_deref(), Some("secret"));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_path_expands_home() {
        let _guard = env_test_lock();
        let vars = ["LIVESUITE_TEST_PATH"];
        cleanup_env(&vars);

        set_env("LIVESUITE_TEST_PATH", "~/runs");
        let mut parser = EnvParser::new();
        let result = parser.get_path("TEST_PATH", "artifacts");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result.value, home.join("runs"));
        }

        cleanup_env(&vars);
        let result = parser.get_path("TEST_PATH", "artifacts");
        assert_eq!(result.value, PathBuf::from("artifacts"));
        assert_eq!(result.source, ConfigSource::Default);
    }
}
