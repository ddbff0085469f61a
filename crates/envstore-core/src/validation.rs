//! Key and value validation.
//!
//! Keys must be usable as process environment variable names: ASCII letters,
//! digits and `_`, not starting with a digit. Deployments may reserve
//! prefixes for platform-injected variables; none are reserved by default.
//! Keys are case-sensitive.

use serde::Deserialize;

use crate::error::{KeyError, ValueError};

/// Maximum key length, in characters.
pub const DEFAULT_MAX_KEY_LEN: usize = 256;

/// Maximum value size, in bytes (1 MiB).
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Configurable validation rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    /// Keys starting with any of these are rejected. Matching is case-sensitive.
    pub reserved_prefixes: Vec<String>,
    pub max_key_len: usize,
    pub max_value_bytes: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            reserved_prefixes: Vec::new(),
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        }
    }
}

/// Validates proposed variable keys and values against [`ValidationRules`].
#[derive(Debug, Clone, Default)]
pub struct KeyValidator {
    rules: ValidationRules,
}

impl KeyValidator {
    #[must_use]
    pub fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }

    /// Check `key` against the naming rules.
    ///
    /// # Errors
    ///
    /// Returns the first rule the key breaks, checked in this order: empty,
    /// too long, leading digit, invalid character, reserved prefix.
    pub fn validate(&self, key: &str) -> Result<(), KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }

        let len = key.chars().count();
        if len > self.rules.max_key_len {
            return Err(KeyError::TooLong {
                max: self.rules.max_key_len,
                actual: len,
            });
        }

        if key.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(KeyError::LeadingDigit);
        }

        if let Some(character) = key
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(KeyError::InvalidCharacter { character });
        }

        if let Some(prefix) = self
            .rules
            .reserved_prefixes
            .iter()
            .find(|p| !p.is_empty() && key.starts_with(p.as_str()))
        {
            return Err(KeyError::ReservedPrefix {
                prefix: prefix.clone(),
            });
        }

        Ok(())
    }

    /// Check a value: non-empty and within the size limit.
    ///
    /// Whitespace-only values are accepted; the value is stored exactly as
    /// submitted.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Empty`] or [`ValueError::TooLarge`].
    pub fn validate_value(&self, value: &str) -> Result<(), ValueError> {
        if value.is_empty() {
            return Err(ValueError::Empty);
        }
        if value.len() > self.rules.max_value_bytes {
            return Err(ValueError::TooLarge {
                max: self.rules.max_value_bytes,
                actual: value.len(),
            });
        }
        Ok(())
    }
}
