use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level run configuration. Every field has a default, so `{}` is a
/// valid JSON config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeobConfig {
    pub patterns: PatternConfig,
    pub sandbox: SandboxConfig,
    /// Upper bound on (Rewriter, Fold) cycles.
    pub max_cycles: usize,
}

impl Default for DeobConfig {
    fn default() -> Self {
        Self {
            patterns: PatternConfig::default(),
            sandbox: SandboxConfig::default(),
            max_cycles: 32,
        }
    }
}

impl DeobConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cycles == 0 {
            return Err(ConfigError::Zero("max_cycles"));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError::Zero("sandbox.timeout_ms"));
        }
        if self.sandbox.call_timeout_ms == 0 {
            return Err(ConfigError::Zero("sandbox.call_timeout_ms"));
        }
        self.patterns.key_regex()?;
        Ok(())
    }
}

/// Shapes accepted as the shuffle loop condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopTest {
    /// `!![]`
    DoubleNegatedArray,
    /// `true`
    TrueLiteral,
    /// `!0`
    NegatedZero,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub loop_tests: Vec<LoopTest>,
    pub rotate_push: String,
    pub rotate_shift: String,
    /// Require the `catch` block of the shuffle loop to rotate the table.
    pub require_catch_rotation: bool,
    /// Per-call keys must fully match this.
    pub key_pattern: String,
    pub max_alias_depth: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            loop_tests: vec![LoopTest::DoubleNegatedArray],
            rotate_push: "push".to_string(),
            rotate_shift: "shift".to_string(),
            require_catch_rotation: true,
            key_pattern: r"^[\s\S]{1,16}$".to_string(),
            max_alias_depth: 8,
        }
    }
}

impl PatternConfig {
    pub fn key_regex(&self) -> Result<Regex, ConfigError> {
        Ok(Regex::new(&self.key_pattern)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    /// Globals that survive in the sandbox. Everything else is removed before
    /// the extracted unit runs.
    pub allowed_globals: Vec<String>,
}

pub const DEFAULT_ALLOWED_GLOBALS: &[&str] = &[
    "undefined",
    "NaN",
    "Infinity",
    "Object",
    "Array",
    "String",
    "Number",
    "Boolean",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "decodeURIComponent",
    "encodeURIComponent",
    "decodeURI",
    "encodeURI",
    "escape",
    "unescape",
    "Error",
    "TypeError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
];

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            call_timeout_ms: 1_000,
            loop_iteration_limit: 1_000_000,
            recursion_limit: 256,
            allowed_globals: DEFAULT_ALLOWED_GLOBALS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config = DeobConfig::from_json("{}").unwrap();
        assert_eq!(config.max_cycles, 32);
        assert_eq!(config.patterns.loop_tests, vec![LoopTest::DoubleNegatedArray]);
        assert!(config.sandbox.allowed_globals.iter().any(|g| g == "String"));
        assert!(!config.sandbox.allowed_globals.iter().any(|g| g == "Date"));
    }

    #[test]
    fn partial_json_overrides_nested_fields() {
        let config = DeobConfig::from_json(
            r#"{"patterns":{"loop_tests":["double_negated_array","true_literal"]},"sandbox":{"timeout_ms":50}}"#,
        )
        .unwrap();
        assert_eq!(
            config.patterns.loop_tests,
            vec![LoopTest::DoubleNegatedArray, LoopTest::TrueLiteral]
        );
        assert_eq!(config.patterns.rotate_push, "push");
        assert_eq!(config.sandbox.timeout_ms, 50);
        assert_eq!(config.sandbox.call_timeout_ms, 1_000);
    }

    #[test]
    fn rejects_bad_key_pattern() {
        let err = DeobConfig::from_json(r#"{"patterns":{"key_pattern":"(["}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::KeyPattern(_)));
    }

    #[test]
    fn rejects_zero_cycles() {
        let err = DeobConfig::from_json(r#"{"max_cycles":0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("max_cycles")));
    }
}
