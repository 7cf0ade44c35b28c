//! Configuration file structures for grammar-bridge.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`GrammarEntry`]: A grammar to compile when a session starts

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::BridgeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// opt_level = "speed"
/// epoch_interruption = true
///
/// [runtime.execution]
/// max_fuel = 50_000_000
/// timeout_ms = 2_000
///
/// [runtime.abi]
/// compile = "compile_grammar"
/// parse = "parse_input"
///
/// [[grammars]]
/// name = "alpha"
/// source = "alpha = { 'a'..'z' | 'A'..'Z' }"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution and ABI settings).
    #[serde(default)]
    pub runtime: BridgeConfig,

    /// Grammars to compile when a session is opened.
    #[serde(default)]
    pub grammars: Vec<GrammarEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML, or if two
    /// grammar entries share a name.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.check_grammar_names()?;
        Ok(config)
    }

    fn check_grammar_names(&self) -> Result<(), ConfigFileError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.grammars {
            if entry.name.is_empty() {
                return Err(ConfigFileError::InvalidGrammar {
                    name: entry.name.clone(),
                    reason: "grammar name must not be empty".into(),
                });
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigFileError::InvalidGrammar {
                    name: entry.name.clone(),
                    reason: "grammar name is declared twice".into(),
                });
            }
        }
        Ok(())
    }
}

/// A grammar compiled under `name` when a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GrammarEntry {
    /// Name the grammar is addressed by in parse calls.
    pub name: String,

    /// Grammar source text.
    pub source: String,
}

impl GrammarEntry {
    /// Create a new grammar entry.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// A grammar entry is unusable.
    #[error("Invalid grammar entry '{name}': {reason}")]
    InvalidGrammar { name: String, reason: String },
}
