//! Handler registry: the static `op_type → executable command` mapping.
//!
//! Loaded once at process start from a line-oriented `key=value` file and
//! treated as immutable afterwards (changing mappings requires a restart).
//! Format, grouped by domain in practice:
//!
//! ```text
//! # site handlers
//! site.create=/usr/local/lib/hostpilot/handlers/manage_site.sh create
//! site.delete=/usr/local/lib/hostpilot/handlers/manage_site.sh delete
//! ```
//!
//! The value is a program followed by optional base arguments, split on
//! whitespace (no quoting). The dispatcher appends `(op_type, operation_id)`
//! at invocation time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read handler registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed registry line {line_no}: {line:?}")]
    Malformed { line_no: usize, line: String },
}

/// Program plus base arguments for one operation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCommand {
    pub program: PathBuf,
    pub base_args: Vec<String>,
}

impl HandlerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Immutable `op_type → command` map.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, HandlerCommand>,
}

impl HandlerRegistry {
    /// Load the registry from a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse registry text. Blank lines and `#` comments are ignored; a later
    /// mapping for the same type overrides an earlier one.
    pub fn parse(text: &str) -> Result<Self, RegistryError> {
        let mut entries = HashMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed = || RegistryError::Malformed {
                line_no: idx + 1,
                line: raw.to_string(),
            };

            let (key, value) = line.split_once('=').ok_or_else(malformed)?;
            let key = key.trim();
            let mut parts = value.split_whitespace();
            let program = parts.next().ok_or_else(malformed)?;
            if key.is_empty() {
                return Err(malformed());
            }

            entries.insert(
                key.to_string(),
                HandlerCommand::new(program).with_args(parts),
            );
        }

        Ok(Self { entries })
    }

    /// Build a registry directly (tests, embedded defaults).
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, HandlerCommand)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        }
    }

    pub fn lookup(&self, op_type: &str) -> Option<&HandlerCommand> {
        self.entries.get(op_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
